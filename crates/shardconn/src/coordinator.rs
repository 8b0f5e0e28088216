//! Transactions spanning several shard keys.
//!
//! A logical transaction begins a driver transaction for every key, runs the
//! caller's body, then commits every key. Phases run sequentially in
//! first-touch order.
//!
//! Commit is best effort. There is no two-phase commit: if one key fails to
//! commit after others succeeded, the committed keys stay committed and the
//! error reports exactly which keys went through. Callers needing atomicity
//! across shards have to build it on top of this.
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::conn::Connection;
use crate::errors::{BoxError, KeyError, KeyOutcome, ShardError, ShardTxError};
use crate::router::ShardKey;
use crate::shard::ShardedConnections;

/// Handle given to a transaction body.
///
/// Only keys declared when starting the transaction are reachable.
#[derive(Debug)]
pub struct TxScope {
    conns: ShardedConnections,
}

impl TxScope {
    /// The connection for a declared key, inside its open transaction.
    ///
    /// The body may nest further levels with `begin`. If it ends the outer
    /// level itself with `commit` or `rollback` at depth 1, that key is left
    /// out of the commit phase and of any later rollback.
    pub fn conn(&mut self, key: impl Into<ShardKey>) -> Result<&mut Connection, ShardError> {
        let key = key.into();
        match self.conns.get_touched(&key) {
            Some(conn) => Ok(conn),
            None => Err(ShardError::UndeclaredKey(key)),
        }
    }

    /// Declared keys in first-touch order.
    pub fn keys(&self) -> impl Iterator<Item = &ShardKey> {
        self.conns.touched()
    }

    pub fn shard_of(&self, key: &ShardKey) -> Option<usize> {
        self.conns.shard_of(key).ok()
    }
}

/// Run `f` in a transaction covering `keys`.
///
/// See [`run_transaction_with_cancel`].
pub async fn run_transaction<K, I, T, F>(
    set: &ShardedConnections,
    keys: I,
    f: F,
) -> Result<T, ShardTxError>
where
    I: IntoIterator<Item = K>,
    K: Into<ShardKey>,
    F: for<'s> FnOnce(&'s mut TxScope) -> BoxFuture<'s, Result<T, BoxError>>,
{
    run_transaction_with_cancel(set, keys, &CancellationToken::new(), f).await
}

/// Run `f` in a transaction covering `keys`, stopping early if `cancel` fires.
///
/// Duplicate keys are collapsed, keeping the first occurrence. If a begin
/// fails, the keys begun before it are rolled back in reverse order and the
/// remaining keys are never touched. If `f` fails, every key is rolled back.
/// Otherwise every key is committed, and commit failures are collected without
/// rolling back keys that already committed.
///
/// Cancellation is checked before each begin and each commit, and raced
/// against every begin, commit and `f` itself, so a driver call that never
/// returns is abandoned once `cancel` fires. Keys that were begun but not
/// committed are rolled back before returning.
pub async fn run_transaction_with_cancel<K, I, T, F>(
    set: &ShardedConnections,
    keys: I,
    cancel: &CancellationToken,
    f: F,
) -> Result<T, ShardTxError>
where
    I: IntoIterator<Item = K>,
    K: Into<ShardKey>,
    F: for<'s> FnOnce(&'s mut TxScope) -> BoxFuture<'s, Result<T, BoxError>>,
{
    let mut scope = TxScope { conns: set.fork() };

    for key in keys {
        let key = key.into();
        if let Err(error) = scope.conns.get(key.clone()) {
            // Nothing begun yet.
            return Err(ShardTxError {
                begin: Some(KeyError {
                    key,
                    shard: None,
                    error,
                }),
                ..Default::default()
            });
        }
    }

    let len = scope.conns.touched_len();
    debug!(keys = len, "beginning sharded transaction");

    // Begin phase.
    for pos in 0..len {
        if cancel.is_cancelled() {
            warn!(begun = pos, "sharded transaction cancelled during begin");
            let rollbacks = rollback_positions(&mut scope.conns, (0..pos).rev()).await;
            return Err(ShardTxError {
                cancelled: true,
                rollbacks,
                ..Default::default()
            });
        }

        let Some((key, touched)) = scope.conns.touched_at(pos) else {
            continue;
        };
        let key = key.clone();
        let shard = touched.shard;
        let begun = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = touched.conn.begin() => Some(result),
        };
        let Some(begun) = begun else {
            warn!(%key, shard, begun = pos, "sharded transaction cancelled during begin");
            let rollbacks = rollback_positions(&mut scope.conns, (0..pos).rev()).await;
            return Err(ShardTxError {
                cancelled: true,
                rollbacks,
                ..Default::default()
            });
        };
        if let Err(e) = begun {
            warn!(%key, shard, %e, "begin failed, rolling back begun keys");
            let rollbacks = rollback_positions(&mut scope.conns, (0..pos).rev()).await;
            return Err(ShardTxError {
                begin: Some(KeyError {
                    key,
                    shard: Some(shard),
                    error: e.into(),
                }),
                rollbacks,
                ..Default::default()
            });
        }
    }

    // Call phase.
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = f(&mut scope) => Some(result),
    };

    let value = match outcome {
        Some(Ok(value)) => value,
        Some(Err(cause)) => {
            debug!(%cause, "transaction body failed, rolling back");
            let rollbacks = rollback_positions(&mut scope.conns, 0..len).await;
            return Err(ShardTxError {
                callback: Some(cause),
                rollbacks,
                ..Default::default()
            });
        }
        None => {
            warn!("sharded transaction cancelled during body");
            let rollbacks = rollback_positions(&mut scope.conns, 0..len).await;
            return Err(ShardTxError {
                cancelled: true,
                rollbacks,
                ..Default::default()
            });
        }
    };

    // Commit phase.
    let mut commits = Vec::with_capacity(len);
    for pos in 0..len {
        if cancel.is_cancelled() {
            warn!(
                committed = pos,
                "sharded transaction cancelled during commit"
            );
            let rollbacks = rollback_positions(&mut scope.conns, pos..len).await;
            return Err(ShardTxError {
                cancelled: true,
                rollbacks,
                commits,
                ..Default::default()
            });
        }

        let Some((key, touched)) = scope.conns.touched_at(pos) else {
            continue;
        };
        let key = key.clone();
        let shard = touched.shard;
        if !touched.conn.in_transaction() {
            debug!(%key, shard, "transaction already finished by body");
            continue;
        }
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = touched.conn.commit_all() => Some(result),
        };
        let Some(result) = result else {
            warn!(%key, shard, committed = pos, "sharded transaction cancelled during commit");
            let rollbacks = rollback_positions(&mut scope.conns, pos..len).await;
            return Err(ShardTxError {
                cancelled: true,
                rollbacks,
                commits,
                ..Default::default()
            });
        };
        if let Err(e) = &result {
            warn!(%key, shard, %e, "commit failed");
        }
        commits.push(KeyOutcome { key, shard, result });
    }

    if commits.iter().any(|o| o.result.is_err()) {
        return Err(ShardTxError {
            commits,
            ..Default::default()
        });
    }

    debug!(keys = len, "committed sharded transaction");
    Ok(value)
}

/// Roll back the touched keys at `positions`, in the given order.
async fn rollback_positions(
    conns: &mut ShardedConnections,
    positions: impl IntoIterator<Item = usize>,
) -> Vec<KeyOutcome> {
    let mut outcomes = Vec::new();
    for pos in positions {
        let Some((key, touched)) = conns.touched_at(pos) else {
            continue;
        };
        if !touched.conn.in_transaction() {
            continue;
        }
        let key = key.clone();
        let shard = touched.shard;
        let result = touched.conn.rollback_all().await;
        if let Err(e) = &result {
            warn!(%key, shard, %e, "rollback failed");
        }
        outcomes.push(KeyOutcome { key, shard, result });
    }
    outcomes
}
