use std::fmt;

use crate::config::ConfigError;
use crate::driver::DriverKind;
use crate::driver::errors::DriverError;
use crate::router::{RouteError, ShardKey};
use crate::value::Value;

/// Error returned by caller supplied transaction bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A driver call tied to a specific statement failed.
#[derive(Debug, thiserror::Error)]
#[error("failed to execute '{statement}' with params {}: {source}", FormatParams(.params))]
pub struct StatementError {
    pub statement: String,
    pub params: Vec<Value>,
    #[source]
    pub source: DriverError,
}

impl StatementError {
    pub fn new(statement: impl Into<String>, params: Vec<Value>, source: DriverError) -> Self {
        StatementError {
            statement: statement.into(),
            params,
            source,
        }
    }
}

struct FormatParams<'a>(&'a [Value]);

impl fmt::Display for FormatParams<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (idx, param) in self.0.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{param}")?;
        }
        write!(f, "]")
    }
}

/// Transaction protocol operations issued by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOp {
    Begin,
    Commit,
    Rollback,
    Savepoint,
    ReleaseSavepoint,
    RollbackToSavepoint,
}

impl fmt::Display for TxOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Begin => "begin transaction",
            Self::Commit => "commit transaction",
            Self::Rollback => "rollback transaction",
            Self::Savepoint => "create savepoint",
            Self::ReleaseSavepoint => "release savepoint",
            Self::RollbackToSavepoint => "rollback to savepoint",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("no active transaction")]
    NoActiveTransaction,

    #[error("driver '{driver}' does not support savepoints, nested transactions are unavailable")]
    UnsupportedSavepoint { driver: DriverKind },

    #[error("failed to {op} at depth {depth}: {source}")]
    Protocol {
        op: TxOp,
        depth: usize,
        #[source]
        source: DriverError,
    },

    #[error(transparent)]
    Statement(#[from] StatementError),
}

pub type Result<T, E = ConnError> = std::result::Result<T, E>;

/// Failure of a transaction on a single connection.
///
/// The begin or callback error is the primary cause. Commit and rollback errors
/// are attached when the corresponding cleanup step failed too.
#[derive(Debug, Default)]
pub struct TransactionError {
    pub begin: Option<ConnError>,
    pub callback: Option<BoxError>,
    pub commit: Option<ConnError>,
    pub rollback: Option<ConnError>,
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(e) = &self.begin {
            write!(f, "begin failed: {e}")?;
        } else if let Some(e) = &self.callback {
            write!(f, "transaction failed: {e}")?;
        } else if let Some(e) = &self.commit {
            write!(f, "commit failed: {e}")?;
        } else {
            write!(f, "transaction failed")?;
        }
        if self.callback.is_some() || self.begin.is_some() {
            if let Some(e) = &self.commit {
                write!(f, "; commit failed: {e}")?;
            }
        }
        if let Some(e) = &self.rollback {
            write!(f, "; rollback failed: {e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TransactionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        if let Some(e) = &self.begin {
            return Some(e);
        }
        if let Some(e) = &self.callback {
            return Some(e.as_ref());
        }
        self.commit
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    #[error("sharded connection set requires at least one shard")]
    NoShards,

    #[error("key {0} was not declared for this transaction")]
    UndeclaredKey(ShardKey),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Conn(#[from] ConnError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A failure attributed to one key.
#[derive(Debug)]
pub struct KeyError {
    pub key: ShardKey,
    /// Shard the key routed to, if routing succeeded.
    pub shard: Option<usize>,
    pub error: ShardError,
}

/// Result of a commit or rollback for one key.
#[derive(Debug)]
pub struct KeyOutcome {
    pub key: ShardKey,
    pub shard: usize,
    pub result: Result<(), ConnError>,
}

impl fmt::Display for KeyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.result {
            Ok(()) => write!(f, "key {} (shard {}) ok", self.key, self.shard),
            Err(e) => write!(f, "key {} (shard {}) failed: {e}", self.key, self.shard),
        }
    }
}

/// Failure of a transaction spanning several keys.
///
/// At most one of `begin`, `callback` and `cancelled` is the primary cause. If
/// none is set, the transaction failed during commit. `rollbacks` and
/// `commits` hold every cleanup attempt, successful or not, so callers can tell
/// which shards may have diverged.
#[derive(Debug, Default)]
pub struct ShardTxError {
    pub begin: Option<KeyError>,
    pub callback: Option<BoxError>,
    pub cancelled: bool,
    pub rollbacks: Vec<KeyOutcome>,
    pub commits: Vec<KeyOutcome>,
}

impl ShardTxError {
    pub fn rollback_errors(&self) -> impl Iterator<Item = (&ShardKey, &ConnError)> {
        failures(&self.rollbacks)
    }

    pub fn commit_errors(&self) -> impl Iterator<Item = (&ShardKey, &ConnError)> {
        failures(&self.commits)
    }

    /// Keys whose commit went through. These are not rolled back.
    pub fn committed_keys(&self) -> impl Iterator<Item = &ShardKey> {
        self.commits
            .iter()
            .filter(|o| o.result.is_ok())
            .map(|o| &o.key)
    }

    pub fn rolled_back_keys(&self) -> impl Iterator<Item = &ShardKey> {
        self.rollbacks
            .iter()
            .filter(|o| o.result.is_ok())
            .map(|o| &o.key)
    }
}

fn failures(outcomes: &[KeyOutcome]) -> impl Iterator<Item = (&ShardKey, &ConnError)> {
    outcomes
        .iter()
        .filter_map(|o| o.result.as_ref().err().map(|e| (&o.key, e)))
}

impl fmt::Display for ShardTxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(begin) = &self.begin {
            write!(f, "begin failed for key {}: {}", begin.key, begin.error)?;
        } else if let Some(e) = &self.callback {
            write!(f, "transaction failed: {e}")?;
        } else if self.cancelled {
            write!(f, "transaction cancelled")?;
        } else {
            let failed = self.commit_errors().count();
            write!(
                f,
                "commit failed for {failed} of {} keys",
                self.commits.len()
            )?;
        }

        for (label, outcomes) in [("rollback", &self.rollbacks), ("commit", &self.commits)] {
            if outcomes.is_empty() {
                continue;
            }
            write!(f, "; {label}: ")?;
            for (idx, outcome) in outcomes.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{outcome}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ShardTxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        if let Some(begin) = &self.begin {
            return Some(&begin.error);
        }
        if let Some(e) = &self.callback {
            return Some(e.as_ref());
        }
        None
    }
}
