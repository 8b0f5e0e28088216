//! A single logical connection with nested transactions.
//!
//! The driver only knows flat transactions. The outermost `begin` opens a
//! driver transaction, every further `begin` creates a savepoint named after
//! the new depth (`trans_2`, `trans_3`, ...). `commit` and `rollback` unwind one
//! level at a time, releasing or rolling back to the savepoint of the current
//! depth until the outermost level ends the driver transaction.
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, trace, warn};

use crate::driver::{Capabilities, Driver, DriverKind, DriverTx};
use crate::errors::{BoxError, ConnError, Result, StatementError, TransactionError, TxOp};
use crate::statement::{Prepared, Statement};
use crate::value::Row;

/// Savepoint name for a nesting depth.
pub fn savepoint_name(depth: usize) -> String {
    format!("trans_{depth}")
}

/// Where a connection is in its transaction lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Depth 0.
    Idle,
    /// Depth 1, inside a driver transaction.
    Active,
    /// Depth 2 or more, inside at least one savepoint.
    Nested,
}

pub struct Connection {
    driver: Arc<dyn Driver>,
    /// Present iff depth > 0.
    tx: Option<Box<dyn DriverTx>>,
    depth: usize,
    capabilities: Capabilities,
}

impl Connection {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        let capabilities = driver.capabilities();
        Self::with_capabilities(driver, capabilities)
    }

    /// Create a connection with capabilities overriding what the driver
    /// reports.
    pub fn with_capabilities(driver: Arc<dyn Driver>, capabilities: Capabilities) -> Self {
        Connection {
            driver,
            tx: None,
            depth: 0,
            capabilities,
        }
    }

    /// Connection sharing this connection's driver with its own, idle,
    /// transaction state.
    pub fn fork(&self) -> Self {
        Self::with_capabilities(self.driver.clone(), self.capabilities)
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn state(&self) -> TxState {
        match self.depth {
            0 => TxState::Idle,
            1 => TxState::Active,
            _ => TxState::Nested,
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.depth > 0
    }

    pub fn driver_kind(&self) -> DriverKind {
        self.driver.kind()
    }

    pub fn supports_savepoints(&self) -> bool {
        self.capabilities.savepoints
    }

    /// Begin a transaction, or a savepoint if one is already open.
    ///
    /// A nested begin without savepoint support fails without touching the
    /// open transaction.
    pub async fn begin(&mut self) -> Result<()> {
        match self.tx.as_mut() {
            None => {
                let tx = self.driver.begin().await.map_err(|source| ConnError::Protocol {
                    op: TxOp::Begin,
                    depth: 0,
                    source,
                })?;
                self.tx = Some(tx);
                self.depth = 1;
            }
            Some(tx) => {
                if !self.capabilities.savepoints {
                    return Err(ConnError::UnsupportedSavepoint {
                        driver: self.driver.kind(),
                    });
                }
                let depth = self.depth;
                let sql = format!("SAVEPOINT {}", savepoint_name(depth + 1));
                tx.exec(&sql, &[]).await.map_err(|source| ConnError::Protocol {
                    op: TxOp::Savepoint,
                    depth,
                    source,
                })?;
                self.depth += 1;
            }
        }
        trace!(depth = self.depth, "begin");
        Ok(())
    }

    /// Commit the innermost level.
    pub async fn commit(&mut self) -> Result<()> {
        let depth = self.depth;
        let tx = self.tx.as_mut().ok_or(ConnError::NoActiveTransaction)?;
        if depth == 1 {
            tx.commit().await.map_err(|source| ConnError::Protocol {
                op: TxOp::Commit,
                depth,
                source,
            })?;
            self.finish();
        } else {
            let sql = format!("RELEASE SAVEPOINT {}", savepoint_name(depth));
            tx.exec(&sql, &[]).await.map_err(|source| ConnError::Protocol {
                op: TxOp::ReleaseSavepoint,
                depth,
                source,
            })?;
            self.depth -= 1;
        }
        trace!(depth = self.depth, "commit");
        Ok(())
    }

    /// Roll back the innermost level.
    pub async fn rollback(&mut self) -> Result<()> {
        let depth = self.depth;
        let tx = self.tx.as_mut().ok_or(ConnError::NoActiveTransaction)?;
        if depth == 1 {
            tx.rollback().await.map_err(|source| ConnError::Protocol {
                op: TxOp::Rollback,
                depth,
                source,
            })?;
            self.finish();
        } else {
            let sql = format!("ROLLBACK TO SAVEPOINT {}", savepoint_name(depth));
            tx.exec(&sql, &[]).await.map_err(|source| ConnError::Protocol {
                op: TxOp::RollbackToSavepoint,
                depth,
                source,
            })?;
            self.depth -= 1;
        }
        trace!(depth = self.depth, "rollback");
        Ok(())
    }

    /// Commit the driver transaction regardless of depth. Open savepoints are
    /// committed along with it.
    pub async fn commit_all(&mut self) -> Result<()> {
        let depth = self.depth;
        let tx = self.tx.as_mut().ok_or(ConnError::NoActiveTransaction)?;
        if depth > 1 {
            debug!(depth, "committing with open savepoints");
        }
        tx.commit().await.map_err(|source| ConnError::Protocol {
            op: TxOp::Commit,
            depth,
            source,
        })?;
        self.finish();
        Ok(())
    }

    /// Roll back the driver transaction regardless of depth.
    pub async fn rollback_all(&mut self) -> Result<()> {
        let depth = self.depth;
        let tx = self.tx.as_mut().ok_or(ConnError::NoActiveTransaction)?;
        if depth > 1 {
            debug!(depth, "rolling back with open savepoints");
        }
        tx.rollback().await.map_err(|source| ConnError::Protocol {
            op: TxOp::Rollback,
            depth,
            source,
        })?;
        self.finish();
        Ok(())
    }

    fn finish(&mut self) {
        self.tx = None;
        self.depth = 0;
    }

    /// Execute a statement, returning the number of affected rows.
    pub async fn exec<S: Statement + ?Sized>(&mut self, stmt: &S) -> Result<u64> {
        let sql = stmt.prepare();
        let params = stmt.binds();
        let result = match self.tx.as_mut() {
            Some(tx) => tx.exec(&sql, &params).await,
            None => self.driver.exec(&sql, &params).await,
        };
        result.map_err(|source| StatementError::new(sql, params, source).into())
    }

    pub async fn query<S: Statement + ?Sized>(&mut self, stmt: &S) -> Result<Vec<Row>> {
        let sql = stmt.prepare();
        let params = stmt.binds();
        let result = match self.tx.as_mut() {
            Some(tx) => tx.query(&sql, &params).await,
            None => self.driver.query(&sql, &params).await,
        };
        result.map_err(|source| StatementError::new(sql, params, source).into())
    }

    /// Query for at most one row. Extra rows are discarded.
    pub async fn query_row<S: Statement + ?Sized>(&mut self, stmt: &S) -> Result<Option<Row>> {
        Ok(self.query(stmt).await?.into_iter().next())
    }

    pub async fn prepare(&mut self, sql: &str) -> Result<Prepared> {
        let result = match self.tx.as_mut() {
            Some(tx) => tx.prepare(sql).await,
            None => self.driver.prepare(sql).await,
        };
        result.map_err(|source| StatementError::new(sql, Vec::new(), source).into())
    }

    /// Run `f` inside a transaction level.
    ///
    /// Commits when `f` succeeds and rolls back when it fails. If the commit
    /// itself fails, the level is rolled back as well. Nested calls use
    /// savepoints.
    pub async fn transaction<T, F>(&mut self, f: F) -> Result<T, TransactionError>
    where
        F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T, BoxError>>,
    {
        if let Err(e) = self.begin().await {
            return Err(TransactionError {
                begin: Some(e),
                ..Default::default()
            });
        }

        match f(self).await {
            Ok(value) => match self.commit().await {
                Ok(()) => Ok(value),
                Err(commit) => {
                    warn!(%commit, "commit failed, rolling back");
                    let rollback = self.rollback().await.err();
                    Err(TransactionError {
                        commit: Some(commit),
                        rollback,
                        ..Default::default()
                    })
                }
            },
            Err(callback) => {
                debug!(%callback, "transaction body failed, rolling back");
                let rollback = self.rollback().await.err();
                Err(TransactionError {
                    callback: Some(callback),
                    rollback,
                    ..Default::default()
                })
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("driver", &self.driver)
            .field("depth", &self.depth)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.depth > 0 {
            warn!(
                depth = self.depth,
                driver = %self.driver.kind(),
                "connection dropped inside a transaction"
            );
        }
    }
}
