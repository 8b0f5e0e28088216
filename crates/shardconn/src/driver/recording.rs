//! An in-memory driver that records every call it receives.
//!
//! Several drivers can share one [`OpLog`], which gives a single ordered view of
//! the traffic across shards. Failures and stalls are injected by op prefix.
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::errors::{DriverError, Result};
use super::{Capabilities, Driver, DriverKind, DriverTx};
use crate::statement::Prepared;
use crate::value::{Row, Value};

pub const BEGIN: &str = "BEGIN";
pub const COMMIT: &str = "COMMIT";
pub const ROLLBACK: &str = "ROLLBACK";

/// A single recorded driver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Op {
    /// Label of the driver that received the call.
    pub target: String,
    pub op: String,
    /// False if the call was failed by injection.
    pub ok: bool,
}

/// Shared, ordered log of driver calls.
#[derive(Debug, Clone, Default)]
pub struct OpLog {
    ops: Arc<Mutex<Vec<Op>>>,
}

impl OpLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().clone()
    }

    /// Op text received by one target, in order.
    pub fn ops_for(&self, target: &str) -> Vec<String> {
        self.ops
            .lock()
            .iter()
            .filter(|op| op.target == target)
            .map(|op| op.op.clone())
            .collect()
    }

    /// `(target, op)` pairs across all targets, in order.
    pub fn pairs(&self) -> Vec<(String, String)> {
        self.ops
            .lock()
            .iter()
            .map(|op| (op.target.clone(), op.op.clone()))
            .collect()
    }

    pub fn clear(&self) {
        self.ops.lock().clear();
    }

    fn push(&self, op: Op) {
        self.ops.lock().push(op);
    }
}

#[derive(Debug)]
struct RecordingState {
    target: String,
    log: OpLog,
    capabilities: Capabilities,
    failures: Mutex<Vec<String>>,
    stalls: Mutex<Vec<String>>,
    rows: Mutex<Vec<Row>>,
}

#[derive(Debug, Clone)]
pub struct RecordingDriver {
    state: Arc<RecordingState>,
}

impl RecordingDriver {
    pub fn new(target: impl Into<String>, log: OpLog) -> Self {
        Self::with_capabilities(target, log, DriverKind::Recording.default_capabilities())
    }

    pub fn with_capabilities(
        target: impl Into<String>,
        log: OpLog,
        capabilities: Capabilities,
    ) -> Self {
        RecordingDriver {
            state: Arc::new(RecordingState {
                target: target.into(),
                log,
                capabilities,
                failures: Mutex::new(Vec::new()),
                stalls: Mutex::new(Vec::new()),
                rows: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.state.target
    }

    pub fn log(&self) -> &OpLog {
        &self.state.log
    }

    /// Fail every subsequent op starting with `prefix`.
    pub fn fail_on(&self, prefix: impl Into<String>) {
        self.state.failures.lock().push(prefix.into());
    }

    /// Never complete subsequent ops starting with `prefix`. The op is still
    /// logged when it is received.
    pub fn stall_on(&self, prefix: impl Into<String>) {
        self.state.stalls.lock().push(prefix.into());
    }

    pub fn clear_failures(&self) {
        self.state.failures.lock().clear();
        self.state.stalls.lock().clear();
    }

    /// Rows returned by every query.
    pub fn set_rows(&self, rows: Vec<Row>) {
        *self.state.rows.lock() = rows;
    }

    async fn record(&self, op: String) -> Result<()> {
        let matches = |prefixes: &Mutex<Vec<String>>| {
            prefixes
                .lock()
                .iter()
                .any(|prefix| op.starts_with(prefix.as_str()))
        };
        let fail = matches(&self.state.failures);
        let stall = matches(&self.state.stalls);
        self.state.log.push(Op {
            target: self.state.target.clone(),
            op: op.clone(),
            ok: !fail,
        });
        if stall {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(DriverError::Injected(format!(
                "injected failure on {}: {op}",
                self.state.target
            )));
        }
        Ok(())
    }

    fn rows(&self) -> Vec<Row> {
        self.state.rows.lock().clone()
    }
}

#[async_trait]
impl Driver for RecordingDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Recording
    }

    fn capabilities(&self) -> Capabilities {
        self.state.capabilities
    }

    async fn begin(&self) -> Result<Box<dyn DriverTx>> {
        self.record(BEGIN.to_string()).await?;
        Ok(Box::new(RecordingTx {
            driver: self.clone(),
            finished: false,
        }))
    }

    async fn exec(&self, sql: &str, _params: &[Value]) -> Result<u64> {
        self.record(sql.to_string()).await?;
        Ok(1)
    }

    async fn query(&self, sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        self.record(sql.to_string()).await?;
        Ok(self.rows())
    }

    async fn prepare(&self, sql: &str) -> Result<Prepared> {
        self.record(format!("PREPARE {sql}")).await?;
        Ok(Prepared::new(sql, count_placeholders(sql)))
    }
}

#[derive(Debug)]
struct RecordingTx {
    driver: RecordingDriver,
    finished: bool,
}

impl RecordingTx {
    fn check_open(&self) -> Result<()> {
        if self.finished {
            return Err(DriverError::TransactionFinished);
        }
        Ok(())
    }
}

#[async_trait]
impl DriverTx for RecordingTx {
    async fn exec(&mut self, sql: &str, _params: &[Value]) -> Result<u64> {
        self.check_open()?;
        self.driver.record(sql.to_string()).await?;
        Ok(1)
    }

    async fn query(&mut self, sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        self.check_open()?;
        self.driver.record(sql.to_string()).await?;
        Ok(self.driver.rows())
    }

    async fn prepare(&mut self, sql: &str) -> Result<Prepared> {
        self.check_open()?;
        self.driver.record(format!("PREPARE {sql}")).await?;
        Ok(Prepared::new(sql, count_placeholders(sql)))
    }

    async fn commit(&mut self) -> Result<()> {
        self.check_open()?;
        self.driver.record(COMMIT.to_string()).await?;
        self.finished = true;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.check_open()?;
        self.driver.record(ROLLBACK.to_string()).await?;
        self.finished = true;
        Ok(())
    }
}

/// Highest `$n` placeholder in the text.
fn count_placeholders(sql: &str) -> usize {
    sql.split('$')
        .skip(1)
        .filter_map(|rest| {
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<usize>().ok()
        })
        .max()
        .unwrap_or(0)
}
