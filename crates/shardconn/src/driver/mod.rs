//! Seam between connections and physical database drivers.
//!
//! A [`Driver`] is a pooled physical handle able to run statements outside of
//! a transaction and to open a flat transaction ([`DriverTx`]). Nesting is not
//! a driver concern; connections emulate it with savepoints when the driver
//! reports the capability.
pub mod errors;
pub mod postgres;
pub mod recording;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::statement::Prepared;
use crate::value::{Row, Value};
use errors::Result;

/// Identifies the driver behind a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    Postgres,
    /// In-memory driver that records every call.
    Recording,
}

impl DriverKind {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Recording => "recording",
        }
    }

    /// Capabilities drivers of this kind have unless configured otherwise.
    pub const fn default_capabilities(&self) -> Capabilities {
        match self {
            Self::Postgres | Self::Recording => Capabilities { savepoints: true },
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for DriverKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "recording" => Ok(Self::Recording),
            other => Err(format!("unknown driver: {other}")),
        }
    }
}

/// Optional driver features connections branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// `SAVEPOINT`, `RELEASE SAVEPOINT` and `ROLLBACK TO SAVEPOINT` are
    /// available inside a transaction.
    pub savepoints: bool,
}

#[async_trait]
pub trait Driver: Send + Sync + fmt::Debug {
    fn kind(&self) -> DriverKind;

    fn capabilities(&self) -> Capabilities {
        self.kind().default_capabilities()
    }

    /// Open a transaction on a dedicated physical link.
    async fn begin(&self) -> Result<Box<dyn DriverTx>>;

    /// Execute a statement outside of a transaction, returning affected rows.
    async fn exec(&self, sql: &str, params: &[Value]) -> Result<u64>;

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    async fn prepare(&self, sql: &str) -> Result<Prepared>;
}

/// An open flat transaction.
///
/// `commit` and `rollback` take `&mut self` so that a failed attempt leaves the
/// handle with its owner.
#[async_trait]
pub trait DriverTx: Send + Sync + fmt::Debug {
    async fn exec(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    async fn prepare(&mut self, sql: &str) -> Result<Prepared>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}
