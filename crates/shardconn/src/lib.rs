//! Sharded connections with nested transactions.
//!
//! [`Connection`] layers nested transactions on top of a driver using
//! savepoints. [`ShardedConnections`] holds one base connection per shard and
//! routes keys to shards with a deterministic modulo. The [`coordinator`] runs
//! a transaction across every shard a set of keys touches, committing each
//! key in turn.
pub mod config;
pub mod conn;
pub mod coordinator;
pub mod driver;
pub mod errors;
pub mod router;
pub mod shard;
pub mod statement;
pub mod value;

pub use config::ShardConfig;
pub use conn::{Connection, TxState};
pub use coordinator::{TxScope, run_transaction, run_transaction_with_cancel};
pub use errors::{BoxError, ConnError, ShardError, ShardTxError, TransactionError};
pub use router::{KeyRouter, ShardKey, UnknownKeyPolicy};
pub use shard::ShardedConnections;
pub use statement::{Prepared, Raw, Statement};
pub use value::{Row, Value};
