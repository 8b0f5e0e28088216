//! Connections for a fixed set of shards.
//!
//! The base connections (one per shard) are shared by every fork of the set.
//! A fork carries its own key cache, so all work on a key inside one logical
//! transaction goes through the same forked connection.
use std::num::NonZeroUsize;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use crate::config::ShardConfig;
use crate::conn::Connection;
use crate::driver::postgres::PostgresDriver;
use crate::driver::recording::{OpLog, RecordingDriver};
use crate::driver::{Driver, DriverKind};
use crate::errors::{ConnError, ShardError};
use crate::router::{KeyRouter, RouteError, ShardKey, UnknownKeyPolicy};
use crate::statement::Statement;

/// A forked connection and the shard it belongs to.
#[derive(Debug)]
pub(crate) struct Touched {
    pub(crate) shard: usize,
    pub(crate) conn: Connection,
}

#[derive(Debug)]
pub struct ShardedConnections {
    shards: Arc<[Connection]>,
    router: KeyRouter,
    /// Key cache in first-touch order.
    touched: IndexMap<ShardKey, Touched>,
}

impl ShardedConnections {
    pub fn new(shards: Vec<Connection>, unknown: UnknownKeyPolicy) -> Result<Self, ShardError> {
        let nodes = NonZeroUsize::new(shards.len()).ok_or(ShardError::NoShards)?;
        Ok(ShardedConnections {
            shards: shards.into(),
            router: KeyRouter::new(nodes, unknown),
            touched: IndexMap::new(),
        })
    }

    pub fn from_drivers(
        drivers: Vec<Arc<dyn Driver>>,
        unknown: UnknownKeyPolicy,
    ) -> Result<Self, ShardError> {
        Self::new(drivers.into_iter().map(Connection::new).collect(), unknown)
    }

    /// Build base connections for every configured node.
    ///
    /// Drivers connect lazily, nothing is opened here.
    pub fn from_config(config: &ShardConfig) -> Result<Self, ShardError> {
        config.validate()?;
        let capabilities = config.capabilities();
        let log = OpLog::new();

        let shards = config
            .nodes
            .iter()
            .map(|node| -> Result<Connection, ShardError> {
                let driver: Arc<dyn Driver> = match config.driver {
                    DriverKind::Postgres => {
                        Arc::new(PostgresDriver::new(node, config.pool_options())?)
                    }
                    DriverKind::Recording => Arc::new(RecordingDriver::with_capabilities(
                        node.clone(),
                        log.clone(),
                        capabilities,
                    )),
                };
                Ok(Connection::with_capabilities(driver, capabilities))
            })
            .collect::<Result<Vec<_>, ShardError>>()?;

        debug!(nodes = shards.len(), driver = %config.driver, "configured shards");
        Self::new(shards, config.unknown_keys)
    }

    pub fn node_count(&self) -> usize {
        self.shards.len()
    }

    pub fn router(&self) -> &KeyRouter {
        &self.router
    }

    pub fn shard_of(&self, key: &ShardKey) -> Result<usize, RouteError> {
        self.router.route(key)
    }

    /// Get the connection for a key, forking the owning shard's base
    /// connection on first touch.
    pub fn get(&mut self, key: impl Into<ShardKey>) -> Result<&mut Connection, ShardError> {
        use indexmap::map::Entry;

        let touched = match self.touched.entry(key.into()) {
            Entry::Occupied(ent) => ent.into_mut(),
            Entry::Vacant(ent) => {
                let shard = self.router.route(ent.key())?;
                debug!(key = %ent.key(), shard, "touching shard");
                ent.insert(Touched {
                    shard,
                    conn: self.shards[shard].fork(),
                })
            }
        };
        Ok(&mut touched.conn)
    }

    /// Connection for a key that has already been touched.
    pub fn get_touched(&mut self, key: &ShardKey) -> Option<&mut Connection> {
        self.touched.get_mut(key).map(|t| &mut t.conn)
    }

    /// Touched keys in first-touch order.
    pub fn touched(&self) -> impl Iterator<Item = &ShardKey> {
        self.touched.keys()
    }

    pub fn touched_len(&self) -> usize {
        self.touched.len()
    }

    pub(crate) fn touched_at(&mut self, pos: usize) -> Option<(&ShardKey, &mut Touched)> {
        self.touched.get_index_mut(pos)
    }

    /// Visit every base connection in shard order.
    pub fn range<F, E>(&self, mut f: F) -> Result<(), E>
    where
        F: FnMut(usize, &Connection) -> Result<(), E>,
    {
        for (idx, conn) in self.shards.iter().enumerate() {
            f(idx, conn)?;
        }
        Ok(())
    }

    /// Execute a statement against every shard, outside of any transaction.
    ///
    /// Every shard is attempted even if an earlier one fails. Results are in
    /// shard order.
    pub async fn broadcast<S: Statement + ?Sized>(&self, stmt: &S) -> Vec<Result<u64, ConnError>> {
        let mut results = Vec::with_capacity(self.shards.len());
        for (shard, base) in self.shards.iter().enumerate() {
            let mut conn = base.fork();
            let result = conn.exec(stmt).await;
            if let Err(e) = &result {
                debug!(shard, %e, "broadcast failed on shard");
            }
            results.push(result);
        }
        results
    }

    /// A new set sharing the base connections with an empty key cache.
    pub fn fork(&self) -> Self {
        ShardedConnections {
            shards: self.shards.clone(),
            router: self.router,
            touched: IndexMap::new(),
        }
    }
}
