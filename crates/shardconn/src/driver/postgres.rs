//! Postgres driver backed by `tokio-postgres`.
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use tokio_postgres::types::{IsNull, ToSql, Type as PostgresType, to_sql_checked};
use tokio_postgres::{Client, Config, NoTls};
use tracing::{debug, warn};

use super::errors::{DriverError, Result};
use super::{Driver, DriverKind, DriverTx};
use crate::statement::Prepared;
use crate::value::{Row, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    /// Idle clients kept around for reuse.
    pub max_idle: usize,
    pub connect_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            max_idle: 4,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PostgresDriver {
    pool: Arc<PostgresPool>,
}

impl PostgresDriver {
    /// Create a driver for a connection string. No connection is made until
    /// the first statement.
    pub fn new(conn_str: &str, opts: PoolOptions) -> Result<Self> {
        let config: Config = conn_str.parse()?;
        let label = format!(
            "{:?}/{}",
            config.get_hosts(),
            config.get_dbname().unwrap_or_default()
        );
        Ok(PostgresDriver {
            pool: Arc::new(PostgresPool {
                config,
                label,
                opts,
                idle: Mutex::new(Vec::new()),
            }),
        })
    }
}

#[derive(Debug)]
struct PostgresPool {
    config: Config,
    label: String,
    opts: PoolOptions,
    idle: Mutex<Vec<Client>>,
}

impl PostgresPool {
    async fn checkout(&self) -> Result<Client> {
        loop {
            let client = self.idle.lock().pop();
            match client {
                Some(client) if client.is_closed() => continue,
                Some(client) => return Ok(client),
                None => return self.connect().await,
            }
        }
    }

    fn checkin(&self, client: Client) {
        if client.is_closed() {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.opts.max_idle {
            idle.push(client);
        }
    }

    async fn connect(&self) -> Result<Client> {
        debug!(target = %self.label, "opening postgres connection");
        let (client, connection) =
            tokio::time::timeout(self.opts.connect_timeout, self.config.connect(NoTls))
                .await
                .map_err(|_| DriverError::ConnectTimeout(self.label.clone()))??;

        let label = self.label.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(%e, target = %label, "postgres connection errored");
            }
        });

        Ok(client)
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Postgres
    }

    async fn begin(&self) -> Result<Box<dyn DriverTx>> {
        let client = self.pool.checkout().await?;
        client.batch_execute("BEGIN").await?;
        Ok(Box::new(PostgresTx {
            client: Some(client),
            pool: self.pool.clone(),
        }))
    }

    async fn exec(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let client = self.pool.checkout().await?;
        let result = client.execute(sql, &param_refs(params)).await;
        self.pool.checkin(client);
        Ok(result?)
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let client = self.pool.checkout().await?;
        let result = client.query(sql, &param_refs(params)).await;
        self.pool.checkin(client);
        result?.iter().map(convert_row).collect()
    }

    async fn prepare(&self, sql: &str) -> Result<Prepared> {
        let client = self.pool.checkout().await?;
        let result = client.prepare(sql).await;
        self.pool.checkin(client);
        let stmt = result?;
        Ok(Prepared::new(sql, stmt.params().len()))
    }
}

/// A transaction pinned to one client.
///
/// The client only goes back to the pool after a successful COMMIT or
/// ROLLBACK. Dropping an unfinished handle closes the client, which ends the
/// transaction server side.
#[derive(Debug)]
struct PostgresTx {
    client: Option<Client>,
    pool: Arc<PostgresPool>,
}

impl PostgresTx {
    fn client(&self) -> Result<&Client> {
        self.client.as_ref().ok_or(DriverError::TransactionFinished)
    }

    async fn finish(&mut self, sql: &str) -> Result<()> {
        self.client()?.batch_execute(sql).await?;
        if let Some(client) = self.client.take() {
            self.pool.checkin(client);
        }
        Ok(())
    }
}

#[async_trait]
impl DriverTx for PostgresTx {
    async fn exec(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        Ok(self.client()?.execute(sql, &param_refs(params)).await?)
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let rows = self.client()?.query(sql, &param_refs(params)).await?;
        rows.iter().map(convert_row).collect()
    }

    async fn prepare(&mut self, sql: &str) -> Result<Prepared> {
        let stmt = self.client()?.prepare(sql).await?;
        Ok(Prepared::new(sql, stmt.params().len()))
    }

    async fn commit(&mut self) -> Result<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}

fn param_refs(params: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &PostgresType,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(v) => v.to_sql(ty, out),
            Value::Int(v) => match ty {
                &PostgresType::INT2 => i16::try_from(*v)?.to_sql(ty, out),
                &PostgresType::INT4 => i32::try_from(*v)?.to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
            Value::Float(v) => match ty {
                &PostgresType::FLOAT4 => (*v as f32).to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
            Value::Text(v) => v.to_sql(ty, out),
            Value::Bytes(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &PostgresType) -> bool {
        // Checked per value in `to_sql`.
        true
    }

    to_sql_checked!();
}

fn convert_row(row: &tokio_postgres::Row) -> Result<Row> {
    let columns = row
        .columns()
        .iter()
        .map(|col| col.name().to_string())
        .collect();
    let values = row
        .columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| convert_value(row, idx, col.name(), col.type_()))
        .collect::<Result<Vec<_>>>()?;
    Ok(Row::new(columns, values))
}

fn convert_value(
    row: &tokio_postgres::Row,
    idx: usize,
    column: &str,
    ty: &PostgresType,
) -> Result<Value> {
    let value = match ty {
        &PostgresType::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool),
        &PostgresType::INT2 => row
            .try_get::<_, Option<i16>>(idx)?
            .map(|v| Value::Int(v.into())),
        &PostgresType::INT4 => row
            .try_get::<_, Option<i32>>(idx)?
            .map(|v| Value::Int(v.into())),
        &PostgresType::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(Value::Int),
        &PostgresType::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)?
            .map(|v| Value::Float(v.into())),
        &PostgresType::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(Value::Float),
        &PostgresType::TEXT
        | &PostgresType::VARCHAR
        | &PostgresType::BPCHAR
        | &PostgresType::NAME => row.try_get::<_, Option<String>>(idx)?.map(Value::Text),
        &PostgresType::BYTEA => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(Value::Bytes),
        other => {
            return Err(DriverError::UnsupportedType {
                column: column.to_string(),
                ty: other.to_string(),
            });
        }
    };
    Ok(value.unwrap_or(Value::Null))
}
