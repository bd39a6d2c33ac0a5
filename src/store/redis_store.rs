//! Redis-backed shared store.
//!
//! Procedures are registered with `SCRIPT LOAD` and run with `EVALSHA`, so a
//! single invocation executes atomically on the Redis server.

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::{aio::MultiplexedConnection, Client, ErrorKind, RedisError};
use tracing::{debug, info};

use super::{Procedure, ScriptHandle, ScriptStore};
use crate::error::StoreError;

/// Shared store backed by a Redis server.
pub struct RedisStore {
    connection: RwLock<Option<MultiplexedConnection>>,
}

impl RedisStore {
    /// Connect to the server at `url` ("redis://127.0.0.1:6379").
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(map_error)?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_error)?;

        info!(addr = %server_addr(&client), "Connected to Redis store");
        Ok(Self {
            connection: RwLock::new(Some(connection)),
        })
    }

    fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        self.connection
            .read()
            .clone()
            .ok_or_else(|| StoreError::Unavailable("store is closed".to_string()))
    }
}

/// Host and port of the server, without credentials.
fn server_addr(client: &Client) -> String {
    client.get_connection_info().addr.to_string()
}

fn map_error(err: RedisError) -> StoreError {
    match err.kind() {
        ErrorKind::NoScriptError => StoreError::NoScript,
        ErrorKind::IoError | ErrorKind::ClientError | ErrorKind::BusyLoadingError => {
            StoreError::Unavailable(err.to_string())
        }
        _ if err.is_connection_dropped() || err.is_timeout() => {
            StoreError::Unavailable(err.to_string())
        }
        _ => StoreError::Script(err.to_string()),
    }
}

#[async_trait]
impl ScriptStore for RedisStore {
    async fn load(&self, procedure: &Procedure) -> Result<ScriptHandle, StoreError> {
        let mut conn = self.connection()?;
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(procedure.source)
            .query_async(&mut conn)
            .await
            .map_err(map_error)?;

        debug!(procedure = %procedure.id(), sha = %sha, "Procedure loaded into Redis");
        Ok(ScriptHandle::new(sha))
    }

    async fn invoke(
        &self,
        handle: &ScriptHandle,
        key: &str,
        args: &[i64],
    ) -> Result<i64, StoreError> {
        let mut conn = self.connection()?;
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(handle.as_str()).arg(1).arg(key);
        for value in args {
            cmd.arg(*value);
        }
        cmd.query_async(&mut conn).await.map_err(map_error)
    }

    async fn close(&self) -> Result<(), StoreError> {
        if self.connection.write().take().is_some() {
            info!("Closed Redis store connection");
        }
        Ok(())
    }
}
