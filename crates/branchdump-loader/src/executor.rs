use async_trait::async_trait;
use branchdump_core::Result;
use branchdump_mysql::{Connection, LoginOptions, WireError};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// A failed statement, classified by how far the failure reaches.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// The server rejected the statement; the session is still usable.
    #[error("{0}")]
    Statement(String),
    /// The session is gone.
    #[error("{0}")]
    Connection(String),
}

impl From<WireError> for ExecError {
    fn from(err: WireError) -> Self {
        if err.is_recoverable() {
            ExecError::Statement(err.to_string())
        } else {
            ExecError::Connection(err.to_string())
        }
    }
}

/// One session that runs statements in order.
#[async_trait]
pub trait StatementExecutor: Send {
    /// Runs `sql` and returns the affected row count.
    async fn execute(&mut self, sql: &str) -> std::result::Result<u64, ExecError>;

    async fn close(self: Box<Self>);
}

/// Opens sessions for loader workers.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn StatementExecutor>>;
}

/// Connects to a MySQL endpoint, normally the local relay, and selects the
/// destination database.
pub struct MySqlConnector {
    addr: String,
    login: LoginOptions,
    database: String,
    timeout: Duration,
}

impl MySqlConnector {
    pub fn new(addr: impl Into<String>, login: LoginOptions, database: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            login,
            database: database.into(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(&self) -> Result<Box<dyn StatementExecutor>> {
        let mut conn = Connection::connect(&self.addr, &self.login, self.timeout).await?;
        conn.select_db(&self.database).await?;
        debug!(addr = %self.addr, connection_id = conn.connection_id(), database = %self.database, "loader session ready");
        Ok(Box::new(conn))
    }
}

#[async_trait]
impl StatementExecutor for Connection {
    async fn execute(&mut self, sql: &str) -> std::result::Result<u64, ExecError> {
        Ok(self.query(sql).await?.affected_rows)
    }

    async fn close(self: Box<Self>) {
        if let Err(e) = self.quit().await {
            debug!("closing loader session: {}", e);
        }
    }
}
