//! SQLite store handle and bootstrap entry points.
//!
//! # Responsibility
//! - Open and configure SQLite connections.
//! - Run store work on the blocking pool behind one shared connection handle.
//! - Verify that entity tables exist before repositories use them.
//!
//! # Invariants
//! - Connection access is serialized through one mutex per store.
//! - Store work never runs on the async executor thread.
//! - Schema creation and migration belong to the host application.

use crate::repo::error::RepoResult;
use rusqlite::Connection;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::sync::{Arc, Mutex};
use tokio::task::spawn_blocking;

mod open;
pub(crate) mod plan;
mod readiness;

pub use open::{open_store, open_store_in_memory};
pub(crate) use readiness::ensure_table_ready;

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    /// A previous store task panicked while holding the connection.
    ConnectionPoisoned,
    /// The blocking task running store work failed to complete.
    TaskFailed(String),
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::ConnectionPoisoned => write!(f, "sqlite connection poisoned"),
            Self::TaskFailed(message) => write!(f, "store task failed: {message}"),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::ConnectionPoisoned | Self::TaskFailed(_) => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

/// Cloneable handle to one SQLite connection.
///
/// Sessions and bulk engines hold clones; the connection closes when the last
/// clone is dropped.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl Debug for SqliteStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("handles", &self.handle_count())
            .finish()
    }
}

impl SqliteStore {
    pub(crate) fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Runs `func` against the connection on the blocking pool.
    pub async fn run<F, T>(&self, func: F) -> RepoResult<T>
    where
        F: FnOnce(&mut Connection) -> RepoResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| DbError::ConnectionPoisoned)?;
            func(&mut guard)
        })
        .await
        .map_err(|err| DbError::TaskFailed(err.to_string()))?
    }

    /// Executes raw SQL, typically schema setup owned by the host.
    pub async fn execute_batch(&self, sql: impl Into<String>) -> RepoResult<()> {
        let sql = sql.into();
        self.run(move |conn| {
            conn.execute_batch(&sql)?;
            Ok(())
        })
        .await
    }

    /// Number of live handles sharing this connection.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.conn)
    }
}
