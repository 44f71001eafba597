//! SQLite persistence for tasks, approvals, audit trails and controller state.
//!
//! The store never reads the clock for task data: every operation that
//! stamps or compares task times takes `now` from the caller, so the
//! controller's injected [`crate::clock::Clock`] is the single time source.

pub mod action_log;
pub mod activity;
pub mod approvals;
pub mod controller_state;
pub mod deps;
pub mod stats;
pub mod tasks;

use anyhow::{Context, Result};
use rusqlite::{Connection, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

/// Applied to every connection. WAL lets `taskpilot task ...` read while a
/// controller holds the database open.
const FILE_PRAGMAS: &str = "PRAGMA journal_mode=WAL;
                            PRAGMA foreign_keys=ON;
                            PRAGMA busy_timeout=5000;";

const MEMORY_PRAGMAS: &str = "PRAGMA foreign_keys=ON;";

/// Shared handle; clones use the same connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (creating if needed) the database file and bring its schema up to date.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("opening database {}", path.display()))?;
        Self::prepare(conn, FILE_PRAGMAS)
    }

    /// A private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::prepare(Connection::open_in_memory()?, MEMORY_PRAGMAS)
    }

    fn prepare(mut conn: Connection, pragmas: &str) -> Result<Self> {
        conn.execute_batch(pragmas)?;

        let report = embedded::migrations::runner()
            .run(&mut conn)
            .context("running schema migrations")?;
        for migration in report.applied_migrations() {
            debug!(
                version = migration.version(),
                name = migration.name(),
                "Applied migration"
            );
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic elsewhere does not leave the connection itself inconsistent
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` with the connection held.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        f(&self.lock())
    }

    /// Run `f` inside a transaction. Commits when `f` succeeds, rolls back
    /// (on drop) when it fails.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction) -> Result<T>,
    {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}
