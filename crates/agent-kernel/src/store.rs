//! Store handle over SQLite.
//!
//! The schema is created idempotently on connect; no external migration
//! tooling is involved. SQLite's single-writer transaction model is what
//! makes every check-then-write sequence in the kernel atomic: a write
//! transaction holds the database until commit, which subsumes the row lock
//! a multi-writer store would need on the parent budget account.

use std::path::Path;
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::KernelError;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS agents (
        id            BLOB PRIMARY KEY,
        role          TEXT NOT NULL,
        task          TEXT NOT NULL,
        depth         INTEGER NOT NULL,
        parent_id     BLOB REFERENCES agents(id),
        status        TEXT NOT NULL DEFAULT 'pending',
        result        TEXT,
        error         TEXT,
        metadata      TEXT NOT NULL DEFAULT '{}',
        created_at    TEXT NOT NULL,
        updated_at    TEXT NOT NULL,
        completed_at  TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status)",
    "CREATE INDEX IF NOT EXISTS idx_agents_parent ON agents(parent_id)",
    r#"
    CREATE TABLE IF NOT EXISTS hierarchies (
        parent_id   BLOB NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
        child_id    BLOB NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
        created_at  TEXT NOT NULL,
        PRIMARY KEY (parent_id, child_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_hierarchies_parent ON hierarchies(parent_id)",
    r#"
    CREATE TABLE IF NOT EXISTS budgets (
        agent_id    BLOB PRIMARY KEY REFERENCES agents(id) ON DELETE CASCADE,
        allocated   INTEGER NOT NULL,
        used        INTEGER NOT NULL DEFAULT 0,
        reserved    INTEGER NOT NULL DEFAULT 0,
        reclaimed   INTEGER NOT NULL DEFAULT 0,
        frozen      INTEGER NOT NULL DEFAULT 0,
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL,
        CHECK (allocated > 0),
        CHECK (used >= 0),
        CHECK (reserved >= 0),
        CHECK (used + reserved <= allocated)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id            BLOB PRIMARY KEY,
        sender_id     BLOB NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
        recipient_id  BLOB NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
        payload       TEXT NOT NULL,
        priority      INTEGER NOT NULL DEFAULT 0,
        status        TEXT NOT NULL DEFAULT 'pending',
        thread_id     BLOB,
        created_at    TEXT NOT NULL,
        processed_at  TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_messages_inbox
        ON messages(recipient_id, status, priority DESC, created_at ASC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workspaces (
        agent_id          BLOB PRIMARY KEY REFERENCES agents(id) ON DELETE CASCADE,
        path              TEXT NOT NULL,
        branch            TEXT NOT NULL,
        isolation_status  TEXT NOT NULL DEFAULT 'active',
        created_at        TEXT NOT NULL,
        updated_at        TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_workspaces_status ON workspaces(isolation_status)",
    r#"
    CREATE TABLE IF NOT EXISTS workflow_graphs (
        id                 BLOB PRIMARY KEY,
        name               TEXT NOT NULL,
        status             TEXT NOT NULL DEFAULT 'created',
        validation_status  TEXT NOT NULL DEFAULT 'pending',
        validation_errors  TEXT,
        validated_at       TEXT,
        created_at         TEXT NOT NULL,
        updated_at         TEXT NOT NULL,
        completed_at       TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_graphs_status ON workflow_graphs(status)",
    r#"
    CREATE TABLE IF NOT EXISTS workflow_nodes (
        id                BLOB PRIMARY KEY,
        graph_id          BLOB NOT NULL REFERENCES workflow_graphs(id) ON DELETE CASCADE,
        agent_id          BLOB REFERENCES agents(id),
        role              TEXT NOT NULL,
        task              TEXT NOT NULL,
        budget            INTEGER NOT NULL,
        dependencies      TEXT NOT NULL DEFAULT '[]',
        execution_status  TEXT NOT NULL DEFAULT 'pending',
        result            TEXT,
        error_message     TEXT,
        spawned_at        TEXT,
        completed_at      TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_nodes_graph ON workflow_nodes(graph_id)",
    "CREATE INDEX IF NOT EXISTS idx_nodes_agent ON workflow_nodes(agent_id)",
];

/// Shared handle to the relational store.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if necessary) a database file and bootstrap the schema.
    pub async fn open(path: impl AsRef<Path>, max_connections: u32) -> Result<Self, KernelError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        Self::connect(options, max_connections).await
    }

    /// Open a process-private in-memory database.
    ///
    /// The pool is pinned to a single never-expiring connection: an in-memory
    /// SQLite database lives and dies with its connection.
    pub async fn in_memory() -> Result<Self, KernelError> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;
        Self::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn connect(options: SqliteConnectOptions, max_connections: u32) -> Result<Self, KernelError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;
        Self::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn init_schema(pool: &SqlitePool) -> Result<(), KernelError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Retry `call` while it fails with a transient store error, up to `limit`
/// extra attempts with jittered exponential backoff. Any other error, and any
/// success, is returned immediately.
pub(crate) async fn with_transient_retry<'a, T>(
    op: &'static str,
    limit: u32,
    mut call: impl FnMut() -> BoxFuture<'a, Result<T, KernelError>>,
) -> Result<T, KernelError> {
    let mut attempt = 0u32;
    loop {
        match call().await {
            Err(err) if err.is_transient() && attempt < limit => {
                attempt += 1;
                let delay = backoff_delay(attempt);
                tracing::warn!(
                    op,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient store error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = 25u64.saturating_mul(1u64 << attempt.min(6));
    let jitter = rand::thread_rng().gen_range(0..25u64);
    Duration::from_millis(base + jitter)
}
