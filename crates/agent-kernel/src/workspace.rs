//! Per-agent workspace isolation.
//!
//! The kernel records workspace state; the actual working copies are
//! created and destroyed by a pluggable [`WorktreeDriver`] (a VCS adapter in
//! production, a temp-dir stub in tests). Only the owning agent touches its
//! workspace, so no locking happens here.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::models::{CleanupReport, IsolationStatus, WorkspaceRecord};
use crate::store::{with_transient_retry, Store};
use crate::{KernelConfig, KernelError};

/// Outcome of creating a working copy.
#[derive(Debug, Clone)]
pub struct ProvisionedWorktree {
    pub path: PathBuf,
    pub branch: String,
}

/// Options for a workspace diff.
#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    /// Restrict the diff to these paths; empty means the whole tree.
    pub paths: Vec<PathBuf>,
    /// Emit a summary instead of full patch text.
    pub stat_only: bool,
}

/// Abstract VCS driver realizing workspace isolation.
#[async_trait]
pub trait WorktreeDriver: Send + Sync {
    async fn create(&self, agent: Uuid) -> Result<ProvisionedWorktree, KernelError>;
    async fn delete(&self, agent: Uuid, force: bool) -> Result<bool, KernelError>;
    async fn diff(&self, agent: Uuid, opts: &DiffOptions) -> Result<String, KernelError>;
    async fn changed_files(&self, agent: Uuid) -> Result<Vec<PathBuf>, KernelError>;
    async fn list_all(&self) -> Result<Vec<Uuid>, KernelError>;
}

#[derive(Clone)]
pub struct WorkspaceManager {
    store: Store,
    driver: Arc<dyn WorktreeDriver>,
    merged_max_age: Duration,
    deleted_max_age: Duration,
    retry_limit: u32,
}

impl WorkspaceManager {
    pub fn new(store: Store, driver: Arc<dyn WorktreeDriver>, config: &KernelConfig) -> Self {
        Self {
            store,
            driver,
            merged_max_age: Duration::days(config.workspace_merged_max_age_days),
            deleted_max_age: Duration::days(config.workspace_deleted_max_age_days),
            retry_limit: config.store_retry_limit,
        }
    }

    /// Create the working copy for `agent` and record it. At most one
    /// workspace exists per agent; a second call is a conflict.
    pub async fn provision(&self, agent: Uuid) -> Result<WorkspaceRecord, KernelError> {
        if self.fetch(agent).await?.is_some() {
            return Err(KernelError::Conflict(format!(
                "workspace already exists for agent {agent}"
            )));
        }
        let worktree = self.driver.create(agent).await?;
        let now = Utc::now();
        let path = worktree.path.to_string_lossy().into_owned();

        with_transient_retry("workspace.provision", self.retry_limit, || {
            let path = path.clone();
            let branch = worktree.branch.clone();
            Box::pin(async move {
                sqlx::query(
                    r#"
                    INSERT INTO workspaces (agent_id, path, branch, isolation_status, created_at, updated_at)
                    VALUES (?1, ?2, ?3, 'active', ?4, ?4)
                    "#,
                )
                .bind(agent)
                .bind(path)
                .bind(branch)
                .bind(now)
                .execute(self.store.pool())
                .await?;
                Ok(())
            })
        })
        .await?;

        tracing::info!(agent = %agent, branch = %worktree.branch, "workspace provisioned");
        Ok(WorkspaceRecord {
            agent,
            path,
            branch: worktree.branch,
            isolation_status: IsolationStatus::Active,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get(&self, agent: Uuid) -> Result<WorkspaceRecord, KernelError> {
        self.fetch(agent)
            .await?
            .ok_or_else(|| KernelError::not_found("workspace", agent))
    }

    pub async fn diff(&self, agent: Uuid, opts: &DiffOptions) -> Result<String, KernelError> {
        self.get(agent).await?;
        self.driver.diff(agent, opts).await
    }

    pub async fn changed_files(&self, agent: Uuid) -> Result<Vec<PathBuf>, KernelError> {
        self.get(agent).await?;
        self.driver.changed_files(agent).await
    }

    /// Advance the isolation status. Only forward moves are accepted.
    pub async fn update_status(
        &self,
        agent: Uuid,
        next: IsolationStatus,
    ) -> Result<WorkspaceRecord, KernelError> {
        let current = self.get(agent).await?;
        if !current.isolation_status.can_advance_to(next) {
            return Err(KernelError::InvalidTransition(format!(
                "workspace {agent} cannot move from {} to {}",
                current.isolation_status.as_str(),
                next.as_str()
            )));
        }
        let now = Utc::now();
        let updated = sqlx::query(
            r#"
            UPDATE workspaces SET isolation_status = ?2, updated_at = ?3
            WHERE agent_id = ?1 AND isolation_status = ?4
            "#,
        )
        .bind(agent)
        .bind(next.as_str())
        .bind(now)
        .bind(current.isolation_status.as_str())
        .execute(self.store.pool())
        .await?;
        if updated.rows_affected() == 0 {
            return Err(KernelError::Conflict(format!(
                "workspace {agent} changed concurrently"
            )));
        }
        Ok(WorkspaceRecord {
            isolation_status: next,
            updated_at: now,
            ..current
        })
    }

    /// Remove stale merged/deleted workspaces: their working copies through
    /// the driver, then their rows. Per-entry failures are reported, not
    /// fatal.
    pub async fn cleanup_stale(&self, now: DateTime<Utc>) -> Result<CleanupReport, KernelError> {
        let merged_cutoff = now - self.merged_max_age;
        let deleted_cutoff = now - self.deleted_max_age;
        let rows = sqlx::query(
            r#"
            SELECT agent_id, path, branch, isolation_status, created_at, updated_at
            FROM workspaces
            WHERE (isolation_status = 'merged' AND updated_at < ?1)
               OR (isolation_status = 'deleted' AND updated_at < ?2)
            "#,
        )
        .bind(merged_cutoff)
        .bind(deleted_cutoff)
        .fetch_all(self.store.pool())
        .await?;

        let mut report = CleanupReport::default();
        for row in &rows {
            let workspace = workspace_from_row(row)?;
            match self.remove_one(&workspace).await {
                Ok(()) => report.removed.push(workspace.agent),
                Err(err) => {
                    tracing::warn!(agent = %workspace.agent, error = %err, "workspace cleanup failed");
                    report.failed.push((workspace.agent, err.to_string()));
                }
            }
        }
        if !report.removed.is_empty() {
            tracing::info!(
                removed = report.removed.len(),
                failed = report.failed.len(),
                "workspace cleanup sweep finished"
            );
        }
        Ok(report)
    }

    async fn remove_one(&self, workspace: &WorkspaceRecord) -> Result<(), KernelError> {
        self.driver.delete(workspace.agent, true).await?;
        sqlx::query("DELETE FROM workspaces WHERE agent_id = ?1")
            .bind(workspace.agent)
            .execute(self.store.pool())
            .await?;
        Ok(())
    }

    async fn fetch(&self, agent: Uuid) -> Result<Option<WorkspaceRecord>, KernelError> {
        let row = sqlx::query(
            r#"
            SELECT agent_id, path, branch, isolation_status, created_at, updated_at
            FROM workspaces WHERE agent_id = ?1
            "#,
        )
        .bind(agent)
        .fetch_optional(self.store.pool())
        .await?;
        row.as_ref().map(workspace_from_row).transpose()
    }
}

fn workspace_from_row(row: &SqliteRow) -> Result<WorkspaceRecord, KernelError> {
    let status: String = row.try_get("isolation_status")?;
    Ok(WorkspaceRecord {
        agent: row.try_get("agent_id")?,
        path: row.try_get("path")?,
        branch: row.try_get("branch")?,
        isolation_status: IsolationStatus::parse(&status)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
