//! Hierarchical Agent Orchestration Kernel
//!
//! This crate provides the orchestration core for tree-structured AI agents:
//! - Agent lifecycle state machine with hierarchical spawn validation
//! - Hierarchical token-budget ledger with strict conservation invariants
//! - Persistent priority-FIFO message queue between agents
//! - Workflow DAG engine with event-driven progression
//! - Background pollers driving pending agents and active workflows
//! - Per-agent workspace isolation over a pluggable worktree driver
//!
//! The kernel is single-process: every cross-agent invariant lives in the
//! relational store and is enforced inside transactions, never in memory.
//! External collaborators (the LLM provider, the concrete VCS driver) plug in
//! through the [`AgentExecutor`] and [`WorktreeDriver`] traits.

pub mod executor;
pub mod kernel;
pub mod ledger;
pub mod lifecycle;
pub mod models;
pub mod poller;
pub mod queue;
pub mod store;
pub mod workflow;
pub mod workspace;

pub use executor::{AgentExecutor, ExecutionChunk, ExecutionOutcome, FinishReason};
pub use kernel::Kernel;
pub use ledger::BudgetLedger;
pub use lifecycle::AgentLifecycle;
pub use models::{
    AgentFilter, AgentRecord, AgentStatus, BroadcastOutcome, BudgetAccount, BudgetTreeNode,
    CleanupReport, GraphSpec, GraphStatus, GraphViolation, HierarchyNode, IsolationStatus,
    MessageRecord, MessageStatus, NodeExecutionStatus, NodeSpec, QueueStatistics, ReclaimOutcome,
    SpawnSpec, TerminationReport, ValidationReport, ValidationStatus, ViolationCode,
    WorkflowGraphRecord, WorkflowNodeRecord, WorkflowProgress, WorkspaceRecord,
};
pub use poller::{ExecutionPoller, PollerHandle, WorkflowPoller};
pub use queue::MessageQueue;
pub use store::Store;
pub use workflow::WorkflowEngine;
pub use workspace::{DiffOptions, ProvisionedWorktree, WorkspaceManager, WorktreeDriver};

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Error taxonomy for every kernel operation.
///
/// Only [`KernelError::Store`] errors classified as transient are retried
/// inside the kernel; everything else is surfaced to the caller unchanged.
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("insufficient budget for agent {agent}: required {required}, available {available}")]
    InsufficientBudget {
        agent: Uuid,
        required: i64,
        available: i64,
    },

    #[error("maximum hierarchy depth {max_depth} exceeded")]
    MaxDepthExceeded { max_depth: i64 },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("workflow invalid: {0:?}")]
    WorkflowInvalid(Vec<models::GraphViolation>),

    #[error("executor failure: {0}")]
    Executor(String),

    #[error("workspace failure: {0}")]
    Workspace(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("payload serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl KernelError {
    pub(crate) fn not_found(kind: &'static str, id: Uuid) -> Self {
        KernelError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether the error is a transient store fault worth retrying.
    ///
    /// Under SQLite these are BUSY/LOCKED faults from a competing writer; the
    /// pool-timeout case covers exhaustion under load. Everything else is
    /// deterministic and retrying would only repeat the failure.
    pub fn is_transient(&self) -> bool {
        match self {
            KernelError::Store(sqlx::Error::PoolTimedOut) => true,
            KernelError::Store(sqlx::Error::Database(db)) => {
                let busy = matches!(
                    db.code().as_deref(),
                    Some("5") | Some("6") | Some("261") | Some("517")
                );
                busy || db.message().contains("database is locked")
            }
            _ => false,
        }
    }
}

/// Recognized kernel configuration.
///
/// Construction is plain-value only; loading from files or the environment
/// belongs to the embedding application.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Path of the SQLite database; `None` selects an in-memory store.
    pub database_path: Option<PathBuf>,
    /// Maximum hierarchy depth (root agents sit at depth 0).
    pub max_depth: i64,
    /// Fallback token allocation when a spawn omits its budget.
    pub default_budget: i64,
    /// Interval of the execution poller.
    pub exec_poll_interval: Duration,
    /// Interval of the workflow poller.
    pub workflow_poll_interval: Duration,
    /// Retention horizon for processed messages.
    pub message_retention_days: i64,
    /// Age after which merged workspaces become eligible for cleanup.
    pub workspace_merged_max_age_days: i64,
    /// Age after which deleted workspaces become eligible for cleanup.
    pub workspace_deleted_max_age_days: i64,
    /// Retry budget for transient store errors.
    pub store_retry_limit: u32,
    /// Connection cap for the store pool.
    pub max_connections: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            max_depth: 5,
            default_budget: 100_000,
            exec_poll_interval: Duration::from_secs(5),
            workflow_poll_interval: Duration::from_secs(5),
            message_retention_days: 7,
            workspace_merged_max_age_days: 7,
            workspace_deleted_max_age_days: 1,
            store_retry_limit: 3,
            max_connections: 4,
        }
    }
}
