//! Persisted data model: agents, budgets, messages, workspaces and workflow
//! graphs, together with their status state machines.
//!
//! Every mutable entity lives in the relational store; the types here are the
//! in-memory mirror of one row each. Status enums carry their transition
//! tables so the components can validate moves before touching the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::KernelError;

/// Lifecycle states of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Terminated,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Pending => "pending",
            AgentStatus::Executing => "executing",
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
            AgentStatus::Terminated => "terminated",
        }
    }

    pub fn parse(value: &str) -> Result<Self, KernelError> {
        match value {
            "pending" => Ok(AgentStatus::Pending),
            "executing" => Ok(AgentStatus::Executing),
            "completed" => Ok(AgentStatus::Completed),
            "failed" => Ok(AgentStatus::Failed),
            "terminated" => Ok(AgentStatus::Terminated),
            other => Err(KernelError::Validation(format!(
                "unknown agent status '{other}'"
            ))),
        }
    }

    /// Terminal states are permanent apart from the cleanup move to
    /// `terminated`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Failed | AgentStatus::Terminated
        )
    }

    /// The lifecycle transition table.
    pub fn can_transition_to(&self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (self, next),
            (Pending, Executing)
                | (Pending, Terminated)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Executing, Terminated)
                | (Completed, Terminated)
                | (Failed, Terminated)
        )
    }
}

/// Delivery states of a queued message. Transitions are forward-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Delivered,
    Processed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Processed => "processed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, KernelError> {
        match value {
            "pending" => Ok(MessageStatus::Pending),
            "delivered" => Ok(MessageStatus::Delivered),
            "processed" => Ok(MessageStatus::Processed),
            other => Err(KernelError::Validation(format!(
                "unknown message status '{other}'"
            ))),
        }
    }

    pub fn can_advance_to(&self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Pending, Delivered) | (Pending, Processed) | (Delivered, Processed)
        )
    }
}

/// Isolation states of an agent workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationStatus {
    Active,
    Merged,
    Deleted,
}

impl IsolationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationStatus::Active => "active",
            IsolationStatus::Merged => "merged",
            IsolationStatus::Deleted => "deleted",
        }
    }

    pub fn parse(value: &str) -> Result<Self, KernelError> {
        match value {
            "active" => Ok(IsolationStatus::Active),
            "merged" => Ok(IsolationStatus::Merged),
            "deleted" => Ok(IsolationStatus::Deleted),
            other => Err(KernelError::Validation(format!(
                "unknown isolation status '{other}'"
            ))),
        }
    }

    pub fn can_advance_to(&self, next: IsolationStatus) -> bool {
        use IsolationStatus::*;
        matches!(
            (self, next),
            (Active, Merged) | (Active, Deleted) | (Merged, Deleted)
        )
    }
}

/// States of a workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphStatus {
    Created,
    Active,
    Completed,
    Failed,
    Terminated,
}

impl GraphStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphStatus::Created => "created",
            GraphStatus::Active => "active",
            GraphStatus::Completed => "completed",
            GraphStatus::Failed => "failed",
            GraphStatus::Terminated => "terminated",
        }
    }

    pub fn parse(value: &str) -> Result<Self, KernelError> {
        match value {
            "created" => Ok(GraphStatus::Created),
            "active" => Ok(GraphStatus::Active),
            "completed" => Ok(GraphStatus::Completed),
            "failed" => Ok(GraphStatus::Failed),
            "terminated" => Ok(GraphStatus::Terminated),
            other => Err(KernelError::Validation(format!(
                "unknown graph status '{other}'"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GraphStatus::Completed | GraphStatus::Failed | GraphStatus::Terminated
        )
    }
}

/// Validation states of a workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Pending,
    Validated,
    Invalid,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Pending => "pending",
            ValidationStatus::Validated => "validated",
            ValidationStatus::Invalid => "invalid",
        }
    }

    pub fn parse(value: &str) -> Result<Self, KernelError> {
        match value {
            "pending" => Ok(ValidationStatus::Pending),
            "validated" => Ok(ValidationStatus::Validated),
            "invalid" => Ok(ValidationStatus::Invalid),
            other => Err(KernelError::Validation(format!(
                "unknown validation status '{other}'"
            ))),
        }
    }
}

/// Execution states of a workflow node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeExecutionStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Skipped,
}

impl NodeExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeExecutionStatus::Pending => "pending",
            NodeExecutionStatus::Executing => "executing",
            NodeExecutionStatus::Completed => "completed",
            NodeExecutionStatus::Failed => "failed",
            NodeExecutionStatus::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Result<Self, KernelError> {
        match value {
            "pending" => Ok(NodeExecutionStatus::Pending),
            "executing" => Ok(NodeExecutionStatus::Executing),
            "completed" => Ok(NodeExecutionStatus::Completed),
            "failed" => Ok(NodeExecutionStatus::Failed),
            "skipped" => Ok(NodeExecutionStatus::Skipped),
            other => Err(KernelError::Validation(format!(
                "unknown node execution status '{other}'"
            ))),
        }
    }
}

/// One agent row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: Uuid,
    pub role: String,
    pub task: String,
    /// Distance from the root of the hierarchy; roots sit at 0.
    pub depth: i64,
    pub parent: Option<Uuid>,
    pub status: AgentStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set exactly when the status becomes terminal.
    pub completed_at: Option<DateTime<Utc>>,
}

impl AgentRecord {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// Request to create an agent.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub role: String,
    pub task: String,
    /// Token allocation; the configured default applies when absent.
    pub budget: Option<i64>,
    pub parent: Option<Uuid>,
    pub metadata: Option<serde_json::Value>,
}

impl SpawnSpec {
    pub fn new(role: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            task: task.into(),
            budget: None,
            parent: None,
            metadata: None,
        }
    }

    pub fn with_budget(mut self, tokens: i64) -> Self {
        self.budget = Some(tokens);
        self
    }

    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// Filter for agent listings. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub status: Option<AgentStatus>,
    pub role: Option<String>,
    pub parent: Option<Uuid>,
    pub depth: Option<i64>,
}

/// Outcome of a termination cascade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminationReport {
    pub subordinates_terminated: u64,
    pub budget_reclaimed: i64,
    pub at: DateTime<Utc>,
}

/// An agent with its transitive subordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchyNode {
    pub agent: AgentRecord,
    pub children: Vec<HierarchyNode>,
}

/// One budget account row. Exactly one exists per agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetAccount {
    pub agent: Uuid,
    pub allocated: i64,
    pub used: i64,
    /// Tokens promised to children; released by reclamation.
    pub reserved: i64,
    pub reclaimed: bool,
    pub frozen: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BudgetAccount {
    /// Tokens the agent may still consume or hand to children.
    pub fn available(&self) -> i64 {
        self.allocated - self.used - self.reserved
    }
}

/// Result of reclaiming a child account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReclaimOutcome {
    pub parent: BudgetAccount,
    pub child: BudgetAccount,
    /// Unused tokens returned to the parent (`allocated - used`).
    pub amount: i64,
}

/// One node in the budget hierarchy view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetTreeNode {
    pub account: BudgetAccount,
    pub role: String,
    pub children: Vec<BudgetTreeNode>,
}

/// One message row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Uuid,
    pub sender: Uuid,
    pub recipient: Uuid,
    pub payload: serde_json::Value,
    /// Higher values are delivered first.
    pub priority: i64,
    pub status: MessageStatus,
    pub thread: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    /// Set exactly when the status becomes `processed`.
    pub processed_at: Option<DateTime<Utc>>,
}

/// Per-recipient result of a broadcast.
#[derive(Debug, Clone, Default)]
pub struct BroadcastOutcome {
    pub sent: Vec<MessageRecord>,
    pub failed: Vec<(Uuid, String)>,
}

/// Queue counts by status.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueStatistics {
    pub total: u64,
    pub pending: u64,
    pub delivered: u64,
    pub processed: u64,
}

/// One workspace row. At most one exists per agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    pub agent: Uuid,
    pub path: String,
    pub branch: String,
    pub isolation_status: IsolationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a workspace cleanup sweep.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub removed: Vec<Uuid>,
    pub failed: Vec<(Uuid, String)>,
}

/// One workflow graph row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraphRecord {
    pub id: Uuid,
    pub name: String,
    pub status: GraphStatus,
    pub validation_status: ValidationStatus,
    pub validation_errors: Option<Vec<GraphViolation>>,
    pub validated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One workflow node row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNodeRecord {
    pub id: Uuid,
    pub graph: Uuid,
    /// Set when the node's agent has been spawned.
    pub agent: Option<Uuid>,
    pub role: String,
    pub task: String,
    pub budget: i64,
    /// Sibling node ids that must complete before this node starts.
    pub dependencies: Vec<Uuid>,
    pub execution_status: NodeExecutionStatus,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub spawned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Node description inside a [`GraphSpec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: Uuid,
    pub role: String,
    pub task: String,
    pub budget: Option<i64>,
    pub dependencies: Vec<Uuid>,
}

impl NodeSpec {
    pub fn new(role: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: role.into(),
            task: task.into(),
            budget: None,
            dependencies: Vec::new(),
        }
    }

    pub fn with_budget(mut self, tokens: i64) -> Self {
        self.budget = Some(tokens);
        self
    }

    pub fn depends_on(mut self, dependency: Uuid) -> Self {
        self.dependencies.push(dependency);
        self
    }
}

/// Description of a workflow graph to create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSpec {
    pub name: String,
    pub nodes: Vec<NodeSpec>,
}

/// Structural violation found by graph validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphViolation {
    pub code: ViolationCode,
    pub details: String,
}

/// Classes of graph violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationCode {
    EmptyWorkflow,
    MissingDependency,
    SelfDependency,
    CircularDependency,
    NoStartingNodes,
}

impl ViolationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationCode::EmptyWorkflow => "EMPTY_WORKFLOW",
            ViolationCode::MissingDependency => "MISSING_DEPENDENCY",
            ViolationCode::SelfDependency => "SELF_DEPENDENCY",
            ViolationCode::CircularDependency => "CIRCULAR_DEPENDENCY",
            ViolationCode::NoStartingNodes => "NO_STARTING_NODES",
        }
    }
}

/// Result of validating a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<GraphViolation>,
}

/// Aggregate node counts for a graph.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WorkflowProgress {
    pub total: u64,
    pub pending: u64,
    pub executing: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl WorkflowProgress {
    /// True once nothing can make further progress.
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.executing == 0
    }
}
