//! Agent lifecycle: creation, state-machine transitions, hierarchy queries
//! and the termination cascade.
//!
//! Spawn is atomic across agent row, hierarchy edge and budget account; the
//! workspace is provisioned best-effort after the transaction commits, so a
//! broken VCS driver can never fail a spawn. Status transitions are
//! compare-and-swap updates on the `status` column, which makes them
//! linearizable per agent.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use uuid::Uuid;

use crate::ledger::BudgetLedger;
use crate::models::{
    AgentFilter, AgentRecord, AgentStatus, HierarchyNode, SpawnSpec, TerminationReport,
};
use crate::store::{with_transient_retry, Store};
use crate::workspace::WorkspaceManager;
use crate::{KernelConfig, KernelError};

const AGENT_COLUMNS: &str = "id, role, task, depth, parent_id, status, result, error, metadata, created_at, updated_at, completed_at";

#[derive(Clone)]
pub struct AgentLifecycle {
    store: Store,
    ledger: BudgetLedger,
    workspaces: Option<WorkspaceManager>,
    max_depth: i64,
    default_budget: i64,
    retry_limit: u32,
}

impl AgentLifecycle {
    pub fn new(
        store: Store,
        ledger: BudgetLedger,
        workspaces: Option<WorkspaceManager>,
        config: &KernelConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            workspaces,
            max_depth: config.max_depth,
            default_budget: config.default_budget,
            retry_limit: config.store_retry_limit,
        }
    }

    pub fn ledger(&self) -> &BudgetLedger {
        &self.ledger
    }

    /// Create an agent in `pending` state together with its hierarchy edge
    /// and budget account. All-or-nothing: the spawn commits iff the budget
    /// step succeeds.
    pub async fn spawn(&self, spec: SpawnSpec) -> Result<AgentRecord, KernelError> {
        if spec.role.trim().is_empty() {
            return Err(KernelError::Validation("agent role must not be empty".into()));
        }
        if spec.task.trim().is_empty() {
            return Err(KernelError::Validation("agent task must not be empty".into()));
        }
        let budget = spec.budget.unwrap_or(self.default_budget);
        if budget <= 0 {
            return Err(KernelError::Validation(format!(
                "agent budget must be positive, got {budget}"
            )));
        }

        let agent = with_transient_retry("lifecycle.spawn", self.retry_limit, || {
            Box::pin(self.try_spawn(&spec, budget))
        })
        .await?;

        tracing::info!(
            agent_id = %agent.id,
            role = %agent.role,
            depth = agent.depth,
            budget,
            "agent spawned"
        );

        // Workspace provisioning is deliberately outside the transaction:
        // a driver failure is logged, never surfaced from spawn.
        if let Some(workspaces) = &self.workspaces {
            if let Err(err) = workspaces.provision(agent.id).await {
                tracing::warn!(agent_id = %agent.id, error = %err, "workspace provisioning failed");
            }
        }
        Ok(agent)
    }

    async fn try_spawn(&self, spec: &SpawnSpec, budget: i64) -> Result<AgentRecord, KernelError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let metadata = spec
            .metadata
            .clone()
            .unwrap_or_else(|| serde_json::json!({}));

        let mut tx = self.store.pool().begin().await?;

        let depth = match spec.parent {
            Some(parent_id) => {
                let parent = fetch_agent_in(&mut tx, parent_id)
                    .await?
                    .ok_or_else(|| KernelError::not_found("agent", parent_id))?;
                if parent.depth + 1 > self.max_depth {
                    return Err(KernelError::MaxDepthExceeded {
                        max_depth: self.max_depth,
                    });
                }
                parent.depth + 1
            }
            None => 0,
        };

        sqlx::query(
            r#"
            INSERT INTO agents (id, role, task, depth, parent_id, status, metadata, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?7)
            "#,
        )
        .bind(id)
        .bind(&spec.role)
        .bind(&spec.task)
        .bind(depth)
        .bind(spec.parent)
        .bind(serde_json::to_string(&metadata)?)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        match spec.parent {
            Some(parent_id) => {
                sqlx::query(
                    "INSERT INTO hierarchies (parent_id, child_id, created_at) VALUES (?1, ?2, ?3)",
                )
                .bind(parent_id)
                .bind(id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                BudgetLedger::allocate_child_in(&mut tx, parent_id, id, budget, now).await?;
            }
            None => {
                BudgetLedger::open_root_in(&mut tx, id, budget, now).await?;
            }
        }

        tx.commit().await?;

        Ok(AgentRecord {
            id,
            role: spec.role.clone(),
            task: spec.task.clone(),
            depth,
            parent: spec.parent,
            status: AgentStatus::Pending,
            result: None,
            error: None,
            metadata,
            created_at: now,
            updated_at: now,
            completed_at: None,
        })
    }

    pub async fn get_agent(&self, id: Uuid) -> Result<AgentRecord, KernelError> {
        self.fetch(id)
            .await?
            .ok_or_else(|| KernelError::not_found("agent", id))
    }

    /// List agents matching `filter`, oldest first.
    pub async fn list_agents(&self, filter: &AgentFilter) -> Result<Vec<AgentRecord>, KernelError> {
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE 1 = 1"
        ));
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(role) = &filter.role {
            query.push(" AND role = ").push_bind(role.clone());
        }
        if let Some(parent) = filter.parent {
            query.push(" AND parent_id = ").push_bind(parent);
        }
        if let Some(depth) = filter.depth {
            query.push(" AND depth = ").push_bind(depth);
        }
        query.push(" ORDER BY created_at ASC, rowid ASC");

        let rows = query.build().fetch_all(self.store.pool()).await?;
        rows.iter().map(agent_from_row).collect()
    }

    /// Transition the agent's status per the lifecycle state machine.
    pub async fn update_status(
        &self,
        id: Uuid,
        next: AgentStatus,
    ) -> Result<AgentRecord, KernelError> {
        with_transient_retry("lifecycle.update_status", self.retry_limit, || {
            Box::pin(self.cas_transition(id, next, None, None))
        })
        .await
    }

    /// `pending -> executing`.
    pub async fn start(&self, id: Uuid) -> Result<AgentRecord, KernelError> {
        self.update_status(id, AgentStatus::Executing).await
    }

    /// `executing -> completed`, persisting the result payload.
    pub async fn complete(
        &self,
        id: Uuid,
        result: serde_json::Value,
    ) -> Result<AgentRecord, KernelError> {
        with_transient_retry("lifecycle.complete", self.retry_limit, || {
            Box::pin(self.cas_transition(id, AgentStatus::Completed, Some(result.clone()), None))
        })
        .await
    }

    /// `executing -> failed`, persisting the error text.
    pub async fn fail(&self, id: Uuid, error: String) -> Result<AgentRecord, KernelError> {
        with_transient_retry("lifecycle.fail", self.retry_limit, || {
            Box::pin(self.cas_transition(id, AgentStatus::Failed, None, Some(error.clone())))
        })
        .await
    }

    /// Compare-and-swap transition: the current status is read and the update
    /// matches on it, so a concurrent transition loses cleanly.
    async fn cas_transition(
        &self,
        id: Uuid,
        next: AgentStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<AgentRecord, KernelError> {
        for _ in 0..3 {
            let current = self.get_agent(id).await?;
            if !current.status.can_transition_to(next) {
                return Err(KernelError::InvalidTransition(format!(
                    "agent {id} cannot move from {} to {}",
                    current.status.as_str(),
                    next.as_str()
                )));
            }
            let now = Utc::now();
            let result_text = result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let updated = sqlx::query(
                r#"
                UPDATE agents
                SET status = ?2,
                    updated_at = ?3,
                    completed_at = CASE WHEN ?4 THEN COALESCE(completed_at, ?3) ELSE completed_at END,
                    result = COALESCE(?5, result),
                    error = COALESCE(?6, error)
                WHERE id = ?1 AND status = ?7
                "#,
            )
            .bind(id)
            .bind(next.as_str())
            .bind(now)
            .bind(next.is_terminal())
            .bind(result_text)
            .bind(error.clone())
            .bind(current.status.as_str())
            .execute(self.store.pool())
            .await?;

            if updated.rows_affected() == 1 {
                tracing::debug!(agent_id = %id, from = current.status.as_str(), to = next.as_str(), "agent transition");
                return self.get_agent(id).await;
            }
            // Lost the race; re-read and re-validate.
        }
        Err(KernelError::Conflict(format!(
            "agent {id} status changed concurrently"
        )))
    }

    /// Result payload of a completed agent.
    pub async fn get_result(&self, id: Uuid) -> Result<serde_json::Value, KernelError> {
        let agent = self.get_agent(id).await?;
        if agent.status != AgentStatus::Completed {
            return Err(KernelError::Validation(format!(
                "agent {id} has no result (status {})",
                agent.status.as_str()
            )));
        }
        agent
            .result
            .ok_or_else(|| KernelError::Validation(format!("agent {id} completed without result")))
    }

    /// Terminate the agent and every descendant, deepest first, reclaiming
    /// unreclaimed budgets along the way. Per-descendant failures are logged
    /// and skipped, never aborting the cascade.
    pub async fn terminate(&self, id: Uuid, reason: &str) -> Result<TerminationReport, KernelError> {
        self.get_agent(id).await?;
        let mut descendants = self.descendants(id).await?;
        descendants.sort_by(|a, b| b.depth.cmp(&a.depth));

        let mut subordinates_terminated = 0u64;
        let mut budget_reclaimed = 0i64;
        for descendant in &descendants {
            match self.terminate_one(descendant, reason).await {
                Ok(reclaimed) => {
                    subordinates_terminated += 1;
                    budget_reclaimed += reclaimed;
                }
                Err(err) => {
                    tracing::warn!(
                        agent_id = %descendant.id,
                        error = %err,
                        "failed to terminate descendant"
                    );
                }
            }
        }

        let target = self.get_agent(id).await?;
        match self.terminate_one(&target, reason).await {
            Ok(reclaimed) => budget_reclaimed += reclaimed,
            Err(err) => {
                tracing::warn!(agent_id = %id, error = %err, "failed to terminate agent");
            }
        }

        let report = TerminationReport {
            subordinates_terminated,
            budget_reclaimed,
            at: Utc::now(),
        };
        tracing::info!(
            agent_id = %id,
            subordinates = report.subordinates_terminated,
            reclaimed = report.budget_reclaimed,
            reason,
            "termination cascade finished"
        );
        Ok(report)
    }

    async fn terminate_one(&self, agent: &AgentRecord, reason: &str) -> Result<i64, KernelError> {
        if agent.status != AgentStatus::Terminated {
            let now = Utc::now();
            sqlx::query(
                r#"
                UPDATE agents
                SET status = 'terminated',
                    updated_at = ?2,
                    completed_at = COALESCE(completed_at, ?2),
                    error = COALESCE(error, ?3)
                WHERE id = ?1 AND status != 'terminated'
                "#,
            )
            .bind(agent.id)
            .bind(now)
            .bind(reason)
            .execute(self.store.pool())
            .await?;
        }

        if agent.parent.is_none() {
            return Ok(0);
        }
        match self.ledger.reclaim(agent.id).await {
            Ok(outcome) => Ok(outcome.amount),
            // Already reclaimed, or the account never existed: nothing to return.
            Err(KernelError::InvalidTransition(_)) | Err(KernelError::NotFound { .. }) => Ok(0),
            Err(err) => Err(err),
        }
    }

    /// Direct children, oldest first.
    pub async fn children(&self, id: Uuid) -> Result<Vec<AgentRecord>, KernelError> {
        let rows = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE parent_id = ?1 ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(id)
        .fetch_all(self.store.pool())
        .await?;
        rows.iter().map(agent_from_row).collect()
    }

    /// Transitive closure below `id`, shallowest first.
    pub async fn descendants(&self, id: Uuid) -> Result<Vec<AgentRecord>, KernelError> {
        let rows = sqlx::query(&format!(
            r#"
            WITH RECURSIVE sub(id) AS (
                SELECT child_id FROM hierarchies WHERE parent_id = ?1
                UNION
                SELECT h.child_id FROM hierarchies h JOIN sub s ON h.parent_id = s.id
            )
            SELECT {AGENT_COLUMNS} FROM agents WHERE id IN (SELECT id FROM sub)
            ORDER BY depth ASC, created_at ASC
            "#
        ))
        .bind(id)
        .fetch_all(self.store.pool())
        .await?;
        rows.iter().map(agent_from_row).collect()
    }

    /// Chain of ancestors, closest parent first.
    pub async fn ancestors(&self, id: Uuid) -> Result<Vec<AgentRecord>, KernelError> {
        let rows = sqlx::query(&format!(
            r#"
            WITH RECURSIVE anc(id) AS (
                SELECT parent_id FROM hierarchies WHERE child_id = ?1
                UNION
                SELECT h.parent_id FROM hierarchies h JOIN anc a ON h.child_id = a.id
            )
            SELECT {AGENT_COLUMNS} FROM agents WHERE id IN (SELECT id FROM anc)
            ORDER BY depth DESC
            "#
        ))
        .bind(id)
        .fetch_all(self.store.pool())
        .await?;
        rows.iter().map(agent_from_row).collect()
    }

    /// Agents sharing this agent's parent, excluding the agent itself.
    /// Roots have no siblings.
    pub async fn siblings(&self, id: Uuid) -> Result<Vec<AgentRecord>, KernelError> {
        let agent = self.get_agent(id).await?;
        let Some(parent) = agent.parent else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE parent_id = ?1 AND id != ?2 ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(parent)
        .bind(id)
        .fetch_all(self.store.pool())
        .await?;
        rows.iter().map(agent_from_row).collect()
    }

    /// The sub-hierarchy rooted at `id` as a tree.
    pub async fn hierarchy(&self, id: Uuid) -> Result<HierarchyNode, KernelError> {
        let root = self.get_agent(id).await?;
        let descendants = self.descendants(id).await?;
        Ok(build_hierarchy(root, descendants))
    }

    pub async fn depth_of(&self, id: Uuid) -> Result<i64, KernelError> {
        Ok(self.get_agent(id).await?.depth)
    }

    pub async fn is_root(&self, id: Uuid) -> Result<bool, KernelError> {
        Ok(self.get_agent(id).await?.parent.is_none())
    }

    pub async fn is_leaf(&self, id: Uuid) -> Result<bool, KernelError> {
        self.get_agent(id).await?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM hierarchies WHERE parent_id = ?1")
            .bind(id)
            .fetch_one(self.store.pool())
            .await?;
        Ok(count == 0)
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<AgentRecord>, KernelError> {
        let row = sqlx::query(&format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"))
            .bind(id)
            .fetch_optional(self.store.pool())
            .await?;
        row.as_ref().map(agent_from_row).transpose()
    }
}

async fn fetch_agent_in(
    conn: &mut sqlx::SqliteConnection,
    id: Uuid,
) -> Result<Option<AgentRecord>, KernelError> {
    let row = sqlx::query(&format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(agent_from_row).transpose()
}

pub(crate) fn agent_from_row(row: &SqliteRow) -> Result<AgentRecord, KernelError> {
    let status: String = row.try_get("status")?;
    let result: Option<String> = row.try_get("result")?;
    let metadata: String = row.try_get("metadata")?;
    Ok(AgentRecord {
        id: row.try_get("id")?,
        role: row.try_get("role")?,
        task: row.try_get("task")?,
        depth: row.try_get("depth")?,
        parent: row.try_get("parent_id")?,
        status: AgentStatus::parse(&status)?,
        result: result.map(|text| serde_json::from_str(&text)).transpose()?,
        error: row.try_get("error")?,
        metadata: serde_json::from_str(&metadata)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn build_hierarchy(root: AgentRecord, descendants: Vec<AgentRecord>) -> HierarchyNode {
    let root_id = root.id;
    let mut node = HierarchyNode {
        agent: root,
        children: Vec::new(),
    };
    // Descendants arrive shallowest first, so each agent's parent node is
    // already in the tree when the agent is attached.
    for agent in descendants {
        let parent_id = agent.parent.unwrap_or(root_id);
        if let Some(parent) = find_hierarchy_node(&mut node, parent_id) {
            parent.children.push(HierarchyNode {
                agent,
                children: Vec::new(),
            });
        }
    }
    node
}

fn find_hierarchy_node(node: &mut HierarchyNode, id: Uuid) -> Option<&mut HierarchyNode> {
    if node.agent.id == id {
        return Some(node);
    }
    for child in &mut node.children {
        if let Some(found) = find_hierarchy_node(child, id) {
            return Some(found);
        }
    }
    None
}
