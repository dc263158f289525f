//! Workflow DAG engine.
//!
//! A graph is a set of agent templates (nodes) with "must-complete-before"
//! dependency edges. Validation runs a white/gray/black depth-first cycle
//! search with Kahn's algorithm as an independent cross-check. Execution
//! spawns only the starting nodes; everything downstream is spawned
//! event-driven as dependencies complete, so the engine needs no in-memory
//! back-pointers to the executor.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::lifecycle::AgentLifecycle;
use crate::models::{
    GraphSpec, GraphStatus, GraphViolation, NodeExecutionStatus, SpawnSpec, ValidationReport,
    ValidationStatus, ViolationCode, WorkflowGraphRecord, WorkflowNodeRecord, WorkflowProgress,
};
use crate::store::{with_transient_retry, Store};
use crate::{KernelConfig, KernelError};

const GRAPH_COLUMNS: &str =
    "id, name, status, validation_status, validation_errors, validated_at, created_at, updated_at, completed_at";
const NODE_COLUMNS: &str =
    "id, graph_id, agent_id, role, task, budget, dependencies, execution_status, result, error_message, spawned_at, completed_at";

#[derive(Clone)]
pub struct WorkflowEngine {
    store: Store,
    lifecycle: AgentLifecycle,
    default_budget: i64,
    retry_limit: u32,
}

impl WorkflowEngine {
    pub fn new(store: Store, lifecycle: AgentLifecycle, config: &KernelConfig) -> Self {
        Self {
            store,
            lifecycle,
            default_budget: config.default_budget,
            retry_limit: config.store_retry_limit,
        }
    }

    /// Persist a graph and its nodes. Structural validation is deferred to
    /// [`validate_graph`](Self::validate_graph); only id uniqueness and
    /// budget positivity are enforced here.
    pub async fn create_graph(&self, spec: GraphSpec) -> Result<WorkflowGraphRecord, KernelError> {
        if spec.name.trim().is_empty() {
            return Err(KernelError::Validation("graph name must not be empty".into()));
        }
        let mut seen = HashSet::new();
        for node in &spec.nodes {
            if !seen.insert(node.id) {
                return Err(KernelError::Conflict(format!(
                    "duplicate node id {} in graph spec",
                    node.id
                )));
            }
            if let Some(budget) = node.budget {
                if budget <= 0 {
                    return Err(KernelError::Validation(format!(
                        "node {} budget must be positive, got {budget}",
                        node.id
                    )));
                }
            }
        }

        with_transient_retry("workflow.create_graph", self.retry_limit, || {
            Box::pin(self.try_create_graph(&spec))
        })
        .await
    }

    async fn try_create_graph(&self, spec: &GraphSpec) -> Result<WorkflowGraphRecord, KernelError> {
        let graph_id = Uuid::new_v4();
        let now = Utc::now();
        let mut tx = self.store.pool().begin().await?;

        sqlx::query(
            r#"
            INSERT INTO workflow_graphs (id, name, status, validation_status, created_at, updated_at)
            VALUES (?1, ?2, 'created', 'pending', ?3, ?3)
            "#,
        )
        .bind(graph_id)
        .bind(&spec.name)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for node in &spec.nodes {
            sqlx::query(
                r#"
                INSERT INTO workflow_nodes (id, graph_id, role, task, budget, dependencies, execution_status)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending')
                "#,
            )
            .bind(node.id)
            .bind(graph_id)
            .bind(&node.role)
            .bind(&node.task)
            .bind(node.budget.unwrap_or(self.default_budget))
            .bind(serde_json::to_string(&node.dependencies)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::info!(graph_id = %graph_id, nodes = spec.nodes.len(), name = %spec.name, "workflow graph created");
        self.get_graph(graph_id).await
    }

    pub async fn get_graph(&self, id: Uuid) -> Result<WorkflowGraphRecord, KernelError> {
        let row = sqlx::query(&format!(
            "SELECT {GRAPH_COLUMNS} FROM workflow_graphs WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(self.store.pool())
        .await?;
        row.as_ref()
            .map(graph_from_row)
            .transpose()?
            .ok_or_else(|| KernelError::not_found("workflow graph", id))
    }

    pub async fn list_graphs(
        &self,
        status: Option<GraphStatus>,
    ) -> Result<Vec<WorkflowGraphRecord>, KernelError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {GRAPH_COLUMNS} FROM workflow_graphs WHERE status = ?1 ORDER BY created_at ASC"
                ))
                .bind(status.as_str())
                .fetch_all(self.store.pool())
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {GRAPH_COLUMNS} FROM workflow_graphs ORDER BY created_at ASC"
                ))
                .fetch_all(self.store.pool())
                .await?
            }
        };
        rows.iter().map(graph_from_row).collect()
    }

    pub async fn nodes_of(&self, graph: Uuid) -> Result<Vec<WorkflowNodeRecord>, KernelError> {
        let rows = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM workflow_nodes WHERE graph_id = ?1 ORDER BY rowid ASC"
        ))
        .bind(graph)
        .fetch_all(self.store.pool())
        .await?;
        rows.iter().map(node_from_row).collect()
    }

    pub async fn get_node(&self, id: Uuid) -> Result<WorkflowNodeRecord, KernelError> {
        let row = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM workflow_nodes WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(self.store.pool())
        .await?;
        row.as_ref()
            .map(node_from_row)
            .transpose()?
            .ok_or_else(|| KernelError::not_found("workflow node", id))
    }

    /// The node backed by `agent`, if any.
    pub async fn find_node_by_agent(
        &self,
        agent: Uuid,
    ) -> Result<Option<WorkflowNodeRecord>, KernelError> {
        let row = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM workflow_nodes WHERE agent_id = ?1"
        ))
        .bind(agent)
        .fetch_optional(self.store.pool())
        .await?;
        row.as_ref().map(node_from_row).transpose()
    }

    /// Structural validation: dependency references, cycles (depth-first
    /// coloring, cross-checked with Kahn's algorithm) and non-emptiness.
    /// The outcome is persisted on the graph row.
    pub async fn validate_graph(&self, graph: Uuid) -> Result<ValidationReport, KernelError> {
        self.get_graph(graph).await?;
        let nodes = self.nodes_of(graph).await?;
        let view: Vec<(Uuid, Vec<Uuid>)> = nodes
            .iter()
            .map(|node| (node.id, node.dependencies.clone()))
            .collect();
        let report = validate_topology(&view);

        let now = Utc::now();
        let status = if report.valid {
            ValidationStatus::Validated
        } else {
            ValidationStatus::Invalid
        };
        let errors_text = if report.errors.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&report.errors)?)
        };
        sqlx::query(
            r#"
            UPDATE workflow_graphs
            SET validation_status = ?2, validation_errors = ?3, validated_at = ?4, updated_at = ?4
            WHERE id = ?1
            "#,
        )
        .bind(graph)
        .bind(status.as_str())
        .bind(errors_text)
        .bind(now)
        .execute(self.store.pool())
        .await?;

        if !report.valid {
            tracing::warn!(graph_id = %graph, errors = report.errors.len(), "workflow graph failed validation");
        }
        Ok(report)
    }

    /// Validate, then spawn an agent for every starting node (empty
    /// dependency list) under `parent_agent`. Downstream nodes are not
    /// touched; they spawn as their dependencies complete.
    ///
    /// Returns the `node -> agent` mapping of the spawned starters.
    pub async fn execute(
        &self,
        graph: Uuid,
        parent_agent: Uuid,
    ) -> Result<HashMap<Uuid, Uuid>, KernelError> {
        let report = self.validate_graph(graph).await?;
        if !report.valid {
            return Err(KernelError::WorkflowInvalid(report.errors));
        }
        let record = self.get_graph(graph).await?;
        if record.status != GraphStatus::Created {
            return Err(KernelError::Conflict(format!(
                "workflow graph {graph} is {} and cannot be executed",
                record.status.as_str()
            )));
        }
        self.lifecycle.get_agent(parent_agent).await?;

        let nodes = self.nodes_of(graph).await?;
        let starting: Vec<&WorkflowNodeRecord> = nodes
            .iter()
            .filter(|node| node.dependencies.is_empty())
            .collect();
        if starting.is_empty() {
            return Err(KernelError::WorkflowInvalid(vec![GraphViolation {
                code: ViolationCode::NoStartingNodes,
                details: "graph has no node without dependencies".into(),
            }]));
        }

        self.set_graph_status(graph, GraphStatus::Active, false).await?;

        let mut spawned = HashMap::new();
        for node in starting {
            match self
                .activate_node(node, parent_agent, node.task.clone())
                .await?
            {
                Some(agent_id) => {
                    spawned.insert(node.id, agent_id);
                }
                None => {
                    tracing::debug!(node_id = %node.id, "starting node already claimed");
                }
            }
        }

        tracing::info!(graph_id = %graph, started = spawned.len(), "workflow execution started");
        Ok(spawned)
    }

    /// React to the completion of the agent backing a node.
    ///
    /// Idempotent: a node already out of `executing` is left alone, so the
    /// execution poller and the workflow poller can both report the same
    /// completion.
    pub async fn on_node_completed(
        &self,
        agent: Uuid,
        result: Option<serde_json::Value>,
    ) -> Result<(), KernelError> {
        let Some(node) = self.find_node_by_agent(agent).await? else {
            return Ok(());
        };
        let now = Utc::now();
        let result_text = result.as_ref().map(serde_json::to_string).transpose()?;
        let updated = sqlx::query(
            r#"
            UPDATE workflow_nodes
            SET execution_status = 'completed', result = ?2, completed_at = ?3
            WHERE id = ?1 AND execution_status = 'executing'
            "#,
        )
        .bind(node.id)
        .bind(result_text)
        .bind(now)
        .execute(self.store.pool())
        .await?;
        if updated.rows_affected() == 0 {
            return Ok(());
        }
        tracing::info!(graph_id = %node.graph, node_id = %node.id, agent_id = %agent, "workflow node completed");

        // Spawn every sibling whose dependencies are now all completed.
        let nodes = self.nodes_of(node.graph).await?;
        let completed: HashSet<Uuid> = nodes
            .iter()
            .filter(|n| n.execution_status == NodeExecutionStatus::Completed)
            .map(|n| n.id)
            .collect();
        for candidate in &nodes {
            if candidate.execution_status != NodeExecutionStatus::Pending {
                continue;
            }
            if candidate.dependencies.is_empty()
                || !candidate.dependencies.iter().all(|dep| completed.contains(dep))
            {
                continue;
            }
            let task = augment_task(candidate, &nodes);
            if let Err(err) = self.activate_node(candidate, agent, task).await {
                tracing::warn!(
                    graph_id = %node.graph,
                    node_id = %candidate.id,
                    error = %err,
                    "failed to spawn ready workflow node"
                );
            }
        }

        self.settle_graph(node.graph).await
    }

    /// React to the failure of the agent backing a node. Downstream nodes
    /// stay `pending`; once nothing is pending or executing the graph is
    /// terminated.
    pub async fn on_node_failed(&self, agent: Uuid, error: &str) -> Result<(), KernelError> {
        let Some(node) = self.find_node_by_agent(agent).await? else {
            return Ok(());
        };
        let updated = sqlx::query(
            r#"
            UPDATE workflow_nodes
            SET execution_status = 'failed', error_message = ?2, completed_at = ?3
            WHERE id = ?1 AND execution_status = 'executing'
            "#,
        )
        .bind(node.id)
        .bind(error)
        .bind(Utc::now())
        .execute(self.store.pool())
        .await?;
        if updated.rows_affected() == 0 {
            return Ok(());
        }
        tracing::warn!(graph_id = %node.graph, node_id = %node.id, agent_id = %agent, error, "workflow node failed");

        self.settle_graph(node.graph).await
    }

    /// Abort a graph: skip every executing node, terminate its backing
    /// agents, and mark the graph failed. Idempotent on terminal graphs.
    pub async fn terminate_graph(&self, graph: Uuid) -> Result<(), KernelError> {
        let record = self.get_graph(graph).await?;
        if record.status.is_terminal() {
            return Ok(());
        }

        let nodes = self.nodes_of(graph).await?;
        let now = Utc::now();
        for node in nodes
            .iter()
            .filter(|n| n.execution_status == NodeExecutionStatus::Executing)
        {
            if let Some(agent) = node.agent {
                if let Err(err) = self.lifecycle.terminate(agent, "Workflow terminated").await {
                    tracing::warn!(
                        graph_id = %graph,
                        node_id = %node.id,
                        agent_id = %agent,
                        error = %err,
                        "failed to terminate workflow agent"
                    );
                }
            }
            sqlx::query(
                r#"
                UPDATE workflow_nodes
                SET execution_status = 'skipped', error_message = 'Workflow terminated', completed_at = ?2
                WHERE id = ?1 AND execution_status = 'executing'
                "#,
            )
            .bind(node.id)
            .bind(now)
            .execute(self.store.pool())
            .await?;
        }

        self.set_graph_status(graph, GraphStatus::Failed, true).await?;
        tracing::info!(graph_id = %graph, "workflow graph terminated");
        Ok(())
    }

    /// Node counts by execution status.
    pub async fn progress(&self, graph: Uuid) -> Result<WorkflowProgress, KernelError> {
        self.get_graph(graph).await?;
        let rows = sqlx::query(
            "SELECT execution_status, COUNT(*) AS n FROM workflow_nodes WHERE graph_id = ?1 GROUP BY execution_status",
        )
        .bind(graph)
        .fetch_all(self.store.pool())
        .await?;

        let mut progress = WorkflowProgress::default();
        for row in rows {
            let status: String = row.try_get("execution_status")?;
            let count = row.try_get::<i64, _>("n")? as u64;
            progress.total += count;
            match NodeExecutionStatus::parse(&status)? {
                NodeExecutionStatus::Pending => progress.pending = count,
                NodeExecutionStatus::Executing => progress.executing = count,
                NodeExecutionStatus::Completed => progress.completed = count,
                NodeExecutionStatus::Failed => progress.failed = count,
                NodeExecutionStatus::Skipped => progress.skipped = count,
            }
        }
        Ok(progress)
    }

    /// Claim a pending node, spawn its agent under `parent`, and record the
    /// backing agent. Returns `None` when another caller claimed the node
    /// first. A spawn failure marks the node failed and surfaces the error.
    async fn activate_node(
        &self,
        node: &WorkflowNodeRecord,
        parent: Uuid,
        task: String,
    ) -> Result<Option<Uuid>, KernelError> {
        let now = Utc::now();
        let claimed = sqlx::query(
            r#"
            UPDATE workflow_nodes SET execution_status = 'executing', spawned_at = ?2
            WHERE id = ?1 AND execution_status = 'pending'
            "#,
        )
        .bind(node.id)
        .bind(now)
        .execute(self.store.pool())
        .await?;
        if claimed.rows_affected() == 0 {
            return Ok(None);
        }

        let spec = SpawnSpec {
            role: node.role.clone(),
            task,
            budget: Some(node.budget),
            parent: Some(parent),
            metadata: Some(serde_json::json!({
                "workflow_graph": node.graph,
                "workflow_node": node.id,
            })),
        };
        match self.lifecycle.spawn(spec).await {
            Ok(agent) => {
                sqlx::query("UPDATE workflow_nodes SET agent_id = ?2 WHERE id = ?1")
                    .bind(node.id)
                    .bind(agent.id)
                    .execute(self.store.pool())
                    .await?;
                tracing::info!(node_id = %node.id, agent_id = %agent.id, "workflow node spawned");
                Ok(Some(agent.id))
            }
            Err(err) => {
                sqlx::query(
                    r#"
                    UPDATE workflow_nodes
                    SET execution_status = 'failed', error_message = ?2, completed_at = ?3
                    WHERE id = ?1 AND execution_status = 'executing'
                    "#,
                )
                .bind(node.id)
                .bind(err.to_string())
                .bind(Utc::now())
                .execute(self.store.pool())
                .await?;
                Err(err)
            }
        }
    }

    /// Move the graph to its terminal state when nothing can progress.
    async fn settle_graph(&self, graph: Uuid) -> Result<(), KernelError> {
        let progress = self.progress(graph).await?;
        if progress.total > 0 && progress.completed == progress.total {
            self.set_graph_status(graph, GraphStatus::Completed, true).await?;
            tracing::info!(graph_id = %graph, "workflow graph completed");
        } else if progress.is_settled() {
            self.terminate_graph(graph).await?;
        }
        Ok(())
    }

    async fn set_graph_status(
        &self,
        graph: Uuid,
        status: GraphStatus,
        stamp_completion: bool,
    ) -> Result<(), KernelError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE workflow_graphs
            SET status = ?2,
                updated_at = ?3,
                completed_at = CASE WHEN ?4 THEN COALESCE(completed_at, ?3) ELSE completed_at END
            WHERE id = ?1
            "#,
        )
        .bind(graph)
        .bind(status.as_str())
        .bind(now)
        .bind(stamp_completion)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }
}

/// Append dependency results to the node's task text.
fn augment_task(node: &WorkflowNodeRecord, all: &[WorkflowNodeRecord]) -> String {
    let mut context = String::new();
    for dep_id in &node.dependencies {
        let Some(dep) = all.iter().find(|n| n.id == *dep_id) else {
            continue;
        };
        if let Some(result) = &dep.result {
            context.push_str(&format!("\n- {}: {}", dep.role, result));
        }
    }
    if context.is_empty() {
        node.task.clone()
    } else {
        format!("{}\n\nResults from completed dependencies:{}", node.task, context)
    }
}

/// Pure structural validation over `(node, dependencies)` pairs.
fn validate_topology(nodes: &[(Uuid, Vec<Uuid>)]) -> ValidationReport {
    let mut errors = Vec::new();
    if nodes.is_empty() {
        errors.push(GraphViolation {
            code: ViolationCode::EmptyWorkflow,
            details: "graph contains no nodes".into(),
        });
        return ValidationReport {
            valid: false,
            errors,
        };
    }

    let ids: HashSet<Uuid> = nodes.iter().map(|(id, _)| *id).collect();
    for (id, deps) in nodes {
        for dep in deps {
            if dep == id {
                errors.push(GraphViolation {
                    code: ViolationCode::SelfDependency,
                    details: format!("node {id} depends on itself"),
                });
            } else if !ids.contains(dep) {
                errors.push(GraphViolation {
                    code: ViolationCode::MissingDependency,
                    details: format!("node {id} references unknown dependency {dep}"),
                });
            }
        }
    }

    let deps: HashMap<Uuid, Vec<Uuid>> = nodes
        .iter()
        .map(|(id, node_deps)| {
            let valid_deps = node_deps
                .iter()
                .copied()
                .filter(|dep| dep != id && ids.contains(dep))
                .collect();
            (*id, valid_deps)
        })
        .collect();
    let order: Vec<Uuid> = nodes.iter().map(|(id, _)| *id).collect();

    if let Some(cycle) = find_cycle(&order, &deps) {
        let path = cycle
            .iter()
            .map(Uuid::to_string)
            .collect::<Vec<_>>()
            .join(" -> ");
        errors.push(GraphViolation {
            code: ViolationCode::CircularDependency,
            details: format!("dependency cycle: {path}"),
        });
    } else if topological_order(&order, &deps).is_none() {
        // Kahn disagreeing with the DFS would mean a bug in one of them;
        // surface it as a cycle rather than accepting a broken graph.
        errors.push(GraphViolation {
            code: ViolationCode::CircularDependency,
            details: "topological sort emitted fewer nodes than the graph contains".into(),
        });
    }

    ValidationReport {
        valid: errors.is_empty(),
        errors,
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Depth-first cycle search. Returns the offending path when a gray node is
/// re-entered.
fn find_cycle(order: &[Uuid], deps: &HashMap<Uuid, Vec<Uuid>>) -> Option<Vec<Uuid>> {
    let mut colors: HashMap<Uuid, Color> = order.iter().map(|id| (*id, Color::White)).collect();
    let mut stack = Vec::new();
    for &id in order {
        if colors[&id] == Color::White {
            if let Some(cycle) = visit(id, deps, &mut colors, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

fn visit(
    node: Uuid,
    deps: &HashMap<Uuid, Vec<Uuid>>,
    colors: &mut HashMap<Uuid, Color>,
    stack: &mut Vec<Uuid>,
) -> Option<Vec<Uuid>> {
    colors.insert(node, Color::Gray);
    stack.push(node);
    for &next in deps.get(&node).into_iter().flatten() {
        match colors.get(&next) {
            Some(Color::Gray) => {
                // Back-edge: the cycle is the stack suffix from `next`.
                let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                let mut cycle = stack[start..].to_vec();
                cycle.push(next);
                return Some(cycle);
            }
            Some(Color::White) => {
                if let Some(cycle) = visit(next, deps, colors, stack) {
                    return Some(cycle);
                }
            }
            _ => {}
        }
    }
    stack.pop();
    colors.insert(node, Color::Black);
    None
}

/// Kahn's algorithm. Returns `None` when fewer nodes come out than went in,
/// which can only happen on a cyclic graph.
fn topological_order(order: &[Uuid], deps: &HashMap<Uuid, Vec<Uuid>>) -> Option<Vec<Uuid>> {
    let mut in_degree: HashMap<Uuid, usize> = order.iter().map(|id| (*id, 0)).collect();
    let mut dependents: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for (&node, node_deps) in deps {
        for &dep in node_deps {
            *in_degree.get_mut(&node)? += 1;
            dependents.entry(dep).or_default().push(node);
        }
    }

    let mut queue: VecDeque<Uuid> = order
        .iter()
        .filter(|id| in_degree[id] == 0)
        .copied()
        .collect();
    let mut result = Vec::with_capacity(order.len());
    while let Some(node) = queue.pop_front() {
        result.push(node);
        for dependent in dependents.get(&node).into_iter().flatten() {
            let degree = in_degree.get_mut(dependent)?;
            *degree -= 1;
            if *degree == 0 {
                queue.push_back(*dependent);
            }
        }
    }

    (result.len() == order.len()).then_some(result)
}

fn graph_from_row(row: &SqliteRow) -> Result<WorkflowGraphRecord, KernelError> {
    let status: String = row.try_get("status")?;
    let validation_status: String = row.try_get("validation_status")?;
    let validation_errors: Option<String> = row.try_get("validation_errors")?;
    Ok(WorkflowGraphRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        status: GraphStatus::parse(&status)?,
        validation_status: ValidationStatus::parse(&validation_status)?,
        validation_errors: validation_errors
            .map(|text| serde_json::from_str(&text))
            .transpose()?,
        validated_at: row.try_get("validated_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn node_from_row(row: &SqliteRow) -> Result<WorkflowNodeRecord, KernelError> {
    let status: String = row.try_get("execution_status")?;
    let dependencies: String = row.try_get("dependencies")?;
    let result: Option<String> = row.try_get("result")?;
    Ok(WorkflowNodeRecord {
        id: row.try_get("id")?,
        graph: row.try_get("graph_id")?,
        agent: row.try_get("agent_id")?,
        role: row.try_get("role")?,
        task: row.try_get("task")?,
        budget: row.try_get("budget")?,
        dependencies: serde_json::from_str(&dependencies)?,
        execution_status: NodeExecutionStatus::parse(&status)?,
        result: result.map(|text| serde_json::from_str(&text)).transpose()?,
        error_message: row.try_get("error_message")?,
        spawned_at: row.try_get("spawned_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn empty_graph_is_invalid() {
        let report = validate_topology(&[]);
        assert!(!report.valid);
        assert_eq!(report.errors[0].code, ViolationCode::EmptyWorkflow);
    }

    #[test]
    fn linear_chain_is_valid() {
        let n = ids(3);
        let report = validate_topology(&[
            (n[0], vec![]),
            (n[1], vec![n[0]]),
            (n[2], vec![n[1]]),
        ]);
        assert!(report.valid, "{:?}", report.errors);
    }

    #[test]
    fn three_cycle_is_rejected() {
        let n = ids(3);
        // X -> Y -> Z -> X
        let report = validate_topology(&[
            (n[0], vec![n[2]]),
            (n[1], vec![n[0]]),
            (n[2], vec![n[1]]),
        ]);
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].code, ViolationCode::CircularDependency);
    }

    #[test]
    fn self_dependency_is_rejected() {
        let n = ids(1);
        let report = validate_topology(&[(n[0], vec![n[0]])]);
        assert!(!report.valid);
        assert!(report
            .errors
            .iter()
            .any(|e| e.code == ViolationCode::SelfDependency));
    }

    #[test]
    fn dangling_dependency_is_rejected() {
        let n = ids(2);
        let report = validate_topology(&[(n[0], vec![n[1]])]);
        assert!(!report.valid);
        assert_eq!(report.errors[0].code, ViolationCode::MissingDependency);
    }

    #[test]
    fn diamond_is_valid_and_orderable() {
        let n = ids(4);
        let nodes = [
            (n[0], vec![]),
            (n[1], vec![n[0]]),
            (n[2], vec![n[0]]),
            (n[3], vec![n[1], n[2]]),
        ];
        let report = validate_topology(&nodes);
        assert!(report.valid);

        let deps: HashMap<Uuid, Vec<Uuid>> =
            nodes.iter().map(|(id, d)| (*id, d.clone())).collect();
        let order_ids: Vec<Uuid> = nodes.iter().map(|(id, _)| *id).collect();
        let order = topological_order(&order_ids, &deps).expect("diamond must be orderable");
        assert_eq!(order.len(), 4);

        // Linear extension: every dependency precedes its dependent.
        let position: HashMap<Uuid, usize> =
            order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        for (id, node_deps) in &nodes {
            for dep in node_deps {
                assert!(position[dep] < position[id]);
            }
        }
    }

    #[test]
    fn kahn_rejects_two_cycle() {
        let n = ids(2);
        let deps: HashMap<Uuid, Vec<Uuid>> =
            [(n[0], vec![n[1]]), (n[1], vec![n[0]])].into_iter().collect();
        assert!(topological_order(&n, &deps).is_none());
    }

    #[test]
    fn dfs_reports_the_cycle_path() {
        let n = ids(3);
        let deps: HashMap<Uuid, Vec<Uuid>> = [
            (n[0], vec![n[1]]),
            (n[1], vec![n[2]]),
            (n[2], vec![n[0]]),
        ]
        .into_iter()
        .collect();
        let cycle = find_cycle(&n, &deps).expect("cycle must be found");
        assert!(cycle.len() >= 3);
        assert_eq!(cycle.first(), cycle.last());
    }

    #[test]
    fn task_augmentation_appends_dependency_results() {
        let dep_id = Uuid::new_v4();
        let graph = Uuid::new_v4();
        let dep = WorkflowNodeRecord {
            id: dep_id,
            graph,
            agent: None,
            role: "researcher".into(),
            task: "dig".into(),
            budget: 1000,
            dependencies: vec![],
            execution_status: NodeExecutionStatus::Completed,
            result: Some(serde_json::json!({"summary": "done"})),
            error_message: None,
            spawned_at: None,
            completed_at: None,
        };
        let node = WorkflowNodeRecord {
            id: Uuid::new_v4(),
            graph,
            agent: None,
            role: "writer".into(),
            task: "write it up".into(),
            budget: 1000,
            dependencies: vec![dep_id],
            execution_status: NodeExecutionStatus::Pending,
            result: None,
            error_message: None,
            spawned_at: None,
            completed_at: None,
        };
        let all = vec![dep, node.clone()];
        let task = augment_task(&node, &all);
        assert!(task.starts_with("write it up"));
        assert!(task.contains("researcher"));
        assert!(task.contains("summary"));
    }
}
