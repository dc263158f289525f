//! Background pollers.
//!
//! Two independent loops drive the system forward: the execution poller
//! promotes `pending` agents into the executor, and the workflow poller
//! feeds agent completions back into the workflow engine. Both are
//! restartable tasks with an explicit stop channel; a stop request takes
//! effect within one interval and lets in-flight work finish. A failing
//! agent is logged and never stops a loop.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::executor::AgentExecutor;
use crate::ledger::BudgetLedger;
use crate::lifecycle::AgentLifecycle;
use crate::models::{AgentFilter, AgentStatus, GraphStatus, NodeExecutionStatus};
use crate::workflow::WorkflowEngine;
use crate::KernelError;

/// Handle to a spawned poller loop.
pub struct PollerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Request the loop to stop. Takes effect at most one interval later;
    /// in-flight operations complete.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Stop and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.stop();
        let _ = self.task.await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Promotes `pending` agents to execution.
#[derive(Clone)]
pub struct ExecutionPoller {
    lifecycle: AgentLifecycle,
    ledger: BudgetLedger,
    workflow: WorkflowEngine,
    executor: Arc<dyn AgentExecutor>,
    interval: Duration,
    in_flight: Arc<DashSet<Uuid>>,
}

impl ExecutionPoller {
    pub fn new(
        lifecycle: AgentLifecycle,
        ledger: BudgetLedger,
        workflow: WorkflowEngine,
        executor: Arc<dyn AgentExecutor>,
        interval: Duration,
    ) -> Self {
        Self {
            lifecycle,
            ledger,
            workflow,
            executor,
            interval,
            in_flight: Arc::new(DashSet::new()),
        }
    }

    /// Run the loop until the handle is stopped.
    pub fn spawn(self) -> PollerHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(interval_ms = self.interval.as_millis() as u64, "execution poller started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.run_once().await {
                            tracing::error!(error = %err, "execution poller iteration failed");
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow_and_update() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("execution poller stopped");
        });
        PollerHandle {
            stop: stop_tx,
            task,
        }
    }

    /// One sweep over the pending agents. Each picked agent is processed in
    /// its own task; the in-flight set keeps overlapping sweeps from racing
    /// themselves.
    pub async fn run_once(&self) -> Result<usize, KernelError> {
        let pending = self
            .lifecycle
            .list_agents(&AgentFilter {
                status: Some(AgentStatus::Pending),
                ..AgentFilter::default()
            })
            .await?;

        let mut picked = 0;
        for agent in pending {
            if !self.in_flight.insert(agent.id) {
                continue;
            }
            picked += 1;
            let poller = self.clone();
            tokio::spawn(async move {
                let agent_id = agent.id;
                if let Err(err) = poller.process_agent(agent_id).await {
                    tracing::error!(agent_id = %agent_id, error = %err, "agent execution failed");
                }
                poller.in_flight.remove(&agent_id);
            });
        }
        Ok(picked)
    }

    /// Drive one agent through execution: `pending -> executing`, invoke the
    /// executor, record consumption, persist the terminal state, and notify
    /// the workflow engine.
    pub async fn process_agent(&self, agent_id: Uuid) -> Result<(), KernelError> {
        let agent = match self.lifecycle.start(agent_id).await {
            Ok(agent) => agent,
            // Someone else already moved the agent on; not an error.
            Err(KernelError::InvalidTransition(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        tracing::debug!(agent_id = %agent_id, role = %agent.role, "executing agent");

        match self.executor.execute(&agent).await {
            Ok(outcome) => {
                if outcome.tokens_used > 0 {
                    match self.ledger.consume(agent_id, outcome.tokens_used).await {
                        Ok(_) => {}
                        Err(err @ KernelError::InsufficientBudget { .. }) => {
                            let message = err.to_string();
                            if self.lifecycle.fail(agent_id, message.clone()).await.is_ok() {
                                self.workflow.on_node_failed(agent_id, &message).await?;
                            }
                            return Ok(());
                        }
                        Err(err) => return Err(err),
                    }
                }
                match self.lifecycle.complete(agent_id, outcome.output.clone()).await {
                    Ok(_) => {}
                    // Terminated while the executor was running; the terminal
                    // state wins and the outcome is dropped.
                    Err(KernelError::InvalidTransition(_)) => return Ok(()),
                    Err(err) => return Err(err),
                }
                self.workflow
                    .on_node_completed(agent_id, Some(outcome.output))
                    .await?;
            }
            Err(err) => {
                let message = err.to_string();
                tracing::warn!(agent_id = %agent_id, error = %message, "executor reported failure");
                match self.lifecycle.fail(agent_id, message.clone()).await {
                    Ok(_) => {}
                    Err(KernelError::InvalidTransition(_)) => return Ok(()),
                    Err(err) => return Err(err),
                }
                self.workflow.on_node_failed(agent_id, &message).await?;
            }
        }
        Ok(())
    }
}

/// Observes agents backing workflow nodes and feeds completions into the
/// engine.
#[derive(Clone)]
pub struct WorkflowPoller {
    lifecycle: AgentLifecycle,
    workflow: WorkflowEngine,
    interval: Duration,
}

impl WorkflowPoller {
    pub fn new(lifecycle: AgentLifecycle, workflow: WorkflowEngine, interval: Duration) -> Self {
        Self {
            lifecycle,
            workflow,
            interval,
        }
    }

    pub fn spawn(self) -> PollerHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(interval_ms = self.interval.as_millis() as u64, "workflow poller started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.run_once().await {
                            tracing::error!(error = %err, "workflow poller iteration failed");
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow_and_update() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("workflow poller stopped");
        });
        PollerHandle {
            stop: stop_tx,
            task,
        }
    }

    /// One sweep over the active graphs. The engine's event handlers are
    /// idempotent, so observing a completion the execution poller already
    /// reported is harmless.
    pub async fn run_once(&self) -> Result<usize, KernelError> {
        let graphs = self.workflow.list_graphs(Some(GraphStatus::Active)).await?;
        let mut observed = 0;
        for graph in graphs {
            let nodes = match self.workflow.nodes_of(graph.id).await {
                Ok(nodes) => nodes,
                Err(err) => {
                    tracing::error!(graph_id = %graph.id, error = %err, "failed to load workflow nodes");
                    continue;
                }
            };
            for node in nodes
                .iter()
                .filter(|n| n.execution_status == NodeExecutionStatus::Executing)
            {
                let Some(agent_id) = node.agent else {
                    continue;
                };
                if let Err(err) = self.observe_node(agent_id).await {
                    tracing::error!(
                        graph_id = %graph.id,
                        node_id = %node.id,
                        agent_id = %agent_id,
                        error = %err,
                        "failed to observe workflow node"
                    );
                } else {
                    observed += 1;
                }
            }
        }
        Ok(observed)
    }

    async fn observe_node(&self, agent_id: Uuid) -> Result<(), KernelError> {
        let agent = self.lifecycle.get_agent(agent_id).await?;
        match agent.status {
            AgentStatus::Completed => {
                self.workflow
                    .on_node_completed(agent_id, agent.result)
                    .await
            }
            AgentStatus::Failed => {
                let error = agent
                    .error
                    .unwrap_or_else(|| "agent failed without error detail".into());
                self.workflow.on_node_failed(agent_id, &error).await
            }
            AgentStatus::Terminated => {
                self.workflow
                    .on_node_failed(agent_id, "agent terminated")
                    .await
            }
            AgentStatus::Pending | AgentStatus::Executing => Ok(()),
        }
    }
}
