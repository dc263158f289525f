//! Top-level wiring of the kernel components.
//!
//! Everything is injected by value: the store handle fans out into the
//! components, the worktree driver and the executor come from the caller,
//! and the pollers are plain restartable tasks owned by the kernel value.
//! There is no process-global state.

use std::sync::Arc;

use crate::executor::AgentExecutor;
use crate::ledger::BudgetLedger;
use crate::lifecycle::AgentLifecycle;
use crate::poller::{ExecutionPoller, PollerHandle, WorkflowPoller};
use crate::queue::MessageQueue;
use crate::store::Store;
use crate::workflow::WorkflowEngine;
use crate::workspace::{WorkspaceManager, WorktreeDriver};
use crate::{KernelConfig, KernelError};

pub struct Kernel {
    config: KernelConfig,
    store: Store,
    ledger: BudgetLedger,
    lifecycle: AgentLifecycle,
    queue: MessageQueue,
    workflow: WorkflowEngine,
    workspaces: Option<WorkspaceManager>,
    execution_poller: Option<PollerHandle>,
    workflow_poller: Option<PollerHandle>,
}

impl Kernel {
    /// Connect to the store (file-backed, or in-memory when the config names
    /// no path) and wire up the components. A worktree driver is optional;
    /// without one, agents simply run without isolated workspaces.
    pub async fn connect(
        config: KernelConfig,
        driver: Option<Arc<dyn WorktreeDriver>>,
    ) -> Result<Self, KernelError> {
        let store = match &config.database_path {
            Some(path) => Store::open(path, config.max_connections).await?,
            None => Store::in_memory().await?,
        };
        let ledger = BudgetLedger::new(store.clone(), config.store_retry_limit);
        let workspaces =
            driver.map(|driver| WorkspaceManager::new(store.clone(), driver, &config));
        let lifecycle =
            AgentLifecycle::new(store.clone(), ledger.clone(), workspaces.clone(), &config);
        let queue = MessageQueue::new(store.clone(), config.store_retry_limit);
        let workflow = WorkflowEngine::new(store.clone(), lifecycle.clone(), &config);

        tracing::info!(
            database = %config
                .database_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<memory>".into()),
            "kernel connected"
        );
        Ok(Self {
            config,
            store,
            ledger,
            lifecycle,
            queue,
            workflow,
            workspaces,
            execution_poller: None,
            workflow_poller: None,
        })
    }

    /// Start the two background pollers against `executor`. Idempotent:
    /// already-running pollers are left alone.
    pub fn start(&mut self, executor: Arc<dyn AgentExecutor>) {
        if self.execution_poller.is_none() {
            let poller = ExecutionPoller::new(
                self.lifecycle.clone(),
                self.ledger.clone(),
                self.workflow.clone(),
                executor,
                self.config.exec_poll_interval,
            );
            self.execution_poller = Some(poller.spawn());
        }
        if self.workflow_poller.is_none() {
            let poller = WorkflowPoller::new(
                self.lifecycle.clone(),
                self.workflow.clone(),
                self.config.workflow_poll_interval,
            );
            self.workflow_poller = Some(poller.spawn());
        }
    }

    /// Stop both pollers and wait for them to exit. In-flight agent
    /// executions complete.
    pub async fn shutdown(&mut self) {
        if let Some(handle) = self.execution_poller.take() {
            handle.shutdown().await;
        }
        if let Some(handle) = self.workflow_poller.take() {
            handle.shutdown().await;
        }
        tracing::info!("kernel shut down");
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn ledger(&self) -> &BudgetLedger {
        &self.ledger
    }

    pub fn lifecycle(&self) -> &AgentLifecycle {
        &self.lifecycle
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    pub fn workflow(&self) -> &WorkflowEngine {
        &self.workflow
    }

    pub fn workspaces(&self) -> Option<&WorkspaceManager> {
        self.workspaces.as_ref()
    }
}
