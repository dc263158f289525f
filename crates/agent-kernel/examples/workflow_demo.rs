//! Workflow Kernel Demo
//!
//! Spins up an in-memory kernel with a stub executor, runs a three-node
//! analysis workflow end to end, and prints the budget ledger afterwards.

use std::sync::Arc;
use std::time::Duration;

use agent_kernel::{
    AgentExecutor, AgentRecord, ExecutionOutcome, FinishReason, GraphSpec, GraphStatus, Kernel,
    KernelConfig, KernelError, NodeSpec, SpawnSpec,
};
use async_trait::async_trait;
use serde_json::json;

/// Stand-in for the LLM provider: echoes the task and burns a fixed share of
/// the budget.
struct EchoExecutor;

#[async_trait]
impl AgentExecutor for EchoExecutor {
    async fn execute(&self, agent: &AgentRecord) -> Result<ExecutionOutcome, KernelError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(ExecutionOutcome {
            output: json!({ "role": agent.role, "summary": format!("finished: {}", agent.task) }),
            tokens_used: 250,
            finish_reason: FinishReason::Stop,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut config = KernelConfig::default();
    config.exec_poll_interval = Duration::from_millis(100);
    config.workflow_poll_interval = Duration::from_millis(100);

    let mut kernel = Kernel::connect(config, None).await?;
    kernel.start(Arc::new(EchoExecutor));

    let root = kernel
        .lifecycle()
        .spawn(SpawnSpec::new("coordinator", "oversee the analysis run").with_budget(50_000))
        .await?;
    // The coordinator is not part of the workflow; park it as executing so
    // the poller leaves it alone.
    kernel.lifecycle().start(root.id).await?;
    println!("coordinator spawned: {}", root.id);

    let fetch = NodeSpec::new("fetcher", "collect the raw inputs").with_budget(2_000);
    let clean = NodeSpec::new("cleaner", "normalize the inputs").with_budget(2_000);
    let report = NodeSpec::new("reporter", "write the final report")
        .with_budget(1_000)
        .depends_on(fetch.id)
        .depends_on(clean.id);
    let graph = kernel
        .workflow()
        .create_graph(GraphSpec {
            name: "analysis-pipeline".into(),
            nodes: vec![fetch, clean, report],
        })
        .await?;

    let started = kernel.workflow().execute(graph.id, root.id).await?;
    println!("workflow {} started with {} initial agents", graph.id, started.len());

    loop {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let record = kernel.workflow().get_graph(graph.id).await?;
        let progress = kernel.workflow().progress(graph.id).await?;
        println!(
            "graph {:?}: {}/{} nodes completed",
            record.status, progress.completed, progress.total
        );
        if record.status != GraphStatus::Active {
            break;
        }
    }

    let tree = kernel.ledger().hierarchy_of(root.id, 5).await?;
    println!(
        "coordinator budget: allocated={} used={} reserved={} available={}",
        tree.account.allocated,
        tree.account.used,
        tree.account.reserved,
        tree.account.available()
    );
    for child in &tree.children {
        println!(
            "  {}: allocated={} used={}",
            child.role, child.account.allocated, child.account.used
        );
    }

    kernel.shutdown().await;
    Ok(())
}
