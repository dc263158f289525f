//! Shared fixtures for the integration tests: an in-memory kernel, a
//! scripted executor and a temp-dir worktree driver.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use agent_kernel::{
    AgentExecutor, AgentRecord, DiffOptions, ExecutionOutcome, FinishReason, Kernel, KernelConfig,
    KernelError, ProvisionedWorktree, SpawnSpec, WorktreeDriver,
};
use async_trait::async_trait;
use tempfile::TempDir;
use uuid::Uuid;

#[allow(dead_code)]
pub async fn kernel() -> Kernel {
    Kernel::connect(KernelConfig::default(), None)
        .await
        .expect("kernel must connect")
}

#[allow(dead_code)]
pub async fn kernel_with_driver(driver: Arc<dyn WorktreeDriver>) -> Kernel {
    Kernel::connect(KernelConfig::default(), Some(driver))
        .await
        .expect("kernel must connect")
}

#[allow(dead_code)]
pub async fn spawn_root(kernel: &Kernel, budget: i64) -> AgentRecord {
    kernel
        .lifecycle()
        .spawn(SpawnSpec::new("coordinator", "coordinate the work").with_budget(budget))
        .await
        .expect("root spawn must succeed")
}

#[allow(dead_code)]
pub async fn spawn_child(kernel: &Kernel, parent: Uuid, budget: i64) -> AgentRecord {
    kernel
        .lifecycle()
        .spawn(
            SpawnSpec::new("worker", "do a slice of the work")
                .with_budget(budget)
                .with_parent(parent),
        )
        .await
        .expect("child spawn must succeed")
}

/// Executor that echoes the task back and burns a fixed token count. Roles
/// listed in `failing_roles` error instead of completing.
pub struct ScriptedExecutor {
    tokens_used: i64,
    failing_roles: HashSet<String>,
}

#[allow(dead_code)]
impl ScriptedExecutor {
    pub fn new(tokens_used: i64) -> Self {
        Self {
            tokens_used,
            failing_roles: HashSet::new(),
        }
    }

    pub fn failing_role(mut self, role: &str) -> Self {
        self.failing_roles.insert(role.to_string());
        self
    }
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    async fn execute(&self, agent: &AgentRecord) -> Result<ExecutionOutcome, KernelError> {
        if self.failing_roles.contains(&agent.role) {
            return Err(KernelError::Executor(format!(
                "scripted failure for role {}",
                agent.role
            )));
        }
        Ok(ExecutionOutcome {
            output: serde_json::json!({ "role": agent.role, "echo": agent.task }),
            tokens_used: self.tokens_used,
            finish_reason: FinishReason::Stop,
        })
    }
}

/// Worktree driver backed by a temporary directory: one subdirectory per
/// agent stands in for a working copy.
pub struct TempDirDriver {
    root: TempDir,
}

#[allow(dead_code)]
impl TempDirDriver {
    pub fn new() -> Self {
        Self {
            root: TempDir::new().expect("tempdir must be creatable"),
        }
    }

    pub fn path_for(&self, agent: Uuid) -> PathBuf {
        self.root.path().join(agent.to_string())
    }
}

fn io_error(err: std::io::Error) -> KernelError {
    KernelError::Workspace(err.to_string())
}

#[async_trait]
impl WorktreeDriver for TempDirDriver {
    async fn create(&self, agent: Uuid) -> Result<ProvisionedWorktree, KernelError> {
        let path = self.path_for(agent);
        std::fs::create_dir_all(&path).map_err(io_error)?;
        Ok(ProvisionedWorktree {
            path,
            branch: format!("agents/{agent}"),
        })
    }

    async fn delete(&self, agent: Uuid, _force: bool) -> Result<bool, KernelError> {
        let path = self.path_for(agent);
        if path.exists() {
            std::fs::remove_dir_all(&path).map_err(io_error)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn diff(&self, agent: Uuid, opts: &DiffOptions) -> Result<String, KernelError> {
        let files = self.changed_files(agent).await?;
        if opts.stat_only {
            Ok(format!("{} files changed", files.len()))
        } else {
            Ok(files
                .iter()
                .map(|path| format!("M {}", path.display()))
                .collect::<Vec<_>>()
                .join("\n"))
        }
    }

    async fn changed_files(&self, agent: Uuid) -> Result<Vec<PathBuf>, KernelError> {
        let path = self.path_for(agent);
        let mut files = Vec::new();
        if path.exists() {
            for entry in std::fs::read_dir(&path).map_err(io_error)? {
                files.push(entry.map_err(io_error)?.path());
            }
        }
        Ok(files)
    }

    async fn list_all(&self) -> Result<Vec<Uuid>, KernelError> {
        let mut agents = Vec::new();
        for entry in std::fs::read_dir(self.root.path()).map_err(io_error)? {
            let entry = entry.map_err(io_error)?;
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(id) = Uuid::parse_str(name) {
                    agents.push(id);
                }
            }
        }
        Ok(agents)
    }
}
