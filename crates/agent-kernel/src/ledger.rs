//! Hierarchical budget ledger.
//!
//! Tokens flow strictly parent to child: `allocate_child` reserves the
//! child's allocation on the parent inside one transaction, and `reclaim`
//! releases the unused part back. The conservation rule — for any subtree,
//! the sum of `used` never exceeds the root's allocation — falls out of
//! reserve-on-allocate plus release-on-reclaim and is re-checked by the
//! `CHECK` constraints on the budgets table.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use crate::models::{BudgetAccount, BudgetTreeNode, ReclaimOutcome};
use crate::store::{with_transient_retry, Store};
use crate::KernelError;

#[derive(Debug, Clone)]
pub struct BudgetLedger {
    store: Store,
    retry_limit: u32,
}

impl BudgetLedger {
    pub fn new(store: Store, retry_limit: u32) -> Self {
        Self { store, retry_limit }
    }

    /// Open the account of a root agent.
    pub async fn open_root(&self, agent: Uuid, tokens: i64) -> Result<BudgetAccount, KernelError> {
        with_transient_retry("ledger.open_root", self.retry_limit, || {
            Box::pin(self.try_open_root(agent, tokens))
        })
        .await
    }

    async fn try_open_root(&self, agent: Uuid, tokens: i64) -> Result<BudgetAccount, KernelError> {
        let mut tx = self.store.pool().begin().await?;
        ensure_agent_exists(&mut tx, agent).await?;
        let account = Self::open_root_in(&mut tx, agent, tokens, Utc::now()).await?;
        tx.commit().await?;
        Ok(account)
    }

    /// Variant of [`open_root`](Self::open_root) running inside a
    /// caller-owned transaction, so agent creation and account creation
    /// commit together.
    pub(crate) async fn open_root_in(
        conn: &mut SqliteConnection,
        agent: Uuid,
        tokens: i64,
        now: DateTime<Utc>,
    ) -> Result<BudgetAccount, KernelError> {
        if tokens <= 0 {
            return Err(KernelError::Validation(format!(
                "allocation must be positive, got {tokens}"
            )));
        }
        if fetch_account(conn, agent).await?.is_some() {
            return Err(KernelError::Conflict(format!(
                "budget account already exists for agent {agent}"
            )));
        }
        sqlx::query(
            r#"
            INSERT INTO budgets (agent_id, allocated, used, reserved, reclaimed, frozen, created_at, updated_at)
            VALUES (?1, ?2, 0, 0, 0, 0, ?3, ?3)
            "#,
        )
        .bind(agent)
        .bind(tokens)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        require_account(conn, agent).await
    }

    /// Carve `tokens` out of the parent's available balance for a new child
    /// account. The availability check and the reservation increment commit
    /// atomically.
    pub async fn allocate_child(
        &self,
        parent: Uuid,
        child: Uuid,
        tokens: i64,
    ) -> Result<BudgetAccount, KernelError> {
        with_transient_retry("ledger.allocate_child", self.retry_limit, || {
            Box::pin(self.try_allocate_child(parent, child, tokens))
        })
        .await
    }

    async fn try_allocate_child(
        &self,
        parent: Uuid,
        child: Uuid,
        tokens: i64,
    ) -> Result<BudgetAccount, KernelError> {
        let mut tx = self.store.pool().begin().await?;
        ensure_agent_exists(&mut tx, child).await?;
        let account = Self::allocate_child_in(&mut tx, parent, child, tokens, Utc::now()).await?;
        tx.commit().await?;
        Ok(account)
    }

    pub(crate) async fn allocate_child_in(
        conn: &mut SqliteConnection,
        parent: Uuid,
        child: Uuid,
        tokens: i64,
        now: DateTime<Utc>,
    ) -> Result<BudgetAccount, KernelError> {
        if tokens <= 0 {
            return Err(KernelError::Validation(format!(
                "allocation must be positive, got {tokens}"
            )));
        }
        let parent_account = fetch_account(conn, parent)
            .await?
            .ok_or_else(|| KernelError::not_found("budget account", parent))?;
        if parent_account.frozen {
            return Err(KernelError::InvalidTransition(format!(
                "budget account {parent} is frozen"
            )));
        }
        if parent_account.reclaimed {
            return Err(KernelError::InvalidTransition(format!(
                "budget account {parent} is reclaimed and can no longer allocate"
            )));
        }
        if fetch_account(conn, child).await?.is_some() {
            return Err(KernelError::Conflict(format!(
                "budget account already exists for agent {child}"
            )));
        }
        let available = parent_account.available();
        if available < tokens {
            return Err(KernelError::InsufficientBudget {
                agent: parent,
                required: tokens,
                available,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO budgets (agent_id, allocated, used, reserved, reclaimed, frozen, created_at, updated_at)
            VALUES (?1, ?2, 0, 0, 0, 0, ?3, ?3)
            "#,
        )
        .bind(child)
        .bind(tokens)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        sqlx::query("UPDATE budgets SET reserved = reserved + ?2, updated_at = ?3 WHERE agent_id = ?1")
            .bind(parent)
            .bind(tokens)
            .bind(now)
            .execute(&mut *conn)
            .await?;

        tracing::debug!(parent = %parent, child = %child, tokens, "allocated child budget");
        require_account(conn, child).await
    }

    /// Record consumption of `tokens` by `agent`.
    pub async fn consume(&self, agent: Uuid, tokens: i64) -> Result<BudgetAccount, KernelError> {
        with_transient_retry("ledger.consume", self.retry_limit, || {
            Box::pin(self.try_consume(agent, tokens))
        })
        .await
    }

    async fn try_consume(&self, agent: Uuid, tokens: i64) -> Result<BudgetAccount, KernelError> {
        if tokens <= 0 {
            return Err(KernelError::Validation(format!(
                "consumption must be positive, got {tokens}"
            )));
        }
        let mut tx = self.store.pool().begin().await?;
        let account = fetch_account(&mut tx, agent)
            .await?
            .ok_or_else(|| KernelError::not_found("budget account", agent))?;
        if account.frozen {
            return Err(KernelError::InvalidTransition(format!(
                "budget account {agent} is frozen"
            )));
        }
        if account.reclaimed {
            return Err(KernelError::InvalidTransition(format!(
                "budget account {agent} is reclaimed and can no longer consume"
            )));
        }
        if account.used + account.reserved + tokens > account.allocated {
            return Err(KernelError::InsufficientBudget {
                agent,
                required: tokens,
                available: account.available(),
            });
        }

        sqlx::query("UPDATE budgets SET used = used + ?2, updated_at = ?3 WHERE agent_id = ?1")
            .bind(agent)
            .bind(tokens)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        let updated = require_account(&mut tx, agent).await?;
        tx.commit().await?;
        Ok(updated)
    }

    /// Return a finished child's unused tokens to its parent and mark the
    /// child account reclaimed. Protected against double reclamation by the
    /// `reclaimed` flag.
    pub async fn reclaim(&self, agent: Uuid) -> Result<ReclaimOutcome, KernelError> {
        with_transient_retry("ledger.reclaim", self.retry_limit, || {
            Box::pin(self.try_reclaim(agent))
        })
        .await
    }

    async fn try_reclaim(&self, agent: Uuid) -> Result<ReclaimOutcome, KernelError> {
        let mut tx = self.store.pool().begin().await?;
        let child = fetch_account(&mut tx, agent)
            .await?
            .ok_or_else(|| KernelError::not_found("budget account", agent))?;
        if child.reclaimed {
            return Err(KernelError::InvalidTransition(format!(
                "budget account {agent} is already reclaimed"
            )));
        }
        let parent_id: Option<Uuid> = sqlx::query_scalar("SELECT parent_id FROM agents WHERE id = ?1")
            .bind(agent)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| KernelError::not_found("agent", agent))?;
        let parent_id = parent_id.ok_or_else(|| {
            KernelError::Validation(format!("agent {agent} has no parent to reclaim into"))
        })?;
        // Tokens still reserved for this child's own children stay earmarked;
        // releasing them here would let the parent hand them out twice.
        let unused = child.allocated - child.used - child.reserved;
        let now = Utc::now();

        sqlx::query("UPDATE budgets SET reserved = reserved - ?2, updated_at = ?3 WHERE agent_id = ?1")
            .bind(parent_id)
            .bind(unused)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE budgets SET reclaimed = 1, updated_at = ?2 WHERE agent_id = ?1")
            .bind(agent)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        let parent = require_account(&mut tx, parent_id).await?;
        let child = require_account(&mut tx, agent).await?;
        tx.commit().await?;

        tracing::debug!(
            parent = %parent_id,
            child = %agent,
            amount = unused,
            "reclaimed unused child budget"
        );
        Ok(ReclaimOutcome {
            parent,
            child,
            amount: unused,
        })
    }

    /// Block consumption and child allocation on the account. Idempotent.
    pub async fn freeze(&self, agent: Uuid) -> Result<BudgetAccount, KernelError> {
        self.set_frozen(agent, true).await
    }

    /// Lift a freeze. Idempotent.
    pub async fn unfreeze(&self, agent: Uuid) -> Result<BudgetAccount, KernelError> {
        self.set_frozen(agent, false).await
    }

    async fn set_frozen(&self, agent: Uuid, frozen: bool) -> Result<BudgetAccount, KernelError> {
        with_transient_retry("ledger.set_frozen", self.retry_limit, || {
            Box::pin(async move {
                let result = sqlx::query(
                    "UPDATE budgets SET frozen = ?2, updated_at = ?3 WHERE agent_id = ?1",
                )
                .bind(agent)
                .bind(frozen)
                .bind(Utc::now())
                .execute(self.store.pool())
                .await?;
                if result.rows_affected() == 0 {
                    return Err(KernelError::not_found("budget account", agent));
                }
                self.account_of(agent).await
            })
        })
        .await
    }

    /// Tokens the agent may still spend or delegate.
    pub async fn available_of(&self, agent: Uuid) -> Result<i64, KernelError> {
        Ok(self.account_of(agent).await?.available())
    }

    pub async fn account_of(&self, agent: Uuid) -> Result<BudgetAccount, KernelError> {
        let row = sqlx::query(ACCOUNT_COLUMNS_QUERY)
            .bind(agent)
            .fetch_optional(self.store.pool())
            .await?;
        row.as_ref()
            .map(account_from_row)
            .transpose()?
            .ok_or_else(|| KernelError::not_found("budget account", agent))
    }

    /// Budget accounts of `root` and its descendants as a tree, cut off at
    /// `max_depth` levels below the root.
    pub async fn hierarchy_of(
        &self,
        root: Uuid,
        max_depth: i64,
    ) -> Result<BudgetTreeNode, KernelError> {
        let rows = sqlx::query(
            r#"
            WITH RECURSIVE tree(id, rel_depth) AS (
                SELECT id, 0 FROM agents WHERE id = ?1
                UNION ALL
                SELECT h.child_id, t.rel_depth + 1
                FROM hierarchies h JOIN tree t ON h.parent_id = t.id
                WHERE t.rel_depth < ?2
            )
            SELECT a.role, a.parent_id,
                   b.agent_id, b.allocated, b.used, b.reserved, b.reclaimed, b.frozen,
                   b.created_at, b.updated_at
            FROM tree t
            JOIN agents a ON a.id = t.id
            JOIN budgets b ON b.agent_id = t.id
            ORDER BY t.rel_depth ASC
            "#,
        )
        .bind(root)
        .bind(max_depth)
        .fetch_all(self.store.pool())
        .await?;

        let mut nodes: Vec<(Option<Uuid>, BudgetTreeNode)> = Vec::with_capacity(rows.len());
        for row in &rows {
            let parent: Option<Uuid> = row.try_get("parent_id")?;
            let role: String = row.try_get("role")?;
            nodes.push((
                parent,
                BudgetTreeNode {
                    account: account_from_row(row)?,
                    role,
                    children: Vec::new(),
                },
            ));
        }
        build_budget_tree(root, nodes).ok_or_else(|| KernelError::not_found("budget account", root))
    }
}

const ACCOUNT_COLUMNS_QUERY: &str = r#"
    SELECT agent_id, allocated, used, reserved, reclaimed, frozen, created_at, updated_at
    FROM budgets WHERE agent_id = ?1
"#;

async fn fetch_account(
    conn: &mut SqliteConnection,
    agent: Uuid,
) -> Result<Option<BudgetAccount>, KernelError> {
    let row = sqlx::query(ACCOUNT_COLUMNS_QUERY)
        .bind(agent)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(account_from_row).transpose()
}

async fn require_account(
    conn: &mut SqliteConnection,
    agent: Uuid,
) -> Result<BudgetAccount, KernelError> {
    fetch_account(conn, agent)
        .await?
        .ok_or_else(|| KernelError::not_found("budget account", agent))
}

async fn ensure_agent_exists(conn: &mut SqliteConnection, agent: Uuid) -> Result<(), KernelError> {
    let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM agents WHERE id = ?1")
        .bind(agent)
        .fetch_optional(&mut *conn)
        .await?;
    if exists.is_none() {
        return Err(KernelError::not_found("agent", agent));
    }
    Ok(())
}

fn account_from_row(row: &SqliteRow) -> Result<BudgetAccount, KernelError> {
    Ok(BudgetAccount {
        agent: row.try_get("agent_id")?,
        allocated: row.try_get("allocated")?,
        used: row.try_get("used")?,
        reserved: row.try_get("reserved")?,
        reclaimed: row.try_get("reclaimed")?,
        frozen: row.try_get("frozen")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Assemble the flat `(parent, node)` list into a tree rooted at `root`.
/// Rows arrive parent-before-child, so children are attached back-to-front.
fn build_budget_tree(root: Uuid, nodes: Vec<(Option<Uuid>, BudgetTreeNode)>) -> Option<BudgetTreeNode> {
    let mut remaining = nodes;
    let root_index = remaining
        .iter()
        .position(|(_, node)| node.account.agent == root)?;
    let (_, mut root_node) = remaining.swap_remove(root_index);

    // Repeatedly attach nodes whose parent is already in the tree.
    while !remaining.is_empty() {
        let mut attached_any = false;
        let mut index = 0;
        while index < remaining.len() {
            let parent = remaining[index].0;
            let attach_under = parent.and_then(|p| find_tree_node(&mut root_node, p).map(|_| p));
            if let Some(parent_id) = attach_under {
                let (_, node) = remaining.swap_remove(index);
                if let Some(slot) = find_tree_node(&mut root_node, parent_id) {
                    slot.children.push(node);
                    attached_any = true;
                }
            } else {
                index += 1;
            }
        }
        if !attached_any {
            break;
        }
    }
    Some(root_node)
}

fn find_tree_node(node: &mut BudgetTreeNode, agent: Uuid) -> Option<&mut BudgetTreeNode> {
    if node.account.agent == agent {
        return Some(node);
    }
    for child in &mut node.children {
        if let Some(found) = find_tree_node(child, agent) {
            return Some(found);
        }
    }
    None
}
