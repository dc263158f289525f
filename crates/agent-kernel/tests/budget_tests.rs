//! Ledger behavior: allocation, consumption, reclamation, freezing and the
//! conservation invariant under random interleavings.

mod common;

use std::collections::HashMap;

use agent_kernel::{AgentFilter, Kernel, KernelError};
use common::{kernel, spawn_child, spawn_root};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

#[tokio::test]
async fn budget_flows_across_three_levels() {
    let kernel = kernel().await;
    let root = spawn_root(&kernel, 100_000).await;
    let a = spawn_child(&kernel, root.id, 30_000).await;
    let b = spawn_child(&kernel, root.id, 40_000).await;
    let a1 = spawn_child(&kernel, a.id, 10_000).await;
    let a2 = spawn_child(&kernel, a.id, 15_000).await;

    let ledger = kernel.ledger();
    ledger.consume(root.id, 5_000).await.unwrap();
    ledger.consume(a.id, 3_000).await.unwrap();
    ledger.consume(a1.id, 8_000).await.unwrap();
    ledger.consume(a2.id, 12_000).await.unwrap();

    let root_account = ledger.account_of(root.id).await.unwrap();
    assert_eq!(root_account.used, 5_000);
    assert_eq!(root_account.reserved, 70_000);
    assert_eq!(root_account.available(), 25_000);

    let a_account = ledger.account_of(a.id).await.unwrap();
    assert_eq!(a_account.used, 3_000);
    assert_eq!(a_account.reserved, 25_000);
    assert_eq!(a_account.available(), 2_000);

    assert_eq!(ledger.available_of(b.id).await.unwrap(), 40_000);
}

#[tokio::test]
async fn reclaim_releases_reservation() {
    let kernel = kernel().await;
    let root = spawn_root(&kernel, 10_000).await;
    let child = spawn_child(&kernel, root.id, 3_000).await;

    kernel.ledger().consume(child.id, 1_000).await.unwrap();
    let outcome = kernel.ledger().reclaim(child.id).await.unwrap();

    assert_eq!(outcome.amount, 2_000);
    assert!(outcome.child.reclaimed);
    assert_eq!(outcome.parent.reserved, 1_000);
    assert_eq!(outcome.parent.available(), 9_000);
}

#[tokio::test]
async fn reclaim_is_idempotency_protected() {
    let kernel = kernel().await;
    let root = spawn_root(&kernel, 10_000).await;
    let child = spawn_child(&kernel, root.id, 3_000).await;

    kernel.ledger().reclaim(child.id).await.unwrap();
    let second = kernel.ledger().reclaim(child.id).await;
    assert!(matches!(second, Err(KernelError::InvalidTransition(_))));

    // The reservation was released exactly once.
    let root_account = kernel.ledger().account_of(root.id).await.unwrap();
    assert_eq!(root_account.reserved, 0);
}

#[tokio::test]
async fn root_account_cannot_be_reclaimed() {
    let kernel = kernel().await;
    let root = spawn_root(&kernel, 10_000).await;
    let result = kernel.ledger().reclaim(root.id).await;
    assert!(matches!(result, Err(KernelError::Validation(_))));
}

#[tokio::test]
async fn allocation_rejects_overdraw() {
    let kernel = kernel().await;
    let root = spawn_root(&kernel, 1_000).await;
    spawn_child(&kernel, root.id, 600).await;

    let overdraw = kernel
        .lifecycle()
        .spawn(
            agent_kernel::SpawnSpec::new("worker", "too expensive")
                .with_budget(600)
                .with_parent(root.id),
        )
        .await;
    match overdraw {
        Err(KernelError::InsufficientBudget {
            agent,
            required,
            available,
        }) => {
            assert_eq!(agent, root.id);
            assert_eq!(required, 600);
            assert_eq!(available, 400);
        }
        other => panic!("expected InsufficientBudget, got {other:?}"),
    }

    // The failed spawn left no agent behind.
    let agents = kernel
        .lifecycle()
        .list_agents(&AgentFilter::default())
        .await
        .unwrap();
    assert_eq!(agents.len(), 2);
}

#[tokio::test]
async fn consume_rejects_overdraw_and_non_positive_amounts() {
    let kernel = kernel().await;
    let root = spawn_root(&kernel, 1_000).await;

    assert!(matches!(
        kernel.ledger().consume(root.id, 0).await,
        Err(KernelError::Validation(_))
    ));
    assert!(matches!(
        kernel.ledger().consume(root.id, -5).await,
        Err(KernelError::Validation(_))
    ));

    kernel.ledger().consume(root.id, 900).await.unwrap();
    match kernel.ledger().consume(root.id, 200).await {
        Err(KernelError::InsufficientBudget {
            agent,
            required,
            available,
        }) => {
            assert_eq!(agent, root.id);
            assert_eq!(required, 200);
            assert_eq!(available, 100);
        }
        other => panic!("expected InsufficientBudget, got {other:?}"),
    }
}

#[tokio::test]
async fn duplicate_account_is_a_conflict() {
    let kernel = kernel().await;
    let root = spawn_root(&kernel, 1_000).await;
    let result = kernel.ledger().open_root(root.id, 500).await;
    assert!(matches!(result, Err(KernelError::Conflict(_))));
}

#[tokio::test]
async fn unknown_account_is_not_found() {
    let kernel = kernel().await;
    let result = kernel.ledger().account_of(Uuid::new_v4()).await;
    assert!(matches!(result, Err(KernelError::NotFound { .. })));
}

#[tokio::test]
async fn frozen_account_rejects_spend_and_allocation() {
    let kernel = kernel().await;
    let root = spawn_root(&kernel, 10_000).await;

    let account = kernel.ledger().freeze(root.id).await.unwrap();
    assert!(account.frozen);
    // Double-freeze is a no-op.
    assert!(kernel.ledger().freeze(root.id).await.unwrap().frozen);

    assert!(matches!(
        kernel.ledger().consume(root.id, 100).await,
        Err(KernelError::InvalidTransition(_))
    ));
    let spawn = kernel
        .lifecycle()
        .spawn(
            agent_kernel::SpawnSpec::new("worker", "blocked")
                .with_budget(100)
                .with_parent(root.id),
        )
        .await;
    assert!(matches!(spawn, Err(KernelError::InvalidTransition(_))));

    let account = kernel.ledger().unfreeze(root.id).await.unwrap();
    assert!(!account.frozen);
    kernel.ledger().consume(root.id, 100).await.unwrap();
}

#[tokio::test]
async fn reclaimed_account_is_inert() {
    let kernel = kernel().await;
    let root = spawn_root(&kernel, 10_000).await;
    let child = spawn_child(&kernel, root.id, 3_000).await;
    kernel.ledger().reclaim(child.id).await.unwrap();

    assert!(matches!(
        kernel.ledger().consume(child.id, 10).await,
        Err(KernelError::InvalidTransition(_))
    ));
    let grandchild = kernel
        .lifecycle()
        .spawn(
            agent_kernel::SpawnSpec::new("worker", "late arrival")
                .with_budget(10)
                .with_parent(child.id),
        )
        .await;
    assert!(matches!(grandchild, Err(KernelError::InvalidTransition(_))));
}

#[tokio::test]
async fn reclaiming_a_parent_keeps_grandchild_reservations_earmarked() {
    let kernel = kernel().await;
    let root = spawn_root(&kernel, 100_000).await;
    let mid = spawn_child(&kernel, root.id, 50_000).await;
    let leaf = spawn_child(&kernel, mid.id, 20_000).await;
    kernel.ledger().consume(leaf.id, 20_000).await.unwrap();

    // Post-order: leaf first, then the middle layer.
    let leaf_outcome = kernel.ledger().reclaim(leaf.id).await.unwrap();
    assert_eq!(leaf_outcome.amount, 0);
    let mid_outcome = kernel.ledger().reclaim(mid.id).await.unwrap();
    // The 20k the leaf burned stays earmarked on the middle account.
    assert_eq!(mid_outcome.amount, 30_000);

    let root_account = kernel.ledger().account_of(root.id).await.unwrap();
    assert_eq!(root_account.reserved, 20_000);
    assert_eq!(root_account.available(), 80_000);
}

#[tokio::test]
async fn hierarchy_of_reports_the_subtree() {
    let kernel = kernel().await;
    let root = spawn_root(&kernel, 100_000).await;
    let a = spawn_child(&kernel, root.id, 30_000).await;
    let b = spawn_child(&kernel, root.id, 20_000).await;
    spawn_child(&kernel, a.id, 5_000).await;

    let tree = kernel.ledger().hierarchy_of(root.id, 5).await.unwrap();
    assert_eq!(tree.account.agent, root.id);
    assert_eq!(tree.children.len(), 2);
    let a_node = tree
        .children
        .iter()
        .find(|node| node.account.agent == a.id)
        .expect("a must be in the tree");
    assert_eq!(a_node.children.len(), 1);
    assert_eq!(a_node.account.reserved, 5_000);
    let b_node = tree
        .children
        .iter()
        .find(|node| node.account.agent == b.id)
        .expect("b must be in the tree");
    assert!(b_node.children.is_empty());

    // Depth cutoff hides the grandchild.
    let shallow = kernel.ledger().hierarchy_of(root.id, 1).await.unwrap();
    let a_shallow = shallow
        .children
        .iter()
        .find(|node| node.account.agent == a.id)
        .unwrap();
    assert!(a_shallow.children.is_empty());
}

#[tokio::test]
async fn conservation_holds_under_random_interleavings() {
    let kernel = kernel().await;
    let root = spawn_root(&kernel, 100_000).await;
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut agents = vec![root.id];

    for _ in 0..120 {
        let target = agents[rng.gen_range(0..agents.len())];
        match rng.gen_range(0..4u8) {
            0 => {
                let budget = rng.gen_range(1..=5_000);
                if let Ok(child) = kernel
                    .lifecycle()
                    .spawn(
                        agent_kernel::SpawnSpec::new("worker", "random work")
                            .with_budget(budget)
                            .with_parent(target),
                    )
                    .await
                {
                    agents.push(child.id);
                }
            }
            1 => {
                let tokens = rng.gen_range(1..=2_000);
                let _ = kernel.ledger().consume(target, tokens).await;
            }
            2 => {
                if target != root.id {
                    let _ = kernel.ledger().reclaim(target).await;
                }
            }
            _ => {
                if target != root.id {
                    let _ = kernel.lifecycle().terminate(target, "random cull").await;
                }
            }
        }
        assert_conservation(&kernel).await;
    }
}

/// For every agent: per-account bounds hold, and the subtree's total usage
/// never exceeds the subtree root's allocation.
async fn assert_conservation(kernel: &Kernel) {
    let agents = kernel
        .lifecycle()
        .list_agents(&AgentFilter::default())
        .await
        .unwrap();
    let mut accounts = HashMap::new();
    let mut children: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for agent in &agents {
        let account = kernel.ledger().account_of(agent.id).await.unwrap();
        assert!(account.used >= 0, "negative used on {}", agent.id);
        assert!(account.reserved >= 0, "negative reserved on {}", agent.id);
        assert!(
            account.used + account.reserved <= account.allocated,
            "account overdrawn on {}",
            agent.id
        );
        accounts.insert(agent.id, account);
        if let Some(parent) = agent.parent {
            children.entry(parent).or_default().push(agent.id);
        }
    }

    for agent in &agents {
        let mut total_used = 0i64;
        let mut stack = vec![agent.id];
        while let Some(id) = stack.pop() {
            total_used += accounts[&id].used;
            if let Some(kids) = children.get(&id) {
                stack.extend(kids.iter().copied());
            }
        }
        assert!(
            total_used <= accounts[&agent.id].allocated,
            "conservation violated for subtree of {}: {} used vs {} allocated",
            agent.id,
            total_used,
            accounts[&agent.id].allocated
        );
    }
}
