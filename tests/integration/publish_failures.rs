//! Publish failures roll back the failed commit and everything downstream of it

use super::support::*;
use creation_kernel::commit::CommitState;
use creation_kernel::{KernelError, Props};

#[tokio::test]
async fn test_broadcast_failure_cascades_downstream() {
    let h = harness();
    h.ledger.reject_broadcasts(true);

    let class = h.kernel.deploy(COUNTER_SRC, Props::new()).unwrap();
    let deploy_commit = h.kernel.last_commit().unwrap();
    let counter = h.kernel.instantiate(&class, vec![]).unwrap();
    let new_commit = h.kernel.last_commit().unwrap();
    let mut deploy_done = deploy_commit.completion();
    let mut new_done = new_commit.completion();

    let err = h.kernel.sync().await.unwrap_err();
    assert_eq!(err, KernelError::Publish("broadcast rejected".to_string()));

    assert_eq!(deploy_commit.state(), CommitState::Failed);
    assert_eq!(new_commit.state(), CommitState::Failed);
    assert_eq!(deploy_done.try_recv().unwrap(), Err(err.clone()));
    assert_eq!(new_done.try_recv().unwrap(), Err(err.clone()));
    assert_eq!(h.kernel.pending_commits(), 0);
    assert!(h.ledger.txids().is_empty());

    // Never published: both carry the failure instead of a location.
    assert!(class.bindings().location.starts_with("error://"));
    assert!(counter.bindings().location.starts_with("error://"));
    assert!(class.bindings().origin.starts_with("error://"));
}

#[tokio::test]
async fn test_spent_creation_returns_to_last_published_state() {
    let h = harness();
    let class = h.kernel.deploy(COUNTER_SRC, Props::new()).unwrap();
    let counter = h.kernel.instantiate(&class, vec![]).unwrap();
    h.kernel.sync().await.unwrap();
    let published = counter.bindings();

    h.purse.fail_payments(true);
    h.kernel.call(&counter, "inc", vec![]).unwrap();
    h.kernel.call(&counter, "inc", vec![]).unwrap();
    assert_eq!(h.kernel.pending_commits(), 2);

    let err = h.kernel.sync().await.unwrap_err();
    assert!(matches!(err, KernelError::Publish(_)));
    assert_eq!(h.kernel.pending_commits(), 0);
    assert_eq!(counter.bindings(), published);
    assert_eq!(
        get(&h.kernel, &counter, "count"),
        creation_kernel::Value::from(0i64)
    );

    // The kernel keeps working once funding recovers.
    h.purse.fail_payments(false);
    h.kernel.call(&counter, "inc", vec![]).unwrap();
    h.kernel.sync().await.unwrap();
    assert_eq!(counter.bindings().nonce, 2);
}

#[tokio::test]
async fn test_completion_resolves_with_txid() {
    let h = harness();
    h.kernel.deploy(PLAIN_SRC, Props::new()).unwrap();
    let commit = h.kernel.last_commit().unwrap();
    let done = commit.completion();
    h.kernel.sync().await.unwrap();

    let txid = done.await.unwrap().unwrap();
    assert_eq!(txid, h.ledger.last_txid());
    assert_eq!(commit.state(), CommitState::Published);
    assert_eq!(commit.txid(), Some(txid));
}

#[tokio::test]
async fn test_failed_creation_cannot_be_used() {
    let h = harness();
    h.ledger.reject_broadcasts(true);
    let code = h.kernel.deploy(COUNTER_SRC, Props::new()).unwrap();
    assert!(h.kernel.sync().await.is_err());

    h.ledger.reject_broadcasts(false);
    let err = h.kernel.instantiate(&code, vec![]).unwrap_err();
    assert!(matches!(err, KernelError::State(_)));
    assert_eq!(h.kernel.pending_commits(), 0);
}
