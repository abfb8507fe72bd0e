//! Instances: construction, method calls, ownership and rollback

use super::support::*;
use creation_kernel::commit::CommitState;
use creation_kernel::membrane::AccessControlled;
use creation_kernel::payload::Payload;
use creation_kernel::snapshot::Snapshot;
use creation_kernel::{Creation, KernelError, Props, Value};

async fn deployed_counter(h: &Harness) -> (Creation, Creation) {
    let class = h.kernel.deploy(COUNTER_SRC, Props::new()).unwrap();
    let counter = h.kernel.instantiate(&class, vec![]).unwrap();
    h.kernel.sync().await.unwrap();
    (class, counter)
}

#[tokio::test]
async fn test_instantiate_waits_for_class_commit() {
    let h = harness();
    let class = h.kernel.deploy(COUNTER_SRC, Props::new()).unwrap();
    let deploy_commit = h.kernel.last_commit().unwrap();
    let counter = h.kernel.instantiate(&class, vec![]).unwrap();
    let new_commit = h.kernel.last_commit().unwrap();

    assert_eq!(new_commit.upstream(), vec![deploy_commit.id]);
    assert_eq!(new_commit.state(), CommitState::Pending);
    assert_eq!(get(&h.kernel, &counter, "count"), Value::from(0i64));

    h.kernel.sync().await.unwrap();
    let txids = h.ledger.txids();
    assert_eq!(txids.len(), 2);
    assert_eq!(counter.bindings().location, format!("{}_o1", txids[1]));
    assert_eq!(get(&h.kernel, &counter, "owner"), Value::from(OWNER));

    let payload = Payload::from_transaction(&h.ledger.tx(&txids[1])).unwrap();
    assert_eq!(payload.refs, vec![format!("{}_o1", txids[0])]);
    assert_eq!(payload.lock.len(), 1);
}

#[tokio::test]
async fn test_calls_advance_nonce_monotonically() {
    let h = harness();
    let (_, counter) = deployed_counter(&h).await;
    assert_eq!(counter.bindings().nonce, 1);

    assert_eq!(h.kernel.call(&counter, "inc", vec![]).unwrap(), Value::from(1i64));
    assert_eq!(h.kernel.call(&counter, "inc", vec![]).unwrap(), Value::from(2i64));
    h.kernel.sync().await.unwrap();

    assert_eq!(get(&h.kernel, &counter, "count"), Value::from(2i64));
    assert_eq!(get(&h.kernel, &counter, "nonce"), Value::from(3i64));
    let txids = h.ledger.txids();
    assert_eq!(txids.len(), 4);
    assert_eq!(counter.bindings().location, format!("{}_o1", txids[3]));
    // Origin stays at the creating transaction.
    assert_eq!(counter.bindings().origin, format!("{}_o1", txids[1]));
}

#[tokio::test]
async fn test_failed_call_rolls_back_everything() {
    let h = harness();
    let (_, counter) = deployed_counter(&h).await;
    let before = counter.bindings();

    let err = h.kernel.call(&counter, "fail", vec![]).unwrap_err();
    assert_eq!(err, KernelError::Execution("boom".to_string()));
    assert_eq!(get(&h.kernel, &counter, "count"), Value::from(0i64));
    assert_eq!(counter.bindings(), before);
    assert_eq!(h.kernel.pending_commits(), 0);
}

#[tokio::test]
async fn test_failure_inside_transaction_undoes_earlier_actions() {
    let h = harness();
    let (_, counter) = deployed_counter(&h).await;

    let err = h
        .kernel
        .transaction(|k| {
            k.call(&counter, "inc", vec![])?;
            k.call(&counter, "fail", vec![])
        })
        .unwrap_err();
    assert!(matches!(err, KernelError::Execution(_)));
    assert_eq!(get(&h.kernel, &counter, "count"), Value::from(0i64));
    assert_eq!(counter.bindings().nonce, 1);
    assert_eq!(h.kernel.pending_commits(), 0);
}

#[tokio::test]
async fn test_transaction_groups_actions_into_one_commit() {
    let h = harness();
    let (_, counter) = deployed_counter(&h).await;

    h.kernel
        .transaction(|k| {
            k.call(&counter, "inc", vec![])?;
            k.call(&counter, "inc", vec![])
        })
        .unwrap();
    h.kernel.sync().await.unwrap();

    let payload = Payload::from_transaction(&h.ledger.tx(&h.ledger.last_txid())).unwrap();
    assert_eq!(payload.cmds.len(), 2);
    assert_eq!(payload.inputs, 1);
    assert_eq!(counter.bindings().nonce, 2);
}

#[tokio::test]
async fn test_membrane_blocks_outside_writes_and_private_calls() {
    let h = harness();
    let (_, counter) = deployed_counter(&h).await;

    let err = h
        .kernel
        .membrane()
        .set(&counter, "count", Value::from(5i64))
        .unwrap_err();
    assert!(matches!(err, KernelError::State(_)));

    let err = h.kernel.call(&counter, "_secret", vec![]).unwrap_err();
    assert!(matches!(err, KernelError::State(_)));
    assert_eq!(h.kernel.pending_commits(), 0);
}

#[tokio::test]
async fn test_owner_change_is_published_and_freezes_the_creation() {
    let h = harness();
    let (_, counter) = deployed_counter(&h).await;

    let err = h
        .kernel
        .transaction(|k| {
            k.call(&counter, "send", vec![Value::from("bob")])?;
            k.call(&counter, "inc", vec![])
        })
        .unwrap_err();
    assert!(matches!(err, KernelError::State(_)));
    assert_eq!(get(&h.kernel, &counter, "owner"), Value::from(OWNER));

    h.kernel.call(&counter, "send", vec![Value::from("bob")]).unwrap();
    h.kernel.sync().await.unwrap();
    let tx = h.ledger.tx(&h.ledger.last_txid());
    assert_eq!(tx.outputs[1].script, "p2pkh:bob");
    assert_eq!(tx.inputs[0].unlock.as_deref(), Some("sig(p2pkh:alice)"));
    assert_eq!(get(&h.kernel, &counter, "owner"), Value::from("bob"));
}

#[tokio::test]
async fn test_instances_created_inside_methods_inherit_owner() {
    let h = harness();
    let (_, counter) = deployed_counter(&h).await;
    h.kernel.call(&counter, "send", vec![Value::from("carol")]).unwrap();
    h.kernel.sync().await.unwrap();

    let spawned = h.kernel.call(&counter, "spawn", vec![]).unwrap();
    let child = spawned.as_creation().cloned().unwrap();
    h.kernel.sync().await.unwrap();

    let txid = h.ledger.last_txid();
    assert_eq!(child.bindings().location, format!("{}_o2", txid));
    assert_eq!(get(&h.kernel, &child, "owner"), Value::from("carol"));
    assert_eq!(get(&h.kernel, &child, "count"), Value::from(0i64));
    let payload = Payload::from_transaction(&h.ledger.tx(&txid)).unwrap();
    assert_eq!(payload.cmds.len(), 1);
    assert_eq!(payload.lock.len(), 1);
}

#[tokio::test]
async fn test_destroy_moves_creation_to_delete_slot() {
    let h = harness();
    let (_, counter) = deployed_counter(&h).await;
    h.kernel.destroy(&counter).unwrap();
    h.kernel.sync().await.unwrap();

    let txid = h.ledger.last_txid();
    let payload = Payload::from_transaction(&h.ledger.tx(&txid)).unwrap();
    assert_eq!(payload.del.len(), 1);
    assert!(payload.out.is_empty());
    assert_eq!(counter.bindings().location, format!("{}_d0", txid));
    assert_eq!(get(&h.kernel, &counter, "owner"), Value::Null);

    let err = h.kernel.call(&counter, "inc", vec![]).unwrap_err();
    assert!(matches!(err, KernelError::State(_)));
}

#[tokio::test]
async fn test_auth_spends_without_changes() {
    let h = harness();
    let (_, counter) = deployed_counter(&h).await;
    h.kernel.auth(&counter).unwrap();
    h.kernel.sync().await.unwrap();

    let txid = h.ledger.last_txid();
    let payload = Payload::from_transaction(&h.ledger.tx(&txid)).unwrap();
    assert_eq!(payload.inputs, 1);
    assert_eq!(payload.out.len(), 1);
    assert_eq!(counter.bindings().nonce, 2);
    assert_eq!(get(&h.kernel, &counter, "count"), Value::from(0i64));
}

#[tokio::test]
async fn test_nested_calls_read_the_callee() {
    let h = harness();
    let (class, holder) = deployed_counter(&h).await;
    let other = h.kernel.instantiate(&class, vec![]).unwrap();
    h.kernel.sync().await.unwrap();

    h.kernel
        .call(&holder, "hold", vec![Value::Creation(other.clone())])
        .unwrap();
    h.kernel.sync().await.unwrap();

    let held = get(&h.kernel, &holder, "held");
    assert!(held.as_creation().unwrap().ptr_eq(&other));
    let payload = Payload::from_transaction(&h.ledger.tx(&h.ledger.last_txid())).unwrap();
    assert_eq!(payload.inputs, 1);
    assert!(payload.refs.contains(&other.bindings().location));
}

#[tokio::test]
async fn test_method_cannot_destroy_or_auth_another_creation() {
    let h = harness();
    let (class, killer) = deployed_counter(&h).await;
    let victim = h.kernel.instantiate(&class, vec![]).unwrap();
    h.kernel.sync().await.unwrap();
    let killer_before = killer.bindings();
    let victim_before = victim.bindings();

    let err = h
        .kernel
        .call(&killer, "kill", vec![Value::Creation(victim.clone())])
        .unwrap_err();
    assert!(matches!(err, KernelError::State(_)));
    let err = h
        .kernel
        .call(&killer, "vouch", vec![Value::Creation(victim.clone())])
        .unwrap_err();
    assert!(matches!(err, KernelError::State(_)));

    assert_eq!(killer.bindings(), killer_before);
    assert_eq!(victim.bindings(), victim_before);
    assert_eq!(h.kernel.pending_commits(), 0);
}

#[tokio::test]
async fn test_method_can_destroy_itself_through_the_kernel() {
    let h = harness();
    let (_, counter) = deployed_counter(&h).await;
    h.kernel.call(&counter, "retire", vec![]).unwrap();
    h.kernel.sync().await.unwrap();

    let txid = h.ledger.last_txid();
    let payload = Payload::from_transaction(&h.ledger.tx(&txid)).unwrap();
    assert_eq!(payload.del.len(), 1);
    assert!(payload.out.is_empty());
    assert_eq!(counter.bindings().location, format!("{}_d0", txid));
}

#[tokio::test]
async fn test_destroying_twice_in_one_transaction_is_a_no_op() {
    let h = harness();
    let (_, counter) = deployed_counter(&h).await;

    h.kernel
        .transaction(|k| {
            k.destroy(&counter)?;
            k.destroy(&counter)
        })
        .unwrap();
    let commit = h.kernel.last_commit().unwrap();
    assert_eq!(commit.deletes.len(), 1);
    h.kernel.sync().await.unwrap();

    let txid = h.ledger.last_txid();
    let payload = Payload::from_transaction(&h.ledger.tx(&txid)).unwrap();
    assert_eq!(payload.del.len(), 1);
    assert_eq!(counter.bindings().location, format!("{}_d0", txid));
    h.kernel.verify(&txid).await.unwrap();
}

#[tokio::test]
async fn test_failed_transaction_restores_every_encoding() {
    let h = harness();
    let (class, counter) = deployed_counter(&h).await;
    let other = h.kernel.instantiate(&class, vec![]).unwrap();
    h.kernel.sync().await.unwrap();
    h.kernel.call(&other, "inc", vec![]).unwrap();
    h.kernel.sync().await.unwrap();

    let fingerprints = |creations: &[&Creation]| -> Vec<serde_json::Value> {
        creations
            .iter()
            .map(|c| Snapshot::capture(c).fingerprint().unwrap())
            .collect()
    };
    let watched = [&class, &counter, &other];
    let before = fingerprints(&watched);

    let err = h
        .kernel
        .transaction(|k| {
            k.call(&counter, "inc", vec![])?;
            k.call(&counter, "hold", vec![Value::Creation(other.clone())])?;
            k.call(&other, "inc", vec![])?;
            k.instantiate(&class, vec![])?;
            k.call(&other, "fail", vec![])
        })
        .unwrap_err();
    assert!(matches!(err, KernelError::Execution(_)));

    assert_eq!(fingerprints(&watched), before);
    assert_eq!(h.kernel.pending_commits(), 0);
}
