//! Deploying and upgrading code

use super::support::*;
use creation_kernel::membrane::AccessControlled;
use creation_kernel::payload::Payload;
use creation_kernel::{KernelError, Props, Value};

#[tokio::test]
async fn test_deploy_without_parent_has_no_refs() {
    let h = harness();
    let code = h.kernel.deploy(PLAIN_SRC, Props::new()).unwrap();

    // Not published yet: the location is still owned by a commit.
    let err = h.kernel.membrane().get(&code, "location").unwrap_err();
    assert!(err.to_string().contains("needs sync"));

    h.kernel.sync().await.unwrap();
    let txid = h.ledger.last_txid();
    let tx = h.ledger.tx(&txid);
    let payload = Payload::from_transaction(&tx).unwrap();
    assert_eq!(payload.inputs, 0);
    assert!(payload.refs.is_empty());
    assert_eq!(payload.out.len(), 1);
    assert_eq!(payload.lock.len(), 1);
    assert_eq!(tx.outputs[1].script, format!("p2pkh:{}", OWNER));

    let bindings = code.bindings();
    assert_eq!(bindings.location, format!("{}_o1", txid));
    assert_eq!(bindings.origin, bindings.location);
    assert_eq!(bindings.nonce, 1);
    assert_eq!(get(&h.kernel, &code, "owner"), Value::from(OWNER));
    assert_eq!(h.kernel.pending_commits(), 0);
}

#[tokio::test]
async fn test_deploy_extending_native_references_it() {
    let h = harness();
    h.kernel.deploy(PARENT_SRC, Props::new()).unwrap();
    h.kernel.sync().await.unwrap();
    let payload = Payload::from_transaction(&h.ledger.tx(&h.ledger.last_txid())).unwrap();
    assert_eq!(payload.refs, vec!["native://Jig".to_string()]);
    assert_eq!(payload.inputs, 0);
}

#[tokio::test]
async fn test_owner_sealed_parent_is_spent_by_child_deploy() {
    let h = harness();
    let parent = h
        .kernel
        .deploy(PARENT_SRC, props(vec![("sealed", Value::from("owner"))]))
        .unwrap();
    h.kernel.sync().await.unwrap();
    let parent_tx = h.ledger.last_txid();

    let child = h
        .kernel
        .deploy(
            CHILD_SRC,
            props(vec![(
                "deps",
                object(vec![("Parent", Value::Creation(parent.clone()))]),
            )]),
        )
        .unwrap();
    h.kernel.sync().await.unwrap();

    let txid = h.ledger.last_txid();
    let tx = h.ledger.tx(&txid);
    let payload = Payload::from_transaction(&tx).unwrap();
    assert_eq!(payload.inputs, 1);
    assert_eq!(tx.inputs[0].txid, parent_tx);
    assert_eq!(tx.inputs[0].vout, 1);
    // The parent was authorized, so it is re-output ahead of the child.
    assert_eq!(parent.bindings().location, format!("{}_o1", txid));
    assert_eq!(parent.bindings().nonce, 2);
    assert_eq!(child.bindings().location, format!("{}_o2", txid));
    assert_eq!(payload.lock.len(), 1);
}

#[tokio::test]
async fn test_sealed_parent_cannot_be_extended() {
    let h = harness();
    let parent = h
        .kernel
        .deploy(PARENT_SRC, props(vec![("sealed", Value::Bool(true))]))
        .unwrap();
    h.kernel.sync().await.unwrap();

    let err = h
        .kernel
        .deploy(
            CHILD_SRC,
            props(vec![("deps", object(vec![("Parent", Value::Creation(parent.clone()))]))]),
        )
        .unwrap_err();
    assert!(matches!(err, KernelError::State(_)));
    assert!(err.to_string().contains("sealed"));
    assert_eq!(h.kernel.pending_commits(), 0);
    assert_eq!(parent.bindings().nonce, 1);
}

#[tokio::test]
async fn test_unsealed_parent_is_only_read() {
    let h = harness();
    let parent = h
        .kernel
        .deploy(PARENT_SRC, props(vec![("sealed", Value::Bool(false))]))
        .unwrap();
    h.kernel.sync().await.unwrap();
    let parent_location = parent.bindings().location;

    h.kernel
        .deploy(
            CHILD_SRC,
            props(vec![("deps", object(vec![("Parent", Value::Creation(parent.clone()))]))]),
        )
        .unwrap();
    h.kernel.sync().await.unwrap();

    let payload = Payload::from_transaction(&h.ledger.tx(&h.ledger.last_txid())).unwrap();
    assert_eq!(payload.inputs, 0);
    assert_eq!(payload.refs, vec![parent_location.clone()]);
    assert_eq!(parent.bindings().location, parent_location);
}

#[test]
fn test_code_props_are_validated() {
    let h = harness();
    let err = h
        .kernel
        .deploy(PLAIN_SRC, props(vec![("location", Value::from("x"))]))
        .unwrap_err();
    assert!(matches!(err, KernelError::Argument(_)));

    let err = h
        .kernel
        .deploy(PLAIN_SRC, props(vec![("sealed", Value::from(3i64))]))
        .unwrap_err();
    assert!(matches!(err, KernelError::Argument(_)));

    let err = h
        .kernel
        .deploy("class Unknown {}", Props::new())
        .unwrap_err();
    assert!(matches!(err, KernelError::Execution(_)));
    assert_eq!(h.kernel.pending_commits(), 0);
}

#[tokio::test]
async fn test_upgrade_swaps_definition() {
    let h = harness();
    let code = h.kernel.deploy(PLAIN_SRC, Props::new()).unwrap();
    h.kernel.sync().await.unwrap();
    assert_eq!(h.kernel.call(&code, "version", vec![]).unwrap(), Value::from(1i64));
    h.kernel.sync().await.unwrap();

    h.kernel
        .upgrade(&code, PLAIN_V2_SRC, props(vec![("tier", Value::from("gold"))]))
        .unwrap();
    assert_eq!(code.code().unwrap().src, PLAIN_V2_SRC);
    assert_eq!(h.kernel.call(&code, "version", vec![]).unwrap(), Value::from(2i64));
    h.kernel.sync().await.unwrap();

    assert_eq!(get(&h.kernel, &code, "tier"), Value::from("gold"));
    assert_eq!(code.bindings().nonce, 4);
    assert_eq!(h.ledger.txids().len(), 4);
}

#[tokio::test]
async fn test_non_upgradable_code_is_refused() {
    let h = harness();
    let code = h
        .kernel
        .deploy(PLAIN_SRC, props(vec![("upgradable", Value::Bool(false))]))
        .unwrap();
    h.kernel.sync().await.unwrap();
    let err = h.kernel.upgrade(&code, PLAIN_V2_SRC, Props::new()).unwrap_err();
    assert!(matches!(err, KernelError::State(_)));
    assert_eq!(code.code().unwrap().src, PLAIN_SRC);
}
