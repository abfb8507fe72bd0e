//! Berries: plucked from a deployed berry class and referenced by location

use super::support::*;
use creation_kernel::payload::Payload;
use creation_kernel::{KernelError, Props, Value};

#[tokio::test]
async fn test_pluck_berry_by_location() {
    let h = harness();
    let tag = h.kernel.deploy(TAG_SRC, Props::new()).unwrap();
    h.kernel.sync().await.unwrap();
    let tag_location = tag.bindings().location;

    let location = format!("{}?berry=red", tag_location);
    let berry = h.kernel.load(&location).await.unwrap();
    assert_eq!(berry.bindings().location, location);
    assert_eq!(get(&h.kernel, &berry, "name"), Value::from("red"));
    assert_eq!(berry.class().unwrap().bindings(), tag.bindings());
    assert_eq!(h.kernel.pending_commits(), 0);
}

#[tokio::test]
async fn test_non_berry_class_cannot_be_plucked() {
    let h = harness();
    let plain = h.kernel.deploy(PLAIN_SRC, Props::new()).unwrap();
    h.kernel.sync().await.unwrap();

    let err = h
        .kernel
        .load(&format!("{}?berry=x", plain.bindings().location))
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::State(_)));
}

#[tokio::test]
async fn test_held_berry_is_a_ref_and_replays() {
    let h = harness();
    let tag = h.kernel.deploy(TAG_SRC, Props::new()).unwrap();
    let class = h.kernel.deploy(COUNTER_SRC, Props::new()).unwrap();
    let counter = h.kernel.instantiate(&class, vec![]).unwrap();
    h.kernel.sync().await.unwrap();

    let location = format!("{}?berry=blue", tag.bindings().location);
    let berry = h.kernel.load(&location).await.unwrap();
    h.kernel
        .call(&counter, "hold", vec![Value::Creation(berry.clone())])
        .unwrap();
    h.kernel.sync().await.unwrap();

    let held = get(&h.kernel, &counter, "held");
    assert!(held.as_creation().unwrap().ptr_eq(&berry));

    let txid = h.ledger.last_txid();
    let payload = Payload::from_transaction(&h.ledger.tx(&txid)).unwrap();
    assert_eq!(payload.inputs, 1);
    assert!(payload.refs.contains(&location));

    let replayed = h.kernel.verify(&txid).await.unwrap();
    let copy = &replayed.outputs[0];
    let held = get(&h.kernel, copy, "held");
    let copied_berry = held.as_creation().unwrap();
    assert_eq!(copied_berry.bindings().location, location);
    assert_eq!(get(&h.kernel, copied_berry, "name"), Value::from("blue"));
}
