//! Replay, verify and import against the ledger

use super::support::*;
use creation_kernel::cache::{refmap_key, state_key, MemoryCache};
use creation_kernel::config::KernelConfig;
use creation_kernel::interfaces::{Cache, METADATA_PREFIX};
use creation_kernel::payload::{Command, Op, Payload};
use creation_kernel::{Creation, KernelError, Props, Value};
use serde_json::json;
use std::sync::Arc;

/// Deploy a counter class, create one counter and increment it once.
async fn history(h: &Harness) -> (Creation, Creation) {
    let class = h.kernel.deploy(COUNTER_SRC, Props::new()).unwrap();
    let counter = h.kernel.instantiate(&class, vec![]).unwrap();
    h.kernel.sync().await.unwrap();
    h.kernel.call(&counter, "inc", vec![]).unwrap();
    h.kernel.sync().await.unwrap();
    (class, counter)
}

#[tokio::test]
async fn test_verify_reproduces_every_transaction() {
    let h = harness();
    let (_, counter) = history(&h).await;
    let txids = h.ledger.txids();
    assert_eq!(txids.len(), 3);

    for txid in &txids {
        let replayed = h.kernel.verify(txid).await.unwrap();
        assert_eq!(&replayed.txid, txid);
        assert_eq!(replayed.outputs.len(), 1);
    }

    let replayed = h.kernel.verify(&txids[2]).await.unwrap();
    let copy = &replayed.outputs[0];
    assert!(!copy.ptr_eq(&counter));
    assert_eq!(copy.bindings(), counter.bindings());
    assert_eq!(get(&h.kernel, copy, "count"), Value::from(1i64));
    assert_eq!(
        replayed.refmap.get(&counter.bindings().origin),
        Some(&(counter.bindings().location, 2))
    );
}

#[tokio::test]
async fn test_tampered_payload_is_rejected_and_not_cached() {
    let h = harness();
    history(&h).await;
    let txids = h.ledger.txids();

    let mut tx = h.ledger.tx(&txids[1]);
    let mut payload = Payload::from_transaction(&tx).unwrap();
    payload.out[0] = "0".repeat(64);
    tx.outputs[0].script = payload.to_script().unwrap();
    let forged = h.ledger.insert(tx.clone());

    let err = h.kernel.replay(&forged, &tx).await.unwrap_err();
    assert!(matches!(err, KernelError::PayloadMismatch(_)));
    assert!(err.is_fatal());

    let location = format!("{}_o1", forged);
    assert_eq!(h.cache.get(&state_key(&location)).await.unwrap(), None);
    assert_eq!(h.cache.get(&refmap_key(&location)).await.unwrap(), None);
    assert!(h.kernel.load(&location).await.is_err());
}

#[tokio::test]
async fn test_wrong_output_value_is_rejected() {
    let h = harness();
    history(&h).await;
    let mut tx = h.ledger.tx(&h.ledger.txids()[1]);
    tx.outputs[1].satoshis += 5;
    let forged = h.ledger.insert(tx.clone());

    let err = h.kernel.replay(&forged, &tx).await.unwrap_err();
    assert!(matches!(err, KernelError::PayloadMismatch(_)));
}

#[tokio::test]
async fn test_untrusted_deploy_is_refused() {
    let h = harness();
    history(&h).await;

    let cautious = kernel_with(
        h.ledger.clone(),
        KernelConfig::default(),
        Arc::new(MemoryCache::new()),
    );
    let first = h.ledger.txids()[0].clone();
    let err = cautious.import(&first).await.unwrap_err();
    assert!(matches!(err, KernelError::Trust(_)));

    let trusting = kernel_with(
        h.ledger.clone(),
        KernelConfig {
            trust: vec![first.clone()],
            ..KernelConfig::default()
        },
        Arc::new(MemoryCache::new()),
    );
    let replayed = trusting.import(&first).await.unwrap();
    assert_eq!(replayed.outputs[0].bindings().location, format!("{}_o1", first));
}

#[tokio::test]
async fn test_second_kernel_loads_and_follows_spends() {
    let h = harness();
    let class = h.kernel.deploy(COUNTER_SRC, Props::new()).unwrap();
    let counter = h.kernel.instantiate(&class, vec![]).unwrap();
    h.kernel.sync().await.unwrap();
    let created = counter.bindings().location;
    h.kernel.call(&counter, "inc", vec![]).unwrap();
    h.kernel.call(&counter, "inc", vec![]).unwrap();
    h.kernel.sync().await.unwrap();

    let other = kernel_with(h.ledger.clone(), trusting_config(), Arc::new(MemoryCache::new()));
    let old = other.load(&created).await.unwrap();
    assert_eq!(get(&other, &old, "count"), Value::from(0i64));
    assert_eq!(old.bindings().nonce, 1);

    let latest = other.load_latest(&created).await.unwrap();
    assert_eq!(latest.bindings(), counter.bindings());
    assert_eq!(get(&other, &latest, "count"), Value::from(2i64));

    // The second kernel can keep going from the state it loaded.
    other.call(&latest, "inc", vec![]).unwrap();
    other.sync().await.unwrap();
    assert_eq!(get(&other, &latest, "count"), Value::from(3i64));
    assert_eq!(latest.bindings().nonce, 4);
}

#[tokio::test]
async fn test_replay_caches_states_for_hydration() {
    let h = harness();
    history(&h).await;
    let txids = h.ledger.txids();

    let cache = Arc::new(MemoryCache::new());
    let other = kernel_with(h.ledger.clone(), trusting_config(), cache.clone());
    other.import(&txids[2]).await.unwrap();
    for txid in &txids {
        let key = state_key(&format!("{}_o1", txid));
        assert!(cache.get(&key).await.unwrap().is_some(), "missing {}", key);
    }

    let state = cache
        .get(&state_key(&format!("{}_o1", txids[1])))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state["kind"], "jig");
    assert_eq!(state["version"], "04");
    assert_eq!(state["cls"]["$jig"], format!("{}_o1", txids[0]));
    assert_eq!(state["props"]["location"], "_o1");
    assert_eq!(state["props"]["count"], 0);
}

#[tokio::test]
async fn test_old_reference_unifies_to_latest_state() {
    let h = harness();
    let class = h.kernel.deploy(COUNTER_SRC, Props::new()).unwrap();
    let holder = h.kernel.instantiate(&class, vec![]).unwrap();
    let target = h.kernel.instantiate(&class, vec![]).unwrap();
    h.kernel.sync().await.unwrap();
    let first_location = target.bindings().location;
    h.kernel.call(&target, "inc", vec![]).unwrap();
    h.kernel.sync().await.unwrap();

    // A stale copy of the target, loaded from its first location.
    let stale = h.kernel.load(&first_location).await.unwrap();
    assert!(!stale.ptr_eq(&target));
    assert_eq!(stale.bindings().nonce, 1);

    let pair = object(vec![
        ("old", Value::Creation(stale.clone())),
        ("new", Value::Creation(target.clone())),
    ]);
    h.kernel.call(&holder, "hold", vec![pair]).unwrap();
    h.kernel.sync().await.unwrap();

    let held = get(&h.kernel, &holder, "held");
    let held = held.as_object().unwrap();
    for key in ["old", "new"] {
        let member = held.get(key).unwrap();
        assert!(member.as_creation().unwrap().ptr_eq(&target), "{} not unified", key);
    }
    assert_eq!(stale.bindings().nonce, 1);

    let last = h.ledger.last_txid();
    let payload = Payload::from_transaction(&h.ledger.tx(&last)).unwrap();
    assert!(payload.refs.contains(&target.bindings().location));
    assert!(!payload.refs.contains(&first_location));

    let refmap = h.kernel.last_commit().unwrap().refmap();
    assert_eq!(
        refmap.get(&target.bindings().origin),
        Some(&(target.bindings().location, 2))
    );
    assert!(refmap.values().all(|(loc, _)| loc != &first_location));
    h.kernel.verify(&last).await.unwrap();
}

#[tokio::test]
async fn test_forged_sparse_array_index_fails_to_decode() {
    let h = harness();
    history(&h).await;
    let txids = h.ledger.txids();

    for key in ["18446744073709551615", "4000000000"] {
        let mut tx = h.ledger.tx(&txids[2]);
        let mut payload = Payload::from_transaction(&tx).unwrap();
        payload.cmds = vec![Command {
            op: Op::Auth,
            data: json!({ "$arr": { key: 1 } }),
        }];
        let meta = tx
            .outputs
            .iter()
            .position(|o| o.script.starts_with(METADATA_PREFIX))
            .unwrap();
        tx.outputs[meta].script = payload.to_script().unwrap();
        let forged = h.ledger.insert(tx.clone());

        let err = h.kernel.replay(&forged, &tx).await.unwrap_err();
        assert!(matches!(err, KernelError::Codec(_)), "{}: {:?}", key, err);
    }
}
