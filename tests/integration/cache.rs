//! Sled-backed state cache shared between kernels

use super::support::*;
use creation_kernel::cache::{state_key, SledCache, REFMAP_PREFIX, STATE_PREFIX};
use creation_kernel::config::{CacheConfig, KernelConfig};
use creation_kernel::interfaces::Cache;
use creation_kernel::{Kernel, Props, Value};
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn test_second_kernel_hydrates_from_shared_cache() {
    let temp_dir = TempDir::new().unwrap();
    let cache = Arc::new(SledCache::new(temp_dir.path().join("cache")).unwrap());

    let ledger = MockLedger::new();
    let first = kernel_with(ledger.clone(), trusting_config(), cache.clone());
    let class = first.deploy(COUNTER_SRC, Props::new()).unwrap();
    let counter = first.instantiate(&class, vec![]).unwrap();
    first.sync().await.unwrap();
    first.call(&counter, "inc", vec![]).unwrap();
    first.sync().await.unwrap();

    let keys = cache.list_keys(Some(STATE_PREFIX)).unwrap();
    for txid in ledger.txids() {
        assert!(keys.contains(&state_key(&format!("{}_o1", txid))));
    }
    assert_eq!(cache.list_keys(Some(REFMAP_PREFIX)).unwrap().len(), keys.len());

    // Nothing on this kernel's ledger: every state has to come from the cache.
    let second = kernel_with(MockLedger::new(), KernelConfig::default(), cache.clone());
    let copy = second.load(&counter.bindings().location).await.unwrap();
    assert!(!copy.ptr_eq(&counter));
    assert_eq!(copy.bindings(), counter.bindings());
    assert_eq!(get(&second, &copy, "count"), Value::from(1i64));

    let copied_class = copy.class().unwrap();
    assert_eq!(copied_class.bindings().location, class.bindings().location);
    assert_eq!(copied_class.code().unwrap().src, COUNTER_SRC);
}

#[tokio::test]
async fn test_missing_state_falls_back_to_ledger() {
    let temp_dir = TempDir::new().unwrap();
    let cache = Arc::new(SledCache::new(temp_dir.path().join("cache")).unwrap());
    let ledger = MockLedger::new();
    let first = kernel_with(ledger.clone(), trusting_config(), cache.clone());
    let code = first.deploy(PLAIN_SRC, Props::new()).unwrap();
    first.sync().await.unwrap();

    let empty = kernel_with(
        MockLedger::new(),
        trusting_config(),
        Arc::new(SledCache::new(temp_dir.path().join("other")).unwrap()),
    );
    assert!(empty.load(&code.bindings().location).await.is_err());

    let replaying = kernel_with(
        ledger.clone(),
        trusting_config(),
        Arc::new(SledCache::new(temp_dir.path().join("third")).unwrap()),
    );
    let copy = replaying.load(&code.bindings().location).await.unwrap();
    assert_eq!(copy.bindings(), code.bindings());
}

#[tokio::test]
async fn test_config_path_selects_sled_cache() {
    let temp_dir = TempDir::new().unwrap();
    let config = KernelConfig {
        cache: CacheConfig {
            path: Some(temp_dir.path().join("states")),
        },
        ..trusting_config()
    };
    let ledger = MockLedger::new();
    let kernel = Kernel::builder()
        .config(config)
        .registry(registry())
        .ledger(ledger.clone())
        .owner(Arc::new(MockOwner))
        .purse(MockPurse::new())
        .build()
        .unwrap();

    let code = kernel.deploy(PLAIN_SRC, Props::new()).unwrap();
    kernel.sync().await.unwrap();

    let state = kernel
        .cache()
        .get(&state_key(&code.bindings().location))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state["kind"], "code");
    assert_eq!(state["src"], PLAIN_SRC);
    assert!(temp_dir.path().join("states").exists());
}

#[tokio::test]
async fn test_uppercase_txid_loads_the_same_state() {
    let temp_dir = TempDir::new().unwrap();
    let cache = Arc::new(SledCache::new(temp_dir.path().join("cache")).unwrap());
    let ledger = MockLedger::new();
    let first = kernel_with(ledger.clone(), trusting_config(), cache.clone());
    let class = first.deploy(COUNTER_SRC, Props::new()).unwrap();
    let counter = first.instantiate(&class, vec![]).unwrap();
    first.sync().await.unwrap();

    let location = counter.bindings().location;
    let (txid, slot) = location.split_once('_').unwrap();
    let shouted = format!("{}_{}", txid.to_uppercase(), slot);

    let hydrating = kernel_with(MockLedger::new(), KernelConfig::default(), cache.clone());
    let copy = hydrating.load(&shouted).await.unwrap();
    assert_eq!(copy.bindings(), counter.bindings());

    let replaying = kernel_with(
        ledger.clone(),
        trusting_config(),
        Arc::new(SledCache::new(temp_dir.path().join("fresh")).unwrap()),
    );
    let copy = replaying.load(&shouted).await.unwrap();
    assert_eq!(copy.bindings().location, location);
}
