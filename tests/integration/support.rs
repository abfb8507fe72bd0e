//! Shared test utilities for integration tests
//!
//! In-memory ledger, owner and purse collaborators, and a registry with the
//! classes the scenarios deploy.

use async_trait::async_trait;
use creation_kernel::cache::MemoryCache;
use creation_kernel::config::KernelConfig;
use creation_kernel::creation::code::PLUCK;
use creation_kernel::interfaces::{Cache, Ledger, Owner, Purse, Transaction, TxInput, TxOutput};
use creation_kernel::membrane::AccessControlled;
use creation_kernel::{CodeDefinition, Creation, Kernel, KernelError, ObjectRef, Props, Registry, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const COUNTER_SRC: &str = "class Counter extends Jig { inc() { this.count += 1 } }";
pub const PLAIN_SRC: &str = "class Plain { static version() { return 1 } }";
pub const PLAIN_V2_SRC: &str = "class Plain { static version() { return 2 } }";
pub const PARENT_SRC: &str = "class Parent extends Jig {}";
pub const CHILD_SRC: &str = "class Child extends Parent {}";
pub const TAG_SRC: &str = "class Tag extends Berry { static pluck(path) { return { name: path } } }";

pub const OWNER: &str = "alice";

/// Ledger keeping every broadcast transaction in memory.
#[derive(Default)]
pub struct MockLedger {
    txs: Mutex<HashMap<String, Transaction>>,
    order: Mutex<Vec<String>>,
    spent: Mutex<HashMap<(String, u32), String>>,
    reject: AtomicBool,
}

impl MockLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every following broadcast fail.
    pub fn reject_broadcasts(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// Txids in broadcast order.
    pub fn txids(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }

    pub fn last_txid(&self) -> String {
        self.txids().last().cloned().expect("no transaction broadcast")
    }

    pub fn tx(&self, txid: &str) -> Transaction {
        self.txs.lock().unwrap()[txid].clone()
    }

    /// Store a transaction without broadcasting it.
    pub fn insert(&self, tx: Transaction) -> String {
        let txid = tx.txid().unwrap();
        self.txs.lock().unwrap().insert(txid.clone(), tx);
        txid
    }
}

#[async_trait]
impl Ledger for MockLedger {
    async fn fetch(&self, txid: &str) -> Result<Transaction, KernelError> {
        self.txs
            .lock()
            .unwrap()
            .get(txid)
            .cloned()
            .ok_or_else(|| KernelError::Argument(format!("Unknown transaction {}", txid)))
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<String, KernelError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(KernelError::Publish("broadcast rejected".to_string()));
        }
        let txid = tx.txid()?;
        let mut spent = self.spent.lock().unwrap();
        for input in &tx.inputs {
            spent.insert((input.txid.clone(), input.vout), txid.clone());
        }
        self.txs.lock().unwrap().insert(txid.clone(), tx.clone());
        self.order.lock().unwrap().push(txid.clone());
        Ok(txid)
    }

    async fn spends(&self, txid: &str, vout: u32) -> Result<Option<String>, KernelError> {
        Ok(self
            .spent
            .lock()
            .unwrap()
            .get(&(txid.to_string(), vout))
            .cloned())
    }
}

/// Owner that locks new creations to one address and signs every input it is shown.
pub struct MockOwner;

#[async_trait]
impl Owner for MockOwner {
    async fn owner(&self) -> Result<Value, KernelError> {
        Ok(Value::from(OWNER))
    }

    async fn sign(
        &self,
        mut tx: Transaction,
        parents: &[TxOutput],
        _locks: &[Value],
    ) -> Result<Transaction, KernelError> {
        for (input, parent) in tx.inputs.iter_mut().zip(parents) {
            input.unlock = Some(format!("sig({})", parent.script));
        }
        Ok(tx)
    }
}

/// Purse that adds one funding input and a change output.
#[derive(Default)]
pub struct MockPurse {
    fail: AtomicBool,
    funded: Mutex<usize>,
}

impl MockPurse {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_payments(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Purse for MockPurse {
    async fn pay(&self, mut tx: Transaction, _parents: &[TxOutput]) -> Result<Transaction, KernelError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(KernelError::Publish("insufficient funds".to_string()));
        }
        let mut funded = self.funded.lock().unwrap();
        *funded += 1;
        tx.inputs.push(TxInput {
            txid: format!("{:064x}", *funded),
            vout: 0,
            unlock: None,
        });
        tx.outputs.push(TxOutput {
            script: "p2pkh:purse".to_string(),
            satoshis: 1000,
        });
        Ok(tx)
    }
}

fn number(value: Value) -> f64 {
    value.as_number().unwrap_or(0.0)
}

fn first_creation(args: Vec<Value>) -> Result<Creation, KernelError> {
    args.into_iter()
        .next()
        .and_then(|v| v.as_creation().cloned())
        .ok_or_else(|| KernelError::Argument("expected a creation".to_string()))
}

/// Registry holding every class the scenarios use.
pub fn registry() -> Arc<Registry> {
    let registry = Registry::new();
    registry.install(
        CodeDefinition::builder("Counter", COUNTER_SRC)
            .parent("Jig")
            .method("init", |ctx, _| {
                ctx.set_own("count", 0i64)?;
                Ok(Value::Undefined)
            })
            .method("inc", |ctx, _| {
                let count = number(ctx.get_own("count")?) + 1.0;
                ctx.set_own("count", count)?;
                Ok(Value::from(count))
            })
            .method("fail", |ctx, _| {
                ctx.set_own("count", 99i64)?;
                Err(KernelError::Execution("boom".to_string()))
            })
            .method("hold", |ctx, args| {
                let value = args.into_iter().next().unwrap_or(Value::Undefined);
                ctx.set_own("held", value)?;
                Ok(Value::Undefined)
            })
            .method("send", |ctx, args| {
                let to = args.into_iter().next().unwrap_or(Value::Undefined);
                ctx.set_own("owner", to)?;
                Ok(Value::Undefined)
            })
            .method("spawn", |ctx, _| {
                let class = ctx
                    .this()
                    .class()
                    .ok_or_else(|| KernelError::Execution("no class".to_string()))?;
                let child = ctx.instantiate(&class, vec![])?;
                Ok(Value::Creation(child))
            })
            .method("kill", |ctx, args| {
                let victim = first_creation(args)?;
                ctx.kernel().destroy(&victim)?;
                Ok(Value::Undefined)
            })
            .method("vouch", |ctx, args| {
                let other = first_creation(args)?;
                ctx.kernel().auth(&other)?;
                Ok(Value::Undefined)
            })
            .method("retire", |ctx, _| {
                ctx.kernel().destroy(ctx.this())?;
                Ok(Value::Undefined)
            })
            .method("_secret", |_, _| Ok(Value::from(42i64)))
            .build(),
    );
    registry.install(
        CodeDefinition::builder("Plain", PLAIN_SRC)
            .function("version", |_, _| Ok(Value::from(1i64)))
            .build(),
    );
    registry.install(
        CodeDefinition::builder("Plain", PLAIN_V2_SRC)
            .function("version", |_, _| Ok(Value::from(2i64)))
            .build(),
    );
    registry.install(CodeDefinition::builder("Parent", PARENT_SRC).parent("Jig").build());
    registry.install(CodeDefinition::builder("Child", CHILD_SRC).parent("Parent").build());
    registry.install(
        CodeDefinition::builder("Tag", TAG_SRC)
            .parent("Berry")
            .function(PLUCK, |_, args| {
                let path = args
                    .first()
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let mut props = Props::new();
                props.insert("name".to_string(), Value::from(path));
                Ok(Value::Object(ObjectRef::plain(props)))
            })
            .build(),
    );
    Arc::new(registry)
}

pub fn trusting_config() -> KernelConfig {
    KernelConfig {
        trust: vec!["*".to_string()],
        ..KernelConfig::default()
    }
}

pub fn kernel_with(ledger: Arc<MockLedger>, config: KernelConfig, cache: Arc<dyn Cache>) -> Kernel {
    Kernel::builder()
        .config(config)
        .registry(registry())
        .ledger(ledger)
        .owner(Arc::new(MockOwner))
        .purse(MockPurse::new())
        .cache(cache)
        .build()
        .unwrap()
}

pub struct Harness {
    pub kernel: Kernel,
    pub ledger: Arc<MockLedger>,
    pub purse: Arc<MockPurse>,
    pub cache: Arc<MemoryCache>,
}

pub fn harness() -> Harness {
    let ledger = MockLedger::new();
    let purse = MockPurse::new();
    let cache = Arc::new(MemoryCache::new());
    let kernel = Kernel::builder()
        .config(trusting_config())
        .registry(registry())
        .ledger(ledger.clone())
        .owner(Arc::new(MockOwner))
        .purse(purse.clone())
        .cache(cache.clone())
        .build()
        .unwrap();
    Harness {
        kernel,
        ledger,
        purse,
        cache,
    }
}

/// Read a member through the membrane, as top-level code would.
pub fn get(kernel: &Kernel, target: &Creation, key: &str) -> Value {
    kernel.membrane().get(target, key).unwrap()
}

pub fn props(entries: Vec<(&str, Value)>) -> Props {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

pub fn object(entries: Vec<(&str, Value)>) -> Value {
    Value::Object(ObjectRef::plain(props(entries)))
}
