//! Kernel
//!
//! The explicit runtime context. A kernel owns the code registry, the collaborators,
//! the call stack, the open record and the commit graph, and exposes the top-level
//! operations: deploy, upgrade, instantiate, call, destroy, auth, and `sync` to
//! publish everything recorded so far.

use crate::action::Action;
use crate::cache::{MemoryCache, SledCache};
use crate::codec::{clone_value, creations_in, Cloner};
use crate::commit::{Commit, CommitGraph};
use crate::config::KernelConfig;
use crate::creation::code::{INIT, PLUCK};
use crate::creation::registry::normalize;
use crate::creation::{
    is_binding, Bindings, CodeHandle, Creation, CreationKind, Method, OwnerSource, Registry,
};
use crate::error::KernelError;
use crate::interfaces::{Cache, Ledger, Owner, Purse, Sandbox};
use crate::location::Location;
use crate::membrane::{CallContext, CallStack, Membrane};
use crate::record::Record;
use crate::unify::{unify, Worldview};
use crate::value::{ObjectData, Props, Value};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Kernel {
    config: KernelConfig,
    registry: Arc<Registry>,
    pub(crate) sandbox: Arc<dyn Sandbox>,
    pub(crate) ledger: Arc<dyn Ledger>,
    pub(crate) owner: Arc<dyn Owner>,
    pub(crate) purse: Arc<dyn Purse>,
    pub(crate) cache: Arc<dyn Cache>,
    pub(crate) stack: CallStack,
    record: Mutex<Option<Record>>,
    pub(crate) commits: CommitGraph,
    last_commit: Mutex<Option<Arc<Commit>>>,
    /// Creations hydrated or imported by this kernel, by location.
    pub(crate) memo: Mutex<HashMap<String, Creation>>,
    berry_depth: AtomicUsize,
    next_record_id: AtomicU64,
}

/// Builder for [`Kernel`]. Ledger, owner and purse are required.
#[derive(Default)]
pub struct KernelBuilder {
    config: Option<KernelConfig>,
    registry: Option<Arc<Registry>>,
    sandbox: Option<Arc<dyn Sandbox>>,
    ledger: Option<Arc<dyn Ledger>>,
    owner: Option<Arc<dyn Owner>>,
    purse: Option<Arc<dyn Purse>>,
    cache: Option<Arc<dyn Cache>>,
}

impl KernelBuilder {
    pub fn config(mut self, config: KernelConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Evaluator for source text. Defaults to the registry.
    pub fn sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn owner(mut self, owner: Arc<dyn Owner>) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn purse(mut self, purse: Arc<dyn Purse>) -> Self {
        self.purse = Some(purse);
        self
    }

    /// State cache. Defaults to a sled cache at `cache.path`, or memory.
    pub fn cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> Result<Kernel, KernelError> {
        let config = self.config.unwrap_or_default();
        config.validate().map_err(|errors| {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            KernelError::Config(messages.join("; "))
        })?;
        let required = |name: &str| KernelError::Config(format!("Kernel requires a {}", name));
        let ledger = self.ledger.ok_or_else(|| required("ledger"))?;
        let owner = self.owner.ok_or_else(|| required("owner"))?;
        let purse = self.purse.ok_or_else(|| required("purse"))?;
        let registry = self.registry.unwrap_or_default();
        let sandbox = self
            .sandbox
            .unwrap_or_else(|| registry.clone() as Arc<dyn Sandbox>);
        let cache: Arc<dyn Cache> = match (self.cache, &config.cache.path) {
            (Some(cache), _) => cache,
            (None, Some(path)) => Arc::new(SledCache::new(path)?),
            (None, None) => Arc::new(MemoryCache::new()),
        };
        info!(network = %config.network, unification = ?config.unification, "Kernel created");
        Ok(Kernel {
            config,
            registry,
            sandbox,
            ledger,
            owner,
            purse,
            cache,
            stack: CallStack::new(),
            record: Mutex::new(None),
            commits: CommitGraph::new(),
            last_commit: Mutex::new(None),
            memo: Mutex::new(HashMap::new()),
            berry_depth: AtomicUsize::new(0),
            next_record_id: AtomicU64::new(1),
        })
    }
}

impl Kernel {
    pub fn builder() -> KernelBuilder {
        KernelBuilder::default()
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    pub fn membrane(&self) -> Membrane<'_> {
        Membrane::new(self)
    }

    /// Built-in code by name (`Jig`, `Berry`).
    pub fn native(&self, name: &str) -> Option<Creation> {
        self.registry.native(name)
    }

    /// Most recently created commit, published or not.
    pub fn last_commit(&self) -> Option<Arc<Commit>> {
        self.last_commit.lock().clone()
    }

    pub fn commit(&self, id: u64) -> Option<Arc<Commit>> {
        self.commits.get(id)
    }

    /// Number of commits not yet published or failed.
    pub fn pending_commits(&self) -> usize {
        self.commits.len()
    }

    pub(crate) fn in_berry_context(&self) -> bool {
        self.berry_depth.load(Ordering::SeqCst) > 0
    }

    /// Run `f` against the open record.
    pub(crate) fn with_record<T, F>(&self, f: F) -> Result<T, KernelError>
    where
        F: FnOnce(&mut Record) -> Result<T, KernelError>,
    {
        if self.in_berry_context() {
            return Err(KernelError::State(
                "Cannot record changes while plucking a berry".to_string(),
            ));
        }
        let mut slot = self.record.lock();
        match slot.as_mut() {
            Some(record) => f(record),
            None => Err(KernelError::State("No open transaction".to_string())),
        }
    }

    /// Mark the open record as failed; its outermost action will roll back.
    fn poison(&self, err: &KernelError) {
        if let Some(record) = self.record.lock().as_mut() {
            record.fail(err.clone());
        }
    }

    fn begin(&self) {
        let mut slot = self.record.lock();
        match slot.as_mut() {
            Some(record) => record.nested += 1,
            None => {
                let id = self.next_record_id.fetch_add(1, Ordering::Relaxed);
                let mut record = Record::new(id, false);
                record.nested = 1;
                debug!(record_id = id, "Record opened");
                *slot = Some(record);
            }
        }
    }

    fn end(&self) -> Result<Option<Arc<Commit>>, KernelError> {
        let finished = {
            let mut slot = self.record.lock();
            let Some(record) = slot.as_mut() else {
                return Err(KernelError::State("No open transaction".to_string()));
            };
            record.nested -= 1;
            if record.nested > 0 {
                return Ok(None);
            }
            slot.take()
        };
        let Some(mut record) = finished else {
            return Ok(None);
        };
        if let Some(err) = record.failure().cloned() {
            record.rollback(&err);
            return Err(err);
        }
        if record.is_empty() {
            return Ok(None);
        }
        match self.commits.create(&record) {
            Ok(commit) => {
                *self.last_commit.lock() = Some(commit.clone());
                Ok(Some(commit))
            }
            Err(err) => {
                record.rollback(&err);
                Err(err)
            }
        }
    }

    fn abort(&self, err: &KernelError) {
        let finished = {
            let mut slot = self.record.lock();
            let Some(record) = slot.as_mut() else { return };
            record.fail(err.clone());
            record.nested -= 1;
            if record.nested > 0 {
                return;
            }
            slot.take()
        };
        if let Some(mut record) = finished {
            record.rollback(err);
        }
    }

    /// Bracket `f` as one action group. Groups nest; the outermost one commits or rolls back.
    fn run_action<T, F>(&self, f: F) -> Result<T, KernelError>
    where
        F: FnOnce() -> Result<T, KernelError>,
    {
        self.begin();
        match f() {
            Ok(value) => {
                self.end()?;
                Ok(value)
            }
            Err(err) => {
                self.abort(&err);
                Err(err)
            }
        }
    }

    /// Open a record for replaying a payload. Actions nest inside it.
    pub(crate) fn begin_replay(&self) -> Result<u64, KernelError> {
        let mut slot = self.record.lock();
        if slot.is_some() {
            return Err(KernelError::State(
                "Cannot replay inside an open transaction".to_string(),
            ));
        }
        let id = self.next_record_id.fetch_add(1, Ordering::Relaxed);
        let mut record = Record::new(id, true);
        record.nested = 1;
        *slot = Some(record);
        Ok(id)
    }

    pub(crate) fn finish_replay(&self) -> Result<Record, KernelError> {
        let mut record = self
            .record
            .lock()
            .take()
            .ok_or_else(|| KernelError::State("No replay in progress".to_string()))?;
        if let Some(err) = record.failure().cloned() {
            record.rollback(&err);
            return Err(err);
        }
        Ok(record)
    }

    pub(crate) fn abort_replay(&self, err: &KernelError) {
        let taken = self.record.lock().take();
        if let Some(mut record) = taken {
            record.rollback(err);
        }
    }

    fn require_top_level(&self, what: &str) -> Result<(), KernelError> {
        if self.stack.is_empty() {
            Ok(())
        } else {
            Err(KernelError::State(format!("Cannot {} inside a method", what)))
        }
    }

    /// Unify `roots` for a top-level operation.
    fn worldview(&self, roots: &[Value]) -> Result<Worldview, KernelError> {
        unify(roots, &[], self.config.unification)
    }

    /// Group several top-level operations into one transaction.
    pub fn transaction<T, F>(&self, f: F) -> Result<T, KernelError>
    where
        F: FnOnce(&Kernel) -> Result<T, KernelError>,
    {
        self.require_top_level("open a transaction")?;
        self.run_action(|| f(self))
    }

    /// Deploy one piece of code.
    pub fn deploy(&self, src: &str, props: Props) -> Result<Creation, KernelError> {
        self.deploy_many(vec![(src.to_string(), props)])?
            .into_iter()
            .next()
            .ok_or_else(|| KernelError::State("Deploy produced no code".to_string()))
    }

    /// Deploy several pieces of code in one action; their props may reference each other.
    pub fn deploy_many(&self, entries: Vec<(String, Props)>) -> Result<Vec<Creation>, KernelError> {
        self.require_top_level("deploy code")?;
        if entries.is_empty() {
            return Err(KernelError::Argument("Nothing to deploy".to_string()));
        }
        self.run_action(|| {
            let roots: Vec<Value> = entries
                .iter()
                .flat_map(|(_, props)| props.values().cloned())
                .collect();
            let worldview = self.worldview(&roots)?;

            let mut codes = Vec::with_capacity(entries.len());
            let mut recorded = Vec::with_capacity(entries.len());
            for (src, props) in &entries {
                validate_code_props(props)?;
                let src = normalize(src);
                let def = self.sandbox.evaluate(&src)?;
                let props: Props = props
                    .iter()
                    .map(|(k, v)| (k.clone(), worldview.resolve_value(v)))
                    .collect();
                let state = Cloner::default().clone_props(&props);
                let code = Creation::new(
                    CreationKind::Code(CodeHandle::new(def)),
                    Bindings::undeployed(OwnerSource::Pending),
                    state,
                );
                self.with_record(|record| record.create(&code))?;
                debug!(code = %code.display_name(), "Deploying code");
                codes.push(code);
                recorded.push((src, Cloner::default().clone_props(&props)));
            }
            for code in &codes {
                let contained = creations_in(&code.references());
                self.with_record(|record| {
                    for c in &contained {
                        record.read(c)?;
                    }
                    Ok(())
                })?;
                self.check_parent(code, &codes)?;
            }
            self.with_record(|record| {
                record.finish_action(Action::Deploy {
                    codes: codes.clone(),
                    entries: recorded,
                })
            })?;
            Ok(codes)
        })
    }

    /// Replace the definition and props of deployed code.
    pub fn upgrade(&self, code: &Creation, src: &str, props: Props) -> Result<(), KernelError> {
        self.require_top_level("upgrade code")?;
        self.run_action(|| {
            let mut roots = vec![Value::Creation(code.clone())];
            roots.extend(props.values().cloned());
            let worldview = self.worldview(&roots)?;
            let code = worldview.resolve(code);
            let CreationKind::Code(handle) = code.kind() else {
                return Err(KernelError::Argument(format!(
                    "Cannot upgrade {}: not code",
                    code.display_name()
                )));
            };
            if matches!(code.read().props.get("upgradable"), Some(Value::Bool(false))) {
                return Err(KernelError::State(format!(
                    "{} is not upgradable",
                    code.display_name()
                )));
            }
            validate_code_props(&props)?;
            let src = normalize(src);
            let def = self.sandbox.evaluate(&src)?;
            self.with_record(|record| record.update(&code))?;

            let props: Props = props
                .iter()
                .map(|(k, v)| (k.clone(), worldview.resolve_value(v)))
                .collect();
            handle.swap(def);
            code.write().props = Cloner::default().clone_props(&props);

            let contained = creations_in(&code.references());
            self.with_record(|record| {
                for c in &contained {
                    record.read(c)?;
                }
                Ok(())
            })?;
            self.check_parent(&code, std::slice::from_ref(&code))?;
            info!(code = %code.display_name(), "Upgraded code");
            self.with_record(|record| {
                record.finish_action(Action::Upgrade {
                    code: code.clone(),
                    src,
                    props: Cloner::default().clone_props(&props),
                })
            })
        })
    }

    /// Create an instance of `class`, running its `init` method with `args`.
    pub fn instantiate(&self, class: &Creation, args: Vec<Value>) -> Result<Creation, KernelError> {
        if let Some(frame) = self.stack.top() {
            return self.instantiate_inner(&frame.this, class, args);
        }
        self.run_action(|| {
            let mut roots = vec![Value::Creation(class.clone())];
            roots.extend(args.iter().cloned());
            let worldview = self.worldview(&roots)?;
            let class = worldview.resolve(class);
            let args: Vec<Value> = args
                .iter()
                .map(|a| clone_value(&worldview.resolve_value(a)))
                .collect();
            let contained = creations_in(&args);
            self.with_record(|record| {
                for c in &contained {
                    record.read(c)?;
                }
                Ok(())
            })?;
            let instance = self.construct(&class, args.iter().map(clone_value).collect(), OwnerSource::Pending)?;
            self.with_record(|record| record.finish_action(Action::New { class, args }))?;
            Ok(instance)
        })
    }

    pub(crate) fn instantiate_inner(
        &self,
        creator: &Creation,
        class: &Creation,
        args: Vec<Value>,
    ) -> Result<Creation, KernelError> {
        let args: Vec<Value> = args.iter().map(clone_value).collect();
        self.construct(class, args, OwnerSource::Inherit(creator.clone()))
            .inspect_err(|err| self.poison(err))
    }

    fn construct(
        &self,
        class: &Creation,
        args: Vec<Value>,
        owner: OwnerSource,
    ) -> Result<Creation, KernelError> {
        let def = class.code().ok_or_else(|| {
            KernelError::Argument(format!("Cannot instantiate {}: not a class", class.display_name()))
        })?;
        if class.is_native() {
            return Err(KernelError::State(format!(
                "Cannot instantiate native {}",
                def.name
            )));
        }
        if def.is_berry_class() {
            return Err(KernelError::State(format!(
                "Berry class {} must be plucked",
                def.name
            )));
        }
        self.with_record(|record| record.read(class))?;
        let instance = Creation::new(
            CreationKind::Instance {
                class: class.clone(),
            },
            Bindings::undeployed(owner),
            Props::new(),
        );
        self.with_record(|record| record.create(&instance))?;
        if self.lookup_method(&instance, INIT)?.is_some() {
            self.execute(&instance, INIT, args)?;
        }
        debug!(instance = %instance.display_name(), "Instantiated");
        Ok(instance)
    }

    /// Call `method` on `target` as a top-level action; `target` is spent.
    pub fn call(&self, target: &Creation, method: &str, args: Vec<Value>) -> Result<Value, KernelError> {
        if !self.stack.is_empty() {
            return self.call_inner(target, method, args);
        }
        self.run_action(|| {
            let mut roots = vec![Value::Creation(target.clone())];
            roots.extend(args.iter().cloned());
            let worldview = self.worldview(&roots)?;
            let target = worldview.resolve(target);
            let args: Vec<Value> = args
                .iter()
                .map(|a| clone_value(&worldview.resolve_value(a)))
                .collect();
            let contained = creations_in(&args);
            self.with_record(|record| {
                record.update(&target)?;
                for c in &contained {
                    record.read(c)?;
                }
                Ok(())
            })?;
            let result = self.execute(&target, method, args.iter().map(clone_value).collect())?;
            self.with_record(|record| {
                record.finish_action(Action::Call {
                    target: target.clone(),
                    method: method.to_string(),
                    args,
                })
            })?;
            Ok(clone_value(&result))
        })
    }

    /// Call from inside another creation's method; `target` is read, not spent.
    pub(crate) fn call_inner(
        &self,
        target: &Creation,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, KernelError> {
        let args: Vec<Value> = args.iter().map(clone_value).collect();
        let result = if self.in_berry_context() {
            self.execute(target, method, args)
        } else {
            self.with_record(|record| record.read(target))
                .and_then(|_| self.execute(target, method, args))
        };
        match result {
            Ok(value) => Ok(clone_value(&value)),
            Err(err) => {
                self.poison(&err);
                Err(err)
            }
        }
    }

    /// Destroy `target` as a top-level action.
    pub fn destroy(&self, target: &Creation) -> Result<(), KernelError> {
        if self.stack.top().is_some() {
            self.check_own_frame(target, "destroy")?;
            return self.destroy_inner(target);
        }
        self.run_action(|| {
            let target = self
                .worldview(&[Value::Creation(target.clone())])?
                .resolve(target);
            self.with_record(|record| {
                record.delete(&target)?;
                record.finish_action(Action::Destroy { target: target.clone() })
            })
        })
    }

    pub(crate) fn destroy_inner(&self, this: &Creation) -> Result<(), KernelError> {
        let callers = self.stack.creations();
        self.with_record(|record| {
            record.delete(this)?;
            for caller in callers.iter().filter(|c| !c.ptr_eq(this)) {
                record.queue_auth(caller);
            }
            Ok(())
        })
        .inspect_err(|err| self.poison(err))
    }

    /// Require `target`'s owner to sign without changing it.
    pub fn auth(&self, target: &Creation) -> Result<(), KernelError> {
        if self.stack.top().is_some() {
            self.check_own_frame(target, "auth")?;
            return self.auth_inner(target);
        }
        self.run_action(|| {
            let target = self
                .worldview(&[Value::Creation(target.clone())])?
                .resolve(target);
            self.with_record(|record| {
                record.auth(&target)?;
                record.finish_action(Action::Auth { target: target.clone() })
            })
        })
    }

    pub(crate) fn auth_inner(&self, this: &Creation) -> Result<(), KernelError> {
        let callers = self.stack.creations();
        self.with_record(|record| {
            record.auth(this)?;
            for caller in callers.iter().filter(|c| !c.ptr_eq(this)) {
                record.queue_auth(caller);
            }
            Ok(())
        })
        .inspect_err(|err| self.poison(err))
    }

    /// Inside a method only the running creation may destroy or auth itself.
    fn check_own_frame(&self, target: &Creation, action: &str) -> Result<(), KernelError> {
        match self.stack.top() {
            Some(frame) if frame.this.ptr_eq(target) => Ok(()),
            _ => {
                let err = KernelError::State(format!(
                    "Cannot {} {} outside of its own methods",
                    action,
                    target.display_name()
                ));
                self.poison(&err);
                Err(err)
            }
        }
    }

    /// Run a method body with a frame pushed for `target`.
    pub(crate) fn execute(
        &self,
        target: &Creation,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, KernelError> {
        let body = self.lookup_method(target, method)?.ok_or_else(|| {
            KernelError::Execution(format!("{} has no method {}", target.display_name(), method))
        })?;
        if method.starts_with('_') {
            let allowed = matches!(
                self.stack.top(),
                Some(frame) if frame.this.method_owner().ptr_eq(&target.method_owner())
            );
            if !allowed {
                return Err(KernelError::State(format!(
                    "Cannot call private method {} of {}",
                    method,
                    target.display_name()
                )));
            }
        }
        self.stack.push(target, method);
        let result = body(&CallContext::new(self, target), args);
        self.stack.pop();
        result
    }

    /// Find a method through the class chain. Code targets resolve static functions.
    fn lookup_method(&self, target: &Creation, method: &str) -> Result<Option<Method>, KernelError> {
        let (mut code, statics) = match target.kind() {
            CreationKind::Code(_) => (target.clone(), true),
            CreationKind::Instance { class } => (class, false),
            CreationKind::Berry { .. } => {
                return Err(KernelError::State(format!(
                    "Cannot call {} on berry {}",
                    method,
                    target.display_name()
                )))
            }
        };
        let mut visited = HashSet::new();
        while visited.insert(code.id()) {
            let Some(def) = code.code() else { break };
            let table = if statics { &def.functions } else { &def.methods };
            if let Some(body) = table.get(method) {
                return Ok(Some(body.clone()));
            }
            match self.parent_of(&code)? {
                Some(parent) => code = parent,
                None => break,
            }
        }
        Ok(None)
    }

    /// Parent class of `code`, resolved through its `deps`, then the natives.
    pub(crate) fn parent_of(&self, code: &Creation) -> Result<Option<Creation>, KernelError> {
        let Some(def) = code.code() else { return Ok(None) };
        let Some(name) = def.parent.as_deref() else { return Ok(None) };
        let dep = code
            .read()
            .props
            .get("deps")
            .and_then(|deps| deps.as_object().and_then(|o| o.get(name)));
        match dep {
            Some(Value::Creation(parent)) => Ok(Some(parent)),
            _ => self.registry.native(name).map(Some).ok_or_else(|| {
                KernelError::State(format!(
                    "Parent {} of {} is not in its deps",
                    name, def.name
                ))
            }),
        }
    }

    /// Apply the parent's seal: read, auth, or refuse.
    fn check_parent(&self, code: &Creation, batch: &[Creation]) -> Result<(), KernelError> {
        let Some(parent) = self.parent_of(code)? else { return Ok(()) };
        if parent.is_native() || batch.iter().any(|c| c.ptr_eq(&parent)) {
            return self.with_record(|record| record.read(&parent));
        }
        let sealed = parent.read().props.get("sealed").cloned();
        match sealed {
            Some(Value::Bool(true)) => Err(KernelError::State(format!(
                "{} is sealed",
                parent.display_name()
            ))),
            Some(Value::Bool(false)) => self.with_record(|record| record.read(&parent)),
            _ => self.with_record(|record| record.auth(&parent)),
        }
    }

    /// Derive the berry at `path` from a berry class.
    pub(crate) fn pluck(&self, class: &Creation, path: &str) -> Result<Creation, KernelError> {
        let def = class.code().ok_or_else(|| {
            KernelError::Argument(format!("{} is not a berry class", class.display_name()))
        })?;
        let body = def.functions.get(PLUCK).cloned().ok_or_else(|| {
            KernelError::State(format!("{} is not a berry class", def.name))
        })?;
        let class_location = Location::parse(&class.raw_location())?;
        let location = Location::Berry {
            class: Box::new(class_location),
            path: path.to_string(),
        }
        .to_string();

        self.berry_depth.fetch_add(1, Ordering::SeqCst);
        self.stack.push(class, PLUCK);
        let result = body(&CallContext::new(self, class), vec![Value::from(path)]);
        self.stack.pop();
        self.berry_depth.fetch_sub(1, Ordering::SeqCst);

        let value = result?;
        let props = plain_props(&value).ok_or_else(|| {
            KernelError::Execution(format!(
                "pluck of {} returned {}, not an object",
                def.name,
                value.type_name()
            ))
        })?;
        if props.keys().any(|k| is_binding(k)) {
            return Err(KernelError::Execution(format!(
                "pluck of {} returned reserved properties",
                def.name
            )));
        }
        debug!(location = %location, "Plucked berry");
        Ok(Creation::new(
            CreationKind::Berry {
                class: class.clone(),
                path: path.to_string(),
            },
            Bindings::fixed(&location),
            props,
        ))
    }

    /// Publish every ready commit, repeating until none are left.
    ///
    /// Returns the first publish failure; every failed commit has been rolled back.
    pub async fn sync(&self) -> Result<(), KernelError> {
        let mut first_error = None;
        loop {
            let ready = self.commits.take_ready();
            if ready.is_empty() {
                break;
            }
            let results = join_all(ready.into_iter().map(|commit| self.publish(commit))).await;
            for result in results {
                if let Err(err) = result {
                    first_error.get_or_insert(err);
                }
            }
        }
        if !self.commits.is_empty() {
            warn!(pending = self.commits.len(), "Commits left unpublished after sync");
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Deep copy of a plain object's properties.
fn plain_props(value: &Value) -> Option<Props> {
    let props = match &*value.as_object()?.lock() {
        ObjectData::Plain(props) => props.clone(),
        _ => return None,
    };
    Some(Cloner::default().clone_props(&props))
}

fn validate_code_props(props: &Props) -> Result<(), KernelError> {
    if let Some(key) = props.keys().find(|k| is_binding(k)) {
        return Err(KernelError::Argument(format!(
            "Cannot set {} on code",
            key
        )));
    }
    match props.get("sealed") {
        None | Some(Value::Bool(_)) => {}
        Some(Value::String(s)) if s == "owner" => {}
        Some(other) => {
            return Err(KernelError::Argument(format!(
                "Invalid sealed option: {}",
                other.type_name()
            )))
        }
    }
    match props.get("upgradable") {
        None | Some(Value::Bool(_)) => {}
        Some(other) => {
            return Err(KernelError::Argument(format!(
                "Invalid upgradable option: {}",
                other.type_name()
            )))
        }
    }
    match props.get("deps") {
        None => Ok(()),
        Some(Value::Object(o)) if matches!(&*o.lock(), ObjectData::Plain(_)) => Ok(()),
        Some(_) => Err(KernelError::Argument("deps must be an object".to_string())),
    }
}
