//! Commit
//!
//! A frozen transaction candidate built from one record. Commits form a dependency
//! graph: a commit that spends or reads a creation still owned by an unpublished
//! commit waits for it, and fails with it.

use crate::action::Action;
use crate::creation::{Creation, CreationSet, OwnerBinding, OwnerSource, SatoshiBinding};
use crate::error::KernelError;
use crate::location::{self, commit_location, published_location, Slot};
use crate::record::Record;
use crate::snapshot::{Snapshot, SnapshotMap};
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    Pending,
    Ready,
    Publishing,
    Published,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitEvent {
    Ready,
    Published { txid: String },
    Failed(KernelError),
}

type Observer = Box<dyn Fn(u64, &CommitEvent) + Send + Sync>;

/// Origin → (location, nonce) for every creation a commit's states can reach.
pub type RefMap = BTreeMap<String, (String, u64)>;

/// Final bindings of one creation, pushed to downstream commits on publish.
#[derive(Debug, Clone)]
pub struct Final {
    pub creation_id: u64,
    pub pending_location: String,
    pub location: String,
    pub origin: String,
    pub owner: Value,
    pub satoshis: u64,
}

struct CommitInner {
    state: CommitState,
    upstream: BTreeSet<u64>,
    downstream: BTreeSet<u64>,
    before: SnapshotMap,
    after: SnapshotMap,
    refmap: RefMap,
    txid: Option<String>,
    observers: Vec<Observer>,
    waiters: Vec<oneshot::Sender<Result<String, KernelError>>>,
}

pub struct Commit {
    pub id: u64,
    pub record_id: u64,
    pub replay: bool,
    pub actions: Vec<Action>,
    pub inputs: Vec<Creation>,
    pub outputs: Vec<Creation>,
    pub deletes: Vec<Creation>,
    pub refs: Vec<Creation>,
    pub creates: Vec<Creation>,
    inner: Mutex<CommitInner>,
}

impl Commit {
    /// Freeze `record` as commit `id`: order inputs and outputs, assign pending
    /// bindings and capture after-snapshots.
    pub fn build(record: &Record, id: u64) -> Result<Commit, KernelError> {
        let creates = &record.creates;
        let deletes = &record.deletes;

        let mut inputs = CreationSet::new();
        for c in record
            .updates
            .iter()
            .chain(record.auths.iter())
            .chain(record.deletes.iter())
        {
            if !creates.contains(c) {
                inputs.insert(c);
            }
        }
        let mut outputs = CreationSet::new();
        for c in inputs.iter().chain(creates.iter()) {
            if !deletes.contains(c) {
                outputs.insert(c);
            }
        }
        let mut refs = CreationSet::new();
        for c in record.reads.iter() {
            if !inputs.contains(c) && !creates.contains(c) && !deletes.contains(c) {
                refs.insert(c);
            }
        }

        for (i, c) in outputs.iter().enumerate() {
            let loc = commit_location(id, Slot::Output, i as u32 + 1);
            let mut state = c.write();
            if creates.contains(c) {
                state.bindings.origin = loc.clone();
            }
            state.bindings.location = loc;
            state.bindings.nonce += 1;
        }
        for (i, c) in deletes.iter().enumerate() {
            let loc = commit_location(id, Slot::Delete, i as u32);
            let mut state = c.write();
            if creates.contains(c) {
                state.bindings.origin = loc.clone();
            }
            state.bindings.location = loc;
            state.bindings.nonce += 1;
            state.bindings.owner = OwnerBinding::Bound(Value::Null);
            state.bindings.satoshis = SatoshiBinding::Bound(0);
        }

        let mut after = SnapshotMap::new();
        for c in outputs.iter().chain(deletes.iter()) {
            after.capture_once(c);
        }

        // Creations referenced from the new states must be resolvable by replay.
        let mut before = record.snapshots.clone();
        let mut implicit = Vec::new();
        for snapshot in after.iter() {
            let mut roots: Vec<Value> = snapshot.props.values().cloned().collect();
            if let Some(class) = snapshot.creation.class() {
                roots.push(Value::Creation(class));
            }
            for c in crate::codec::creations_in(&roots) {
                let known = inputs.contains(&c)
                    || outputs.contains(&c)
                    || deletes.contains(&c)
                    || refs.contains(&c);
                if !known {
                    implicit.push(c);
                }
            }
        }
        for c in implicit {
            let loc = c.raw_location();
            if location::is_error(&loc) || loc.starts_with("record://") {
                return Err(KernelError::State(format!(
                    "Cannot reference {}: {}",
                    c.display_name(),
                    loc
                )));
            }
            if refs.insert(&c) {
                before.insert(Snapshot::capture(&c));
            }
        }

        for c in refs.iter() {
            let loc = c.raw_location();
            if location::is_error(&loc) {
                return Err(KernelError::State(format!(
                    "Cannot reference {}: {}",
                    c.display_name(),
                    loc
                )));
            }
        }

        let mut upstream: BTreeSet<u64> = record.upstream.iter().copied().collect();
        for snapshot in before.iter() {
            if let Some(commit) = location::pending_commit(&snapshot.bindings.location) {
                if commit != id {
                    upstream.insert(commit);
                }
            }
        }

        Ok(Commit {
            id,
            record_id: record.id,
            replay: record.replay,
            actions: record.actions.clone(),
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            deletes: deletes.to_vec(),
            refs: refs.to_vec(),
            creates: creates.to_vec(),
            inner: Mutex::new(CommitInner {
                state: CommitState::Pending,
                upstream,
                downstream: BTreeSet::new(),
                before,
                after,
                refmap: RefMap::new(),
                txid: None,
                observers: Vec::new(),
                waiters: Vec::new(),
            }),
        })
    }

    pub fn state(&self) -> CommitState {
        self.inner.lock().state
    }

    pub fn txid(&self) -> Option<String> {
        self.inner.lock().txid.clone()
    }

    pub fn upstream(&self) -> Vec<u64> {
        self.inner.lock().upstream.iter().copied().collect()
    }

    pub fn downstream(&self) -> Vec<u64> {
        self.inner.lock().downstream.iter().copied().collect()
    }

    pub fn refmap(&self) -> RefMap {
        self.inner.lock().refmap.clone()
    }

    pub(crate) fn set_refmap(&self, refmap: RefMap) {
        self.inner.lock().refmap = refmap;
    }

    pub fn before(&self, creation: &Creation) -> Option<Snapshot> {
        self.inner.lock().before.get(creation).cloned()
    }

    pub fn after(&self, creation: &Creation) -> Option<Snapshot> {
        self.inner.lock().after.get(creation).cloned()
    }

    pub(crate) fn update_after<F>(&self, creation: &Creation, f: F)
    where
        F: FnOnce(&mut Snapshot),
    {
        if let Some(snapshot) = self.inner.lock().after.get_mut(creation) {
            f(snapshot);
        }
    }

    /// Pending location this commit assigned to an output or delete.
    pub fn pending_location(&self, creation: &Creation) -> Option<String> {
        if let Some(i) = self.outputs.iter().position(|c| c.ptr_eq(creation)) {
            return Some(commit_location(self.id, Slot::Output, i as u32 + 1));
        }
        self.deletes
            .iter()
            .position(|c| c.ptr_eq(creation))
            .map(|i| commit_location(self.id, Slot::Delete, i as u32))
    }

    pub fn is_created(&self, creation: &Creation) -> bool {
        self.creates.iter().any(|c| c.ptr_eq(creation))
    }

    pub fn on_ready<F>(&self, f: F)
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.observe(move |id, event| {
            if matches!(event, CommitEvent::Ready) {
                f(id)
            }
        });
    }

    pub fn on_published<F>(&self, f: F)
    where
        F: Fn(u64, &str) + Send + Sync + 'static,
    {
        self.observe(move |id, event| {
            if let CommitEvent::Published { txid } = event {
                f(id, txid)
            }
        });
    }

    pub fn on_failed<F>(&self, f: F)
    where
        F: Fn(u64, &KernelError) + Send + Sync + 'static,
    {
        self.observe(move |id, event| {
            if let CommitEvent::Failed(err) = event {
                f(id, err)
            }
        });
    }

    fn observe<F>(&self, f: F)
    where
        F: Fn(u64, &CommitEvent) + Send + Sync + 'static,
    {
        self.inner.lock().observers.push(Box::new(f));
    }

    /// Resolves with the txid once published, or the failure.
    pub fn completion(&self) -> oneshot::Receiver<Result<String, KernelError>> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        match inner.state {
            CommitState::Published => {
                let _ = tx.send(Ok(inner.txid.clone().unwrap_or_default()));
            }
            _ => inner.waiters.push(tx),
        }
        rx
    }

    fn notify(&self, event: CommitEvent) {
        // Observers run outside the lock so they may inspect the commit.
        let observers = std::mem::take(&mut self.inner.lock().observers);
        for observer in &observers {
            observer(self.id, &event);
        }
        let mut inner = self.inner.lock();
        let added = std::mem::replace(&mut inner.observers, observers);
        inner.observers.extend(added);
    }

    fn settle(&self, result: Result<String, KernelError>) {
        let waiters = std::mem::take(&mut self.inner.lock().waiters);
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    pub(crate) fn mark_ready(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != CommitState::Pending || !inner.upstream.is_empty() {
            return false;
        }
        inner.state = CommitState::Ready;
        drop(inner);
        debug!(commit_id = self.id, "Commit ready");
        self.notify(CommitEvent::Ready);
        true
    }

    pub(crate) fn begin_publishing(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != CommitState::Ready {
            return false;
        }
        inner.state = CommitState::Publishing;
        true
    }

    /// Pull final bindings of an upstream commit into this commit's snapshots.
    pub fn on_upstream_published(&self, upstream_id: u64, finals: &[Final]) {
        let mut inner = self.inner.lock();
        for f in finals {
            for snapshot in inner.before.values_mut() {
                if snapshot.creation.id() == f.creation_id {
                    apply_final(snapshot, f, true);
                }
            }
            for snapshot in inner.after.values_mut() {
                if snapshot.creation.id() == f.creation_id {
                    apply_final(snapshot, f, false);
                }
            }
        }
        inner.upstream.remove(&upstream_id);
        drop(inner);
        debug!(commit_id = self.id, upstream_id, "Upstream commit published");
        self.mark_ready();
    }

    /// Assign final `txid_oN`/`txid_dN` locations to outputs and deletes.
    ///
    /// Live creations are only updated while this commit still owns them; a later
    /// commit that spent them receives the finals through `on_upstream_published`.
    pub fn finalize(&self, txid: &str) -> Vec<Final> {
        let mut finals = Vec::with_capacity(self.outputs.len() + self.deletes.len());
        let slots = self
            .outputs
            .iter()
            .enumerate()
            .map(|(i, c)| (c, Slot::Output, i as u32 + 1))
            .chain(
                self.deletes
                    .iter()
                    .enumerate()
                    .map(|(i, c)| (c, Slot::Delete, i as u32)),
            );
        let mut inner = self.inner.lock();
        for (c, slot, index) in slots {
            let pending = commit_location(self.id, slot, index);
            let location = published_location(txid, slot, index);
            let Some(snapshot) = inner.after.get_mut(c) else { continue };
            if snapshot.bindings.origin == pending {
                snapshot.bindings.origin = location.clone();
            }
            snapshot.bindings.location = location.clone();
            let owner = match &snapshot.bindings.owner {
                OwnerBinding::Bound(v) => v.clone(),
                OwnerBinding::Unbound(OwnerSource::Assigned(v)) => v.clone(),
                OwnerBinding::Unbound(_) => Value::Null,
            };
            let satoshis = snapshot.bindings.satoshis.amount();
            snapshot.bindings.owner = OwnerBinding::Bound(owner.clone());
            snapshot.bindings.satoshis = SatoshiBinding::Bound(satoshis);
            let f = Final {
                creation_id: c.id(),
                pending_location: pending.clone(),
                location,
                origin: snapshot.bindings.origin.clone(),
                owner,
                satoshis,
            };

            let mut live = c.write();
            if live.bindings.location == pending {
                live.bindings.location = f.location.clone();
                live.bindings.origin = f.origin.clone();
                live.bindings.owner = OwnerBinding::Bound(f.owner.clone());
                live.bindings.satoshis = SatoshiBinding::Bound(f.satoshis);
            } else {
                if live.bindings.origin == pending {
                    live.bindings.origin = f.origin.clone();
                }
                if matches!(
                    live.bindings.owner,
                    OwnerBinding::Unbound(OwnerSource::Pending) | OwnerBinding::Unbound(OwnerSource::Inherit(_))
                ) {
                    live.bindings.owner = OwnerBinding::Bound(f.owner.clone());
                }
            }
            finals.push(f);
        }
        inner.txid = Some(txid.to_string());
        finals
    }

    pub(crate) fn mark_published(&self, txid: &str) {
        self.inner.lock().state = CommitState::Published;
        info!(commit_id = self.id, txid = %txid, "Commit published");
        self.notify(CommitEvent::Published {
            txid: txid.to_string(),
        });
        self.settle(Ok(txid.to_string()));
    }

    /// Restore pre-images of everything this commit spent or created.
    pub(crate) fn rollback(&self, err: &KernelError) {
        let text = err.to_string();
        let inner = self.inner.lock();
        for c in self.inputs.iter().chain(self.creates.iter()).rev() {
            if let Some(snapshot) = inner.before.get(c) {
                snapshot.restore_or_fail(&text);
            }
        }
    }

    pub(crate) fn mark_failed(&self, err: &KernelError) {
        {
            let mut inner = self.inner.lock();
            if matches!(inner.state, CommitState::Failed | CommitState::Published) {
                return;
            }
            inner.state = CommitState::Failed;
        }
        error!(commit_id = self.id, error = %err, "Commit failed");
        self.rollback(err);
        self.notify(CommitEvent::Failed(err.clone()));
        self.settle(Err(err.clone()));
    }
}

fn apply_final(snapshot: &mut Snapshot, f: &Final, before: bool) {
    let bindings = &mut snapshot.bindings;
    if bindings.location == f.pending_location {
        bindings.location = f.location.clone();
    }
    if bindings.origin == f.pending_location {
        bindings.origin = f.origin.clone();
    }
    let inherited = matches!(
        bindings.owner,
        OwnerBinding::Unbound(OwnerSource::Pending) | OwnerBinding::Unbound(OwnerSource::Inherit(_))
    );
    // A pre-image owner assigned upstream is final now; an after-image one is ours.
    if inherited || (before && !bindings.owner.is_bound()) {
        bindings.owner = OwnerBinding::Bound(f.owner.clone());
    }
    if before {
        if let SatoshiBinding::Unbound(_) = bindings.satoshis {
            bindings.satoshis = SatoshiBinding::Bound(f.satoshis);
        }
    }
}

/// All unpublished commits of one kernel, keyed by id.
pub struct CommitGraph {
    next_id: AtomicU64,
    commits: Mutex<BTreeMap<u64, Arc<Commit>>>,
}

impl Default for CommitGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitGraph {
    pub fn new() -> Self {
        CommitGraph {
            next_id: AtomicU64::new(1),
            commits: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Build a commit from `record` and link it to the unpublished commits it depends on.
    pub fn create(&self, record: &Record) -> Result<Arc<Commit>, KernelError> {
        let commit = Arc::new(Commit::build(record, self.next_id())?);
        let mut commits = self.commits.lock();
        {
            let mut inner = commit.inner.lock();
            let linked: BTreeSet<u64> = inner
                .upstream
                .iter()
                .copied()
                .filter(|id| commits.contains_key(id))
                .collect();
            inner.upstream = linked;
            for id in &inner.upstream {
                if let Some(upstream) = commits.get(id) {
                    upstream.inner.lock().downstream.insert(commit.id);
                }
            }
        }
        commits.insert(commit.id, commit.clone());
        drop(commits);
        info!(
            commit_id = commit.id,
            inputs = commit.inputs.len(),
            outputs = commit.outputs.len(),
            deletes = commit.deletes.len(),
            refs = commit.refs.len(),
            upstream = ?commit.upstream(),
            "Commit created"
        );
        commit.mark_ready();
        Ok(commit)
    }

    pub fn get(&self, id: u64) -> Option<Arc<Commit>> {
        self.commits.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.commits.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.lock().is_empty()
    }

    /// Ready commits, moved to Publishing.
    pub(crate) fn take_ready(&self) -> Vec<Arc<Commit>> {
        let commits: Vec<Arc<Commit>> = self.commits.lock().values().cloned().collect();
        commits
            .into_iter()
            .filter(|c| c.begin_publishing())
            .collect()
    }

    /// Record a successful publish and release downstream commits.
    pub(crate) fn published(&self, commit: &Commit, finals: &[Final]) {
        let txid = commit.txid().unwrap_or_default();
        commit.mark_published(&txid);
        self.commits.lock().remove(&commit.id);
        for id in commit.downstream() {
            if let Some(downstream) = self.get(id) {
                downstream.on_upstream_published(commit.id, finals);
            }
        }
    }

    /// Fail a commit. Downstream commits fail first, then the commit rolls back.
    pub(crate) fn fail(&self, id: u64, err: &KernelError) {
        let Some(commit) = self.get(id) else { return };
        if matches!(commit.state(), CommitState::Failed | CommitState::Published) {
            return;
        }
        for downstream in commit.downstream() {
            self.fail(downstream, err);
        }
        commit.mark_failed(err);
        self.commits.lock().remove(&id);
    }
}
