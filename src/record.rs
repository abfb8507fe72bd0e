//! Record
//!
//! Accumulates one logical operation: the creations it creates, reads, updates,
//! deletes and authorizes, a pre-image snapshot of each, and the top-level actions
//! that produced them. The kernel converts a finished record into a commit, or
//! rolls it back.

use crate::action::Action;
use crate::creation::{Creation, CreationSet};
use crate::error::KernelError;
use crate::location::{self, record_location, Location, Slot};
use crate::snapshot::SnapshotMap;
use tracing::{debug, warn};

pub struct Record {
    pub id: u64,
    /// Depth of open `begin`/`end` brackets.
    pub(crate) nested: usize,
    /// Set when any action inside the record failed; the record can only roll back.
    failure: Option<KernelError>,
    /// Records rebuilt from a payload are never committed to the graph.
    pub replay: bool,
    pub actions: Vec<Action>,
    pub creates: CreationSet,
    pub reads: CreationSet,
    pub updates: CreationSet,
    pub deletes: CreationSet,
    pub auths: CreationSet,
    pub disables: CreationSet,
    pending_auths: CreationSet,
    bound_changes: CreationSet,
    pub snapshots: SnapshotMap,
    /// Unpublished commits this record depends on, in link order.
    pub upstream: Vec<u64>,
}

impl Record {
    pub fn new(id: u64, replay: bool) -> Self {
        Record {
            id,
            nested: 0,
            failure: None,
            replay,
            actions: Vec::new(),
            creates: CreationSet::new(),
            reads: CreationSet::new(),
            updates: CreationSet::new(),
            deletes: CreationSet::new(),
            auths: CreationSet::new(),
            disables: CreationSet::new(),
            pending_auths: CreationSet::new(),
            bound_changes: CreationSet::new(),
            snapshots: SnapshotMap::new(),
            upstream: Vec::new(),
        }
    }

    pub fn failure(&self) -> Option<&KernelError> {
        self.failure.as_ref()
    }

    pub(crate) fn fail(&mut self, err: KernelError) {
        if self.failure.is_none() {
            self.failure = Some(err);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Take ownership of a creation that did not exist before this record.
    pub fn create(&mut self, creation: &Creation) -> Result<(), KernelError> {
        self.check_usable()?;
        if self.creates.contains(creation) {
            return Ok(());
        }
        self.snapshots.capture_once(creation);
        creation.write().bindings.location = record_location(self.id);
        self.creates.insert(creation);
        debug!(record_id = self.id, creation = %creation.display_name(), "Record create");
        Ok(())
    }

    pub fn read(&mut self, creation: &Creation) -> Result<(), KernelError> {
        self.check_usable()?;
        if self.creates.contains(creation) || self.reads.contains(creation) {
            return Ok(());
        }
        let loc = creation.raw_location();
        if location::is_error(&loc) {
            return Err(KernelError::State(format!(
                "Cannot read {}: {}",
                creation.display_name(),
                loc
            )));
        }
        self.link(creation);
        self.snapshots.capture_once(creation);
        self.reads.insert(creation);
        debug!(record_id = self.id, creation = %creation.display_name(), "Record read");
        Ok(())
    }

    /// Mark a creation as about to be spent with changed state.
    pub fn update(&mut self, creation: &Creation) -> Result<(), KernelError> {
        self.check_spendable(creation, "update")?;
        if self.creates.contains(creation) || self.updates.contains(creation) {
            return Ok(());
        }
        self.link(creation);
        self.snapshots.capture_once(creation);
        self.updates.insert(creation);
        debug!(record_id = self.id, creation = %creation.display_name(), "Record update");
        Ok(())
    }

    pub fn delete(&mut self, creation: &Creation) -> Result<(), KernelError> {
        self.check_usable()?;
        if self.deletes.contains(creation) {
            return Ok(());
        }
        self.check_spendable(creation, "delete")?;
        self.link(creation);
        self.snapshots.capture_once(creation);
        self.deletes.insert(creation);
        debug!(record_id = self.id, creation = %creation.display_name(), "Record delete");
        Ok(())
    }

    /// Spend a creation without changing it, so its owner must sign.
    pub fn auth(&mut self, creation: &Creation) -> Result<(), KernelError> {
        self.check_spendable(creation, "auth")?;
        if self.creates.contains(creation) {
            return Err(KernelError::State(format!(
                "Cannot auth {}: created in this transaction",
                creation.display_name()
            )));
        }
        if self.auths.contains(creation) {
            return Ok(());
        }
        self.link(creation);
        self.snapshots.capture_once(creation);
        self.auths.insert(creation);
        debug!(record_id = self.id, creation = %creation.display_name(), "Record auth");
        Ok(())
    }

    /// Depend on the commit that currently owns `creation`, if it has not published.
    pub fn link(&mut self, creation: &Creation) {
        if let Some(commit) = location::pending_commit(&creation.raw_location()) {
            if !self.upstream.contains(&commit) {
                self.upstream.push(commit);
            }
        }
    }

    /// Callers on the stack must sign once the current top-level action completes.
    pub(crate) fn queue_auth(&mut self, creation: &Creation) {
        self.pending_auths.insert(creation);
    }

    /// Owner or satoshis were assigned; the creation is frozen after this action.
    pub(crate) fn mark_bound_change(&mut self, creation: &Creation) {
        self.bound_changes.insert(creation);
    }

    /// Close a top-level action.
    pub fn finish_action(&mut self, action: Action) -> Result<(), KernelError> {
        self.check_usable()?;
        let pending = std::mem::take(&mut self.pending_auths);
        for creation in pending.iter() {
            let spent = self.creates.contains(creation)
                || self.updates.contains(creation)
                || self.deletes.contains(creation)
                || self.auths.contains(creation);
            if !spent {
                self.auth(creation)?;
            }
        }
        let changed = std::mem::take(&mut self.bound_changes);
        for creation in changed.iter() {
            self.disables.insert(creation);
        }
        debug!(record_id = self.id, op = ?action.op(), "Record action");
        self.actions.push(action);
        Ok(())
    }

    /// Restore every pre-image. The record is unusable afterwards.
    pub fn rollback(&mut self, err: &KernelError) {
        warn!(record_id = self.id, error = %err, "Rolling back record");
        self.snapshots.restore_all();
        self.fail(err.clone());
    }

    fn check_usable(&self) -> Result<(), KernelError> {
        match &self.failure {
            Some(err) => Err(KernelError::State(format!("Record is unusable: {}", err))),
            None => Ok(()),
        }
    }

    fn check_spendable(&self, creation: &Creation, what: &str) -> Result<(), KernelError> {
        self.check_usable()?;
        let name = creation.display_name();
        if creation.is_native() {
            return Err(KernelError::State(format!("Cannot {} native {}", what, name)));
        }
        if creation.is_berry() {
            return Err(KernelError::State(format!("Cannot {} berry {}", what, name)));
        }
        if self.deletes.contains(creation) {
            return Err(KernelError::State(format!("Cannot {} destroyed {}", what, name)));
        }
        if self.disables.contains(creation) {
            return Err(KernelError::State(format!(
                "Cannot {} {}: owner or satoshis changed in this transaction",
                what, name
            )));
        }
        let loc = creation.raw_location();
        if !self.creates.contains(creation) && location::is_error(&loc) {
            return Err(KernelError::State(format!("Cannot {} {}: {}", what, name, loc)));
        }
        if matches!(
            Location::parse(&loc),
            Ok(Location::Published { slot: Slot::Delete, .. }) | Ok(Location::Commit { slot: Slot::Delete, .. })
        ) {
            return Err(KernelError::State(format!("Cannot {} destroyed {}", what, name)));
        }
        Ok(())
    }
}
