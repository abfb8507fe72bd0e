//! Snapshots
//!
//! Immutable point-in-time copies of a creation, taken before a record first touches
//! it and after a commit assigns its pending bindings. Restoring a snapshot is the
//! only way a creation's bindings go backwards.

use crate::codec::{self, Cloner, Json};
use crate::creation::{Bindings, CodeDefinition, Creation, CreationKind, OwnerBinding, SatoshiBinding};
use crate::error::KernelError;
use crate::location::{self, error_location};
use crate::value::Props;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct Snapshot {
    pub creation: Creation,
    pub kind: CreationKind,
    /// Definition a code creation pointed at when captured.
    pub code: Option<Arc<CodeDefinition>>,
    pub bindings: Bindings,
    pub props: Props,
}

impl Snapshot {
    pub fn capture(creation: &Creation) -> Self {
        let (kind, bindings, props) = {
            let state = creation.read();
            (state.kind.clone(), state.bindings.clone(), state.props.clone())
        };
        let code = match &kind {
            CreationKind::Code(handle) => Some(handle.current()),
            _ => None,
        };
        Snapshot {
            creation: creation.clone(),
            kind,
            code,
            bindings,
            props: Cloner::default().clone_props(&props),
        }
    }

    /// Put the creation back exactly as captured.
    pub fn restore(&self) {
        if let (CreationKind::Code(handle), Some(def)) = (&self.kind, &self.code) {
            if !Arc::ptr_eq(&handle.current(), def) {
                handle.swap(def.clone());
            }
        }
        let props = Cloner::default().clone_props(&self.props);
        let mut state = self.creation.write();
        state.bindings = self.bindings.clone();
        state.props = props;
    }

    /// Restore, then mark any binding that names no valid output with an error location.
    pub fn restore_or_fail(&self, text: &str) {
        self.restore();
        let mut state = self.creation.write();
        let error = error_location(text);
        if location::is_pending(&state.bindings.location) || location::is_error(&state.bindings.location) {
            state.bindings.location = error.clone();
        }
        if location::is_pending(&state.bindings.origin) || location::is_error(&state.bindings.origin) {
            state.bindings.origin = error;
        }
    }

    /// Canonical JSON of the captured state, with creations written by identity.
    ///
    /// Equal fingerprints mean the creation is bit-for-bit the same state.
    pub fn fingerprint(&self) -> Result<Json, KernelError> {
        let saver = |c: &Creation| -> Result<Json, KernelError> { Ok(Json::from(c.id())) };
        let props = codec::Encoder::new(&saver).encode_props(&self.props)?;
        let owner = match &self.bindings.owner {
            OwnerBinding::Bound(v) => json!({ "bound": codec::encode(v, &saver)? }),
            OwnerBinding::Unbound(source) => json!({ "unbound": format!("{:?}", source) }),
        };
        let satoshis = match self.bindings.satoshis {
            SatoshiBinding::Bound(n) => json!({ "bound": n }),
            SatoshiBinding::Unbound(n) => json!({ "unbound": n }),
        };
        Ok(json!({
            "kind": self.kind.name(),
            "src": self.code.as_ref().map(|def| def.src.clone()),
            "origin": self.bindings.origin,
            "location": self.bindings.location,
            "nonce": self.bindings.nonce,
            "owner": owner,
            "satoshis": satoshis,
            "props": props,
        }))
    }
}

/// Snapshots keyed by creation, iterated in capture order.
#[derive(Clone, Default)]
pub struct SnapshotMap {
    order: Vec<u64>,
    snapshots: HashMap<u64, Snapshot>,
}

impl SnapshotMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture `creation` unless a snapshot already exists. Returns true on capture.
    pub fn capture_once(&mut self, creation: &Creation) -> bool {
        if self.snapshots.contains_key(&creation.id()) {
            return false;
        }
        self.insert(Snapshot::capture(creation));
        true
    }

    pub fn insert(&mut self, snapshot: Snapshot) {
        let id = snapshot.creation.id();
        if self.snapshots.insert(id, snapshot).is_none() {
            self.order.push(id);
        }
    }

    pub fn get(&self, creation: &Creation) -> Option<&Snapshot> {
        self.snapshots.get(&creation.id())
    }

    pub fn get_mut(&mut self, creation: &Creation) -> Option<&mut Snapshot> {
        self.snapshots.get_mut(&creation.id())
    }

    pub fn contains(&self, creation: &Creation) -> bool {
        self.snapshots.contains_key(&creation.id())
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Snapshot> {
        self.order.iter().filter_map(|id| self.snapshots.get(id))
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Snapshot> {
        self.snapshots.values_mut()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Restore every snapshot, most recent capture first.
    pub fn restore_all(&self) {
        for snapshot in self.iter().rev() {
            snapshot.restore();
        }
    }
}
