//! Creations
//!
//! A creation is any object that participates in the protocol: a stateful instance,
//! a piece of code, or a berry derived by a berry class. Every creation carries the
//! same five bindings. Creations are shared handles; cloning a `Creation` clones the
//! handle, never the state.

pub mod code;
pub mod registry;

pub use code::{CodeBuilder, CodeDefinition, CodeHandle, Method};
pub use registry::Registry;

use crate::location::{self, UNDEPLOYED};
use crate::value::{Props, Value};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Binding names reserved on every creation.
pub const BINDINGS: [&str; 5] = ["location", "origin", "nonce", "owner", "satoshis"];

pub fn is_binding(key: &str) -> bool {
    BINDINGS.contains(&key)
}

/// Where an unbound owner will come from once the owning commit publishes.
#[derive(Clone, Debug, PartialEq)]
pub enum OwnerSource {
    /// Ask the owner collaborator at publish time.
    Pending,
    /// Assigned by a method; validated, not yet final.
    Assigned(Value),
    /// Created inside another creation's method; takes that creation's owner.
    Inherit(Creation),
}

#[derive(Clone, Debug, PartialEq)]
pub enum OwnerBinding {
    Bound(Value),
    Unbound(OwnerSource),
}

impl OwnerBinding {
    pub fn is_bound(&self) -> bool {
        matches!(self, OwnerBinding::Bound(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SatoshiBinding {
    Bound(u64),
    Unbound(u64),
}

impl SatoshiBinding {
    pub fn amount(self) -> u64 {
        match self {
            SatoshiBinding::Bound(n) | SatoshiBinding::Unbound(n) => n,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Bindings {
    pub origin: String,
    pub location: String,
    pub nonce: u64,
    pub owner: OwnerBinding,
    pub satoshis: SatoshiBinding,
}

impl Bindings {
    /// Bindings of a creation that exists only in memory.
    pub fn undeployed(owner: OwnerSource) -> Self {
        Bindings {
            origin: UNDEPLOYED.to_string(),
            location: UNDEPLOYED.to_string(),
            nonce: 0,
            owner: OwnerBinding::Unbound(owner),
            satoshis: SatoshiBinding::Unbound(0),
        }
    }

    /// Bindings of built-in code and berries, which are never spent.
    pub fn fixed(location: &str) -> Self {
        Bindings {
            origin: location.to_string(),
            location: location.to_string(),
            nonce: 0,
            owner: OwnerBinding::Bound(Value::Null),
            satoshis: SatoshiBinding::Bound(0),
        }
    }

    /// True when location and origin name published (or native) outputs.
    pub fn is_settled(&self) -> bool {
        !location::is_pending(&self.location)
            && !location::is_error(&self.location)
            && !location::is_pending(&self.origin)
            && !location::is_error(&self.origin)
    }
}

#[derive(Clone)]
pub enum CreationKind {
    Instance { class: Creation },
    Code(CodeHandle),
    Berry { class: Creation, path: String },
}

impl CreationKind {
    pub fn name(&self) -> &'static str {
        match self {
            CreationKind::Instance { .. } => "jig",
            CreationKind::Code(_) => "code",
            CreationKind::Berry { .. } => "berry",
        }
    }
}

pub struct CreationState {
    pub kind: CreationKind,
    pub bindings: Bindings,
    pub props: Props,
}

pub struct CreationCell {
    id: u64,
    state: RwLock<CreationState>,
}

/// Shared handle to a creation.
#[derive(Clone)]
pub struct Creation(Arc<CreationCell>);

impl Creation {
    pub fn new(kind: CreationKind, bindings: Bindings, props: Props) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Creation(Arc::new(CreationCell {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: RwLock::new(CreationState {
                kind,
                bindings,
                props,
            }),
        }))
    }

    /// Process-unique identity, stable for the lifetime of the handle.
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn ptr_eq(&self, other: &Creation) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Raw state access. Bypasses the membrane; crate-internal bookkeeping only.
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, CreationState> {
        self.0.state.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, CreationState> {
        self.0.state.write()
    }

    /// Copy of the current bindings, for inspection.
    pub fn bindings(&self) -> Bindings {
        self.read().bindings.clone()
    }

    pub fn kind(&self) -> CreationKind {
        self.read().kind.clone()
    }

    pub fn kind_name(&self) -> &'static str {
        self.read().kind.name()
    }

    pub fn is_code(&self) -> bool {
        matches!(self.read().kind, CreationKind::Code(_))
    }

    pub fn is_berry(&self) -> bool {
        matches!(self.read().kind, CreationKind::Berry { .. })
    }

    pub fn is_native(&self) -> bool {
        location::is_native(&self.read().bindings.location)
    }

    /// Class of an instance or berry; `None` for code.
    pub fn class(&self) -> Option<Creation> {
        match &self.read().kind {
            CreationKind::Instance { class } | CreationKind::Berry { class, .. } => {
                Some(class.clone())
            }
            CreationKind::Code(_) => None,
        }
    }

    /// Current code definition of a code creation.
    pub fn code(&self) -> Option<Arc<CodeDefinition>> {
        match &self.read().kind {
            CreationKind::Code(handle) => Some(handle.current()),
            _ => None,
        }
    }

    /// Code creation whose methods run for this creation.
    pub(crate) fn method_owner(&self) -> Creation {
        self.class().unwrap_or_else(|| self.clone())
    }

    pub(crate) fn raw_location(&self) -> String {
        self.read().bindings.location.clone()
    }

    pub(crate) fn raw_origin(&self) -> String {
        self.read().bindings.origin.clone()
    }

    pub(crate) fn raw_nonce(&self) -> u64 {
        self.read().bindings.nonce
    }

    /// Creations referenced directly by this creation's kind and properties.
    pub(crate) fn references(&self) -> Vec<Value> {
        let state = self.read();
        let mut out: Vec<Value> = Vec::with_capacity(state.props.len() + 1);
        match &state.kind {
            CreationKind::Instance { class } | CreationKind::Berry { class, .. } => {
                out.push(Value::Creation(class.clone()))
            }
            CreationKind::Code(_) => {}
        }
        out.extend(state.props.values().cloned());
        out
    }

    /// Name used in messages: class name for instances, code name for code.
    pub fn display_name(&self) -> String {
        let state = self.read();
        match &state.kind {
            CreationKind::Code(handle) => handle.current().name.clone(),
            CreationKind::Instance { class } => match class.code() {
                Some(def) => format!("[jig {}]", def.name),
                None => "[jig]".to_string(),
            },
            CreationKind::Berry { class, path } => match class.code() {
                Some(def) => format!("[berry {} {}]", def.name, path),
                None => "[berry]".to_string(),
            },
        }
    }
}

impl PartialEq for Creation {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Creation {}

impl std::hash::Hash for Creation {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id().hash(state)
    }
}

impl fmt::Debug for Creation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.state.try_read() {
            Some(state) => write!(
                f,
                "Creation(#{} {} {})",
                self.id(),
                state.kind.name(),
                state.bindings.location
            ),
            None => write!(f, "Creation(#{})", self.id()),
        }
    }
}

/// Ordered, duplicate-free set of creations keyed by identity.
#[derive(Clone, Default, Debug)]
pub struct CreationSet {
    items: Vec<Creation>,
    ids: HashSet<u64>,
}

impl CreationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the creation was already present.
    pub fn insert(&mut self, creation: &Creation) -> bool {
        if !self.ids.insert(creation.id()) {
            return false;
        }
        self.items.push(creation.clone());
        true
    }

    pub fn contains(&self, creation: &Creation) -> bool {
        self.ids.contains(&creation.id())
    }

    pub fn remove(&mut self, creation: &Creation) -> bool {
        if !self.ids.remove(&creation.id()) {
            return false;
        }
        self.items.retain(|c| c.id() != creation.id());
        true
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Creation> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn to_vec(&self) -> Vec<Creation> {
        self.items.clone()
    }

    pub fn index_of(&self, creation: &Creation) -> Option<usize> {
        if !self.contains(creation) {
            return None;
        }
        self.items.iter().position(|c| c.ptr_eq(creation))
    }
}

impl<'a> FromIterator<&'a Creation> for CreationSet {
    fn from_iter<I: IntoIterator<Item = &'a Creation>>(iter: I) -> Self {
        let mut set = CreationSet::new();
        for c in iter {
            set.insert(c);
        }
        set
    }
}
