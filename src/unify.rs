//! Unification
//!
//! Before an operation runs, every reference to the same logical creation reachable
//! from its roots is rewritten to one chosen reference (the worldview). Replay later
//! reverses the rewrites inside creations that the transaction does not spend or
//! read directly.

use crate::creation::{Creation, CreationKind, CreationSet};
use crate::error::KernelError;
use crate::location;
use crate::value::{ObjectData, ObjectRef, Value};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnificationMode {
    /// Always observe the most advanced nonce of each origin.
    #[default]
    ByOrigin,
    /// Keep what the caller passed; only exact location matches are merged.
    ByLocation,
}

#[derive(Clone, Debug)]
enum Slot {
    Key(String),
    Index(usize),
    SetItem(usize),
    MapKey(usize),
    MapValue(usize),
    ArbClass,
}

#[derive(Clone, Debug)]
enum Target {
    Prop { creation: Creation, key: String },
    Class { creation: Creation },
    Element { object: ObjectRef, slot: Slot },
}

#[derive(Clone, Debug)]
struct Replacement {
    /// Creation whose state contained the slot; `None` for the operation's own roots.
    owner: Option<Creation>,
    target: Target,
    original: Creation,
}

/// The chosen reference per logical creation, plus the rewrites that installed it.
#[derive(Default, Debug)]
pub struct Worldview {
    chosen: HashMap<String, Creation>,
    keys: HashMap<u64, String>,
    replacements: Vec<Replacement>,
}

impl Worldview {
    /// The reference every participant observes for `creation`.
    pub fn resolve(&self, creation: &Creation) -> Creation {
        self.keys
            .get(&creation.id())
            .and_then(|key| self.chosen.get(key))
            .cloned()
            .unwrap_or_else(|| creation.clone())
    }

    pub fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::Creation(c) => Value::Creation(self.resolve(c)),
            other => other.clone(),
        }
    }

    pub fn replacement_count(&self) -> usize {
        self.replacements.len()
    }

    fn is_chosen(&self, creation: &Creation) -> bool {
        self.resolve(creation).ptr_eq(creation)
    }
}

fn group_key(creation: &Creation, mode: UnificationMode) -> String {
    let state = creation.read();
    let bindings = &state.bindings;
    let transient = |loc: &str| location::is_error(loc) || loc.starts_with("record://");
    if matches!(state.kind, CreationKind::Berry { .. }) {
        return format!("loc:{}", bindings.location);
    }
    match mode {
        UnificationMode::ByOrigin if !transient(&bindings.origin) => {
            format!("origin:{}", bindings.origin)
        }
        UnificationMode::ByLocation if !transient(&bindings.location) => {
            format!("loc:{}", bindings.location)
        }
        _ => format!("id:{}", creation.id()),
    }
}

/// Graph reachable from the roots: creations, and containers tagged with their owner.
struct Reach {
    creations: CreationSet,
    containers: Vec<(ObjectRef, Option<Creation>)>,
}

fn reach(roots: &[Value]) -> Reach {
    let mut creations = CreationSet::new();
    let mut containers = Vec::new();
    let mut seen_objects: HashSet<usize> = HashSet::new();
    let mut stack: Vec<(Value, Option<Creation>)> =
        roots.iter().rev().map(|v| (v.clone(), None)).collect();

    while let Some((value, owner)) = stack.pop() {
        match value {
            Value::Creation(c) => {
                if creations.insert(&c) {
                    let refs = c.references();
                    stack.extend(refs.into_iter().rev().map(|v| (v, Some(c.clone()))));
                }
            }
            Value::Object(o) => {
                if seen_objects.insert(o.id()) {
                    let children = o.lock().children();
                    containers.push((o, owner.clone()));
                    stack.extend(children.into_iter().rev().map(|v| (v, owner.clone())));
                }
            }
            _ => {}
        }
    }
    Reach {
        creations,
        containers,
    }
}

/// Unify every creation reachable from `roots`.
///
/// `pinned` creations are authoritative: finding a newer nonce for one of them is
/// a time-travel error.
pub fn unify(
    roots: &[Value],
    pinned: &[Creation],
    mode: UnificationMode,
) -> Result<Worldview, KernelError> {
    let reached = reach(roots);
    let pinned: CreationSet = pinned.iter().collect();

    let mut groups: Vec<(String, Vec<Creation>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut worldview = Worldview::default();
    for c in reached.creations.iter() {
        let key = group_key(c, mode);
        worldview.keys.insert(c.id(), key.clone());
        match index.get(&key) {
            Some(&i) => groups[i].1.push(c.clone()),
            None => {
                index.insert(key.clone(), groups.len());
                groups.push((key, vec![c.clone()]));
            }
        }
    }

    for (key, members) in groups {
        let mut best: Option<&Creation> = None;
        for member in &members {
            best = match best {
                None => Some(member),
                Some(current) => {
                    let (m, n) = (member.raw_nonce(), current.raw_nonce());
                    let better = m > n || (m == n && pinned.contains(member) && !pinned.contains(current));
                    Some(if better { member } else { current })
                }
            };
        }
        let Some(best) = best.cloned() else { continue };
        for member in members.iter().filter(|m| pinned.contains(m)) {
            if member.raw_nonce() < best.raw_nonce() {
                return Err(KernelError::State(format!(
                    "Time travel: {} at nonce {} is older than the known nonce {}",
                    member.display_name(),
                    member.raw_nonce(),
                    best.raw_nonce()
                )));
            }
        }
        worldview.chosen.insert(key, best);
    }

    for c in reached.creations.iter() {
        if worldview.is_chosen(c) {
            rewrite_creation(&mut worldview, c);
        }
    }
    for (object, owner) in &reached.containers {
        if owner.as_ref().map_or(true, |o| worldview.is_chosen(o)) {
            rewrite_object(&mut worldview, object, owner.clone());
        }
    }

    debug!(
        creations = reached.creations.len(),
        replaced = worldview.replacements.len(),
        "Unified worldview"
    );
    Ok(worldview)
}

fn rewrite_creation(worldview: &mut Worldview, creation: &Creation) {
    let mut log = Vec::new();
    {
        let mut state = creation.write();
        if let CreationKind::Instance { class } = &mut state.kind {
            let chosen = worldview.resolve(class);
            if !chosen.ptr_eq(class) {
                let original = std::mem::replace(class, chosen);
                log.push((Target::Class { creation: creation.clone() }, original));
            }
        }
        for (key, value) in state.props.iter_mut() {
            if let Value::Creation(c) = value {
                let chosen = worldview.resolve(c);
                if !chosen.ptr_eq(c) {
                    let original = std::mem::replace(c, chosen);
                    log.push((
                        Target::Prop {
                            creation: creation.clone(),
                            key: key.clone(),
                        },
                        original,
                    ));
                }
            }
        }
    }
    for (target, original) in log {
        worldview.replacements.push(Replacement {
            owner: Some(creation.clone()),
            target,
            original,
        });
    }
}

fn rewrite_object(worldview: &mut Worldview, object: &ObjectRef, owner: Option<Creation>) {
    let mut log: Vec<(Slot, Creation)> = Vec::new();
    {
        let mut swap = |slot: Slot, value: &mut Value| {
            if let Value::Creation(c) = value {
                let chosen = worldview.resolve(c);
                if !chosen.ptr_eq(c) {
                    log.push((slot, std::mem::replace(c, chosen)));
                }
            }
        };
        let mut data = object.lock();
        match &mut *data {
            ObjectData::Plain(props) => {
                for (k, v) in props.iter_mut() {
                    swap(Slot::Key(k.clone()), v);
                }
            }
            ObjectData::Array { items, props } => {
                for (i, v) in items.iter_mut().enumerate() {
                    if let Some(v) = v {
                        swap(Slot::Index(i), v);
                    }
                }
                for (k, v) in props.iter_mut() {
                    swap(Slot::Key(k.clone()), v);
                }
            }
            ObjectData::Set { items, props } => {
                for (i, v) in items.iter_mut().enumerate() {
                    swap(Slot::SetItem(i), v);
                }
                for (k, v) in props.iter_mut() {
                    swap(Slot::Key(k.clone()), v);
                }
            }
            ObjectData::Map { entries, props } => {
                for (i, (k, v)) in entries.iter_mut().enumerate() {
                    swap(Slot::MapKey(i), k);
                    swap(Slot::MapValue(i), v);
                }
                for (k, v) in props.iter_mut() {
                    swap(Slot::Key(k.clone()), v);
                }
            }
            ObjectData::Instance { class, props } => {
                let mut class_value = Value::Creation(class.clone());
                swap(Slot::ArbClass, &mut class_value);
                if let Value::Creation(c) = class_value {
                    *class = c;
                }
                for (k, v) in props.iter_mut() {
                    swap(Slot::Key(k.clone()), v);
                }
            }
            ObjectData::Bytes(_) => {}
        }
    }
    for (slot, original) in log {
        worldview.replacements.push(Replacement {
            owner: owner.clone(),
            target: Target::Element {
                object: object.clone(),
                slot,
            },
            original,
        });
    }
}

/// Undo rewrites inside creations that are not in `keep`.
pub fn deunify(worldview: Worldview, keep: &[Creation]) {
    let keep: CreationSet = keep.iter().collect();
    let mut restored = 0usize;
    for replacement in worldview.replacements.into_iter().rev() {
        let Some(owner) = &replacement.owner else { continue };
        if keep.contains(owner) {
            continue;
        }
        restore(replacement.target, replacement.original);
        restored += 1;
    }
    debug!(restored, "Deunified worldview");
}

fn restore(target: Target, original: Creation) {
    match target {
        Target::Prop { creation, key } => {
            creation.write().props.insert(key, Value::Creation(original));
        }
        Target::Class { creation } => {
            if let CreationKind::Instance { class } = &mut creation.write().kind {
                *class = original;
            }
        }
        Target::Element { object, slot } => {
            let mut data = object.lock();
            let original = Value::Creation(original);
            match (&mut *data, slot) {
                (ObjectData::Plain(props), Slot::Key(k))
                | (ObjectData::Array { props, .. }, Slot::Key(k))
                | (ObjectData::Set { props, .. }, Slot::Key(k))
                | (ObjectData::Map { props, .. }, Slot::Key(k))
                | (ObjectData::Instance { props, .. }, Slot::Key(k)) => {
                    props.insert(k, original);
                }
                (ObjectData::Array { items, .. }, Slot::Index(i)) => {
                    if let Some(slot) = items.get_mut(i) {
                        *slot = Some(original);
                    }
                }
                (ObjectData::Set { items, .. }, Slot::SetItem(i)) => {
                    if let Some(slot) = items.get_mut(i) {
                        *slot = original;
                    }
                }
                (ObjectData::Map { entries, .. }, Slot::MapKey(i)) => {
                    if let Some(entry) = entries.get_mut(i) {
                        entry.0 = original;
                    }
                }
                (ObjectData::Map { entries, .. }, Slot::MapValue(i)) => {
                    if let Some(entry) = entries.get_mut(i) {
                        entry.1 = original;
                    }
                }
                (ObjectData::Instance { class, .. }, Slot::ArbClass) => {
                    if let Value::Creation(c) = original {
                        *class = c;
                    }
                }
                _ => {}
            }
        }
    }
}
