//! Live values
//!
//! The in-memory object graph that creations hold in their properties. Containers
//! have identity (two `ObjectRef`s may point at the same container) so graphs can
//! share substructure and contain cycles; the codec preserves both.

use crate::creation::Creation;
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Keyed properties, visited in sorted key order everywhere.
pub type Props = BTreeMap<String, Value>;

/// Longest array the graph will grow to through keyed inserts.
pub const MAX_ARRAY_LENGTH: usize = 1 << 20;

/// Whether `key` is written the way an array index is: decimal digits, no sign and
/// no leading zero. `"01"` and `"+1"` are ordinary property names.
pub fn is_index_key(key: &str) -> bool {
    !key.is_empty()
        && key.bytes().all(|b| b.is_ascii_digit())
        && (key.len() == 1 || !key.starts_with('0'))
}

/// Element slot named by `key`, if it is an index below [`MAX_ARRAY_LENGTH`].
pub fn array_index(key: &str) -> Option<usize> {
    if !is_index_key(key) {
        return None;
    }
    key.parse::<usize>().ok().filter(|i| *i < MAX_ARRAY_LENGTH)
}

#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Object(ObjectRef),
    Creation(Creation),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_creation(&self) -> Option<&Creation> {
        match self {
            Value::Creation(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Object(o) => o.lock().type_name(),
            Value::Creation(_) => "creation",
        }
    }

    /// SameValueZero: NaN equals NaN, +0 equals -0, containers by identity.
    pub fn same_value_zero(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => (a.is_nan() && b.is_nan()) || a == b,
            _ => self == other,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Creation(a), Value::Creation(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Object(o) => write!(f, "{:?}", o),
            Value::Creation(c) => write!(f, "{:?}", c),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Creation> for Value {
    fn from(c: Creation) -> Self {
        Value::Creation(c)
    }
}

impl From<ObjectRef> for Value {
    fn from(o: ObjectRef) -> Self {
        Value::Object(o)
    }
}

/// Container contents.
#[derive(Clone)]
pub enum ObjectData {
    Plain(Props),
    /// Ordered sequence; `None` marks a hole.
    Array {
        items: Vec<Option<Value>>,
        props: Props,
    },
    Set {
        items: Vec<Value>,
        props: Props,
    },
    Map {
        entries: Vec<(Value, Value)>,
        props: Props,
    },
    Bytes(Vec<u8>),
    /// Instance of a non-creation class, re-hydrated through its class reference.
    Instance {
        class: Creation,
        props: Props,
    },
}

impl ObjectData {
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjectData::Plain(_) => "object",
            ObjectData::Array { .. } => "array",
            ObjectData::Set { .. } => "set",
            ObjectData::Map { .. } => "map",
            ObjectData::Bytes(_) => "bytes",
            ObjectData::Instance { .. } => "instance",
        }
    }

    /// Empty container of the same shape, used when cloning cyclic graphs.
    pub(crate) fn empty_like(&self) -> ObjectData {
        match self {
            ObjectData::Plain(_) => ObjectData::Plain(Props::new()),
            ObjectData::Array { .. } => ObjectData::Array {
                items: Vec::new(),
                props: Props::new(),
            },
            ObjectData::Set { .. } => ObjectData::Set {
                items: Vec::new(),
                props: Props::new(),
            },
            ObjectData::Map { .. } => ObjectData::Map {
                entries: Vec::new(),
                props: Props::new(),
            },
            ObjectData::Bytes(_) => ObjectData::Bytes(Vec::new()),
            ObjectData::Instance { class, .. } => ObjectData::Instance {
                class: class.clone(),
                props: Props::new(),
            },
        }
    }

    /// Every directly contained value, in visiting order.
    pub fn children(&self) -> Vec<Value> {
        match self {
            ObjectData::Plain(props) => props.values().cloned().collect(),
            ObjectData::Array { items, props } => items
                .iter()
                .flatten()
                .cloned()
                .chain(props.values().cloned())
                .collect(),
            ObjectData::Set { items, props } => {
                items.iter().cloned().chain(props.values().cloned()).collect()
            }
            ObjectData::Map { entries, props } => entries
                .iter()
                .flat_map(|(k, v)| [k.clone(), v.clone()])
                .chain(props.values().cloned())
                .collect(),
            ObjectData::Bytes(_) => Vec::new(),
            ObjectData::Instance { class, props } => std::iter::once(Value::Creation(class.clone()))
                .chain(props.values().cloned())
                .collect(),
        }
    }
}

/// Shared, identity-carrying container handle.
#[derive(Clone)]
pub struct ObjectRef(Arc<Mutex<ObjectData>>);

impl ObjectRef {
    pub fn new(data: ObjectData) -> Self {
        ObjectRef(Arc::new(Mutex::new(data)))
    }

    pub fn plain(props: Props) -> Self {
        Self::new(ObjectData::Plain(props))
    }

    pub fn array(items: Vec<Value>) -> Self {
        Self::new(ObjectData::Array {
            items: items.into_iter().map(Some).collect(),
            props: Props::new(),
        })
    }

    pub fn set(items: Vec<Value>) -> Self {
        let mut unique: Vec<Value> = Vec::with_capacity(items.len());
        for item in items {
            if !unique.iter().any(|u| u.same_value_zero(&item)) {
                unique.push(item);
            }
        }
        Self::new(ObjectData::Set {
            items: unique,
            props: Props::new(),
        })
    }

    pub fn map(entries: Vec<(Value, Value)>) -> Self {
        let obj = Self::new(ObjectData::Map {
            entries: Vec::new(),
            props: Props::new(),
        });
        for (k, v) in entries {
            obj.map_insert(k, v);
        }
        obj
    }

    pub fn bytes(bytes: Vec<u8>) -> Self {
        Self::new(ObjectData::Bytes(bytes))
    }

    pub fn instance(class: Creation, props: Props) -> Self {
        Self::new(ObjectData::Instance { class, props })
    }

    /// Identity of the container for the lifetime of the graph.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn lock(&self) -> MutexGuard<'_, ObjectData> {
        self.0.lock()
    }

    /// Keyed property of a plain object, array, set, map or instance.
    pub fn get(&self, key: &str) -> Option<Value> {
        let data = self.lock();
        match &*data {
            ObjectData::Plain(props) | ObjectData::Instance { props, .. } => props.get(key).cloned(),
            ObjectData::Array { items, props } => match array_index(key) {
                Some(i) => items.get(i).cloned().flatten(),
                None => props.get(key).cloned(),
            },
            ObjectData::Set { props, .. } | ObjectData::Map { props, .. } => props.get(key).cloned(),
            ObjectData::Bytes(_) => None,
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let mut data = self.lock();
        match &mut *data {
            ObjectData::Plain(props) | ObjectData::Instance { props, .. } => {
                props.insert(key, value);
            }
            ObjectData::Array { items, props } => match array_index(&key) {
                Some(i) => {
                    if i >= items.len() {
                        items.resize(i + 1, None);
                    }
                    items[i] = Some(value);
                }
                None => {
                    props.insert(key, value);
                }
            },
            ObjectData::Set { props, .. } | ObjectData::Map { props, .. } => {
                props.insert(key, value);
            }
            ObjectData::Bytes(_) => {}
        }
    }

    pub fn push(&self, value: Value) {
        if let ObjectData::Array { items, .. } = &mut *self.lock() {
            items.push(Some(value));
        }
    }

    pub fn len(&self) -> usize {
        match &*self.lock() {
            ObjectData::Plain(props) | ObjectData::Instance { props, .. } => props.len(),
            ObjectData::Array { items, .. } => items.len(),
            ObjectData::Set { items, .. } => items.len(),
            ObjectData::Map { entries, .. } => entries.len(),
            ObjectData::Bytes(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_add(&self, value: Value) {
        if let ObjectData::Set { items, .. } = &mut *self.lock() {
            if !items.iter().any(|u| u.same_value_zero(&value)) {
                items.push(value);
            }
        }
    }

    pub fn map_insert(&self, key: Value, value: Value) {
        if let ObjectData::Map { entries, .. } = &mut *self.lock() {
            match entries.iter_mut().find(|(k, _)| k.same_value_zero(&key)) {
                Some(entry) => entry.1 = value,
                None => entries.push((key, value)),
            }
        }
    }

    pub fn map_get(&self, key: &Value) -> Option<Value> {
        match &*self.lock() {
            ObjectData::Map { entries, .. } => entries
                .iter()
                .find(|(k, _)| k.same_value_zero(key))
                .map(|(_, v)| v.clone()),
            _ => None,
        }
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never recurse: graphs may be cyclic.
        match self.0.try_lock() {
            Some(data) => write!(f, "ObjectRef({:#x} {})", self.id(), data.type_name()),
            None => write!(f, "ObjectRef({:#x})", self.id()),
        }
    }
}
