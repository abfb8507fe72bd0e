//! Deep cloning of value graphs.
//!
//! Containers are copied preserving shared identity and cycles; creations are
//! references and are never copied.

use crate::creation::{Creation, CreationSet};
use crate::value::{ObjectData, ObjectRef, Props, Value};
use std::collections::{HashMap, HashSet};

pub fn clone_value(value: &Value) -> Value {
    Cloner::default().clone_value(value)
}

#[derive(Default)]
pub struct Cloner {
    memo: HashMap<usize, ObjectRef>,
}

impl Cloner {
    pub fn clone_value(&mut self, value: &Value) -> Value {
        match value {
            Value::Object(object) => Value::Object(self.clone_object(object)),
            other => other.clone(),
        }
    }

    fn clone_object(&mut self, object: &ObjectRef) -> ObjectRef {
        if let Some(copy) = self.memo.get(&object.id()) {
            return copy.clone();
        }
        let data = object.lock().clone();
        let copy = ObjectRef::new(data.empty_like());
        self.memo.insert(object.id(), copy.clone());

        let filled = match data {
            ObjectData::Plain(props) => ObjectData::Plain(self.clone_props(&props)),
            ObjectData::Array { items, props } => ObjectData::Array {
                items: items
                    .iter()
                    .map(|item| item.as_ref().map(|v| self.clone_value(v)))
                    .collect(),
                props: self.clone_props(&props),
            },
            ObjectData::Set { items, props } => ObjectData::Set {
                items: items.iter().map(|v| self.clone_value(v)).collect(),
                props: self.clone_props(&props),
            },
            ObjectData::Map { entries, props } => ObjectData::Map {
                entries: entries
                    .iter()
                    .map(|(k, v)| (self.clone_value(k), self.clone_value(v)))
                    .collect(),
                props: self.clone_props(&props),
            },
            ObjectData::Bytes(bytes) => ObjectData::Bytes(bytes),
            ObjectData::Instance { class, props } => ObjectData::Instance {
                class,
                props: self.clone_props(&props),
            },
        };
        *copy.lock() = filled;
        copy
    }

    pub fn clone_props(&mut self, props: &Props) -> Props {
        props
            .iter()
            .map(|(k, v)| (k.clone(), self.clone_value(v)))
            .collect()
    }
}

/// Creations reachable from `values` without entering other creations, in first-seen order.
pub fn creations_in(values: &[Value]) -> Vec<Creation> {
    let mut found = CreationSet::new();
    let mut visited: HashSet<usize> = HashSet::new();
    let mut stack: Vec<Value> = values.iter().rev().cloned().collect();
    while let Some(value) = stack.pop() {
        match value {
            Value::Creation(c) => {
                found.insert(&c);
            }
            Value::Object(o) => {
                if visited.insert(o.id()) {
                    let children = o.lock().children();
                    stack.extend(children.into_iter().rev());
                }
            }
            _ => {}
        }
    }
    found.to_vec()
}
