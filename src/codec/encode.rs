//! Encoding live values into the canonical JSON tree.

use super::*;
use crate::creation::Creation;
use crate::value::{is_index_key, ObjectData, ObjectRef, Props, Value};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Map};
use std::collections::HashMap;

type Saver<'a> = dyn Fn(&Creation) -> Result<Json, KernelError> + 'a;

/// Encode one value. Creations are written as `{$jig: saver(creation)}`.
pub fn encode(value: &Value, saver: &Saver<'_>) -> Result<Json, KernelError> {
    Encoder::new(saver).encode(value)
}

/// Single-use encoder holding the first-seen path of every container.
pub struct Encoder<'a> {
    saver: &'a Saver<'a>,
    seen: HashMap<usize, Vec<Json>>,
    path: Vec<Json>,
}

impl<'a> Encoder<'a> {
    pub fn new(saver: &'a Saver<'a>) -> Self {
        Self {
            saver,
            seen: HashMap::new(),
            path: Vec::new(),
        }
    }

    pub fn encode(&mut self, value: &Value) -> Result<Json, KernelError> {
        match value {
            Value::Undefined => Ok(json!({ UNDEFINED: 1 })),
            Value::Null => Ok(Json::Null),
            Value::Bool(b) => Ok(Json::Bool(*b)),
            Value::Number(n) => encode_number(*n),
            Value::String(s) => Ok(Json::String(s.clone())),
            Value::Creation(c) => Ok(json!({ CREATION: (self.saver)(c)? })),
            Value::Object(o) => self.encode_object(o),
        }
    }

    /// Encode keyed properties as a bare JSON object (used for creation states).
    pub fn encode_props(&mut self, props: &Props) -> Result<Json, KernelError> {
        let mut out = Map::new();
        for (key, value) in props {
            out.insert(key.clone(), self.child(Json::String(key.clone()), value)?);
        }
        Ok(Json::Object(out))
    }

    fn child(&mut self, segment: Json, value: &Value) -> Result<Json, KernelError> {
        self.path.push(segment);
        let result = self.encode(value);
        self.path.pop();
        result
    }

    fn nested_props(&mut self, marker: &str, props: &Props) -> Result<Json, KernelError> {
        self.path.push(Json::String(marker.to_string()));
        let result = self.encode_props(props);
        self.path.pop();
        result
    }

    fn encode_object(&mut self, object: &ObjectRef) -> Result<Json, KernelError> {
        if let Some(path) = self.seen.get(&object.id()) {
            return Ok(json!({ DUPLICATE: path.clone() }));
        }
        self.seen.insert(object.id(), self.path.clone());

        // Copy out so the lock is not held while children encode.
        let data = object.lock().clone();
        match data {
            ObjectData::Plain(props) => {
                if props.keys().any(|k| k.starts_with('$')) {
                    Ok(json!({ OBJECT: self.nested_props(OBJECT, &props)? }))
                } else {
                    self.encode_props(&props)
                }
            }
            ObjectData::Array { mut items, props } => {
                while matches!(items.last(), Some(None)) {
                    items.pop();
                }
                if props.is_empty() && items.iter().all(Option::is_some) {
                    let mut out = Vec::with_capacity(items.len());
                    for (i, item) in items.iter().flatten().enumerate() {
                        out.push(self.child(Json::from(i), item)?);
                    }
                    return Ok(Json::Array(out));
                }
                self.path.push(Json::String(ARRAY.to_string()));
                let mut out = Map::new();
                for (i, item) in items.iter().enumerate() {
                    if let Some(item) = item {
                        let key = i.to_string();
                        out.insert(key.clone(), self.child(Json::String(key), item)?);
                    }
                }
                for (key, value) in &props {
                    if is_index_key(key) {
                        self.path.pop();
                        return Err(KernelError::Codec(format!(
                            "Cannot encode: array index {} out of range",
                            key
                        )));
                    }
                    out.insert(key.clone(), self.child(Json::String(key.clone()), value)?);
                }
                self.path.pop();
                Ok(json!({ ARRAY: out }))
            }
            ObjectData::Set { items, props } => {
                self.path.push(Json::String(SET.to_string()));
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    out.push(self.child(Json::from(i), item)?);
                }
                self.path.pop();
                let mut wrapper = Map::new();
                wrapper.insert(SET.to_string(), Json::Array(out));
                if !props.is_empty() {
                    wrapper.insert(PROPS.to_string(), self.nested_props(PROPS, &props)?);
                }
                Ok(Json::Object(wrapper))
            }
            ObjectData::Map { entries, props } => {
                self.path.push(Json::String(MAP.to_string()));
                let mut out = Vec::with_capacity(entries.len());
                for (i, (key, value)) in entries.iter().enumerate() {
                    self.path.push(Json::from(i));
                    let k = self.child(Json::from(0), key);
                    let v = self.child(Json::from(1), value);
                    self.path.pop();
                    out.push(Json::Array(vec![k?, v?]));
                }
                self.path.pop();
                let mut wrapper = Map::new();
                wrapper.insert(MAP.to_string(), Json::Array(out));
                if !props.is_empty() {
                    wrapper.insert(PROPS.to_string(), self.nested_props(PROPS, &props)?);
                }
                Ok(Json::Object(wrapper))
            }
            ObjectData::Bytes(bytes) => Ok(json!({ BYTES: STANDARD.encode(bytes) })),
            ObjectData::Instance { class, props } => {
                let class = (self.saver)(&class)?;
                let props = self.nested_props(ARBITRARY, &props)?;
                Ok(json!({ ARBITRARY: props, ARB_CLASS: { CREATION: class } }))
            }
        }
    }
}

fn encode_number(n: f64) -> Result<Json, KernelError> {
    if n.is_nan() {
        Ok(json!({ NAN: 1 }))
    } else if n == f64::INFINITY {
        Ok(json!({ INFINITY: 1 }))
    } else if n == f64::NEG_INFINITY {
        Ok(json!({ NEG_INFINITY: 1 }))
    } else if n == 0.0 && n.is_sign_negative() {
        Ok(json!({ NEG_ZERO: 1 }))
    } else if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        Ok(Json::from(n as i64))
    } else {
        serde_json::Number::from_f64(n)
            .map(Json::Number)
            .ok_or_else(|| KernelError::Codec(format!("Cannot encode number {}", n)))
    }
}
