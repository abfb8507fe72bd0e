//! Decoding the canonical JSON tree back into live values.

use super::*;
use crate::creation::Creation;
use crate::value::{array_index, is_index_key, ObjectData, ObjectRef, Props, Value};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Map;
use std::collections::HashMap;

type Loader<'a> = dyn Fn(&Json) -> Result<Creation, KernelError> + 'a;

/// Decode one value. `{$jig: x}` resolves through `loader(x)`.
pub fn decode(json: &Json, loader: &Loader<'_>) -> Result<Value, KernelError> {
    Decoder::new(loader).decode(json)
}

/// Decode, allowing the caller to reuse one decoder for several values.
pub fn decode_with(decoder: &mut Decoder<'_>, json: &Json) -> Result<Value, KernelError> {
    decoder.decode(json)
}

pub struct Decoder<'a> {
    loader: &'a Loader<'a>,
    objects: HashMap<String, ObjectRef>,
    path: Vec<Json>,
}

impl<'a> Decoder<'a> {
    pub fn new(loader: &'a Loader<'a>) -> Self {
        Self {
            loader,
            objects: HashMap::new(),
            path: Vec::new(),
        }
    }

    pub fn decode(&mut self, json: &Json) -> Result<Value, KernelError> {
        match json {
            Json::Null => Ok(Value::Null),
            Json::Bool(b) => Ok(Value::Bool(*b)),
            Json::Number(n) => n
                .as_f64()
                .map(Value::Number)
                .ok_or_else(|| bad(format!("unsupported number {}", n))),
            Json::String(s) => Ok(Value::String(s.clone())),
            Json::Array(items) => {
                let array = self.register(ObjectData::Array {
                    items: Vec::with_capacity(items.len()),
                    props: Props::new(),
                })?;
                for (i, item) in items.iter().enumerate() {
                    let value = self.child(Json::from(i), item)?;
                    array.push(value);
                }
                Ok(Value::Object(array))
            }
            Json::Object(map) => self.decode_object(map),
        }
    }

    /// Decode a bare JSON object of keyed properties (creation states).
    pub fn decode_props(&mut self, json: &Json) -> Result<Props, KernelError> {
        let map = json
            .as_object()
            .ok_or_else(|| bad("properties must be an object".to_string()))?;
        let mut props = Props::new();
        for (key, value) in map {
            let value = self.child(Json::String(key.clone()), value)?;
            props.insert(key.clone(), value);
        }
        Ok(props)
    }

    fn child(&mut self, segment: Json, json: &Json) -> Result<Value, KernelError> {
        self.path.push(segment);
        let result = self.decode(json);
        self.path.pop();
        result
    }

    fn nested_props(&mut self, marker: &str, json: &Json) -> Result<Props, KernelError> {
        self.path.push(Json::String(marker.to_string()));
        let result = self.decode_props(json);
        self.path.pop();
        result
    }

    fn path_key(path: &[Json]) -> String {
        Json::Array(path.to_vec()).to_string()
    }

    /// Register a container at the current path before its children decode.
    fn register(&mut self, data: ObjectData) -> Result<ObjectRef, KernelError> {
        let object = ObjectRef::new(data);
        let key = Self::path_key(&self.path);
        if self.objects.insert(key.clone(), object.clone()).is_some() {
            return Err(bad(format!("duplicate container path {}", key)));
        }
        Ok(object)
    }

    fn decode_object(&mut self, map: &Map<String, Json>) -> Result<Value, KernelError> {
        let markers: Vec<&String> = map.keys().filter(|k| k.starts_with('$')).collect();
        if markers.is_empty() {
            let object = self.register(ObjectData::Plain(Props::new()))?;
            for (key, value) in map {
                let value = self.child(Json::String(key.clone()), value)?;
                object.insert(key.clone(), value);
            }
            return Ok(Value::Object(object));
        }
        if markers.len() > 1 {
            return Err(bad(format!("multiple markers {:?}", markers)));
        }
        let marker = markers[0].as_str();
        let allowed_extra = match marker {
            SET | MAP => Some(PROPS),
            ARBITRARY => Some(ARB_CLASS),
            _ => None,
        };
        if let Some(extra) = map.keys().find(|k| k.as_str() != marker && Some(k.as_str()) != allowed_extra) {
            return Err(bad(format!("unexpected key {} beside {}", extra, marker)));
        }
        let inner = &map[marker];

        match marker {
            UNDEFINED | NAN | INFINITY | NEG_INFINITY | NEG_ZERO => {
                if inner.as_u64() != Some(1) {
                    return Err(bad(format!("{} must be 1", marker)));
                }
                Ok(match marker {
                    UNDEFINED => Value::Undefined,
                    NAN => Value::Number(f64::NAN),
                    INFINITY => Value::Number(f64::INFINITY),
                    NEG_INFINITY => Value::Number(f64::NEG_INFINITY),
                    _ => Value::Number(-0.0),
                })
            }
            OBJECT => {
                let object = self.register(ObjectData::Plain(Props::new()))?;
                let props = self.nested_props(OBJECT, inner)?;
                *object.lock() = ObjectData::Plain(props);
                Ok(Value::Object(object))
            }
            ARRAY => {
                let entries = inner
                    .as_object()
                    .ok_or_else(|| bad("$arr must hold an object".to_string()))?;
                let array = self.register(ObjectData::Array {
                    items: Vec::new(),
                    props: Props::new(),
                })?;
                self.path.push(Json::String(ARRAY.to_string()));
                let mut result = Ok(());
                for (key, value) in entries {
                    if is_index_key(key) && array_index(key).is_none() {
                        result = Err(bad(format!("array index {} out of range", key)));
                        break;
                    }
                    match self.child(Json::String(key.clone()), value) {
                        Ok(value) => array.insert(key.clone(), value),
                        Err(e) => {
                            result = Err(e);
                            break;
                        }
                    }
                }
                self.path.pop();
                result?;
                Ok(Value::Object(array))
            }
            SET => {
                let items = inner
                    .as_array()
                    .ok_or_else(|| bad("$set must hold an array".to_string()))?;
                let set = self.register(ObjectData::Set {
                    items: Vec::new(),
                    props: Props::new(),
                })?;
                self.path.push(Json::String(SET.to_string()));
                let decoded: Result<Vec<Value>, KernelError> = items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| self.child(Json::from(i), item))
                    .collect();
                self.path.pop();
                for item in decoded? {
                    set.set_add(item);
                }
                if let Some(props) = map.get(PROPS) {
                    for (key, value) in self.nested_props(PROPS, props)? {
                        set.insert(key, value);
                    }
                }
                Ok(Value::Object(set))
            }
            MAP => {
                let entries = inner
                    .as_array()
                    .ok_or_else(|| bad("$map must hold an array".to_string()))?;
                let object = self.register(ObjectData::Map {
                    entries: Vec::new(),
                    props: Props::new(),
                })?;
                self.path.push(Json::String(MAP.to_string()));
                let mut decoded = Vec::with_capacity(entries.len());
                let mut result = Ok(());
                for (i, entry) in entries.iter().enumerate() {
                    match self.map_entry(i, entry) {
                        Ok(pair) => decoded.push(pair),
                        Err(e) => {
                            result = Err(e);
                            break;
                        }
                    }
                }
                self.path.pop();
                result?;
                for (key, value) in decoded {
                    object.map_insert(key, value);
                }
                if let Some(props) = map.get(PROPS) {
                    for (key, value) in self.nested_props(PROPS, props)? {
                        object.insert(key, value);
                    }
                }
                Ok(Value::Object(object))
            }
            BYTES => {
                let text = inner
                    .as_str()
                    .ok_or_else(|| bad("$ui8a must hold a string".to_string()))?;
                let bytes = STANDARD
                    .decode(text)
                    .map_err(|e| bad(format!("bad base64: {}", e)))?;
                let object = self.register(ObjectData::Bytes(bytes))?;
                Ok(Value::Object(object))
            }
            CREATION => Ok(Value::Creation((self.loader)(inner)?)),
            ARBITRARY => {
                let class = map
                    .get(ARB_CLASS)
                    .and_then(|t| t.as_object())
                    .filter(|t| t.len() == 1)
                    .and_then(|t| t.get(CREATION))
                    .ok_or_else(|| bad("$arb requires T: {$jig}".to_string()))?;
                let class = (self.loader)(class)?;
                let object = self.register(ObjectData::Instance {
                    class: class.clone(),
                    props: Props::new(),
                })?;
                let props = self.nested_props(ARBITRARY, inner)?;
                *object.lock() = ObjectData::Instance { class, props };
                Ok(Value::Object(object))
            }
            DUPLICATE => {
                let path = inner
                    .as_array()
                    .ok_or_else(|| bad("$dup must hold a path".to_string()))?;
                let key = Self::path_key(path);
                self.objects
                    .get(&key)
                    .cloned()
                    .map(Value::Object)
                    .ok_or_else(|| bad(format!("$dup target {} not found", key)))
            }
            other => Err(bad(format!("unknown marker {}", other))),
        }
    }

    fn map_entry(&mut self, i: usize, entry: &Json) -> Result<(Value, Value), KernelError> {
        let pair = entry
            .as_array()
            .filter(|p| p.len() == 2)
            .ok_or_else(|| bad("$map entries must be pairs".to_string()))?;
        self.path.push(Json::from(i));
        let key = self.child(Json::from(0), &pair[0]);
        let value = self.child(Json::from(1), &pair[1]);
        self.path.pop();
        Ok((key?, value?))
    }
}

fn bad(reason: String) -> KernelError {
    KernelError::Codec(format!("Cannot decode: {}", reason))
}
