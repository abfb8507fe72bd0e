//! State cache
//!
//! Committed states are cached under `jig://<location>` and their reference maps under
//! `refmap://<location>`. Both implementations below satisfy [`Cache`].

pub mod persistence;

pub use persistence::SledCache;

use crate::codec::Json;
use crate::error::KernelError;
use crate::interfaces::Cache;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;

pub const STATE_PREFIX: &str = "jig://";
pub const REFMAP_PREFIX: &str = "refmap://";

pub fn state_key(location: &str) -> String {
    format!("{}{}", STATE_PREFIX, location)
}

pub fn refmap_key(location: &str) -> String {
    format!("{}{}", REFMAP_PREFIX, location)
}

/// In-process cache.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<BTreeMap<String, Json>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Json>, KernelError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Json) -> Result<(), KernelError> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }
}
