//! Code registry: installed definitions and built-in code, owned by one kernel.

use crate::creation::{Bindings, CodeDefinition, CodeHandle, Creation, CreationKind};
use crate::error::KernelError;
use crate::interfaces::Sandbox;
use crate::location::Location;
use crate::value::Props;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub const NATIVE_JIG: &str = "Jig";
pub const NATIVE_BERRY: &str = "Berry";

/// Registry of evaluable code
///
/// Stands in for the sandbox: source text evaluates to whichever definition was
/// installed for it. Built-in code lives here too, addressed as `native://<Name>`.
pub struct Registry {
    definitions: RwLock<HashMap<String, Arc<CodeDefinition>>>,
    natives: BTreeMap<String, Creation>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let mut natives = BTreeMap::new();
        for name in [NATIVE_JIG, NATIVE_BERRY] {
            let src = format!("class {} {{ [native code] }}", name);
            let def = CodeDefinition::builder(name, &src).build();
            let location = Location::Native(name.to_string()).to_string();
            let code = Creation::new(
                CreationKind::Code(CodeHandle::new(def)),
                Bindings::fixed(&location),
                Props::new(),
            );
            natives.insert(name.to_string(), code);
        }
        Self {
            definitions: RwLock::new(HashMap::new()),
            natives,
        }
    }

    /// Install a definition; later evaluations of the same source return it.
    pub fn install(&self, def: Arc<CodeDefinition>) {
        let key = normalize(&def.src);
        self.definitions.write().insert(key, def);
    }

    pub fn lookup(&self, src: &str) -> Option<Arc<CodeDefinition>> {
        self.definitions.read().get(&normalize(src)).cloned()
    }

    pub fn native(&self, name: &str) -> Option<Creation> {
        self.natives.get(name).cloned()
    }

    pub fn natives(&self) -> impl Iterator<Item = &Creation> {
        self.natives.values()
    }
}

impl Sandbox for Registry {
    fn evaluate(&self, src: &str) -> Result<Arc<CodeDefinition>, KernelError> {
        self.lookup(src)
            .ok_or_else(|| KernelError::Execution(format!("Cannot evaluate code: {}", excerpt(src))))
    }
}

/// Source text normalization applied before lookup and hashing.
pub fn normalize(src: &str) -> String {
    src.trim().to_string()
}

fn excerpt(src: &str) -> String {
    let first = src.trim().lines().next().unwrap_or_default();
    first.chars().take(40).collect()
}
