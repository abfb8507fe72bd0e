//! Code definitions and the upgradable code handle.

use crate::error::KernelError;
use crate::membrane::CallContext;
use crate::value::Value;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A method or static function body.
pub type Method =
    Arc<dyn Fn(&CallContext<'_>, Vec<Value>) -> Result<Value, KernelError> + Send + Sync>;

/// Name of the static function a berry class exposes.
pub const PLUCK: &str = "pluck";

/// Name of the instance initializer.
pub const INIT: &str = "init";

/// Evaluated code: what the sandbox produces from normalized source text.
pub struct CodeDefinition {
    pub name: String,
    pub src: String,
    /// Name of the parent class; resolved through the code's `deps`.
    pub parent: Option<String>,
    pub methods: BTreeMap<String, Method>,
    pub functions: BTreeMap<String, Method>,
}

impl CodeDefinition {
    pub fn builder(name: &str, src: &str) -> CodeBuilder {
        CodeBuilder {
            def: CodeDefinition {
                name: name.to_string(),
                src: src.to_string(),
                parent: None,
                methods: BTreeMap::new(),
                functions: BTreeMap::new(),
            },
        }
    }

    pub fn is_berry_class(&self) -> bool {
        self.functions.contains_key(PLUCK)
    }
}

impl fmt::Debug for CodeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeDefinition")
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub struct CodeBuilder {
    def: CodeDefinition,
}

impl CodeBuilder {
    pub fn parent(mut self, name: &str) -> Self {
        self.def.parent = Some(name.to_string());
        self
    }

    pub fn method<F>(mut self, name: &str, body: F) -> Self
    where
        F: Fn(&CallContext<'_>, Vec<Value>) -> Result<Value, KernelError> + Send + Sync + 'static,
    {
        self.def.methods.insert(name.to_string(), Arc::new(body));
        self
    }

    pub fn function<F>(mut self, name: &str, body: F) -> Self
    where
        F: Fn(&CallContext<'_>, Vec<Value>) -> Result<Value, KernelError> + Send + Sync + 'static,
    {
        self.def.functions.insert(name.to_string(), Arc::new(body));
        self
    }

    pub fn build(self) -> Arc<CodeDefinition> {
        Arc::new(self.def)
    }
}

/// Stable code identity pointing at its current definition.
///
/// Upgrading swaps the definition; every instance keeps observing the same handle.
#[derive(Clone)]
pub struct CodeHandle(Arc<RwLock<Arc<CodeDefinition>>>);

impl CodeHandle {
    pub fn new(def: Arc<CodeDefinition>) -> Self {
        CodeHandle(Arc::new(RwLock::new(def)))
    }

    pub fn current(&self) -> Arc<CodeDefinition> {
        self.0.read().clone()
    }

    /// Install a new definition, returning the previous one.
    pub fn swap(&self, def: Arc<CodeDefinition>) -> Arc<CodeDefinition> {
        std::mem::replace(&mut *self.0.write(), def)
    }
}

impl fmt::Debug for CodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodeHandle({})", self.current().name)
    }
}
