//! Membrane
//!
//! Every read and write of a creation from user code goes through here. The membrane
//! consults the kernel's call stack to decide whether an access is allowed, records
//! reads and updates into the open record, and clones every value that crosses it so
//! callers never alias a creation's state.

use crate::codec::{clone_value, creations_in};
use crate::creation::{Creation, OwnerBinding, OwnerSource, SatoshiBinding};
use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::location;
use crate::value::Value;
use parking_lot::Mutex;

/// Largest integer a number binding can hold exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Access to a creation's members under the capability rules.
pub trait AccessControlled {
    fn get(&self, target: &Creation, key: &str) -> Result<Value, KernelError>;

    fn set(&self, target: &Creation, key: &str, value: Value) -> Result<(), KernelError>;

    fn delete(&self, target: &Creation, key: &str) -> Result<(), KernelError>;

    fn has(&self, target: &Creation, key: &str) -> Result<bool, KernelError>;

    fn call(&self, target: &Creation, method: &str, args: Vec<Value>) -> Result<Value, KernelError>;
}

#[derive(Clone, Debug)]
pub struct Frame {
    pub this: Creation,
    pub method: String,
}

/// Methods currently executing, innermost last.
#[derive(Default)]
pub struct CallStack {
    frames: Mutex<Vec<Frame>>,
}

impl CallStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, this: &Creation, method: &str) {
        self.frames.lock().push(Frame {
            this: this.clone(),
            method: method.to_string(),
        });
    }

    pub fn pop(&self) -> Option<Frame> {
        self.frames.lock().pop()
    }

    pub fn top(&self) -> Option<Frame> {
        self.frames.lock().last().cloned()
    }

    pub fn depth(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// The frame beneath the top, if any.
    pub fn caller(&self) -> Option<Frame> {
        let frames = self.frames.lock();
        frames.len().checked_sub(2).map(|i| frames[i].clone())
    }

    /// Creations of every frame, outermost first.
    pub fn creations(&self) -> Vec<Creation> {
        self.frames.lock().iter().map(|f| f.this.clone()).collect()
    }
}

/// The access-control wrapper used for all creation access.
pub struct Membrane<'k> {
    kernel: &'k Kernel,
}

impl<'k> Membrane<'k> {
    pub fn new(kernel: &'k Kernel) -> Self {
        Membrane { kernel }
    }

    fn check_private(&self, target: &Creation, key: &str) -> Result<(), KernelError> {
        if !key.starts_with('_') {
            return Ok(());
        }
        match self.kernel.stack.top() {
            Some(frame) if !frame.this.method_owner().ptr_eq(&target.method_owner()) => {
                Err(KernelError::State(format!(
                    "Cannot access private property {} of {}",
                    key,
                    target.display_name()
                )))
            }
            _ => Ok(()),
        }
    }

    fn check_writable(&self, target: &Creation, key: &str) -> Result<(), KernelError> {
        if self.kernel.in_berry_context() {
            return Err(KernelError::State(format!(
                "Cannot update {} while plucking a berry",
                target.display_name()
            )));
        }
        match self.kernel.stack.top() {
            Some(frame) if frame.this.ptr_eq(target) => Ok(()),
            _ => Err(KernelError::State(format!(
                "Attempt to update {} outside of a method: {}",
                target.display_name(),
                key
            ))),
        }
    }

    fn track_read(&self, target: &Creation) -> Result<(), KernelError> {
        if self.kernel.stack.is_empty() || self.kernel.in_berry_context() {
            return Ok(());
        }
        self.kernel.with_record(|record| record.read(target))
    }

    /// Spend `target`; everyone on the stack must authorize the action.
    fn track_update(&self, target: &Creation) -> Result<(), KernelError> {
        let callers = self.kernel.stack.creations();
        self.kernel.with_record(|record| {
            record.update(target)?;
            for caller in callers.iter().filter(|c| !c.ptr_eq(target)) {
                record.queue_auth(caller);
            }
            Ok(())
        })
    }

    fn read_binding(&self, target: &Creation, key: &str) -> Result<Value, KernelError> {
        let name = target.display_name();
        let state = target.read();
        let bindings = &state.bindings;
        let settled = |loc: &str| -> Result<(), KernelError> {
            if location::is_pending(loc) {
                Err(KernelError::needs_sync(format!("{} of {}", key, name)))
            } else if location::is_error(loc) {
                Err(KernelError::State(format!(
                    "Cannot read {} of {}: {}",
                    key, name, loc
                )))
            } else {
                Ok(())
            }
        };
        match key {
            "location" => {
                settled(&bindings.location)?;
                Ok(Value::from(bindings.location.as_str()))
            }
            "origin" => {
                settled(&bindings.origin)?;
                Ok(Value::from(bindings.origin.as_str()))
            }
            "nonce" => {
                settled(&bindings.location)?;
                Ok(Value::Number(bindings.nonce as f64))
            }
            "owner" => match &bindings.owner {
                OwnerBinding::Bound(v) => Ok(clone_value(v)),
                OwnerBinding::Unbound(_) => Err(KernelError::needs_sync(format!("owner of {}", name))),
            },
            "satoshis" => match bindings.satoshis {
                SatoshiBinding::Bound(n) => Ok(Value::Number(n as f64)),
                SatoshiBinding::Unbound(_) => {
                    Err(KernelError::needs_sync(format!("satoshis of {}", name)))
                }
            },
            _ => Err(KernelError::Argument(format!("Not a binding: {}", key))),
        }
    }

    fn write_binding(&self, target: &Creation, key: &str, value: Value) -> Result<(), KernelError> {
        let name = target.display_name();
        match key {
            "owner" => {
                let valid = match &value {
                    Value::String(s) => !s.is_empty(),
                    Value::Object(_) => true,
                    _ => false,
                };
                if !valid {
                    return Err(KernelError::Argument(format!(
                        "Invalid owner for {}: {}",
                        name,
                        value.type_name()
                    )));
                }
                self.track_update(target)?;
                target.write().bindings.owner =
                    OwnerBinding::Unbound(OwnerSource::Assigned(clone_value(&value)));
            }
            "satoshis" => {
                let max = self.kernel.config().publish.max_satoshis;
                let amount = value
                    .as_number()
                    .filter(|n| n.fract() == 0.0 && *n >= 0.0 && *n <= MAX_SAFE_INTEGER)
                    .map(|n| n as u64)
                    .filter(|n| *n <= max)
                    .ok_or_else(|| {
                        KernelError::Argument(format!("Invalid satoshis for {}", name))
                    })?;
                self.track_update(target)?;
                target.write().bindings.satoshis = SatoshiBinding::Unbound(amount);
            }
            _ => {
                return Err(KernelError::State(format!(
                    "Cannot set {} of {}",
                    key, name
                )))
            }
        }
        self.kernel.with_record(|record| {
            record.mark_bound_change(target);
            Ok(())
        })
    }
}

impl AccessControlled for Membrane<'_> {
    fn get(&self, target: &Creation, key: &str) -> Result<Value, KernelError> {
        self.check_private(target, key)?;
        self.track_read(target)?;
        if crate::creation::is_binding(key) {
            return self.read_binding(target, key);
        }
        let value = target.read().props.get(key).cloned();
        Ok(value.map(|v| clone_value(&v)).unwrap_or(Value::Undefined))
    }

    fn set(&self, target: &Creation, key: &str, value: Value) -> Result<(), KernelError> {
        self.check_writable(target, key)?;
        self.check_private(target, key)?;
        if crate::creation::is_binding(key) {
            return self.write_binding(target, key, value);
        }
        let value = clone_value(&value);
        let contained = creations_in(std::slice::from_ref(&value));
        self.track_update(target)?;
        self.kernel.with_record(|record| {
            for c in &contained {
                record.link(c);
            }
            Ok(())
        })?;
        target.write().props.insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, target: &Creation, key: &str) -> Result<(), KernelError> {
        self.check_writable(target, key)?;
        self.check_private(target, key)?;
        if crate::creation::is_binding(key) {
            return Err(KernelError::State(format!(
                "Cannot delete {} of {}",
                key,
                target.display_name()
            )));
        }
        self.track_update(target)?;
        target.write().props.remove(key);
        Ok(())
    }

    fn has(&self, target: &Creation, key: &str) -> Result<bool, KernelError> {
        self.check_private(target, key)?;
        self.track_read(target)?;
        if crate::creation::is_binding(key) {
            return Ok(true);
        }
        Ok(target.read().props.contains_key(key))
    }

    fn call(&self, target: &Creation, method: &str, args: Vec<Value>) -> Result<Value, KernelError> {
        if self.kernel.stack.is_empty() {
            self.kernel.call(target, method, args)
        } else {
            self.kernel.call_inner(target, method, args)
        }
    }
}

/// What a method body sees: its creation, and the membrane for everything else.
pub struct CallContext<'k> {
    kernel: &'k Kernel,
    this: Creation,
}

impl<'k> CallContext<'k> {
    pub(crate) fn new(kernel: &'k Kernel, this: &Creation) -> Self {
        CallContext {
            kernel,
            this: this.clone(),
        }
    }

    pub fn this(&self) -> &Creation {
        &self.this
    }

    pub fn kernel(&self) -> &'k Kernel {
        self.kernel
    }

    fn membrane(&self) -> Membrane<'k> {
        Membrane::new(self.kernel)
    }

    pub fn get(&self, target: &Creation, key: &str) -> Result<Value, KernelError> {
        self.membrane().get(target, key)
    }

    pub fn set(&self, target: &Creation, key: &str, value: impl Into<Value>) -> Result<(), KernelError> {
        self.membrane().set(target, key, value.into())
    }

    pub fn delete(&self, target: &Creation, key: &str) -> Result<(), KernelError> {
        self.membrane().delete(target, key)
    }

    pub fn has(&self, target: &Creation, key: &str) -> Result<bool, KernelError> {
        self.membrane().has(target, key)
    }

    pub fn call(&self, target: &Creation, method: &str, args: Vec<Value>) -> Result<Value, KernelError> {
        self.membrane().call(target, method, args)
    }

    pub fn get_own(&self, key: &str) -> Result<Value, KernelError> {
        self.get(&self.this, key)
    }

    pub fn set_own(&self, key: &str, value: impl Into<Value>) -> Result<(), KernelError> {
        self.set(&self.this, key, value)
    }

    pub fn delete_own(&self, key: &str) -> Result<(), KernelError> {
        self.delete(&self.this, key)
    }

    /// Create an instance of `class`; it inherits this creation's owner.
    pub fn instantiate(&self, class: &Creation, args: Vec<Value>) -> Result<Creation, KernelError> {
        self.kernel.instantiate_inner(&self.this, class, args)
    }

    /// Destroy this creation.
    pub fn destroy(&self) -> Result<(), KernelError> {
        self.kernel.destroy_inner(&self.this)
    }

    /// Require this creation's owner to sign without changing it.
    pub fn auth(&self) -> Result<(), KernelError> {
        self.kernel.auth_inner(&self.this)
    }

    /// Creation whose method called this one; `None` when called from top-level code.
    pub fn caller(&self) -> Option<Creation> {
        self.kernel.stack.caller().map(|f| f.this)
    }
}
