//! Loader
//!
//! Resolves a location to a hydrated creation. Resolution order: built-in code,
//! berries (load the class, then pluck), creations already loaded in this session,
//! creations this kernel imported earlier, cached states, and finally a replay of
//! the transaction that produced the location.

use crate::cache::state_key;
use crate::codec::{Decoder, Json};
use crate::creation::registry::{normalize, NATIVE_JIG};
use crate::creation::{Bindings, CodeHandle, Creation, CreationKind, OwnerBinding, SatoshiBinding};
use crate::error::KernelError;
use crate::interfaces::Loader;
use crate::kernel::Kernel;
use crate::location::Location;
use crate::publish::STATE_VERSION;
use crate::value::{Props, Value};
use async_trait::async_trait;
use futures::future::{FutureExt, LocalBoxFuture};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, info};

/// Creations loaded during one top-level load, keyed by location.
///
/// A creation whose state refers back to itself resolves to the same handle.
#[derive(Default)]
struct Session {
    loaded: Mutex<HashMap<String, Creation>>,
}

impl Session {
    fn get(&self, location: &str) -> Option<Creation> {
        self.loaded.lock().get(location).cloned()
    }

    fn insert(&self, location: &str, creation: &Creation) {
        self.loaded
            .lock()
            .insert(location.to_string(), creation.clone());
    }
}

pub struct CreationLoader<'k> {
    kernel: &'k Kernel,
    /// Ignore memoized and cached states; rebuild everything by replay.
    fresh: bool,
    session: Session,
}

impl<'k> CreationLoader<'k> {
    pub fn new(kernel: &'k Kernel) -> Self {
        CreationLoader {
            kernel,
            fresh: false,
            session: Session::default(),
        }
    }

    /// Loader that trusts nothing local and replays every dependency.
    pub fn fresh(kernel: &'k Kernel) -> Self {
        CreationLoader {
            kernel,
            fresh: true,
            session: Session::default(),
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub(crate) fn load_in<'a>(&'a self, location: &'a str) -> LocalBoxFuture<'a, Result<Creation, KernelError>> {
        async move {
            let parsed = Location::parse(location)?;
            match &parsed {
                Location::Native(name) => {
                    return self.kernel.native(name).ok_or_else(|| {
                        KernelError::Argument(format!("Unknown native code: {}", name))
                    })
                }
                Location::Berry { class, path } => return self.load_berry(location, class, path).await,
                Location::Published { .. } => {}
                _ => {
                    return Err(KernelError::Argument(format!(
                        "Cannot load {}: not a published location",
                        location
                    )))
                }
            }
            // Txids are case-insensitive; every key below uses the lowercase form.
            let canonical = parsed.to_string();
            let location = canonical.as_str();

            if let Some(creation) = self.session.get(location) {
                return Ok(creation);
            }
            if !self.fresh {
                let memoized = self.kernel.memo.lock().get(location).cloned();
                if let Some(creation) = memoized.filter(|c| c.raw_location() == location) {
                    self.session.insert(location, &creation);
                    return Ok(creation);
                }
                if let Some(state) = self.kernel.cache.get(&state_key(location)).await? {
                    debug!(location = %location, "Hydrating from cache");
                    return self.hydrate(location, &state).await;
                }
            }
            self.load_by_replay(location, &parsed).await
        }
        .boxed_local()
    }

    async fn load_berry(&self, location: &str, class: &Location, path: &str) -> Result<Creation, KernelError> {
        if let Some(berry) = self.session.get(location) {
            return Ok(berry);
        }
        let class = self.load_in(&class.to_string()).await?;
        let berry = self.kernel.pluck(&class, path)?;
        self.session.insert(location, &berry);
        Ok(berry)
    }

    async fn load_by_replay(&self, location: &str, parsed: &Location) -> Result<Creation, KernelError> {
        let txid = parsed
            .txid()
            .ok_or_else(|| KernelError::Argument(format!("No transaction in {}", location)))?
            .to_string();
        info!(location = %location, txid = %txid, "Loading by replay");
        let tx = self.kernel.ledger.fetch(&txid).await?;
        let replayed = self
            .kernel
            .replay_with(&txid, &tx, self, !self.fresh)
            .await?;
        let creation = replayed
            .outputs
            .iter()
            .chain(replayed.deletes.iter())
            .find(|c| c.raw_location() == location)
            .cloned()
            .ok_or_else(|| {
                KernelError::Argument(format!("{} is not an output of {}", location, txid))
            })?;
        self.session.insert(location, &creation);
        Ok(creation)
    }

    /// Build a creation from a cached `{version, kind, props, [cls], [src]}` state.
    async fn hydrate(&self, location: &str, state: &Json) -> Result<Creation, KernelError> {
        let txid = Location::parse(location)?
            .txid()
            .map(str::to_string)
            .ok_or_else(|| KernelError::Argument(format!("No transaction in {}", location)))?;
        if state.get("version").and_then(Json::as_str) != Some(STATE_VERSION) {
            return Err(corrupt(location, "unsupported state version"));
        }
        let kind = state
            .get("kind")
            .and_then(Json::as_str)
            .ok_or_else(|| corrupt(location, "missing kind"))?;

        let shell = match kind {
            "code" => {
                let src = state
                    .get("src")
                    .and_then(Json::as_str)
                    .ok_or_else(|| corrupt(location, "code without src"))?;
                let def = self.kernel.sandbox.evaluate(&normalize(src))?;
                Creation::new(
                    CreationKind::Code(CodeHandle::new(def)),
                    Bindings::fixed(location),
                    Props::new(),
                )
            }
            "jig" => {
                let placeholder = self
                    .kernel
                    .native(NATIVE_JIG)
                    .ok_or_else(|| KernelError::State("Native Jig is not registered".to_string()))?;
                Creation::new(
                    CreationKind::Instance { class: placeholder },
                    Bindings::fixed(location),
                    Props::new(),
                )
            }
            other => return Err(corrupt(location, &format!("cannot hydrate kind {}", other))),
        };
        self.session.insert(location, &shell);

        let props_json = state
            .get("props")
            .ok_or_else(|| corrupt(location, "missing props"))?;
        let mut tokens = Vec::new();
        collect_tokens(props_json, &mut tokens);
        if let Some(cls) = state.get("cls") {
            collect_tokens(cls, &mut tokens);
        }
        let mut resolved: HashMap<String, Creation> = HashMap::new();
        for token in tokens {
            if resolved.contains_key(&token) {
                continue;
            }
            let absolute = Location::parse(&token)?.absolute(&txid).to_string();
            let creation = self.load_in(&absolute).await?;
            resolved.insert(token, creation);
        }

        let lookup = |json: &Json| -> Result<Creation, KernelError> {
            json.as_str()
                .and_then(|token| resolved.get(token))
                .cloned()
                .ok_or_else(|| KernelError::Codec(format!("Unresolved reference {}", json)))
        };
        let mut props = Decoder::new(&lookup).decode_props(props_json)?;
        let class = match state.get("cls") {
            Some(cls) => match Decoder::new(&lookup).decode(cls)? {
                Value::Creation(class) => Some(class),
                _ => return Err(corrupt(location, "cls is not a creation")),
            },
            None => None,
        };

        let bindings = take_bindings(location, &txid, &mut props)?;
        {
            let mut live = shell.write();
            if let Some(class) = class {
                if matches!(live.kind, CreationKind::Instance { .. }) {
                    live.kind = CreationKind::Instance { class };
                }
            }
            live.bindings = bindings;
            live.props = props;
        }
        debug!(location = %location, creation = %shell.display_name(), "Hydrated");
        Ok(shell)
    }
}

#[async_trait(?Send)]
impl Loader for CreationLoader<'_> {
    async fn load(&self, location: &str) -> Result<Creation, KernelError> {
        self.load_in(location).await
    }
}

impl Kernel {
    /// Load the creation at `location`.
    pub async fn load(&self, location: &str) -> Result<Creation, KernelError> {
        CreationLoader::new(self).load(location).await
    }
}

fn corrupt(location: &str, reason: &str) -> KernelError {
    KernelError::Codec(format!("Bad state at {}: {}", location, reason))
}

/// Every `{$jig: "<location>"}` token in an encoded tree, in visiting order.
fn collect_tokens(json: &Json, out: &mut Vec<String>) {
    match json {
        Json::Object(map) => {
            if let Some(Json::String(token)) = map.get("$jig") {
                out.push(token.clone());
            }
            for value in map.values() {
                collect_tokens(value, out);
            }
        }
        Json::Array(items) => {
            for item in items {
                collect_tokens(item, out);
            }
        }
        _ => {}
    }
}

/// Remove the binding entries from decoded props, resolving relative locations.
fn take_bindings(location: &str, txid: &str, props: &mut Props) -> Result<Bindings, KernelError> {
    let mut text = |key: &str| -> Result<String, KernelError> {
        match props.remove(key) {
            Some(Value::String(s)) => Ok(Location::parse(&s)?.absolute(txid).to_string()),
            _ => Err(corrupt(location, &format!("missing {}", key))),
        }
    };
    let state_location = text("location")?;
    let origin = text("origin")?;
    if state_location != location {
        return Err(corrupt(location, &format!("state claims {}", state_location)));
    }
    let mut integer = |key: &str| -> Result<u64, KernelError> {
        props
            .remove(key)
            .and_then(|v| v.as_number())
            .filter(|n| n.fract() == 0.0 && *n >= 0.0)
            .map(|n| n as u64)
            .ok_or_else(|| corrupt(location, &format!("missing {}", key)))
    };
    let nonce = integer("nonce")?;
    let satoshis = integer("satoshis")?;
    let owner = props
        .remove("owner")
        .ok_or_else(|| corrupt(location, "missing owner"))?;
    Ok(Bindings {
        origin,
        location: state_location,
        nonce,
        owner: OwnerBinding::Bound(owner),
        satoshis: SatoshiBinding::Bound(satoshis),
    })
}
