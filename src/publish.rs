//! Publish
//!
//! Turns a ready commit into a broadcast transaction: resolve owners and satoshis,
//! encode each output and delete as a localized state, hash the states into the
//! payload, fund, sign and broadcast, then assign final locations and cache the
//! published states. Replay reuses the same generation step so both sides agree
//! on the payload byte for byte.

use crate::cache::{refmap_key, state_key};
use crate::codec::{self, state_hash, Encoder, Json};
use crate::commit::{Commit, RefMap};
use crate::creation::{Creation, CreationKind, OwnerBinding, OwnerSource, SatoshiBinding};
use crate::error::KernelError;
use crate::interfaces::{Transaction, TxInput, TxOutput};
use crate::kernel::Kernel;
use crate::location::{self, relative_location, Location, Slot};
use crate::payload::Payload;
use crate::snapshot::Snapshot;
use crate::value::Value;
use serde_json::{json, Map};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Version tag of cached states.
pub const STATE_VERSION: &str = "04";

/// Payload and the localized states it hashes.
#[derive(Debug, Clone)]
pub struct Generated {
    pub payload: Payload,
    /// One state per output, in output order.
    pub states: Vec<Json>,
    /// One state per delete, in delete order.
    pub delete_states: Vec<Json>,
}

impl Kernel {
    /// Publish one ready commit. On failure the commit and everything downstream of
    /// it is failed and rolled back.
    pub(crate) async fn publish(&self, commit: Arc<Commit>) -> Result<String, KernelError> {
        info!(commit_id = commit.id, "Publishing commit");
        match self.publish_commit(&commit).await {
            Ok(txid) => Ok(txid),
            Err(err) => {
                self.commits.fail(commit.id, &err);
                Err(err)
            }
        }
    }

    async fn publish_commit(&self, commit: &Commit) -> Result<String, KernelError> {
        self.assign_owners(commit).await?;
        self.assign_satoshis(commit)?;
        let generated = self.generate(commit)?;
        let (tx, parents, locks) = self.build_transaction(commit, &generated.payload)?;

        let tx = self.purse.pay(tx, &parents).await?;
        let tx = self.owner.sign(tx, &parents, &locks).await?;
        let script = generated.payload.to_script()?;
        if tx.outputs.first().map(|out| out.script.as_str()) != Some(script.as_str()) {
            return Err(KernelError::Publish(
                "Funding or signing altered the metadata output".to_string(),
            ));
        }
        let txid = self.ledger.broadcast(&tx).await?;
        if let Err(err) = self.purse.broadcast(&tx).await {
            warn!(commit_id = commit.id, txid = %txid, error = %err, "Purse broadcast hook failed");
        }

        let finals = commit.finalize(&txid);
        self.store_states(&txid, commit, &generated).await;
        self.commits.published(commit, &finals);
        Ok(txid)
    }

    /// Bind every unbound output owner, repeating while inherited owners resolve.
    pub(crate) async fn assign_owners(&self, commit: &Commit) -> Result<(), KernelError> {
        let rounds = self.config().publish.max_owner_rounds;
        for round in 0..rounds {
            let mut unresolved = 0;
            let mut progressed = false;
            for c in &commit.outputs {
                let Some(after) = commit.after(c) else { continue };
                let OwnerBinding::Unbound(source) = after.bindings.owner else { continue };
                let owner = match source {
                    OwnerSource::Pending => Some(self.owner.owner().await?),
                    OwnerSource::Assigned(value) => Some(value),
                    OwnerSource::Inherit(creator) => inherited_owner(commit, &creator),
                };
                match owner {
                    Some(owner) => {
                        validate_lock(&owner)?;
                        commit.update_after(c, |s| s.bindings.owner = OwnerBinding::Bound(owner));
                        progressed = true;
                    }
                    None => unresolved += 1,
                }
            }
            if unresolved == 0 {
                debug!(commit_id = commit.id, rounds = round + 1, "Owners assigned");
                return Ok(());
            }
            if !progressed {
                return Err(KernelError::Publish(format!(
                    "Cannot resolve {} owner(s): cyclic inheritance",
                    unresolved
                )));
            }
        }
        Err(KernelError::Publish(format!(
            "Owners still unresolved after {} rounds",
            rounds
        )))
    }

    pub(crate) fn assign_satoshis(&self, commit: &Commit) -> Result<(), KernelError> {
        let max = self.config().publish.max_satoshis;
        for c in &commit.outputs {
            let Some(after) = commit.after(c) else { continue };
            let amount = after.bindings.satoshis.amount();
            if amount > max {
                return Err(KernelError::Publish(format!(
                    "{} holds {} satoshis, more than {}",
                    c.display_name(),
                    amount,
                    max
                )));
            }
            commit.update_after(c, |s| s.bindings.satoshis = SatoshiBinding::Bound(amount));
        }
        Ok(())
    }

    /// Compute the payload for `commit` from its action log and after-states.
    pub(crate) fn generate(&self, commit: &Commit) -> Result<Generated, KernelError> {
        let master: Vec<Creation> = commit
            .inputs
            .iter()
            .chain(commit.refs.iter())
            .chain(commit.creates.iter())
            .cloned()
            .collect();
        let index_saver = |c: &Creation| -> Result<Json, KernelError> {
            master
                .iter()
                .position(|m| m.ptr_eq(c))
                .map(Json::from)
                .ok_or_else(|| {
                    KernelError::State(format!("{} is not part of the transaction", c.display_name()))
                })
        };
        let cmds = commit
            .actions
            .iter()
            .map(|action| action.to_command(&index_saver))
            .collect::<Result<Vec<_>, _>>()?;

        let location_saver = |c: &Creation| -> Result<Json, KernelError> {
            Ok(Json::from(localized_location(commit, c)?))
        };

        let mut lock = Vec::new();
        for c in commit.creates.iter().filter(|c| commit.outputs.iter().any(|o| o.ptr_eq(c))) {
            let after = commit.after(c).ok_or_else(|| missing(c))?;
            let owner = match &after.bindings.owner {
                OwnerBinding::Bound(owner) => owner.clone(),
                OwnerBinding::Unbound(_) => {
                    return Err(KernelError::Publish(format!(
                        "Owner of {} is not bound",
                        c.display_name()
                    )))
                }
            };
            lock.push(encode_lock(&owner)?);
        }

        let mut states = Vec::with_capacity(commit.outputs.len());
        for c in &commit.outputs {
            let after = commit.after(c).ok_or_else(|| missing(c))?;
            states.push(localized_state(commit, &after, &location_saver)?);
        }
        let mut delete_states = Vec::with_capacity(commit.deletes.len());
        for c in &commit.deletes {
            let after = commit.after(c).ok_or_else(|| missing(c))?;
            delete_states.push(localized_state(commit, &after, &location_saver)?);
        }

        let refs = commit
            .refs
            .iter()
            .map(|c| localized_location(commit, c))
            .collect::<Result<Vec<_>, _>>()?;

        let payload = Payload {
            cmds,
            del: delete_states.iter().map(state_hash).collect::<Result<_, _>>()?,
            inputs: commit.inputs.len(),
            lock,
            out: states.iter().map(state_hash).collect::<Result<_, _>>()?,
            refs,
        };
        Ok(Generated {
            payload,
            states,
            delete_states,
        })
    }

    /// Inputs spend the before-locations; vout 0 carries the payload.
    pub(crate) fn build_transaction(
        &self,
        commit: &Commit,
        payload: &Payload,
    ) -> Result<(Transaction, Vec<TxOutput>, Vec<Value>), KernelError> {
        let dust = self.config().publish.min_output_satoshis;
        let mut tx = Transaction::new();
        let mut parents = Vec::with_capacity(commit.inputs.len());
        let mut locks = Vec::with_capacity(commit.inputs.len());
        for c in &commit.inputs {
            let before = commit.before(c).ok_or_else(|| missing(c))?;
            let (txid, vout) = match Location::parse(&before.bindings.location)? {
                Location::Published {
                    txid,
                    slot: Slot::Output,
                    index,
                } => (txid, index),
                _ => {
                    return Err(KernelError::State(format!(
                        "Cannot spend {} at {}",
                        c.display_name(),
                        before.bindings.location
                    )))
                }
            };
            let OwnerBinding::Bound(owner) = before.bindings.owner.clone() else {
                return Err(KernelError::State(format!(
                    "Owner of {} is not bound",
                    c.display_name()
                )));
            };
            parents.push(TxOutput {
                script: owner_script(&owner)?,
                satoshis: before.bindings.satoshis.amount().max(dust),
            });
            tx.inputs.push(TxInput {
                txid,
                vout,
                unlock: None,
            });
            locks.push(owner);
        }

        tx.outputs.push(TxOutput {
            script: payload.to_script()?,
            satoshis: 0,
        });
        for c in &commit.outputs {
            let after = commit.after(c).ok_or_else(|| missing(c))?;
            let OwnerBinding::Bound(owner) = &after.bindings.owner else {
                return Err(KernelError::Publish(format!(
                    "Owner of {} is not bound",
                    c.display_name()
                )));
            };
            tx.outputs.push(TxOutput {
                script: owner_script(owner)?,
                satoshis: after.bindings.satoshis.amount().max(dust),
            });
        }
        Ok((tx, parents, locks))
    }

    /// Cache the published states and the commit's refmap. Failures are logged; the
    /// transaction is already on the ledger.
    pub(crate) async fn store_states(&self, txid: &str, commit: &Commit, generated: &Generated) {
        let refmap = self.build_refmap(commit).await;
        commit.set_refmap(refmap.clone());
        let refmap_json = refmap_to_json(&refmap);

        let entries = commit
            .outputs
            .iter()
            .zip(generated.states.iter())
            .enumerate()
            .map(|(i, (_, state))| (location::published_location(txid, Slot::Output, i as u32 + 1), state))
            .chain(
                commit
                    .deletes
                    .iter()
                    .zip(generated.delete_states.iter())
                    .enumerate()
                    .map(|(i, (_, state))| (location::published_location(txid, Slot::Delete, i as u32), state)),
            );
        for (loc, state) in entries {
            if let Err(err) = self.cache.set(&state_key(&loc), state.clone()).await {
                warn!(location = %loc, error = %err, "Failed to cache state");
                continue;
            }
            if let Err(err) = self.cache.set(&refmap_key(&loc), refmap_json.clone()).await {
                warn!(location = %loc, error = %err, "Failed to cache refmap");
            }
        }
    }

    /// Origin → (location, nonce) over the commit's creations and the cached refmaps of
    /// what it spent or read, keeping the highest nonce per origin.
    pub(crate) async fn build_refmap(&self, commit: &Commit) -> RefMap {
        let mut refmap = RefMap::new();
        let mut upstream_keys = Vec::new();
        for c in commit.inputs.iter().chain(commit.refs.iter()) {
            if let Some(before) = commit.before(c) {
                upstream_keys.push(refmap_key(&before.bindings.location));
                if !commit.outputs.iter().any(|o| o.ptr_eq(c)) && !commit.deletes.iter().any(|d| d.ptr_eq(c)) {
                    merge_ref(&mut refmap, &before);
                }
            }
        }
        for c in commit.outputs.iter().chain(commit.deletes.iter()) {
            if let Some(after) = commit.after(c) {
                merge_ref(&mut refmap, &after);
            }
        }
        for key in upstream_keys {
            match self.cache.get(&key).await {
                Ok(Some(cached)) => {
                    for (origin, (loc, nonce)) in refmap_from_json(&cached) {
                        merge_entry(&mut refmap, origin, loc, nonce);
                    }
                }
                Ok(None) => {}
                Err(err) => debug!(key = %key, error = %err, "Refmap unavailable"),
            }
        }
        refmap
    }
}

/// Owner of `creator` as this commit will publish it.
fn inherited_owner(commit: &Commit, creator: &Creation) -> Option<Value> {
    if let Some(after) = commit.after(creator) {
        return match after.bindings.owner {
            OwnerBinding::Bound(owner) => Some(owner),
            OwnerBinding::Unbound(_) => None,
        };
    }
    match creator.bindings().owner {
        OwnerBinding::Bound(owner) => Some(owner),
        OwnerBinding::Unbound(OwnerSource::Assigned(owner)) => Some(owner),
        OwnerBinding::Unbound(_) => None,
    }
}

fn missing(c: &Creation) -> KernelError {
    KernelError::State(format!("No snapshot of {}", c.display_name()))
}

fn validate_lock(owner: &Value) -> Result<(), KernelError> {
    match owner {
        Value::String(s) if !s.is_empty() => Ok(()),
        Value::Object(_) => Ok(()),
        other => Err(KernelError::Publish(format!(
            "Invalid owner: {}",
            other.type_name()
        ))),
    }
}

/// Encode an owner lock. Locks are plain data; creations are not allowed inside.
pub(crate) fn encode_lock(owner: &Value) -> Result<Json, KernelError> {
    codec::encode(owner, &|c: &Creation| {
        Err(KernelError::Argument(format!(
            "Owner lock cannot contain {}",
            c.display_name()
        )))
    })
}

/// Output script locking to `owner`.
pub fn owner_script(owner: &Value) -> Result<String, KernelError> {
    match owner {
        Value::String(address) if !address.is_empty() => Ok(format!("p2pkh:{}", address)),
        Value::Object(_) => Ok(format!("custom:{}", state_hash(&encode_lock(owner)?)?)),
        other => Err(KernelError::Publish(format!(
            "Cannot lock to {}",
            other.type_name()
        ))),
    }
}

/// Location of `c` as written inside this commit's states and ref list.
fn localized_location(commit: &Commit, c: &Creation) -> Result<String, KernelError> {
    if let Some(i) = commit.outputs.iter().position(|o| o.ptr_eq(c)) {
        return Ok(relative_location(Slot::Output, i as u32 + 1));
    }
    if let Some(i) = commit.deletes.iter().position(|d| d.ptr_eq(c)) {
        return Ok(relative_location(Slot::Delete, i as u32));
    }
    let loc = match commit.before(c) {
        Some(before) => before.bindings.location,
        None => c.raw_location(),
    };
    if location::is_pending(&loc) || location::is_error(&loc) {
        return Err(KernelError::State(format!(
            "Cannot reference {} at {}",
            c.display_name(),
            loc
        )));
    }
    Ok(loc)
}

/// `{version, kind, props, [cls], [src]}` with bindings merged into `props`.
fn localized_state(
    commit: &Commit,
    snapshot: &Snapshot,
    saver: &dyn Fn(&Creation) -> Result<Json, KernelError>,
) -> Result<Json, KernelError> {
    let c = &snapshot.creation;
    let location = localized_location(commit, c)?;
    let origin = if commit.is_created(c) {
        location.clone()
    } else {
        snapshot.bindings.origin.clone()
    };
    let owner = match &snapshot.bindings.owner {
        OwnerBinding::Bound(owner) => encode_lock(owner)?,
        OwnerBinding::Unbound(_) => {
            return Err(KernelError::Publish(format!(
                "Owner of {} is not bound",
                c.display_name()
            )))
        }
    };

    let mut props = match Encoder::new(saver).encode_props(&snapshot.props)? {
        Json::Object(map) => map,
        _ => Map::new(),
    };
    props.insert("location".to_string(), Json::from(location));
    props.insert("origin".to_string(), Json::from(origin));
    props.insert("nonce".to_string(), Json::from(snapshot.bindings.nonce));
    props.insert("owner".to_string(), owner);
    props.insert(
        "satoshis".to_string(),
        Json::from(snapshot.bindings.satoshis.amount()),
    );

    let mut state = Map::new();
    state.insert("kind".to_string(), Json::from(snapshot.kind.name()));
    state.insert("props".to_string(), Json::Object(props));
    state.insert("version".to_string(), Json::from(STATE_VERSION));
    match &snapshot.kind {
        CreationKind::Instance { class } => {
            state.insert("cls".to_string(), json!({ "$jig": saver(class)? }));
        }
        CreationKind::Code(_) => {
            let src = snapshot
                .code
                .as_ref()
                .map(|def| def.src.clone())
                .unwrap_or_default();
            state.insert("src".to_string(), Json::from(src));
        }
        CreationKind::Berry { .. } => {
            return Err(KernelError::State(format!(
                "Berry {} cannot be an output",
                c.display_name()
            )))
        }
    }
    Ok(Json::Object(state))
}

fn merge_ref(refmap: &mut RefMap, snapshot: &Snapshot) {
    let origin = &snapshot.bindings.origin;
    let loc = &snapshot.bindings.location;
    if location::is_pending(origin) || location::is_error(origin) || location::is_pending(loc) {
        return;
    }
    merge_entry(refmap, origin.clone(), loc.clone(), snapshot.bindings.nonce);
}

fn merge_entry(refmap: &mut RefMap, origin: String, loc: String, nonce: u64) {
    match refmap.get(&origin) {
        Some((_, known)) if *known >= nonce => {}
        _ => {
            refmap.insert(origin, (loc, nonce));
        }
    }
}

pub(crate) fn refmap_to_json(refmap: &RefMap) -> Json {
    let map: Map<String, Json> = refmap
        .iter()
        .map(|(origin, (loc, nonce))| (origin.clone(), json!([loc, nonce])))
        .collect();
    Json::Object(map)
}

pub(crate) fn refmap_from_json(json: &Json) -> RefMap {
    let mut refmap = RefMap::new();
    let Some(map) = json.as_object() else { return refmap };
    for (origin, entry) in map {
        let loc = entry.get(0).and_then(Json::as_str);
        let nonce = entry.get(1).and_then(Json::as_u64);
        if let (Some(loc), Some(nonce)) = (loc, nonce) {
            refmap.insert(origin.clone(), (loc.to_string(), nonce));
        }
    }
    refmap
}
