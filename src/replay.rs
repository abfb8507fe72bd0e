//! Replay and verify
//!
//! Rebuild a commit from a transaction's declared payload: load its inputs and refs,
//! unify them, re-execute every command on a fresh record, and regenerate the payload
//! exactly as publish would. Any difference is a payload mismatch and nothing is
//! cached. A replayed transaction also has to match the source transaction's inputs,
//! output scripts and output values.

use crate::codec::{self, Json};
use crate::commit::{Commit, RefMap};
use crate::creation::{Creation, OwnerBinding, OwnerSource};
use crate::error::KernelError;
use crate::interfaces::Transaction;
use crate::kernel::Kernel;
use crate::loader::CreationLoader;
use crate::location::{published_location, Location, Slot};
use crate::payload::{Command, Op, Payload};
use crate::publish::Generated;
use crate::unify::{deunify, unify};
use crate::value::{ObjectData, Props, Value};
use tracing::{debug, info, warn};

/// Outcome of a successful replay.
#[derive(Debug, Clone)]
pub struct Replayed {
    pub txid: String,
    /// Creations at the transaction's outputs, in output order.
    pub outputs: Vec<Creation>,
    pub deletes: Vec<Creation>,
    pub refmap: RefMap,
}

impl Kernel {
    /// Replay `tx`, caching its states and remembering its creations.
    pub async fn replay(&self, txid: &str, tx: &Transaction) -> Result<Replayed, KernelError> {
        let loader = CreationLoader::new(self);
        self.replay_with(txid, tx, &loader, true).await
    }

    /// Fetch and replay a transaction.
    pub async fn import(&self, txid: &str) -> Result<Replayed, KernelError> {
        let tx = self.ledger.fetch(txid).await?;
        self.replay(txid, &tx).await
    }

    /// Recompute a transaction and all of its dependencies without using or
    /// writing any cached state.
    pub async fn verify(&self, txid: &str) -> Result<Replayed, KernelError> {
        let tx = self.ledger.fetch(txid).await?;
        let loader = CreationLoader::fresh(self);
        self.replay_with(txid, &tx, &loader, false).await
    }

    /// Load `location`, then follow spends until reaching the creation's latest state.
    pub async fn load_latest(&self, location: &str) -> Result<Creation, KernelError> {
        let mut creation = self.load(location).await?;
        loop {
            let current = creation.raw_location();
            let (txid, vout) = match Location::parse(&current)? {
                Location::Published {
                    txid,
                    slot: Slot::Output,
                    index,
                } => (txid, index),
                _ => return Ok(creation),
            };
            let Some(spender) = self.ledger.spends(&txid, vout).await? else {
                return Ok(creation);
            };
            debug!(location = %current, spender = %spender, "Following spend");
            let replayed = self.import(&spender).await?;
            let origin = creation.raw_origin();
            creation = replayed
                .outputs
                .iter()
                .chain(replayed.deletes.iter())
                .find(|c| c.raw_origin() == origin)
                .cloned()
                .ok_or_else(|| {
                    KernelError::State(format!("{} spent {} without a new state", spender, current))
                })?;
        }
    }

    pub(crate) async fn replay_with(
        &self,
        txid: &str,
        tx: &Transaction,
        loader: &CreationLoader<'_>,
        cache: bool,
    ) -> Result<Replayed, KernelError> {
        if !self.stack.is_empty() {
            return Err(KernelError::State("Cannot replay inside a method".to_string()));
        }
        let payload = Payload::from_transaction(tx)?;
        if payload.cmds.iter().any(|cmd| cmd.op.deploys_code()) && !self.config().trusts(txid) {
            return Err(KernelError::Trust(format!(
                "{} deploys code and is not trusted",
                txid
            )));
        }
        if tx.inputs.len() < payload.inputs {
            return Err(KernelError::PayloadMismatch(format!(
                "payload spends {} inputs, transaction has {}",
                payload.inputs,
                tx.inputs.len()
            )));
        }
        info!(txid = %txid, cmds = payload.cmds.len(), "Replaying transaction");

        let mut inputs = Vec::with_capacity(payload.inputs);
        for input in &tx.inputs[..payload.inputs] {
            let location = published_location(&input.txid, Slot::Output, input.vout);
            inputs.push(loader.load_in(&location).await?);
        }
        let mut refs = Vec::with_capacity(payload.refs.len());
        for location in &payload.refs {
            refs.push(loader.load_in(location).await?);
        }

        let pinned: Vec<Creation> = inputs.iter().chain(refs.iter()).cloned().collect();
        let roots: Vec<Value> = pinned.iter().cloned().map(Value::Creation).collect();
        let worldview = unify(&roots, &pinned, self.config().unification)?;
        let inputs: Vec<Creation> = inputs.iter().map(|c| worldview.resolve(c)).collect();
        let refs: Vec<Creation> = refs.iter().map(|c| worldview.resolve(c)).collect();

        let commit = match self.rebuild(&payload, &inputs, &refs) {
            Ok(commit) => commit,
            Err(err) => {
                deunify(worldview, &[]);
                return Err(err);
            }
        };
        let generated = match self.regenerate(&commit, &payload, tx) {
            Ok(generated) => generated,
            Err(err) => {
                warn!(txid = %txid, error = %err, "Replay rejected");
                commit.rollback(&err);
                deunify(worldview, &[]);
                return Err(err);
            }
        };

        commit.finalize(txid);
        if cache {
            self.store_states(txid, &commit, &generated).await;
            let mut memo = self.memo.lock();
            for c in commit.outputs.iter().chain(commit.deletes.iter()) {
                memo.insert(c.raw_location(), c.clone());
            }
        } else {
            let refmap = self.build_refmap(&commit).await;
            commit.set_refmap(refmap);
        }
        let keep: Vec<Creation> = commit
            .outputs
            .iter()
            .chain(commit.deletes.iter())
            .cloned()
            .collect();
        deunify(worldview, &keep);
        info!(txid = %txid, outputs = commit.outputs.len(), deletes = commit.deletes.len(), "Replayed transaction");

        Ok(Replayed {
            txid: txid.to_string(),
            outputs: commit.outputs.clone(),
            deletes: commit.deletes.clone(),
            refmap: commit.refmap(),
        })
    }

    /// Re-execute the payload's commands on a replay record and freeze the result.
    fn rebuild(&self, payload: &Payload, inputs: &[Creation], refs: &[Creation]) -> Result<Commit, KernelError> {
        self.begin_replay()?;
        for cmd in &payload.cmds {
            if let Err(err) = self.replay_command(cmd, inputs, refs) {
                self.abort_replay(&err);
                return Err(err);
            }
        }
        let mut record = self.finish_replay()?;
        Commit::build(&record, self.commits.next_id()).inspect_err(|err| record.rollback(err))
    }

    fn replay_command(&self, cmd: &Command, inputs: &[Creation], refs: &[Creation]) -> Result<(), KernelError> {
        let creates = self.with_record(|record| Ok(record.creates.to_vec()))?;
        let master: Vec<Creation> = inputs
            .iter()
            .chain(refs.iter())
            .chain(creates.iter())
            .cloned()
            .collect();
        let lookup = |json: &Json| -> Result<Creation, KernelError> {
            json.as_u64()
                .and_then(|i| master.get(i as usize))
                .cloned()
                .ok_or_else(|| {
                    KernelError::PayloadMismatch(format!("no creation at index {}", json))
                })
        };
        let data = codec::decode(&cmd.data, &lookup)?;
        debug!(op = ?cmd.op, "Replaying command");
        match cmd.op {
            Op::Deploy => {
                let items = array_items(&data)?;
                if items.len() % 2 != 0 {
                    return Err(malformed(cmd.op));
                }
                let entries = items
                    .chunks(2)
                    .map(|pair| match &pair[0] {
                        Value::String(src) => Ok((src.clone(), plain_props(&pair[1])?)),
                        _ => Err(malformed(cmd.op)),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                self.deploy_many(entries).map(|_| ())
            }
            Op::Upgrade => match array_items(&data)?.as_slice() {
                [Value::Creation(code), Value::String(src), props] => {
                    self.upgrade(code, src, plain_props(props)?)
                }
                _ => Err(malformed(cmd.op)),
            },
            Op::Destroy => match &data {
                Value::Creation(target) => self.destroy(target),
                _ => Err(malformed(cmd.op)),
            },
            Op::Auth => match &data {
                Value::Creation(target) => self.auth(target),
                _ => Err(malformed(cmd.op)),
            },
            Op::Call => match array_items(&data)?.as_slice() {
                [Value::Creation(target), Value::String(method), args] => {
                    self.call(target, method, array_items(args)?).map(|_| ())
                }
                _ => Err(malformed(cmd.op)),
            },
            Op::New => match array_items(&data)?.as_slice() {
                [Value::Creation(class), args] => self.instantiate(class, array_items(args)?).map(|_| ()),
                _ => Err(malformed(cmd.op)),
            },
        }
    }

    /// Apply the declared locks, finish bindings and compare against the payload and
    /// transaction.
    fn regenerate(
        &self,
        commit: &Commit,
        payload: &Payload,
        tx: &Transaction,
    ) -> Result<Generated, KernelError> {
        let created_outputs: Vec<&Creation> = commit
            .creates
            .iter()
            .filter(|c| commit.outputs.iter().any(|o| o.ptr_eq(c)))
            .collect();
        if created_outputs.len() != payload.lock.len() {
            return Err(KernelError::PayloadMismatch(format!(
                "{} locks for {} new creations",
                payload.lock.len(),
                created_outputs.len()
            )));
        }
        for (c, lock) in created_outputs.into_iter().zip(payload.lock.iter()) {
            let owner = codec::decode(lock, &|_| {
                Err(KernelError::PayloadMismatch("lock references a creation".to_string()))
            })?;
            commit.update_after(c, |s| {
                if !s.bindings.owner.is_bound() {
                    s.bindings.owner = OwnerBinding::Bound(owner);
                }
            });
        }
        for c in &commit.outputs {
            let Some(after) = commit.after(c) else { continue };
            match after.bindings.owner {
                OwnerBinding::Bound(_) => {}
                OwnerBinding::Unbound(OwnerSource::Assigned(owner)) => {
                    commit.update_after(c, |s| s.bindings.owner = OwnerBinding::Bound(owner))
                }
                OwnerBinding::Unbound(_) => {
                    return Err(KernelError::PayloadMismatch(format!(
                        "owner of {} is not determined by the payload",
                        c.display_name()
                    )))
                }
            }
        }
        self.assign_satoshis(commit)?;

        let generated = self.generate(commit)?;
        if generated.payload.canonical_bytes()? != payload.canonical_bytes()? {
            let detail = payload
                .first_difference(&generated.payload)
                .unwrap_or_else(|| "commands differ".to_string());
            return Err(KernelError::PayloadMismatch(detail));
        }

        let (expected, _, _) = self.build_transaction(commit, &generated.payload)?;
        for (i, (want, got)) in expected.inputs.iter().zip(tx.inputs.iter()).enumerate() {
            if want.txid != got.txid || want.vout != got.vout {
                return Err(KernelError::PayloadMismatch(format!(
                    "input {} spends {}:{}, expected {}:{}",
                    i, got.txid, got.vout, want.txid, want.vout
                )));
            }
        }
        for (vout, want) in expected.outputs.iter().enumerate().skip(1) {
            match tx.outputs.get(vout) {
                Some(got) if got.script == want.script && got.satoshis == want.satoshis => {}
                Some(got) => {
                    return Err(KernelError::PayloadMismatch(format!(
                        "output {} is {} with {} satoshis, expected {} with {}",
                        vout, got.script, got.satoshis, want.script, want.satoshis
                    )))
                }
                None => {
                    return Err(KernelError::PayloadMismatch(format!(
                        "output {} is missing",
                        vout
                    )))
                }
            }
        }
        Ok(generated)
    }
}

fn malformed(op: Op) -> KernelError {
    KernelError::PayloadMismatch(format!("malformed {:?} command", op))
}

/// Items of a decoded array; holes read as undefined.
fn array_items(value: &Value) -> Result<Vec<Value>, KernelError> {
    let object = value
        .as_object()
        .ok_or_else(|| KernelError::PayloadMismatch(format!("expected array, found {}", value.type_name())))?;
    let data = object.lock();
    match &*data {
        ObjectData::Array { items, .. } => Ok(items
            .iter()
            .map(|item| item.clone().unwrap_or(Value::Undefined))
            .collect()),
        other => Err(KernelError::PayloadMismatch(format!(
            "expected array, found {}",
            other.type_name()
        ))),
    }
}

fn plain_props(value: &Value) -> Result<Props, KernelError> {
    let object = value
        .as_object()
        .ok_or_else(|| KernelError::PayloadMismatch(format!("expected object, found {}", value.type_name())))?;
    let data = object.lock();
    match &*data {
        ObjectData::Plain(props) => Ok(props.clone()),
        other => Err(KernelError::PayloadMismatch(format!(
            "expected object, found {}",
            other.type_name()
        ))),
    }
}
