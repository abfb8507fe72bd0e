//! External collaborators
//!
//! Narrow interfaces the kernel consumes. Their implementations (ledger networking,
//! key management, funding, persistent caches, the code sandbox) live outside the
//! kernel; tests supply in-memory versions.

use crate::codec::Json;
use crate::creation::{CodeDefinition, Creation};
use crate::error::KernelError;
use crate::value::Value;
use async_trait::async_trait;
use blake3::Hasher;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Script prefix of the metadata output (vout 0) carrying the payload.
pub const METADATA_PREFIX: &str = "meta:ckernel:";

/// Minimal transaction model shared with the ledger collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub txid: String,
    pub vout: u32,
    /// Unlocking data added by the owner when signing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlock: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub script: String,
    pub satoshis: u64,
}

impl Transaction {
    pub fn new() -> Self {
        Transaction {
            version: 1,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// BLAKE3 hex of the transaction's canonical JSON.
    pub fn txid(&self) -> Result<String, KernelError> {
        let bytes = serde_json::to_vec(self)?;
        let mut hasher = Hasher::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize().as_bytes()))
    }

    /// Payload text carried by the metadata output.
    pub fn metadata(&self) -> Option<&str> {
        self.outputs
            .first()
            .and_then(|out| out.script.strip_prefix(METADATA_PREFIX))
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic evaluator of normalized source text.
pub trait Sandbox: Send + Sync {
    fn evaluate(&self, src: &str) -> Result<Arc<CodeDefinition>, KernelError>;
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn fetch(&self, txid: &str) -> Result<Transaction, KernelError>;

    /// Broadcast and return the transaction id the network assigned.
    async fn broadcast(&self, tx: &Transaction) -> Result<String, KernelError>;

    /// Transaction spending `txid:vout`, if any.
    async fn spends(&self, txid: &str, vout: u32) -> Result<Option<String>, KernelError>;
}

#[async_trait]
pub trait Owner: Send + Sync {
    /// Lock assigned to new creations that were not given an owner.
    async fn owner(&self) -> Result<Value, KernelError>;

    async fn sign(
        &self,
        tx: Transaction,
        parents: &[TxOutput],
        locks: &[Value],
    ) -> Result<Transaction, KernelError>;
}

#[async_trait]
pub trait Purse: Send + Sync {
    async fn pay(&self, tx: Transaction, parents: &[TxOutput]) -> Result<Transaction, KernelError>;

    /// Notification after a successful broadcast.
    async fn broadcast(&self, _tx: &Transaction) -> Result<(), KernelError> {
        Ok(())
    }
}

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Json>, KernelError>;

    async fn set(&self, key: &str, value: Json) -> Result<(), KernelError>;
}

/// Resolves a location to a hydrated creation.
#[async_trait(?Send)]
pub trait Loader {
    async fn load(&self, location: &str) -> Result<Creation, KernelError>;
}
