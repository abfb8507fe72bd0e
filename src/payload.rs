//! Payload
//!
//! The canonical description of a transaction's inputs, outputs and commands,
//! carried in the metadata output and compared byte-for-byte during verify.

use crate::codec::{self, Json};
use crate::error::KernelError;
use crate::interfaces::{Transaction, METADATA_PREFIX};
use crate::location::Location;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Op {
    Deploy,
    Upgrade,
    Destroy,
    Auth,
    Call,
    New,
}

impl Op {
    pub fn deploys_code(self) -> bool {
        matches!(self, Op::Deploy | Op::Upgrade)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Command {
    pub data: Json,
    pub op: Op,
}

/// Fields are declared in key order so direct serialization is already canonical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Payload {
    pub cmds: Vec<Command>,
    pub del: Vec<String>,
    #[serde(rename = "in")]
    pub inputs: usize,
    pub lock: Vec<Json>,
    pub out: Vec<String>,
    #[serde(rename = "ref")]
    pub refs: Vec<String>,
}

impl Payload {
    pub fn to_json(&self) -> Result<Json, KernelError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn canonical_bytes(&self) -> Result<Vec<u8>, KernelError> {
        codec::canonical_bytes(&self.to_json()?)
    }

    pub fn parse(text: &str) -> Result<Payload, KernelError> {
        let payload: Payload = serde_json::from_str(text)
            .map_err(|e| KernelError::Argument(format!("Bad payload: {}", e)))?;
        payload.validate()?;
        Ok(payload)
    }

    pub fn from_transaction(tx: &Transaction) -> Result<Payload, KernelError> {
        let text = tx
            .metadata()
            .ok_or_else(|| KernelError::Argument("Not a kernel transaction".to_string()))?;
        Self::parse(text)
    }

    /// Metadata output script carrying this payload.
    pub fn to_script(&self) -> Result<String, KernelError> {
        let bytes = self.canonical_bytes()?;
        let text = String::from_utf8(bytes)
            .map_err(|e| KernelError::Codec(format!("Payload is not UTF-8: {}", e)))?;
        Ok(format!("{}{}", METADATA_PREFIX, text))
    }

    pub fn validate(&self) -> Result<(), KernelError> {
        if self.cmds.is_empty() {
            return Err(KernelError::Argument("Payload has no commands".to_string()));
        }
        for hash in self.out.iter().chain(self.del.iter()) {
            if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(KernelError::Argument(format!("Bad state hash: {}", hash)));
            }
        }
        for r in &self.refs {
            match Location::parse(r)? {
                Location::Published { .. } | Location::Native(_) | Location::Berry { .. } => {}
                _ => return Err(KernelError::Argument(format!("Bad ref: {}", r))),
            }
        }
        if self.lock.len() > self.out.len() {
            return Err(KernelError::Argument(
                "Payload has more locks than outputs".to_string(),
            ));
        }
        Ok(())
    }

    /// Describe the first difference from `other`, for mismatch reports.
    pub fn first_difference(&self, other: &Payload) -> Option<String> {
        if self.inputs != other.inputs {
            return Some(format!("in: {} != {}", self.inputs, other.inputs));
        }
        if self.refs != other.refs {
            return Some("ref list differs".to_string());
        }
        for (i, (a, b)) in self.out.iter().zip(other.out.iter()).enumerate() {
            if a != b {
                return Some(format!("out[{}] hash {} != {}", i, a, b));
            }
        }
        if self.out.len() != other.out.len() {
            return Some(format!("out: {} != {} states", self.out.len(), other.out.len()));
        }
        for (i, (a, b)) in self.del.iter().zip(other.del.iter()).enumerate() {
            if a != b {
                return Some(format!("del[{}] hash {} != {}", i, a, b));
            }
        }
        if self.del.len() != other.del.len() {
            return Some(format!("del: {} != {} states", self.del.len(), other.del.len()));
        }
        if self.lock != other.lock {
            return Some("lock list differs".to_string());
        }
        if self.cmds != other.cmds {
            return Some("command list differs".to_string());
        }
        None
    }
}
