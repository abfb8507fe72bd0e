//! Location grammar
//!
//! Every creation binding that names a transaction output is a location string.
//! Published forms are `<txid>_o<N>` and `<txid>_d<N>`; the kernel also uses a few
//! transient forms while a creation travels through the Record/Commit pipeline.

use crate::error::KernelError;
use std::fmt;

/// Origin and location of a creation that has not been deployed.
pub const UNDEPLOYED: &str = "error://Undeployed";

const ERROR_PREFIX: &str = "error://";
const RECORD_PREFIX: &str = "record://";
const COMMIT_PREFIX: &str = "commit://";
const NATIVE_PREFIX: &str = "native://";
const BERRY_QUERY: &str = "?berry=";

/// Whether an output slot holds a live output or a deleted creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Output,
    Delete,
}

impl Slot {
    fn marker(self) -> char {
        match self {
            Slot::Output => 'o',
            Slot::Delete => 'd',
        }
    }
}

/// Parsed location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Published output or delete: `<txid>_o<N>` / `<txid>_d<N>`
    Published { txid: String, slot: Slot, index: u32 },
    /// Relative to the transaction being encoded: `_o<N>` / `_d<N>`
    Relative { slot: Slot, index: u32 },
    /// Created inside an open record
    Record(u64),
    /// Owned by a commit that has not published yet
    Commit { commit: u64, slot: Slot, index: u32 },
    Native(String),
    Error(String),
    Berry { class: Box<Location>, path: String },
}

impl Location {
    pub fn parse(s: &str) -> Result<Location, KernelError> {
        if let Some(text) = s.strip_prefix(ERROR_PREFIX) {
            return Ok(Location::Error(text.to_string()));
        }
        if let Some((class, path)) = s.split_once(BERRY_QUERY) {
            let class = Location::parse(class)?;
            return match class {
                Location::Published { .. } | Location::Native(_) => Ok(Location::Berry {
                    class: Box::new(class),
                    path: path.to_string(),
                }),
                _ => Err(bad_location(s)),
            };
        }
        if let Some(name) = s.strip_prefix(NATIVE_PREFIX) {
            if name.is_empty() {
                return Err(bad_location(s));
            }
            return Ok(Location::Native(name.to_string()));
        }
        if let Some(id) = s.strip_prefix(RECORD_PREFIX) {
            return id
                .parse::<u64>()
                .map(Location::Record)
                .map_err(|_| bad_location(s));
        }
        if let Some(rest) = s.strip_prefix(COMMIT_PREFIX) {
            let (commit, tail) = rest.split_once('_').ok_or_else(|| bad_location(s))?;
            let commit = commit.parse::<u64>().map_err(|_| bad_location(s))?;
            let (slot, index) = parse_slot(tail).ok_or_else(|| bad_location(s))?;
            return Ok(Location::Commit {
                commit,
                slot,
                index,
            });
        }
        if let Some(tail) = s.strip_prefix('_') {
            let (slot, index) = parse_slot(tail).ok_or_else(|| bad_location(s))?;
            return Ok(Location::Relative { slot, index });
        }
        let (txid, tail) = s.rsplit_once('_').ok_or_else(|| bad_location(s))?;
        if txid.len() != 64 || !txid.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(bad_location(s));
        }
        let (slot, index) = parse_slot(tail).ok_or_else(|| bad_location(s))?;
        Ok(Location::Published {
            txid: txid.to_lowercase(),
            slot,
            index,
        })
    }

    /// Resolve a relative location against the transaction that contains it.
    pub fn absolute(self, txid: &str) -> Location {
        match self {
            Location::Relative { slot, index } => Location::Published {
                txid: txid.to_lowercase(),
                slot,
                index,
            },
            other => other,
        }
    }

    pub fn txid(&self) -> Option<&str> {
        match self {
            Location::Published { txid, .. } => Some(txid),
            _ => None,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Published { txid, slot, index } => {
                write!(f, "{}_{}{}", txid, slot.marker(), index)
            }
            Location::Relative { slot, index } => write!(f, "_{}{}", slot.marker(), index),
            Location::Record(id) => write!(f, "{}{}", RECORD_PREFIX, id),
            Location::Commit {
                commit,
                slot,
                index,
            } => write!(f, "{}{}_{}{}", COMMIT_PREFIX, commit, slot.marker(), index),
            Location::Native(name) => write!(f, "{}{}", NATIVE_PREFIX, name),
            Location::Error(text) => write!(f, "{}{}", ERROR_PREFIX, text),
            Location::Berry { class, path } => write!(f, "{}{}{}", class, BERRY_QUERY, path),
        }
    }
}

fn parse_slot(tail: &str) -> Option<(Slot, u32)> {
    let mut chars = tail.chars();
    let slot = match chars.next()? {
        'o' => Slot::Output,
        'd' => Slot::Delete,
        _ => return None,
    };
    let digits = chars.as_str();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((slot, digits.parse().ok()?))
}

fn bad_location(s: &str) -> KernelError {
    KernelError::Argument(format!("Bad location: {}", s))
}

/// Error location carrying failure text.
pub fn error_location(text: &str) -> String {
    format!("{}{}", ERROR_PREFIX, text)
}

pub fn is_error(location: &str) -> bool {
    location.starts_with(ERROR_PREFIX)
}

pub fn is_native(location: &str) -> bool {
    location.starts_with(NATIVE_PREFIX)
}

/// True for locations that will change once an open record or commit resolves.
pub fn is_pending(location: &str) -> bool {
    location.starts_with(RECORD_PREFIX) || location.starts_with(COMMIT_PREFIX)
}

/// Commit id of a `commit://` location.
pub fn pending_commit(location: &str) -> Option<u64> {
    match Location::parse(location) {
        Ok(Location::Commit { commit, .. }) => Some(commit),
        _ => None,
    }
}

pub fn record_location(record_id: u64) -> String {
    Location::Record(record_id).to_string()
}

pub fn commit_location(commit: u64, slot: Slot, index: u32) -> String {
    Location::Commit {
        commit,
        slot,
        index,
    }
    .to_string()
}

pub fn published_location(txid: &str, slot: Slot, index: u32) -> String {
    Location::Published {
        txid: txid.to_string(),
        slot,
        index,
    }
    .to_string()
}

pub fn relative_location(slot: Slot, index: u32) -> String {
    Location::Relative { slot, index }.to_string()
}
