//! Codec
//!
//! Canonical, cycle-safe transform between live values and a JSON-safe tree. Object
//! keys are emitted in sorted order and integral numbers as JSON integers, so two
//! encoders given the same logical graph produce byte-identical output. Repeated
//! containers are written once and referenced afterwards by their path in the
//! encoded tree.

mod clone;
mod decode;
mod encode;

pub use clone::{clone_value, creations_in, Cloner};
pub use decode::{decode, decode_with, Decoder};
pub use encode::{encode, Encoder};

use crate::error::KernelError;
use blake3::Hasher;

/// Wire JSON.
pub type Json = serde_json::Value;

pub(crate) const UNDEFINED: &str = "$und";
pub(crate) const NAN: &str = "$nan";
pub(crate) const INFINITY: &str = "$inf";
pub(crate) const NEG_INFINITY: &str = "$ninf";
pub(crate) const NEG_ZERO: &str = "$n0";
pub(crate) const OBJECT: &str = "$obj";
pub(crate) const ARRAY: &str = "$arr";
pub(crate) const SET: &str = "$set";
pub(crate) const MAP: &str = "$map";
pub(crate) const BYTES: &str = "$ui8a";
pub(crate) const CREATION: &str = "$jig";
pub(crate) const ARBITRARY: &str = "$arb";
pub(crate) const DUPLICATE: &str = "$dup";

/// Side-channel key for properties attached to sets and maps.
pub(crate) const PROPS: &str = "props";
/// Class key accompanying `$arb`.
pub(crate) const ARB_CLASS: &str = "T";

/// Largest magnitude emitted as a JSON integer.
pub(crate) const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Canonical bytes of an encoded tree.
///
/// `serde_json` maps are ordered by key, so serialization is already canonical.
pub fn canonical_bytes(json: &Json) -> Result<Vec<u8>, KernelError> {
    Ok(serde_json::to_vec(json)?)
}

/// BLAKE3 hash (hex) of a state's canonical bytes.
pub fn state_hash(json: &Json) -> Result<String, KernelError> {
    let bytes = canonical_bytes(json)?;
    let mut hasher = Hasher::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize().as_bytes()))
}
