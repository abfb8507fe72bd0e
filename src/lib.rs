//! Creation Kernel: Deterministic Record, Commit and Replay
//!
//! A kernel for programmable on-chain objects. Code and the instances it creates are
//! "creations"; every change to them is recorded, grouped into commits, published as
//! a transaction whose payload lists the recorded actions, and later replayed from that
//! payload to rebuild identical state.

pub mod action;
pub mod cache;
pub mod codec;
pub mod commit;
pub mod config;
pub mod creation;
pub mod error;
pub mod interfaces;
pub mod kernel;
pub mod loader;
pub mod location;
pub mod logging;
pub mod membrane;
pub mod payload;
pub mod publish;
pub mod record;
pub mod replay;
pub mod snapshot;
pub mod unify;
pub mod value;

pub use creation::{CodeDefinition, Creation, Registry};
pub use error::KernelError;
pub use kernel::{Kernel, KernelBuilder};
pub use membrane::CallContext;
pub use value::{ObjectRef, Props, Value};
