//! Configuration System
//!
//! Layered configuration for a kernel instance. Sources, lowest precedence first:
//! built-in defaults, `$HOME/.config/ckernel/config.toml`, `<workspace>/ckernel.toml`,
//! `<workspace>/ckernel.<network>.toml` for the network named by `CKERNEL_NETWORK`,
//! then `CKERNEL__*` environment variables (`CKERNEL__PUBLISH__MAX_OWNER_ROUNDS=3`).
//! Txids listed in `<workspace>/ckernel.trust` are added to `trust`, and a relative
//! `cache.path` is taken relative to the workspace.

use crate::error::KernelError;
use crate::logging::LoggingConfig;
use crate::unify::UnificationMode;
use config::{Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

mod merge;
mod sources;

/// Trust entry that trusts every transaction.
pub const TRUST_ALL: &str = "*";

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Network name; informational, used to namespace caches.
    #[serde(default = "default_network")]
    pub network: String,

    #[serde(default)]
    pub unification: UnificationMode,

    /// Transactions whose code deployments and upgrades replay may execute.
    #[serde(default)]
    pub trust: Vec<String>,

    #[serde(default)]
    pub publish: PublishConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Rounds of owner assignment before giving up on unresolved owners.
    #[serde(default = "default_max_owner_rounds")]
    pub max_owner_rounds: usize,

    /// Dust floor for creation outputs.
    #[serde(default = "default_min_output_satoshis")]
    pub min_output_satoshis: u64,

    #[serde(default = "default_max_satoshis")]
    pub max_satoshis: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory of the sled-backed state cache; in-memory when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_network() -> String {
    "mock".to_string()
}

fn default_max_owner_rounds() -> usize {
    10
}

fn default_min_output_satoshis() -> u64 {
    1
}

fn default_max_satoshis() -> u64 {
    100_000_000
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            max_owner_rounds: default_max_owner_rounds(),
            min_output_satoshis: default_min_output_satoshis(),
            max_satoshis: default_max_satoshis(),
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            unification: UnificationMode::default(),
            trust: Vec::new(),
            publish: PublishConfig::default(),
            cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    Network(String),
    Trust(String),
    Publish(String),
    Logging(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Network(msg) => write!(f, "Network: {}", msg),
            ValidationError::Trust(msg) => write!(f, "Trust: {}", msg),
            ValidationError::Publish(msg) => write!(f, "Publish: {}", msg),
            ValidationError::Logging(msg) => write!(f, "Logging: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl PublishConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_owner_rounds == 0 {
            return Err("max_owner_rounds must be at least 1".to_string());
        }
        if self.min_output_satoshis > self.max_satoshis {
            return Err(format!(
                "min_output_satoshis ({}) exceeds max_satoshis ({})",
                self.min_output_satoshis, self.max_satoshis
            ));
        }
        Ok(())
    }
}

impl KernelConfig {
    /// Validate the entire configuration, reporting every problem found.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.network.trim().is_empty() {
            errors.push(ValidationError::Network("network cannot be empty".to_string()));
        }

        for entry in &self.trust {
            let is_txid = entry.len() == 64 && entry.chars().all(|c| c.is_ascii_hexdigit());
            if entry != TRUST_ALL && !is_txid {
                errors.push(ValidationError::Trust(format!(
                    "'{}' is neither a txid nor '{}'",
                    entry, TRUST_ALL
                )));
            }
        }

        if let Err(e) = self.publish.validate() {
            errors.push(ValidationError::Publish(e));
        }
        if let Err(e) = self.logging.validate() {
            errors.push(ValidationError::Logging(e));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// True when code deployed or upgraded by `txid` may be executed during replay.
    pub fn trusts(&self, txid: &str) -> bool {
        self.trust.iter().any(|t| t == TRUST_ALL || t == txid)
    }

    /// Load and validate configuration for `workspace_root`.
    pub fn load(workspace_root: &Path) -> Result<KernelConfig, KernelError> {
        let network = std::env::var("CKERNEL_NETWORK").ok();
        Self::load_for_network(workspace_root, network.as_deref())
    }

    /// Load with an explicit network overlay instead of `CKERNEL_NETWORK`.
    pub fn load_for_network(
        workspace_root: &Path,
        network: Option<&str>,
    ) -> Result<KernelConfig, KernelError> {
        let mut builder = merge::merge_policy::builder_with_defaults()?;
        builder = sources::global_file::add_to_builder(builder)?;
        builder = sources::workspace_file::add_to_builder(builder, workspace_root, network)?;
        builder = builder.add_source(
            Environment::with_prefix("CKERNEL")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("trust")
                .try_parsing(true),
        );
        let config: KernelConfig = builder.build()?.try_deserialize()?;
        sources::workspace_file::apply(config, workspace_root)?.validated()
    }

    /// Load a single TOML file on top of the defaults.
    pub fn load_from_file(path: &Path) -> Result<KernelConfig, KernelError> {
        let config: KernelConfig = merge::merge_policy::builder_with_defaults()?
            .add_source(File::from(path))
            .build()?
            .try_deserialize()?;
        config.validated()
    }

    fn validated(self) -> Result<KernelConfig, KernelError> {
        self.validate().map_err(|errors| {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            KernelError::Config(format!(
                "Configuration validation failed:\n{}",
                messages.join("\n")
            ))
        })?;
        Ok(self)
    }
}
