//! Workspace sources: `ckernel.toml`, its per-network overlay and the trust list.

use crate::config::KernelConfig;
use crate::error::KernelError;
use config::builder::DefaultState;
use config::ConfigBuilder;
use config::ConfigError;
use config::File;
use std::path::Path;
use tracing::debug;

pub const WORKSPACE_FILE: &str = "ckernel.toml";

/// One trusted txid per line; `#` starts a comment.
pub const TRUST_FILE: &str = "ckernel.trust";

/// Add `ckernel.toml` and, when a network is selected, `ckernel.<network>.toml`.
///
/// The selected network also overrides the `network` key so the overlay and the
/// cache namespace cannot disagree.
pub fn add_to_builder(
    mut builder: ConfigBuilder<DefaultState>,
    workspace_root: &Path,
    network: Option<&str>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let base = workspace_root.join(WORKSPACE_FILE);
    if base.is_file() {
        builder = builder.add_source(File::from(base));
    }

    if let Some(network) = network {
        let overlay = workspace_root.join(format!("ckernel.{}.toml", network));
        if overlay.is_file() {
            builder = builder.add_source(File::from(overlay));
        } else {
            debug!(network, config_path = %overlay.display(), "No network overlay");
        }
        builder = builder.set_override("network", network)?;
    }

    Ok(builder)
}

/// Entries of the workspace trust list, empty when the file is absent.
pub fn read_trust_list(workspace_root: &Path) -> Result<Vec<String>, KernelError> {
    let path = workspace_root.join(TRUST_FILE);
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(&path)
        .map_err(|e| KernelError::Config(format!("Cannot read {}: {}", path.display(), e)))?;
    Ok(text
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(|line| line.to_ascii_lowercase())
        .collect())
}

/// Anchor a relative cache path at the workspace and fold in the trust list.
pub fn apply(mut config: KernelConfig, workspace_root: &Path) -> Result<KernelConfig, KernelError> {
    if let Some(path) = config.cache.path.take() {
        config.cache.path = Some(if path.is_relative() {
            workspace_root.join(path)
        } else {
            path
        });
    }
    for txid in read_trust_list(workspace_root)? {
        if !config.trust.contains(&txid) {
            config.trust.push(txid);
        }
    }
    Ok(config)
}
