//! Merge rules: defaults every layer is merged over.

use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with the kernel defaults applied.
pub fn builder_with_defaults() -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError>
{
    Config::builder()
        .set_default("network", "mock")?
        .set_default("unification", "by-origin")?
        .set_default("publish.max_owner_rounds", 10)?
        .set_default("publish.min_output_satoshis", 1)?
        .set_default("publish.max_satoshis", 100_000_000)?
        .set_default("logging.level", "info")?
        .set_default("logging.format", "text")
}
