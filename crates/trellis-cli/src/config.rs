//! Engine configuration loader for the `trellis` binary.
//!
//! Reads a TOML file (default `trellis.toml` in the working directory) into
//! [`EngineConfig`]. Falls back to defaults when the file is missing,
//! unreadable, malformed, or holds settings the engine would reject.

use std::path::Path;

use trellis_types::config::EngineConfig;

/// Default config file name, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "trellis.toml";

/// Load engine configuration from `path`.
///
/// - Missing file: [`EngineConfig::default()`], logged at debug.
/// - Unreadable, malformed, or invalid file: defaults, logged as a warning.
pub async fn load_engine_config(path: &Path) -> EngineConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return EngineConfig::default();
        }
    };

    let config = match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            return EngineConfig::default();
        }
    };

    if let Err(err) = config.validate() {
        tracing::warn!("Ignoring {}: {err}, using defaults", path.display());
        return EngineConfig::default();
    }
    config
}
