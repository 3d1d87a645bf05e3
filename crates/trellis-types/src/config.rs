//! Engine configuration.
//!
//! `EngineConfig` controls how a workflow run is scheduled. It is typically
//! loaded from `trellis.toml`; every field has a default, and a workflow
//! document may override individual fields.

use serde::{Deserialize, Serialize};

use crate::document::WorkflowDocument;
use crate::error::ValidationError;

/// Scheduling knobs for a workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of handlers executing at once across the whole run.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Stop right after any wave that contains a Failed node.
    #[serde(default = "default_fail_fast")]
    pub fail_fast: bool,

    /// Upper bound on scheduling loop iterations before the run is declared
    /// Stalled.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Delay between retry attempts for nodes that do not set their own.
    #[serde(default = "default_retry_delay_ms")]
    pub default_retry_delay_ms: u64,
}

fn default_max_parallel() -> usize {
    10
}

fn default_fail_fast() -> bool {
    true
}

fn default_max_iterations() -> u32 {
    100
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            fail_fast: default_fail_fast(),
            max_iterations: default_max_iterations(),
            default_retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl EngineConfig {
    /// Reject settings that would prevent any node from ever running.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_parallel == 0 {
            return Err(ValidationError::InvalidSetting(
                "max_parallel must be >= 1".to_string(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(ValidationError::InvalidSetting(
                "max_iterations must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply the scheduling overrides declared in a workflow document.
    pub fn overridden_by(&self, document: &WorkflowDocument) -> Self {
        Self {
            max_parallel: document.max_parallel.unwrap_or(self.max_parallel),
            fail_fast: document.fail_fast.unwrap_or(self.fail_fast),
            max_iterations: document.max_iterations.unwrap_or(self.max_iterations),
            default_retry_delay_ms: self.default_retry_delay_ms,
        }
    }
}
