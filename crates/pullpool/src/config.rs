//! Pool configuration.

use serde::{Deserialize, Serialize};

/// Default concurrency limit when none is configured.
pub const DEFAULT_LIMIT: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("pool limit must be at least 1")]
    ZeroLimit,
}

/// Options recognized at pool construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of live instances, and of simultaneously active
    /// dispatch workers.
    pub limit: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_limit(self.limit)
    }
}

pub(crate) fn check_limit(limit: usize) -> Result<(), ConfigError> {
    if limit == 0 {
        return Err(ConfigError::ZeroLimit);
    }
    Ok(())
}
