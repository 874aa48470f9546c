//! TCAP configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// TCAP layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcapConfig {
    /// Invocation timer in milliseconds; bounds every wait on a
    /// transaction mailbox (default 30s)
    pub invoke_timeout_ms: u64,
}

impl Default for TcapConfig {
    fn default() -> Self {
        Self {
            invoke_timeout_ms: 30000,
        }
    }
}

impl TcapConfig {
    /// Load configuration from file
    pub fn from_file(path: &str) -> Result<Self, crate::TcapError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::TcapError::Config(e.to_string()))?;

        serde_json::from_str(&content).map_err(|e| crate::TcapError::Config(e.to_string()))
    }

    /// Get invocation timer as Duration
    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_millis(self.invoke_timeout_ms)
    }
}
