//! Database configuration.

use serde::{Deserialize, Serialize};

/// Live-query worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveQueryConfig {
    /// Prefix for the names of live-query worker threads.
    pub worker_name_prefix: String,
    /// Max queued "serve this late listener" requests per query before
    /// falling back to a full re-run.
    pub attach_queue_capacity: usize,
}

impl Default for LiveQueryConfig {
    fn default() -> Self {
        Self {
            worker_name_prefix: "docql-live".to_string(),
            attach_queue_capacity: 64,
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub live: LiveQueryConfig,
}

impl DatabaseConfig {
    /// Parses a configuration from JSON. Absent fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
