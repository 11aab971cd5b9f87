use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOperation {
    Process,
    File,
    Network,
}

/// One line of a per-container process/file/network event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub cluster: String,
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub container_image: String,
    pub source_binary: String,
    pub operation: EventOperation,
    pub resource_path_or_endpoint: String,
    pub timestamp: DateTime<Utc>,
    pub monotonic_id: i64,
}
