use async_trait::async_trait;
use policy_model::{FlowRecord, SystemEvent};

use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct FlowBatch {
    pub records: Vec<FlowRecord>,
    /// The maximum `monotonic_id` seen in this batch, if non-empty.
    pub max_id: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct EventBatch {
    pub events: Vec<SystemEvent>,
    pub max_id: Option<i64>,
}

/// Bounded, checkpointed log ingestion. A concrete implementation might
/// pull from an RDBMS, a streaming feed consumer, or a push RPC buffer;
/// this crate only ever sees bounded batches between checkpoints.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Returns flow records with `monotonic_id` in `(after_id, after_id + limit]`,
    /// ordered ascending by `monotonic_id`.
    async fn read_flows(&self, after_id: i64, limit: u32) -> Result<FlowBatch>;

    /// Returns system events with `monotonic_id` in `(after_id, after_id + limit]`,
    /// ordered ascending by `monotonic_id`.
    async fn read_events(&self, after_id: i64, limit: u32) -> Result<EventBatch>;

    /// Removes log rows older than `before_timestamp`.
    async fn purge(&self, before_timestamp: chrono::DateTime<chrono::Utc>) -> Result<u64>;
}

#[async_trait]
impl<T: LogSource + ?Sized> LogSource for std::sync::Arc<T> {
    async fn read_flows(&self, after_id: i64, limit: u32) -> Result<FlowBatch> {
        (**self).read_flows(after_id, limit).await
    }

    async fn read_events(&self, after_id: i64, limit: u32) -> Result<EventBatch> {
        (**self).read_events(after_id, limit).await
    }

    async fn purge(&self, before_timestamp: chrono::DateTime<chrono::Utc>) -> Result<u64> {
        (**self).purge(before_timestamp).await
    }
}
