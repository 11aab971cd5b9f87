pub mod cluster_source;
pub mod log_source;
pub mod policy_store;

pub use cluster_source::ClusterSource;
pub use log_source::{EventBatch, FlowBatch, LogSource};
pub use policy_store::{PolicyFilter, PolicyStore};
