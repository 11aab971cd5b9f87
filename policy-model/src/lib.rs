//! Shared types for the policy discovery engine: flow records, system
//! events, workload identity, discovered policies, and cluster snapshots.
//!
//! This crate performs no I/O. Every type here is plain data that crosses
//! a boundary (store row, RPC payload, or aggregator input/output).

pub mod cluster;
pub mod event;
pub mod flow;
pub mod identity;
pub mod policy;

pub use cluster::{ClusterSnapshot, ContainerSpec, PodInfo, ServiceInfo};
pub use event::{EventOperation, SystemEvent};
pub use flow::{FlowRecord, Protocol, Verdict};
pub use identity::WorkloadIdentity;
pub use policy::{
    Action, AdmissionPolicy, Direction, DiscoveredNetworkPolicy, DiscoveredSystemPolicy,
    HttpRule, PathRule, PolicyKind, PolicyStatus, Peer, PortRule, ProcessFileRules, Severity,
};
