pub mod admission;
pub mod network;
pub mod reconcile;
pub mod system;

pub use admission::{AdmissionDiscovery, AdmissionTemplate, AdmissionWorker, FileAccessSummary};
pub use network::{NetworkDiscovery, RoundConfig};
pub use reconcile::RoundOutcome;
pub use system::SystemDiscovery;
