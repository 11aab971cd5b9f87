use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The granularity at which policies are emitted: a cluster, a namespace,
/// and a label set. Two workloads with identical label-sets in the same
/// namespace are the same workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadIdentity {
    pub cluster: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
}

impl WorkloadIdentity {
    pub fn new(
        cluster: impl Into<String>,
        namespace: impl Into<String>,
        labels: BTreeMap<String, String>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            namespace: namespace.into(),
            labels,
        }
    }

    /// A stable hash of this identity, used for deterministic policy naming.
    pub fn identity_hash(&self) -> String {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        use std::hash::{Hash, Hasher};
        self.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}
