use async_trait::async_trait;
use policy_model::ClusterSnapshot;

use crate::error::Result;

/// Cluster resource enumeration: namespaces, services, pods and their
/// labels/IPs. A concrete implementation talks to a Kubernetes API
/// client, a cached KVM-service mirror, or a static onboarding record;
/// this crate only consumes the resulting snapshot.
#[async_trait]
pub trait ClusterSource: Send + Sync {
    async fn snapshot(&self, cluster: &str) -> Result<ClusterSnapshot>;
}

#[async_trait]
impl<T: ClusterSource + ?Sized> ClusterSource for std::sync::Arc<T> {
    async fn snapshot(&self, cluster: &str) -> Result<ClusterSnapshot> {
        (**self).snapshot(cluster).await
    }
}
