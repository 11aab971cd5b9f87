use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use policy_core::error::{DiscoveryError, Result};
use policy_core::ports::ClusterSource;
use policy_model::ClusterSnapshot;
use tokio::sync::RwLock;
use tracing::debug;

/// `ClusterSource` for the `onboarded` info mode: cluster resources come
/// from a static JSON record dropped on disk by the onboarding process,
/// rather than a live Kubernetes or KVM-service client.
#[derive(Debug)]
pub struct StaticClusterSource {
    directory: PathBuf,
    cache: RwLock<HashMap<String, ClusterSnapshot>>,
}

impl StaticClusterSource {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn snapshot_path(&self, cluster: &str) -> PathBuf {
        self.directory.join(format!("{cluster}.json"))
    }
}

#[async_trait]
impl ClusterSource for StaticClusterSource {
    async fn snapshot(&self, cluster: &str) -> Result<ClusterSnapshot> {
        if let Some(cached) = self.cache.read().await.get(cluster) {
            return Ok(cached.clone());
        }

        let path = self.snapshot_path(cluster);
        debug!(cluster, path = %path.display(), "loading onboarded cluster snapshot");
        let contents = tokio::fs::read_to_string(&path).await.map_err(|e| {
            DiscoveryError::NotOnboarded(format!(
                "no onboarding record for cluster {cluster}: {e}"
            ))
        })?;
        let snapshot: ClusterSnapshot = serde_json::from_str(&contents)
            .map_err(|e| DiscoveryError::MalformedRecord(e.to_string()))?;

        self.cache
            .write()
            .await
            .insert(cluster.to_string(), snapshot.clone());
        Ok(snapshot)
    }
}
