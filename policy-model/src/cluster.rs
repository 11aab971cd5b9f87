use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A point-in-time snapshot of cluster resources, as returned by a
/// `ClusterSource`. This crate only defines the shape; enumerating the
/// actual cluster is an external collaborator's responsibility.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub cluster: String,
    pub namespaces: Vec<String>,
    pub services: Vec<ServiceInfo>,
    pub pods: Vec<PodInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub namespace: String,
    pub cluster_ip: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub ip: String,
    pub labels: BTreeMap<String, String>,
    pub owner_kind: Option<String>,
    pub service_account: String,
    pub containers: Vec<ContainerSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Where, if anywhere, the projected service-account-token volume is
    /// mounted in this container. `None` when the pod has no such volume.
    pub sa_token_mount_path: Option<String>,
}

impl ClusterSnapshot {
    pub fn service_by_cluster_ip(&self, ip: &str) -> Option<&ServiceInfo> {
        self.services.iter().find(|s| s.cluster_ip == ip)
    }

    pub fn pod_by_ip(&self, ip: &str) -> Option<&PodInfo> {
        self.pods.iter().find(|p| p.ip == ip)
    }

    pub fn pods_matching(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Vec<&PodInfo> {
        self.pods
            .iter()
            .filter(|p| {
                p.namespace == namespace
                    && selector.iter().all(|(k, v)| p.labels.get(k) == Some(v))
            })
            .collect()
    }
}
