use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flow::Protocol;
use crate::identity::WorkloadIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ingress,
    Egress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyStatus {
    Latest,
    Outdated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    Network,
    System,
    Admission,
}

/// A destination peer, kept as a closed sum of variants rather than a
/// string-tagged dynamic shape, per the redesign note against the
/// original string-branching dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Peer {
    CidrSet { cidrs: Vec<String> },
    ReservedEntity { name: String },
    FqdnSet { fqdns: Vec<String> },
    K8sService {
        namespace: String,
        name: String,
    },
    PodSelector {
        namespace: String,
        labels: BTreeMap<String, String>,
    },
}

impl Peer {
    /// A stable hash identifying this peer's *shape* (not its full
    /// contents), used both for reconciliation grouping and for
    /// deterministic policy naming.
    pub fn peer_hash(&self) -> String {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        use std::hash::{Hash, Hasher};
        match self {
            Peer::CidrSet { cidrs } => {
                let mut sorted = cidrs.clone();
                sorted.sort();
                ("cidr_set", sorted).hash(&mut hasher);
            }
            Peer::ReservedEntity { name } => ("reserved_entity", name).hash(&mut hasher),
            Peer::FqdnSet { fqdns } => {
                let mut sorted = fqdns.clone();
                sorted.sort();
                ("fqdn_set", sorted).hash(&mut hasher);
            }
            Peer::K8sService { namespace, name } => {
                ("k8s_service", namespace, name).hash(&mut hasher)
            }
            Peer::PodSelector { namespace, labels } => {
                ("pod_selector", namespace, labels).hash(&mut hasher)
            }
        }
        format!("{:016x}", hasher.finish())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRule {
    pub protocol: Protocol,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRule {
    pub method: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredNetworkPolicy {
    pub id: Uuid,
    pub identity: WorkloadIdentity,
    pub selector: BTreeMap<String, String>,
    pub direction: Direction,
    pub peer: Peer,
    pub ports: Vec<PortRule>,
    pub http_rules: Vec<HttpRule>,
    pub action: Action,
    pub status: PolicyStatus,
    pub supersedes_id: Option<Uuid>,
    pub generated_at: DateTime<Utc>,
    pub flow_ids: Vec<i64>,
}

impl DiscoveredNetworkPolicy {
    /// True when `self`'s port/http rule set is a strict subset of
    /// `other`'s, as required by the reconciliation rules in the
    /// network and system discovery round protocols.
    pub fn is_strict_subset_of(&self, other: &Self) -> bool {
        let self_ports: std::collections::BTreeSet<_> = self.ports.iter().collect();
        let other_ports: std::collections::BTreeSet<_> = other.ports.iter().collect();
        self_ports.is_subset(&other_ports) && self_ports != other_ports
    }

    /// True when `self` and `other` describe the same port/http rule set,
    /// ignoring identity fields (`id`, `status`, `generated_at`, `flow_ids`)
    /// that differ between rounds even when nothing actually changed.
    pub fn is_equivalent_to(&self, other: &Self) -> bool {
        let self_ports: std::collections::BTreeSet<_> = self.ports.iter().collect();
        let other_ports: std::collections::BTreeSet<_> = other.ports.iter().collect();
        let self_http: std::collections::BTreeSet<_> =
            self.http_rules.iter().map(|r| (&r.method, &r.path)).collect();
        let other_http: std::collections::BTreeSet<_> =
            other.http_rules.iter().map(|r| (&r.method, &r.path)).collect();
        self_ports == other_ports && self_http == other_http
    }
}

/// One entry of a system policy's `matchPaths`/`matchDirectories` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathRule {
    /// Exact file path, or a directory path ending in `/`.
    pub path: String,
    pub is_directory: bool,
    pub read_only: Option<bool>,
    pub owner_only: Option<bool>,
    pub from_source: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessFileRules {
    pub match_paths: Vec<PathRule>,
    pub match_directories: Vec<PathRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredSystemPolicy {
    pub id: Uuid,
    pub identity: WorkloadIdentity,
    pub selector: BTreeMap<String, String>,
    pub severity: Severity,
    pub process: ProcessFileRules,
    pub file: ProcessFileRules,
    pub network: Vec<Protocol>,
    pub action: Action,
    pub status: PolicyStatus,
    pub supersedes_id: Option<Uuid>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionPrecondition {
    pub key: String,
    pub operator: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionPolicy {
    pub id: Uuid,
    pub identity: WorkloadIdentity,
    pub target_kind: String,
    pub validation_pattern: serde_json::Value,
    pub preconditions: Vec<AdmissionPrecondition>,
    pub auto_mount_sa_token: bool,
    pub status: PolicyStatus,
    pub generated_at: DateTime<Utc>,
}

impl AdmissionPolicy {
    /// True when `self` and `other` describe the same validation rule,
    /// ignoring identity fields (`id`, `status`, `generated_at`) that
    /// differ between rounds even when nothing actually changed.
    pub fn is_equivalent_to(&self, other: &Self) -> bool {
        self.target_kind == other.target_kind
            && self.validation_pattern == other.validation_pattern
            && self.preconditions == other.preconditions
            && self.auto_mount_sa_token == other.auto_mount_sa_token
    }
}
