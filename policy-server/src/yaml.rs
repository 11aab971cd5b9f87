use policy_core::ports::policy_store::AnyPolicy;
use policy_model::{Direction, Peer};
use serde::Serialize;

/// Renders a discovered policy as the Policy-YAML document a cluster
/// operator would review and apply, named deterministically from
/// `(cluster, identity-hash, direction, peer-hash)` so repeated discovery
/// rounds keep emitting the same document name for the same logical rule.
pub fn to_policy_yaml(policy: &AnyPolicy) -> Result<String, serde_yml::Error> {
    match policy {
        AnyPolicy::Network(p) => {
            let doc = NetworkPolicyDoc {
                api_version: "policy.discovery/v1",
                kind: "DiscoveredNetworkPolicy",
                metadata: Metadata {
                    name: network_policy_name(p),
                    namespace: p.identity.namespace.clone(),
                },
                spec: NetworkPolicySpec {
                    cluster: p.identity.cluster.clone(),
                    selector: p.selector.clone(),
                    direction: p.direction,
                    peer: p.peer.clone(),
                    ports: p.ports.clone(),
                    action: p.action,
                    status: p.status,
                },
            };
            serde_yml::to_string(&doc)
        }
        AnyPolicy::System(p) => {
            let doc = SystemPolicyDoc {
                api_version: "policy.discovery/v1",
                kind: "DiscoveredSystemPolicy",
                metadata: Metadata {
                    name: format!(
                        "{}-{}",
                        p.identity.cluster,
                        p.identity.identity_hash()
                    ),
                    namespace: p.identity.namespace.clone(),
                },
                spec: SystemPolicySpec {
                    cluster: p.identity.cluster.clone(),
                    selector: p.selector.clone(),
                    severity: p.severity,
                    process: p.process.clone(),
                    file: p.file.clone(),
                    network: p.network.clone(),
                    action: p.action,
                    status: p.status,
                },
            };
            serde_yml::to_string(&doc)
        }
        AnyPolicy::Admission(p) => {
            let doc = AdmissionPolicyDoc {
                api_version: "policy.discovery/v1",
                kind: "DiscoveredAdmissionPolicy",
                metadata: Metadata {
                    name: format!(
                        "{}-{}",
                        p.identity.cluster,
                        p.identity.identity_hash()
                    ),
                    namespace: p.identity.namespace.clone(),
                },
                spec: AdmissionPolicySpec {
                    target_kind: p.target_kind.clone(),
                    validation_pattern: p.validation_pattern.clone(),
                    preconditions: p.preconditions.clone(),
                    auto_mount_sa_token: p.auto_mount_sa_token,
                    status: p.status,
                },
            };
            serde_yml::to_string(&doc)
        }
    }
}

fn network_policy_name(p: &policy_model::DiscoveredNetworkPolicy) -> String {
    let direction = match p.direction {
        Direction::Ingress => "ingress",
        Direction::Egress => "egress",
    };
    format!(
        "{}-{}-{}-{}",
        p.identity.cluster,
        p.identity.identity_hash(),
        direction,
        peer_hash(&p.peer)
    )
}

fn peer_hash(peer: &Peer) -> String {
    peer.peer_hash()
}

#[derive(Serialize)]
struct Metadata {
    name: String,
    namespace: String,
}

#[derive(Serialize)]
struct NetworkPolicyDoc {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    metadata: Metadata,
    spec: NetworkPolicySpec,
}

#[derive(Serialize)]
struct NetworkPolicySpec {
    cluster: String,
    selector: std::collections::BTreeMap<String, String>,
    direction: Direction,
    peer: Peer,
    ports: Vec<policy_model::PortRule>,
    action: policy_model::Action,
    status: policy_model::PolicyStatus,
}

#[derive(Serialize)]
struct SystemPolicyDoc {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    metadata: Metadata,
    spec: SystemPolicySpec,
}

#[derive(Serialize)]
struct SystemPolicySpec {
    cluster: String,
    selector: std::collections::BTreeMap<String, String>,
    severity: policy_model::Severity,
    process: policy_model::ProcessFileRules,
    file: policy_model::ProcessFileRules,
    network: Vec<policy_model::Protocol>,
    action: policy_model::Action,
    status: policy_model::PolicyStatus,
}

#[derive(Serialize)]
struct AdmissionPolicyDoc {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    metadata: Metadata,
    spec: AdmissionPolicySpec,
}

#[derive(Serialize)]
struct AdmissionPolicySpec {
    target_kind: String,
    validation_pattern: serde_json::Value,
    preconditions: Vec<policy_model::AdmissionPrecondition>,
    auto_mount_sa_token: bool,
    status: policy_model::PolicyStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy_model::{Action, PolicyStatus, WorkloadIdentity};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn sample() -> AnyPolicy {
        AnyPolicy::Network(policy_model::DiscoveredNetworkPolicy {
            id: Uuid::new_v4(),
            identity: WorkloadIdentity::new("prod", "checkout", BTreeMap::new()),
            selector: BTreeMap::new(),
            direction: Direction::Egress,
            peer: Peer::ReservedEntity { name: "world".into() },
            ports: vec![],
            http_rules: vec![],
            action: Action::Allow,
            status: PolicyStatus::Latest,
            supersedes_id: None,
            generated_at: chrono::DateTime::from_timestamp(0, 0).unwrap(),
            flow_ids: vec![],
        })
    }

    #[test]
    fn naming_is_deterministic_across_renders() {
        let policy = sample();
        let first = to_policy_yaml(&policy).unwrap();
        let second = to_policy_yaml(&policy).unwrap();
        assert_eq!(first, second);
        assert!(first.contains("prod-"));
    }

    #[test]
    fn renders_as_valid_yaml_mapping() {
        let policy = sample();
        let rendered = to_policy_yaml(&policy).unwrap();
        let parsed: serde_yml::Value = serde_yml::from_str(&rendered).unwrap();
        assert!(parsed.get("spec").is_some());
    }
}
