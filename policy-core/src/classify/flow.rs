use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use policy_model::{ClusterSnapshot, FlowRecord, Peer};

/// The vocabulary of symbolic peers not addressable by CIDR/IP in the
/// policy dialect.
static RESERVED_ENTITIES: Lazy<BTreeSet<&'static str>> = Lazy::new(|| {
    [
        "world",
        "host",
        "remote-node",
        "cluster",
        "health",
        "unmanaged",
        "kube-apiserver",
        "ingress",
    ]
    .into_iter()
    .collect()
});

/// Classifies a flow record's destination into one of: external CIDR,
/// reserved entity, FQDN, in-cluster service, in-cluster pod.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowClassifier;

impl FlowClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classifies `flow`'s destination against `snapshot`. Deterministic:
    /// the same flow and the same snapshot always classify the same way.
    pub fn classify(&self, flow: &FlowRecord, snapshot: &ClusterSnapshot) -> Peer {
        if RESERVED_ENTITIES.contains(flow.dst_id.as_str()) {
            return Peer::ReservedEntity {
                name: flow.dst_id.clone(),
            };
        }

        if flow.dns_query.is_some() {
            // The exporter already resolved the query to `dst_ip` within
            // the flow window; we trust that resolution rather than
            // re-resolving DNS ourselves.
            return Peer::FqdnSet {
                fqdns: vec![flow.dns_query.clone().expect("checked is_some")],
            };
        }

        if let Some(service) = snapshot.service_by_cluster_ip(&flow.dst_ip) {
            return Peer::K8sService {
                namespace: service.namespace.clone(),
                name: service.name.clone(),
            };
        }

        if let Some(pod) = snapshot.pod_by_ip(&flow.dst_ip) {
            return Peer::PodSelector {
                namespace: pod.namespace.clone(),
                labels: pod.labels.clone(),
            };
        }

        Peer::CidrSet {
            cidrs: vec![cidr_for(&flow.dst_ip)],
        }
    }
}

fn cidr_for(ip: &str) -> String {
    if ip.contains(':') {
        format!("{ip}/128")
    } else {
        format!("{ip}/32")
    }
}

/// Strips configured-ignore label keys from a label map before it
/// reaches an aggregator.
pub fn strip_ignored_labels(
    labels: &BTreeMap<String, String>,
    ignore: &BTreeSet<String>,
) -> BTreeMap<String, String> {
    labels
        .iter()
        .filter(|(k, _)| !ignore.contains(k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use policy_model::{Protocol, ServiceInfo, Verdict};

    fn base_flow() -> FlowRecord {
        FlowRecord {
            src_id: "src".into(),
            dst_id: "dst".into(),
            src_labels: BTreeMap::new(),
            dst_labels: BTreeMap::new(),
            src_namespace: "default".into(),
            dst_namespace: "kube-system".into(),
            dst_ip: "10.96.0.1".into(),
            dst_port: 53,
            protocol: Protocol::Udp,
            verdict: Verdict::Allow,
            dns_query: None,
            http: None,
            timestamp: Utc::now(),
            monotonic_id: 1,
        }
    }

    #[test]
    fn e4_matches_cluster_ip_service() {
        let mut snapshot = ClusterSnapshot::default();
        snapshot.services.push(ServiceInfo {
            name: "kube-dns".into(),
            namespace: "kube-system".into(),
            cluster_ip: "10.96.0.1".into(),
            labels: BTreeMap::new(),
        });
        let classifier = FlowClassifier::new();
        let peer = classifier.classify(&base_flow(), &snapshot);
        match peer {
            Peer::K8sService { name, namespace } => {
                assert_eq!(name, "kube-dns");
                assert_eq!(namespace, "kube-system");
            }
            other => panic!("expected k8s_service, got {other:?}"),
        }
    }

    #[test]
    fn reserved_entity_takes_priority() {
        let mut flow = base_flow();
        flow.dst_id = "world".into();
        let classifier = FlowClassifier::new();
        let peer = classifier.classify(&flow, &ClusterSnapshot::default());
        assert!(matches!(peer, Peer::ReservedEntity { name } if name == "world"));
    }

    #[test]
    fn falls_back_to_cidr() {
        let mut flow = base_flow();
        flow.dst_ip = "203.0.113.7".into();
        let classifier = FlowClassifier::new();
        let peer = classifier.classify(&flow, &ClusterSnapshot::default());
        assert!(matches!(peer, Peer::CidrSet { cidrs } if cidrs == vec!["203.0.113.7/32".to_string()]));
    }

    #[test]
    fn classification_is_deterministic() {
        let flow = base_flow();
        let snapshot = ClusterSnapshot::default();
        let classifier = FlowClassifier::new();
        assert_eq!(
            classifier.classify(&flow, &snapshot),
            classifier.classify(&flow, &snapshot)
        );
    }
}
