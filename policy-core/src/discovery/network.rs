use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::Utc;
use policy_model::{
    Action, ClusterSnapshot, Direction, DiscoveredNetworkPolicy, FlowRecord, HttpRule, Peer,
    PolicyKind, PortRule, Verdict, WorkloadIdentity,
};
use uuid::Uuid;

use crate::aggregation::{LabelAggregator, PortMerger};
use crate::classify::flow::strip_ignored_labels;
use crate::classify::FlowClassifier;
use crate::discovery::reconcile::{reconcile_candidates, RoundOutcome};
use crate::error::Result;
use crate::ports::policy_store::AnyPolicy;
use crate::ports::{ClusterSource, LogSource, PolicyStore};

/// Batch-size and filtering knobs for one discovery pipeline, shared by
/// `NetworkDiscovery` and `SystemDiscovery`.
#[derive(Debug, Clone)]
pub struct RoundConfig {
    pub cluster: String,
    pub limit: u32,
    pub trigger: u32,
    pub ignore_labels: BTreeSet<String>,
}

/// Orchestrates a single network-policy discovery round: pull flow batch
/// → classify → aggregate → merge → reconcile with the store.
pub struct NetworkDiscovery<L, C, S> {
    log_source: L,
    cluster_source: C,
    store: S,
    config: RoundConfig,
    classifier: FlowClassifier,
    labels: LabelAggregator,
    ports: PortMerger,
    last_flow_id: tokio::sync::Mutex<i64>,
}

impl<L, C, S> NetworkDiscovery<L, C, S>
where
    L: LogSource,
    C: ClusterSource,
    S: PolicyStore,
{
    pub fn new(log_source: L, cluster_source: C, store: S, config: RoundConfig) -> Self {
        Self {
            log_source,
            cluster_source,
            store,
            config,
            classifier: FlowClassifier::new(),
            labels: LabelAggregator::new(),
            ports: PortMerger::new(),
            last_flow_id: tokio::sync::Mutex::new(0),
        }
    }

    pub async fn checkpoint(&self) -> i64 {
        *self.last_flow_id.lock().await
    }

    /// Runs one round. Aborts (returns an outcome with no checkpoint
    /// advance) if the batch is below `trigger`, or if any step fails
    /// with a `TransientIO` error.
    pub async fn run_round(&self) -> Result<RoundOutcome> {
        let mut checkpoint = self.last_flow_id.lock().await;
        let before = *checkpoint;

        let batch = self.log_source.read_flows(before, self.config.limit).await?;
        if (batch.records.len() as u32) < self.config.trigger {
            tracing::debug!(
                read = batch.records.len(),
                trigger = self.config.trigger,
                "network round below trigger, aborting"
            );
            return Ok(RoundOutcome {
                records_read: batch.records.len() as u64,
                checkpoint_before: before,
                checkpoint_after: before,
                ..Default::default()
            });
        }

        let snapshot = self.cluster_source.snapshot(&self.config.cluster).await?;

        let candidates = self.build_candidates(&batch.records, &snapshot);
        let emitted = candidates.len() as u64;

        let (applied, dropped) = reconcile_candidates(
            &self.store,
            PolicyKind::Network,
            candidates.into_iter().map(AnyPolicy::Network).collect(),
            group_key,
            |a, b| match (a, b) {
                (AnyPolicy::Network(a), AnyPolicy::Network(b)) => a.is_strict_subset_of(b),
                _ => false,
            },
            |a, b| match (a, b) {
                (AnyPolicy::Network(a), AnyPolicy::Network(b)) => a.is_equivalent_to(b),
                _ => false,
            },
            Utc::now(),
        )
        .await?;

        let new_checkpoint = batch.max_id.unwrap_or(before);
        *checkpoint = new_checkpoint;

        Ok(RoundOutcome {
            records_read: batch.records.len() as u64,
            checkpoint_before: before,
            checkpoint_after: new_checkpoint,
            candidates_emitted: emitted,
            candidates_applied: applied,
            candidates_dropped: dropped,
        })
    }

    fn build_candidates(
        &self,
        records: &[FlowRecord],
        snapshot: &ClusterSnapshot,
    ) -> Vec<DiscoveredNetworkPolicy> {
        let mut groups: HashMap<GroupKey, Group> = HashMap::new();

        for flow in records {
            if flow.verdict != Verdict::Allow {
                continue;
            }

            let dst_peer = self.classifier.classify(flow, snapshot);
            self.fold_into_group(
                &mut groups,
                WorkloadIdentity::new(
                    self.config.cluster.clone(),
                    flow.src_namespace.clone(),
                    strip_ignored_labels(&flow.src_labels, &self.config.ignore_labels),
                ),
                Direction::Egress,
                dst_peer,
                flow,
            );

            let src_peer = reserved_or_pod(&flow.src_id, &flow.src_namespace, &flow.src_labels);
            self.fold_into_group(
                &mut groups,
                WorkloadIdentity::new(
                    self.config.cluster.clone(),
                    flow.dst_namespace.clone(),
                    strip_ignored_labels(&flow.dst_labels, &self.config.ignore_labels),
                ),
                Direction::Ingress,
                src_peer,
                flow,
            );
        }

        groups
            .into_values()
            .map(|group| self.finalize_group(group))
            .collect()
    }

    fn fold_into_group(
        &self,
        groups: &mut HashMap<GroupKey, Group>,
        identity: WorkloadIdentity,
        direction: Direction,
        peer: Peer,
        flow: &FlowRecord,
    ) {
        let key = GroupKey {
            identity: identity.clone(),
            direction,
            peer_shape: peer_shape_key(&peer),
        };
        let group = groups.entry(key).or_insert_with(|| Group {
            identity,
            direction,
            peer_samples: Vec::new(),
            ports: Vec::new(),
            http_rules: BTreeSet::new(),
            flow_ids: Vec::new(),
        });
        group.peer_samples.push(peer);
        group.ports.push(PortRule {
            protocol: flow.protocol,
            port: flow.dst_port,
        });
        if let Some(http) = &flow.http {
            group.http_rules.insert((http.method.clone(), http.path.clone()));
        }
        group.flow_ids.push(flow.monotonic_id);
    }

    fn finalize_group(&self, group: Group) -> DiscoveredNetworkPolicy {
        let peer = self.generalize_peer(&group.peer_samples);
        let ports = self.ports.merge(group.ports);
        let http_rules = group
            .http_rules
            .into_iter()
            .map(|(method, path)| HttpRule { method, path })
            .collect();

        DiscoveredNetworkPolicy {
            id: Uuid::new_v4(),
            selector: group.identity.labels.clone(),
            identity: group.identity,
            direction: group.direction,
            peer,
            ports,
            http_rules,
            action: Action::Allow,
            status: policy_model::PolicyStatus::Latest,
            supersedes_id: None,
            generated_at: Utc::now(),
            flow_ids: group.flow_ids,
        }
    }

    /// Collapses a set of observed peer samples of the same shape into
    /// one peer, generalizing `pod_selector` labels with the
    /// `LabelAggregator` when more than one distinct pod was observed.
    fn generalize_peer(&self, samples: &[Peer]) -> Peer {
        match &samples[0] {
            Peer::PodSelector { namespace, .. } => {
                let label_sets: Vec<BTreeMap<String, String>> = samples
                    .iter()
                    .filter_map(|p| match p {
                        Peer::PodSelector { labels, .. } => Some(labels.clone()),
                        _ => None,
                    })
                    .collect();
                Peer::PodSelector {
                    namespace: namespace.clone(),
                    labels: self.labels.find_common_selector(&label_sets),
                }
            }
            Peer::CidrSet { .. } => {
                let mut cidrs: BTreeSet<String> = BTreeSet::new();
                for sample in samples {
                    if let Peer::CidrSet { cidrs: c } = sample {
                        cidrs.extend(c.iter().cloned());
                    }
                }
                Peer::CidrSet {
                    cidrs: cidrs.into_iter().collect(),
                }
            }
            Peer::FqdnSet { .. } => {
                let mut fqdns: BTreeSet<String> = BTreeSet::new();
                for sample in samples {
                    if let Peer::FqdnSet { fqdns: f } = sample {
                        fqdns.extend(f.iter().cloned());
                    }
                }
                Peer::FqdnSet {
                    fqdns: fqdns.into_iter().collect(),
                }
            }
            other => other.clone(),
        }
    }
}

fn reserved_or_pod(
    src_id: &str,
    namespace: &str,
    labels: &BTreeMap<String, String>,
) -> Peer {
    const RESERVED: [&str; 4] = ["world", "host", "remote-node", "cluster"];
    if RESERVED.contains(&src_id) {
        Peer::ReservedEntity {
            name: src_id.to_string(),
        }
    } else {
        Peer::PodSelector {
            namespace: namespace.to_string(),
            labels: labels.clone(),
        }
    }
}

fn peer_shape_key(peer: &Peer) -> String {
    match peer {
        Peer::CidrSet { .. } => "cidr".into(),
        Peer::ReservedEntity { name } => format!("reserved:{name}"),
        Peer::FqdnSet { .. } => "fqdn".into(),
        Peer::K8sService { namespace, name } => format!("svc:{namespace}/{name}"),
        Peer::PodSelector { namespace, .. } => format!("pod:{namespace}"),
    }
}

fn group_key(policy: &AnyPolicy) -> String {
    match policy {
        AnyPolicy::Network(p) => format!(
            "{}/{}/{}/{:?}/{}",
            p.identity.cluster,
            p.identity.namespace,
            p.identity.identity_hash(),
            p.direction,
            peer_shape_key(&p.peer)
        ),
        _ => String::new(),
    }
}

struct GroupKey {
    identity: WorkloadIdentity,
    direction: Direction,
    peer_shape: String,
}

impl std::hash::Hash for GroupKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identity.hash(state);
        (self.direction as u8 as i32).hash(state);
        self.peer_shape.hash(state);
    }
}
impl PartialEq for GroupKey {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
            && self.direction as u8 == other.direction as u8
            && self.peer_shape == other.peer_shape
    }
}
impl Eq for GroupKey {}

struct Group {
    identity: WorkloadIdentity,
    direction: Direction,
    peer_samples: Vec<Peer>,
    ports: Vec<PortRule>,
    http_rules: BTreeSet<(String, String)>,
    flow_ids: Vec<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiscoveryError;
    use crate::ports::log_source::{EventBatch, FlowBatch};
    use crate::ports::policy_store::InMemoryPolicyStore;
    use async_trait::async_trait;
    use policy_model::Protocol;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FakeLogSource {
        batches: StdMutex<Vec<Vec<FlowRecord>>>,
        fail_next: AtomicBool,
    }

    #[async_trait]
    impl LogSource for FakeLogSource {
        async fn read_flows(&self, _after_id: i64, _limit: u32) -> Result<FlowBatch> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(DiscoveryError::TransientIO("simulated failure".into()));
            }
            let mut guard = self.batches.lock().unwrap();
            let records = if guard.is_empty() {
                Vec::new()
            } else {
                guard.remove(0)
            };
            let max_id = records.iter().map(|r| r.monotonic_id).max();
            Ok(FlowBatch { records, max_id })
        }

        async fn read_events(&self, _after_id: i64, _limit: u32) -> Result<EventBatch> {
            Ok(EventBatch::default())
        }

        async fn purge(&self, _before: chrono::DateTime<Utc>) -> Result<u64> {
            Ok(0)
        }
    }

    struct FakeClusterSource;

    #[async_trait]
    impl ClusterSource for FakeClusterSource {
        async fn snapshot(&self, cluster: &str) -> Result<ClusterSnapshot> {
            Ok(ClusterSnapshot {
                cluster: cluster.to_string(),
                ..Default::default()
            })
        }
    }

    fn flow(id: i64, ns: &str) -> FlowRecord {
        FlowRecord {
            src_id: "client".into(),
            dst_id: "server".into(),
            src_labels: BTreeMap::from([("app".to_string(), "client".to_string())]),
            dst_labels: BTreeMap::from([("app".to_string(), "server".to_string())]),
            src_namespace: ns.into(),
            dst_namespace: ns.into(),
            dst_ip: "203.0.113.1".into(),
            dst_port: 80,
            protocol: Protocol::Tcp,
            verdict: Verdict::Allow,
            dns_query: None,
            http: None,
            timestamp: Utc::now(),
            monotonic_id: id,
        }
    }

    fn config() -> RoundConfig {
        RoundConfig {
            cluster: "c1".into(),
            limit: 100,
            trigger: 2,
            ignore_labels: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn e6_below_trigger_does_not_advance_checkpoint() {
        let log = FakeLogSource {
            batches: StdMutex::new(vec![vec![flow(1, "ns")]]),
            fail_next: AtomicBool::new(false),
        };
        let discovery =
            NetworkDiscovery::new(log, FakeClusterSource, InMemoryPolicyStore::new(), config());
        let outcome = discovery.run_round().await.unwrap();
        assert_eq!(outcome.checkpoint_before, outcome.checkpoint_after);
        assert_eq!(outcome.candidates_applied, 0);
    }

    #[tokio::test]
    async fn checkpoint_advances_strictly_after_success() {
        let log = FakeLogSource {
            batches: StdMutex::new(vec![vec![flow(1, "ns"), flow(2, "ns")]]),
            fail_next: AtomicBool::new(false),
        };
        let discovery =
            NetworkDiscovery::new(log, FakeClusterSource, InMemoryPolicyStore::new(), config());
        let before = discovery.checkpoint().await;
        let outcome = discovery.run_round().await.unwrap();
        assert!(outcome.checkpoint_after > before);
        assert_eq!(discovery.checkpoint().await, outcome.checkpoint_after);
    }

    #[tokio::test]
    async fn failed_batch_read_does_not_advance_checkpoint() {
        let log = FakeLogSource {
            batches: StdMutex::new(vec![vec![flow(1, "ns"), flow(2, "ns")]]),
            fail_next: AtomicBool::new(true),
        };
        let discovery =
            NetworkDiscovery::new(log, FakeClusterSource, InMemoryPolicyStore::new(), config());
        let before = discovery.checkpoint().await;
        let err = discovery.run_round().await.unwrap_err();
        assert!(matches!(err, DiscoveryError::TransientIO(_)));
        assert_eq!(discovery.checkpoint().await, before);
    }

    #[tokio::test]
    async fn e5_wider_candidate_supersedes_existing_latest() {
        let log = FakeLogSource {
            batches: StdMutex::new(vec![
                vec![flow(1, "ns"), flow(2, "ns")],
                vec![{
                    let mut f = flow(3, "ns");
                    f.dst_port = 443;
                    f
                }, flow(4, "ns")],
            ]),
            fail_next: AtomicBool::new(false),
        };
        let discovery =
            NetworkDiscovery::new(log, FakeClusterSource, InMemoryPolicyStore::new(), config());
        discovery.run_round().await.unwrap();
        let second = discovery.run_round().await.unwrap();
        // Both the egress (client->cidr) and ingress (server<-pod) groups
        // widen from {80/tcp} to {80/tcp, 443/tcp} and supersede.
        assert_eq!(second.candidates_applied, 2);
        assert_eq!(second.candidates_dropped, 0);
    }

    #[tokio::test]
    async fn identical_candidate_does_not_duplicate_latest() {
        let log = FakeLogSource {
            batches: StdMutex::new(vec![
                vec![flow(1, "ns"), flow(2, "ns")],
                vec![flow(3, "ns"), flow(4, "ns")],
            ]),
            fail_next: AtomicBool::new(false),
        };
        let store = InMemoryPolicyStore::new();
        let discovery = NetworkDiscovery::new(log, FakeClusterSource, store, config());
        discovery.run_round().await.unwrap();
        let second = discovery.run_round().await.unwrap();
        // Rediscovering the exact same behavior must not insert a second
        // "latest" policy for the same identity+selector+direction+peer.
        assert_eq!(second.candidates_applied, 0);
        assert_eq!(second.candidates_dropped, 2);
    }
}
