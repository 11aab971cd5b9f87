use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use policy_model::{
    Action, DiscoveredSystemPolicy, EventOperation, PolicyKind, Protocol, Severity, SystemEvent,
    WorkloadIdentity,
};
use uuid::Uuid;

use crate::aggregation::PathAggregator;
use crate::discovery::network::RoundConfig;
use crate::discovery::reconcile::{reconcile_candidates, RoundOutcome};
use crate::error::Result;
use crate::ports::policy_store::AnyPolicy;
use crate::ports::{LogSource, PolicyFilter, PolicyStore};

/// Orchestrates a single system-policy discovery round: pull event batch
/// → group by workload+source-binary → aggregate paths → reconcile.
pub struct SystemDiscovery<L, S> {
    log_source: L,
    store: S,
    config: RoundConfig,
    paths: PathAggregator,
    last_event_id: tokio::sync::Mutex<i64>,
}

impl<L, S> SystemDiscovery<L, S>
where
    L: LogSource,
    S: PolicyStore,
{
    pub fn new(log_source: L, store: S, config: RoundConfig, path_threshold: u32) -> Self {
        Self {
            log_source,
            store,
            config,
            paths: PathAggregator::new(path_threshold),
            last_event_id: tokio::sync::Mutex::new(0),
        }
    }

    pub async fn checkpoint(&self) -> i64 {
        *self.last_event_id.lock().await
    }

    pub async fn run_round(&self) -> Result<RoundOutcome> {
        let mut checkpoint = self.last_event_id.lock().await;
        let before = *checkpoint;

        let batch = self
            .log_source
            .read_events(before, self.config.limit)
            .await?;
        if (batch.events.len() as u32) < self.config.trigger {
            tracing::debug!(
                read = batch.events.len(),
                trigger = self.config.trigger,
                "system round below trigger, aborting"
            );
            return Ok(RoundOutcome {
                records_read: batch.events.len() as u64,
                checkpoint_before: before,
                checkpoint_after: before,
                ..Default::default()
            });
        }

        let candidates = self.build_candidates(&batch.events).await?;
        let emitted = candidates.len() as u64;

        let (applied, dropped) = reconcile_candidates(
            &self.store,
            PolicyKind::System,
            candidates.into_iter().map(AnyPolicy::System).collect(),
            group_key,
            |a, b| match (a, b) {
                (AnyPolicy::System(a), AnyPolicy::System(b)) => {
                    is_strict_subset(a, b)
                }
                _ => false,
            },
            |a, b| match (a, b) {
                (AnyPolicy::System(a), AnyPolicy::System(b)) => is_equivalent(a, b),
                _ => false,
            },
            Utc::now(),
        )
        .await?;

        let new_checkpoint = batch.max_id.unwrap_or(before);
        *checkpoint = new_checkpoint;

        Ok(RoundOutcome {
            records_read: batch.events.len() as u64,
            checkpoint_before: before,
            checkpoint_after: new_checkpoint,
            candidates_emitted: emitted,
            candidates_applied: applied,
            candidates_dropped: dropped,
        })
    }

    async fn build_candidates(
        &self,
        events: &[SystemEvent],
    ) -> Result<Vec<DiscoveredSystemPolicy>> {
        let mut groups: HashMap<WorkloadGroupKey, WorkloadGroup> = HashMap::new();

        for event in events {
            let key = WorkloadGroupKey {
                cluster: event.cluster.clone(),
                namespace: event.namespace.clone(),
                pod: event.pod.clone(),
                container: event.container.clone(),
                source_binary: event.source_binary.clone(),
            };
            let group = groups.entry(key).or_default();
            match event.operation {
                EventOperation::Process => {
                    group.process_paths.insert(event.resource_path_or_endpoint.clone());
                }
                EventOperation::File => {
                    group.file_paths.insert(event.resource_path_or_endpoint.clone());
                }
                EventOperation::Network => {
                    group.protocols.insert(Protocol::Tcp);
                }
            }
        }

        let mut out = Vec::with_capacity(groups.len());
        for (key, group) in groups {
            let identity = WorkloadIdentity::new(key.cluster.clone(), key.namespace.clone(), Default::default());
            let existing = self
                .store
                .query(PolicyKind::System, PolicyFilter {
                    cluster: Some(key.cluster.clone()),
                    namespace: Some(key.namespace.clone()),
                    labels: Default::default(),
                })
                .await?;
            let prior = existing.into_iter().find_map(|p| match p {
                AnyPolicy::System(s) if s.identity.namespace == key.namespace => Some(s),
                _ => None,
            });

            let process_paths: Vec<String> = group.process_paths.into_iter().collect();
            let file_paths: Vec<String> = group.file_paths.into_iter().collect();

            let process = match &prior {
                Some(p) => self.paths.aggregate_merge(&process_paths, &p.process),
                None => self.paths.aggregate(&process_paths),
            };
            let file = match &prior {
                Some(p) => self.paths.aggregate_merge(&file_paths, &p.file),
                None => self.paths.aggregate(&file_paths),
            };

            out.push(DiscoveredSystemPolicy {
                id: Uuid::new_v4(),
                identity,
                selector: Default::default(),
                severity: Severity::Info,
                process,
                file,
                network: group.protocols.into_iter().collect(),
                action: Action::Allow,
                status: policy_model::PolicyStatus::Latest,
                supersedes_id: None,
                generated_at: Utc::now(),
            });
        }
        Ok(out)
    }
}

fn is_strict_subset(a: &DiscoveredSystemPolicy, b: &DiscoveredSystemPolicy) -> bool {
    let a_paths: BTreeSet<&str> = a
        .process
        .match_paths
        .iter()
        .chain(a.process.match_directories.iter())
        .chain(a.file.match_paths.iter())
        .chain(a.file.match_directories.iter())
        .map(|p| p.path.as_str())
        .collect();
    let b_paths: BTreeSet<&str> = b
        .process
        .match_paths
        .iter()
        .chain(b.process.match_directories.iter())
        .chain(b.file.match_paths.iter())
        .chain(b.file.match_directories.iter())
        .map(|p| p.path.as_str())
        .collect();
    a_paths.is_subset(&b_paths) && a_paths != b_paths
}

/// True when `a` and `b` describe the same process/file/network rule
/// set, ignoring identity fields that differ between rounds even when
/// nothing about the workload's behavior actually changed.
fn is_equivalent(a: &DiscoveredSystemPolicy, b: &DiscoveredSystemPolicy) -> bool {
    let paths = |p: &DiscoveredSystemPolicy| -> BTreeSet<&str> {
        p.process
            .match_paths
            .iter()
            .chain(p.process.match_directories.iter())
            .chain(p.file.match_paths.iter())
            .chain(p.file.match_directories.iter())
            .map(|p| p.path.as_str())
            .collect()
    };
    let a_network: BTreeSet<&Protocol> = a.network.iter().collect();
    let b_network: BTreeSet<&Protocol> = b.network.iter().collect();
    paths(a) == paths(b) && a_network == b_network
}

fn group_key(policy: &AnyPolicy) -> String {
    match policy {
        AnyPolicy::System(p) => format!("{}/{}", p.identity.cluster, p.identity.namespace),
        _ => String::new(),
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct WorkloadGroupKey {
    cluster: String,
    namespace: String,
    pod: String,
    container: String,
    source_binary: String,
}

#[derive(Debug, Default)]
struct WorkloadGroup {
    process_paths: BTreeSet<String>,
    file_paths: BTreeSet<String>,
    protocols: BTreeSet<Protocol>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::log_source::{EventBatch, FlowBatch};
    use crate::ports::policy_store::InMemoryPolicyStore;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct FakeLogSource {
        batches: StdMutex<Vec<Vec<SystemEvent>>>,
    }

    #[async_trait]
    impl LogSource for FakeLogSource {
        async fn read_flows(&self, _after_id: i64, _limit: u32) -> Result<FlowBatch> {
            Ok(FlowBatch::default())
        }

        async fn read_events(&self, _after_id: i64, _limit: u32) -> Result<EventBatch> {
            let mut guard = self.batches.lock().unwrap();
            let events = if guard.is_empty() {
                Vec::new()
            } else {
                guard.remove(0)
            };
            let max_id = events.iter().map(|e| e.monotonic_id).max();
            Ok(EventBatch { events, max_id })
        }

        async fn purge(&self, _before: chrono::DateTime<Utc>) -> Result<u64> {
            Ok(0)
        }
    }

    fn event(id: i64, path: &str) -> SystemEvent {
        SystemEvent {
            cluster: "c1".into(),
            namespace: "ns".into(),
            pod: "pod-a".into(),
            container: "main".into(),
            container_image: "img".into(),
            source_binary: "app".into(),
            operation: EventOperation::File,
            resource_path_or_endpoint: path.into(),
            timestamp: Utc::now(),
            monotonic_id: id,
        }
    }

    fn config() -> RoundConfig {
        RoundConfig {
            cluster: "c1".into(),
            limit: 100,
            trigger: 2,
            ignore_labels: Default::default(),
        }
    }

    #[tokio::test]
    async fn below_trigger_does_not_advance_checkpoint() {
        let log = FakeLogSource {
            batches: StdMutex::new(vec![vec![event(1, "/etc/config")]]),
        };
        let discovery = SystemDiscovery::new(log, InMemoryPolicyStore::new(), config(), 3);
        let outcome = discovery.run_round().await.unwrap();
        assert_eq!(outcome.checkpoint_before, outcome.checkpoint_after);
    }

    #[tokio::test]
    async fn above_trigger_aggregates_and_advances() {
        let log = FakeLogSource {
            batches: StdMutex::new(vec![vec![
                event(1, "/etc/config"),
                event(2, "/tmp/log"),
            ]]),
        };
        let discovery = SystemDiscovery::new(log, InMemoryPolicyStore::new(), config(), 3);
        let outcome = discovery.run_round().await.unwrap();
        assert!(outcome.checkpoint_after > outcome.checkpoint_before);
        assert_eq!(outcome.candidates_applied, 1);
    }

    #[tokio::test]
    async fn identical_candidate_does_not_duplicate_latest() {
        let log = FakeLogSource {
            batches: StdMutex::new(vec![
                vec![event(1, "/etc/config"), event(2, "/tmp/log")],
                vec![event(3, "/etc/config"), event(4, "/tmp/log")],
            ]),
        };
        let discovery = SystemDiscovery::new(log, InMemoryPolicyStore::new(), config(), 3);
        discovery.run_round().await.unwrap();
        let second = discovery.run_round().await.unwrap();
        // Rediscovering the exact same process/file behavior must not
        // insert a second "latest" policy for the same workload group.
        assert_eq!(second.candidates_applied, 0);
        assert_eq!(second.candidates_dropped, 1);
    }
}
