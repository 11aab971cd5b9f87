use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use policy_model::{
    AdmissionPolicy, DiscoveredNetworkPolicy, DiscoveredSystemPolicy, PolicyKind, PolicyStatus,
};
use uuid::Uuid;

use crate::error::{DiscoveryError, Result};

/// The three policy payload shapes a `PolicyStore` can hold, kept as a
/// closed sum rather than a dynamically-typed row so that callers pattern
/// match instead of string-branching on `kind`.
#[derive(Debug, Clone)]
pub enum AnyPolicy {
    Network(DiscoveredNetworkPolicy),
    System(DiscoveredSystemPolicy),
    Admission(AdmissionPolicy),
}

impl AnyPolicy {
    pub fn id(&self) -> Uuid {
        match self {
            AnyPolicy::Network(p) => p.id,
            AnyPolicy::System(p) => p.id,
            AnyPolicy::Admission(p) => p.id,
        }
    }

    pub fn kind(&self) -> PolicyKind {
        match self {
            AnyPolicy::Network(_) => PolicyKind::Network,
            AnyPolicy::System(_) => PolicyKind::System,
            AnyPolicy::Admission(_) => PolicyKind::Admission,
        }
    }

    pub fn status(&self) -> PolicyStatus {
        match self {
            AnyPolicy::Network(p) => p.status,
            AnyPolicy::System(p) => p.status,
            AnyPolicy::Admission(p) => p.status,
        }
    }

    pub fn set_status(&mut self, status: PolicyStatus) {
        match self {
            AnyPolicy::Network(p) => p.status = status,
            AnyPolicy::System(p) => p.status = status,
            AnyPolicy::Admission(p) => p.status = status,
        }
    }

    pub fn supersedes_id(&self) -> Option<Uuid> {
        match self {
            AnyPolicy::Network(p) => p.supersedes_id,
            AnyPolicy::System(p) => p.supersedes_id,
            AnyPolicy::Admission(_) => None,
        }
    }

    pub fn cluster(&self) -> &str {
        match self {
            AnyPolicy::Network(p) => &p.identity.cluster,
            AnyPolicy::System(p) => &p.identity.cluster,
            AnyPolicy::Admission(p) => &p.identity.cluster,
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            AnyPolicy::Network(p) => &p.identity.namespace,
            AnyPolicy::System(p) => &p.identity.namespace,
            AnyPolicy::Admission(p) => &p.identity.namespace,
        }
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        match self {
            AnyPolicy::Network(p) => &p.selector,
            AnyPolicy::System(p) => &p.selector,
            AnyPolicy::Admission(p) => &p.identity.labels,
        }
    }

    pub fn generated_at(&self) -> DateTime<Utc> {
        match self {
            AnyPolicy::Network(p) => p.generated_at,
            AnyPolicy::System(p) => p.generated_at,
            AnyPolicy::Admission(p) => p.generated_at,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PolicyFilter {
    pub cluster: Option<String>,
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl PolicyFilter {
    /// Label filter uses subset match: every key/value pair named in the
    /// filter must be present in the candidate's labels.
    pub fn matches(&self, policy: &AnyPolicy) -> bool {
        if let Some(cluster) = &self.cluster {
            if policy.cluster() != cluster {
                return false;
            }
        }
        if let Some(namespace) = &self.namespace {
            if policy.namespace() != namespace {
                return false;
            }
        }
        self.labels
            .iter()
            .all(|(k, v)| policy.labels().get(k) == Some(v))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UpsertOutcome {
    pub id: Uuid,
    pub created: bool,
}

/// Upsert/query/supersede persistence abstraction for discovered policies.
/// Backing engines are pluggable; the store hides engine-specific SQL, and
/// is scoped to a single process-wide configuration — no per-call
/// connection handles are exposed.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Atomic per-policy: identity collision (by id) updates the payload
    /// and timestamp; otherwise inserts.
    async fn upsert(&self, policies: Vec<AnyPolicy>) -> Result<Vec<UpsertOutcome>>;

    /// Atomic; refuses if `old_id` is already outdated.
    async fn mark_outdated(&self, old_id: Uuid, new_id: Uuid) -> Result<()>;

    /// Returns only `latest` policies of the given kind matching `filter`.
    async fn query(&self, kind: PolicyKind, filter: PolicyFilter) -> Result<Vec<AnyPolicy>>;

    /// Removes `outdated` policies generated before `before`. Never
    /// removes `latest` policies. Returns the number of rows removed.
    async fn purge(&self, before: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
impl<T: PolicyStore + ?Sized> PolicyStore for std::sync::Arc<T> {
    async fn upsert(&self, policies: Vec<AnyPolicy>) -> Result<Vec<UpsertOutcome>> {
        (**self).upsert(policies).await
    }

    async fn mark_outdated(&self, old_id: Uuid, new_id: Uuid) -> Result<()> {
        (**self).mark_outdated(old_id, new_id).await
    }

    async fn query(&self, kind: PolicyKind, filter: PolicyFilter) -> Result<Vec<AnyPolicy>> {
        (**self).query(kind, filter).await
    }

    async fn purge(&self, before: DateTime<Utc>) -> Result<u64> {
        (**self).purge(before).await
    }
}

/// In-memory `PolicyStore`, used by the discovery engines' own unit tests
/// and as a lightweight example implementation of the port.
#[derive(Debug, Default)]
pub struct InMemoryPolicyStore {
    policies: tokio::sync::RwLock<Vec<AnyPolicy>>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn upsert(&self, policies: Vec<AnyPolicy>) -> Result<Vec<UpsertOutcome>> {
        let mut guard = self.policies.write().await;
        let mut outcomes = Vec::with_capacity(policies.len());
        for policy in policies {
            let id = policy.id();
            if let Some(existing) = guard.iter_mut().find(|p| p.id() == id) {
                *existing = policy;
                outcomes.push(UpsertOutcome { id, created: false });
            } else {
                guard.push(policy);
                outcomes.push(UpsertOutcome { id, created: true });
            }
        }
        Ok(outcomes)
    }

    async fn mark_outdated(&self, old_id: Uuid, new_id: Uuid) -> Result<()> {
        let mut guard = self.policies.write().await;
        let Some(old) = guard.iter_mut().find(|p| p.id() == old_id) else {
            return Err(DiscoveryError::PolicyConflict(format!(
                "no such policy {old_id}"
            )));
        };
        if old.status() == PolicyStatus::Outdated {
            return Err(DiscoveryError::PolicyConflict(format!(
                "{old_id} is already outdated"
            )));
        }
        old.set_status(PolicyStatus::Outdated);
        drop(guard);
        tracing::debug!(%old_id, %new_id, "marked policy outdated");
        Ok(())
    }

    async fn query(&self, kind: PolicyKind, filter: PolicyFilter) -> Result<Vec<AnyPolicy>> {
        let guard = self.policies.read().await;
        Ok(guard
            .iter()
            .filter(|p| p.kind() == kind && p.status() == PolicyStatus::Latest)
            .filter(|p| filter.matches(p))
            .cloned()
            .collect())
    }

    async fn purge(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut guard = self.policies.write().await;
        let before_len = guard.len();
        guard.retain(|p| !(p.status() == PolicyStatus::Outdated && p.generated_at() < before));
        Ok((before_len - guard.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy_model::{Action, Direction, Peer, PolicyStatus, WorkloadIdentity};

    fn sample_network_policy(supersedes: Option<Uuid>) -> DiscoveredNetworkPolicy {
        DiscoveredNetworkPolicy {
            id: Uuid::new_v4(),
            identity: WorkloadIdentity::new("c1", "ns1", BTreeMap::new()),
            selector: BTreeMap::new(),
            direction: Direction::Egress,
            peer: Peer::ReservedEntity {
                name: "world".into(),
            },
            ports: vec![],
            http_rules: vec![],
            action: Action::Allow,
            status: PolicyStatus::Latest,
            supersedes_id: supersedes,
            generated_at: Utc::now(),
            flow_ids: vec![],
        }
    }

    #[tokio::test]
    async fn mark_outdated_refuses_already_outdated() {
        let store = InMemoryPolicyStore::new();
        let policy = sample_network_policy(None);
        let id = policy.id;
        store
            .upsert(vec![AnyPolicy::Network(policy)])
            .await
            .unwrap();
        store.mark_outdated(id, Uuid::new_v4()).await.unwrap();
        let err = store.mark_outdated(id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::PolicyConflict(_)));
    }

    #[tokio::test]
    async fn supersede_chain_has_no_cycle() {
        let store = InMemoryPolicyStore::new();
        let first = sample_network_policy(None);
        let first_id = first.id;
        let mut second = sample_network_policy(Some(first_id));
        second.id = Uuid::new_v4();
        let second_id = second.id;
        store
            .upsert(vec![
                AnyPolicy::Network(first),
                AnyPolicy::Network(second),
            ])
            .await
            .unwrap();
        store.mark_outdated(first_id, second_id).await.unwrap();

        let all = store
            .query(PolicyKind::Network, PolicyFilter::default())
            .await
            .unwrap();
        // Walk the supersede chain from every node; it must terminate.
        for policy in &all {
            let mut seen = std::collections::HashSet::new();
            let mut cursor = policy.supersedes_id();
            while let Some(id) = cursor {
                assert!(seen.insert(id), "cycle detected at {id}");
                cursor = all.iter().find(|p| p.id() == id).and_then(|p| p.supersedes_id());
            }
        }
    }

    #[tokio::test]
    async fn purge_never_removes_latest() {
        let store = InMemoryPolicyStore::new();
        let mut old = sample_network_policy(None);
        old.status = PolicyStatus::Outdated;
        old.generated_at = Utc::now() - chrono::Duration::days(30);
        let latest = sample_network_policy(None);
        store
            .upsert(vec![AnyPolicy::Network(old), AnyPolicy::Network(latest.clone())])
            .await
            .unwrap();

        let removed = store.purge(Utc::now()).await.unwrap();
        assert_eq!(removed, 1);
        let remaining = store
            .query(PolicyKind::Network, PolicyFilter::default())
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id(), latest.id);
    }
}
