use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use policy_model::{
    AdmissionPolicy, AdmissionPrecondition, PodInfo, PolicyKind, WorkloadIdentity,
};
use regex::Regex;
use serde_json::Value;
use uuid::Uuid;

use crate::discovery::reconcile::RoundOutcome;
use crate::error::Result;
use crate::ports::policy_store::AnyPolicy;
use crate::ports::{ClusterSource, PolicyFilter, PolicyStore};

static TIMESTAMPED_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\.\.[0-9]{4}_[0-9]{2}_[0-9]{2}.*").unwrap());

/// A file-access summary as produced by `SystemDiscovery`, keyed by
/// container name, used only by the auto-mount decision rule here.
pub trait FileAccessSummary {
    fn accessed_paths(&self, container: &str) -> Vec<String>;
}

/// From pod snapshots plus observed process/file summaries, decides which
/// admission rules to emit (e.g., disable service-account-token
/// auto-mount).
#[derive(Debug, Clone, Copy, Default)]
pub struct AdmissionDiscovery;

impl AdmissionDiscovery {
    pub fn new() -> Self {
        Self
    }

    /// Builds an admission policy from the pods matching a selector
    /// (already filtered by the caller from a `ClusterSource` snapshot),
    /// using `template` as the base validation pattern and `summary` for
    /// the observed-file-access lookup. Only the first matching pod is
    /// inspected, per the accepted "first pod only" limitation.
    pub fn discover(
        &self,
        cluster: &str,
        namespace: &str,
        selector: &std::collections::BTreeMap<String, String>,
        matching_pods: &[PodInfo],
        template: &Value,
        target_kind: &str,
        summary: &dyn FileAccessSummary,
    ) -> Result<Option<AdmissionPolicy>> {
        let Some(representative) = matching_pods.first() else {
            return Ok(None);
        };

        let auto_mount = self.should_auto_mount(representative, summary);

        let (validation_pattern, preconditions) = if target_kind == "Pod" {
            (template.clone(), Vec::new())
        } else {
            rewrite_for_controller(template, "template", selector)
        };

        Ok(Some(AdmissionPolicy {
            id: Uuid::new_v4(),
            identity: WorkloadIdentity::new(cluster, namespace, selector.clone()),
            target_kind: target_kind.to_string(),
            validation_pattern,
            preconditions,
            auto_mount_sa_token: auto_mount,
            status: policy_model::PolicyStatus::Latest,
            generated_at: chrono::Utc::now(),
        }))
    }

    /// Decides whether the service-account token should be auto-mounted
    /// for the representative pod: `true` iff at least one container's
    /// observed file accesses include its resolved token mount path. On
    /// any observation failure, conservatively returns `true`.
    fn should_auto_mount(&self, pod: &PodInfo, summary: &dyn FileAccessSummary) -> bool {
        for container in &pod.containers {
            let Some(mount_path) = &container.sa_token_mount_path else {
                continue;
            };
            let accessed = summary.accessed_paths(&container.name);
            if accessed
                .iter()
                .any(|observed| paths_match(mount_path, observed))
            {
                return true;
            }
        }
        // No container observed to use its token: but an empty
        // observation set is itself ambiguous (failure vs. genuinely
        // unused), so without any containers carrying a mount path at
        // all we fall back to the conservative default.
        if pod.containers.iter().all(|c| c.sa_token_mount_path.is_none()) {
            return true;
        }
        false
    }
}

/// One configured admission target: the namespace+selector to watch, the
/// workload-object kind the validation pattern is written against, and
/// the base pattern itself.
#[derive(Debug, Clone)]
pub struct AdmissionTemplate {
    pub cluster: String,
    pub namespace: String,
    pub selector: BTreeMap<String, String>,
    pub target_kind: String,
    pub pattern: Value,
}

/// Drives `AdmissionDiscovery` as a scheduler round: for each configured
/// template, inspects matching pods and the workload's observed file
/// accesses (from `SystemDiscovery`'s stored policies) and reconciles the
/// resulting admission policy against the store.
pub struct AdmissionWorker<C, S> {
    cluster_source: C,
    store: S,
    discovery: AdmissionDiscovery,
    templates: Vec<AdmissionTemplate>,
}

impl<C, S> AdmissionWorker<C, S>
where
    C: ClusterSource,
    S: PolicyStore,
{
    pub fn new(cluster_source: C, store: S, templates: Vec<AdmissionTemplate>) -> Self {
        Self {
            cluster_source,
            store,
            discovery: AdmissionDiscovery::new(),
            templates,
        }
    }

    pub async fn run_round(&self) -> Result<RoundOutcome> {
        let mut emitted = 0u64;
        let mut applied = 0u64;
        let mut dropped = 0u64;

        for template in &self.templates {
            let snapshot = self.cluster_source.snapshot(&template.cluster).await?;
            let matching_pods: Vec<PodInfo> = snapshot
                .pods_matching(&template.namespace, &template.selector)
                .into_iter()
                .cloned()
                .collect();
            if matching_pods.is_empty() {
                continue;
            }

            let summary = self.file_access_summary(&template.cluster, &template.namespace).await?;

            let Some(candidate) = self.discovery.discover(
                &template.cluster,
                &template.namespace,
                &template.selector,
                &matching_pods,
                &template.pattern,
                &template.target_kind,
                &summary,
            )?
            else {
                continue;
            };
            emitted += 1;

            let existing = self
                .store
                .query(
                    PolicyKind::Admission,
                    PolicyFilter {
                        cluster: Some(template.cluster.clone()),
                        namespace: Some(template.namespace.clone()),
                        labels: template.selector.clone(),
                    },
                )
                .await?
                .into_iter()
                .find_map(|p| match p {
                    AnyPolicy::Admission(a) if a.target_kind == candidate.target_kind => Some(a),
                    _ => None,
                });

            match existing {
                Some(prior) if prior.is_equivalent_to(&candidate) => {
                    dropped += 1;
                }
                Some(prior) => {
                    self.store.mark_outdated(prior.id, candidate.id).await?;
                    self.store.upsert(vec![AnyPolicy::Admission(candidate)]).await?;
                    applied += 1;
                }
                None => {
                    self.store.upsert(vec![AnyPolicy::Admission(candidate)]).await?;
                    applied += 1;
                }
            }
        }

        Ok(RoundOutcome {
            records_read: 0,
            checkpoint_before: 0,
            checkpoint_after: 0,
            candidates_emitted: emitted,
            candidates_applied: applied,
            candidates_dropped: dropped,
        })
    }

    /// Builds a `FileAccessSummary` from the workload's latest system
    /// policy. The store does not retain a per-container breakdown, so
    /// every container is reported the same observed path set; this
    /// tolerates the auto-mount decision rule's own path-comparison
    /// fuzziness and is the coarsest information the store exposes.
    async fn file_access_summary(
        &self,
        cluster: &str,
        namespace: &str,
    ) -> Result<StaticSummary> {
        let existing = self
            .store
            .query(
                PolicyKind::System,
                PolicyFilter {
                    cluster: Some(cluster.to_string()),
                    namespace: Some(namespace.to_string()),
                    labels: Default::default(),
                },
            )
            .await?;

        let mut paths = Vec::new();
        for policy in existing {
            if let AnyPolicy::System(p) = policy {
                paths.extend(p.process.match_paths.iter().map(|r| r.path.clone()));
                paths.extend(p.process.match_directories.iter().map(|r| r.path.clone()));
                paths.extend(p.file.match_paths.iter().map(|r| r.path.clone()));
                paths.extend(p.file.match_directories.iter().map(|r| r.path.clone()));
            }
        }

        Ok(StaticSummary(std::collections::HashMap::from([(
            "*".to_string(),
            paths,
        )])))
    }
}

/// Compares two filesystem paths tolerating the two known rewrite
/// quirks: a timestamped intermediate segment is elided, and the leading
/// path component may optionally be stripped (symlink-resolution
/// artifact).
pub fn paths_match(expected: &str, observed: &str) -> bool {
    let normalize = |p: &str| -> String {
        let without_timestamp = TIMESTAMPED_SEGMENT.replace_all(p, "");
        without_timestamp.trim_end_matches('/').to_string()
    };
    let a = normalize(expected);
    let b = normalize(observed);
    if a == b {
        return true;
    }
    // Strip the leading path component on either side and retry.
    let strip_leading = |p: &str| -> String {
        let mut segments: Vec<&str> = p.split('/').filter(|s| !s.is_empty()).collect();
        if !segments.is_empty() {
            segments.remove(0);
        }
        format!("/{}", segments.join("/"))
    };
    strip_leading(&a) == b || a == strip_leading(&b)
}

/// Rewrites a `Pod`-targeted validation pattern for a controller kind
/// (Deployment/StatefulSet/Job/…): wraps the pattern under
/// `{spec: {<template_key>: <pattern>}}` and appends one precondition per
/// selector label.
fn rewrite_for_controller(
    template: &Value,
    template_key: &str,
    selector: &std::collections::BTreeMap<String, String>,
) -> (Value, Vec<AdmissionPrecondition>) {
    let rewritten = serde_json::json!({
        "spec": { template_key: template.clone() }
    });
    let preconditions = selector
        .iter()
        .map(|(k, v)| AdmissionPrecondition {
            key: format!(
                "{{{{request.object.spec.{template_key}.metadata.labels.{k}}}}} || ''"
            ),
            operator: "Equals".to_string(),
            value: v.clone(),
        })
        .collect();
    (rewritten, preconditions)
}

struct StaticSummary(std::collections::HashMap<String, Vec<String>>);

impl FileAccessSummary for StaticSummary {
    fn accessed_paths(&self, container: &str) -> Vec<String> {
        self.0
            .get(container)
            .or_else(|| self.0.get("*"))
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::policy_store::InMemoryPolicyStore;
    use async_trait::async_trait;
    use policy_model::{ClusterSnapshot, ContainerSpec};

    struct FakeClusterSource(ClusterSnapshot);

    #[async_trait]
    impl ClusterSource for FakeClusterSource {
        async fn snapshot(&self, _cluster: &str) -> Result<ClusterSnapshot> {
            Ok(self.0.clone())
        }
    }

    fn pod() -> PodInfo {
        PodInfo {
            name: "p".into(),
            namespace: "ns".into(),
            ip: "10.0.0.1".into(),
            labels: BTreeMap::from([("app".to_string(), "api".to_string())]),
            owner_kind: None,
            service_account: "default".into(),
            containers: vec![ContainerSpec {
                name: "main".into(),
                image: "img".into(),
                sa_token_mount_path: Some(
                    "/var/run/secrets/kubernetes.io/serviceaccount".into(),
                ),
            }],
        }
    }

    fn template() -> AdmissionTemplate {
        AdmissionTemplate {
            cluster: "c1".into(),
            namespace: "ns".into(),
            selector: BTreeMap::from([("app".to_string(), "api".to_string())]),
            target_kind: "Pod".into(),
            pattern: serde_json::json!({"pattern": "x"}),
        }
    }

    #[tokio::test]
    async fn first_round_inserts_one_latest_admission_policy() {
        let snapshot = ClusterSnapshot {
            cluster: "c1".into(),
            pods: vec![pod()],
            ..Default::default()
        };
        let worker = AdmissionWorker::new(
            FakeClusterSource(snapshot),
            InMemoryPolicyStore::new(),
            vec![template()],
        );
        let outcome = worker.run_round().await.unwrap();
        assert_eq!(outcome.candidates_applied, 1);
        assert_eq!(outcome.candidates_dropped, 0);
    }

    #[tokio::test]
    async fn second_identical_round_does_not_duplicate_latest() {
        let snapshot = ClusterSnapshot {
            cluster: "c1".into(),
            pods: vec![pod()],
            ..Default::default()
        };
        let worker = AdmissionWorker::new(
            FakeClusterSource(snapshot),
            InMemoryPolicyStore::new(),
            vec![template()],
        );
        worker.run_round().await.unwrap();
        let second = worker.run_round().await.unwrap();
        assert_eq!(second.candidates_applied, 0);
        assert_eq!(second.candidates_dropped, 1);
    }

    #[test]
    fn e2_sa_token_used_with_timestamp_and_leading_component_rewrite() {
        let expected = "/var/run/secrets/kubernetes.io/serviceaccount";
        let observed = "/run/secrets/kubernetes.io/serviceaccount/..2024_01_15_10_30/token";
        assert!(paths_match(expected, observed));
    }

    #[test]
    fn e3_unrelated_paths_do_not_match() {
        assert!(!paths_match(
            "/var/run/secrets/kubernetes.io/serviceaccount",
            "/etc/config"
        ));
    }

    #[test]
    fn e2_e3_auto_mount_decision() {
        let pod = PodInfo {
            name: "p".into(),
            namespace: "ns".into(),
            ip: "10.0.0.1".into(),
            labels: Default::default(),
            owner_kind: None,
            service_account: "default".into(),
            containers: vec![ContainerSpec {
                name: "main".into(),
                image: "img".into(),
                sa_token_mount_path: Some(
                    "/var/run/secrets/kubernetes.io/serviceaccount".into(),
                ),
            }],
        };

        let used = StaticSummary(std::collections::HashMap::from([(
            "main".to_string(),
            vec!["/run/secrets/kubernetes.io/serviceaccount".to_string()],
        )]));
        let discovery = AdmissionDiscovery::new();
        assert!(discovery.should_auto_mount(&pod, &used));

        let unused = StaticSummary(std::collections::HashMap::from([(
            "main".to_string(),
            vec!["/etc/config".to_string(), "/tmp/log".to_string()],
        )]));
        assert!(!discovery.should_auto_mount(&pod, &unused));
    }

    #[test]
    fn controller_rewrite_appends_label_preconditions() {
        let template = serde_json::json!({"pattern": "x"});
        let mut selector = std::collections::BTreeMap::new();
        selector.insert("app".to_string(), "api".to_string());
        let (pattern, preconditions) = rewrite_for_controller(&template, "template", &selector);
        assert_eq!(pattern["spec"]["template"]["pattern"], "x");
        assert_eq!(preconditions.len(), 1);
        assert_eq!(preconditions[0].value, "api");
    }
}
