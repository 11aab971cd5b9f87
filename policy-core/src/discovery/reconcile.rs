use std::collections::HashMap;

use chrono::{DateTime, Utc};
use policy_model::PolicyKind;

use crate::error::Result;
use crate::ports::policy_store::{AnyPolicy, PolicyFilter, PolicyStore};

/// Outcome of reconciling one discovery round's candidates against a
/// `PolicyStore`, reported back to the `Scheduler`'s status RPC.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundOutcome {
    pub records_read: u64,
    pub checkpoint_before: i64,
    pub checkpoint_after: i64,
    pub candidates_emitted: u64,
    pub candidates_applied: u64,
    pub candidates_dropped: u64,
}

/// Diffs `candidates` against the store's current `latest` policies of
/// `kind` and applies the insert/update/supersede/drop rules shared by
/// both `NetworkDiscovery` and `SystemDiscovery`:
///
/// - No existing `latest` with the same group key: insert as `latest`.
/// - Existing `latest` is a strict subset of the candidate: mark existing
///   `outdated`, insert the candidate as `latest` with `supersedes_id`.
/// - Candidate is a subset of the existing `latest`: drop the candidate.
/// - Neither subsumes the other: insert the candidate as an independent
///   `latest` (a second policy under the same group key).
pub async fn reconcile_candidates<S: PolicyStore + ?Sized>(
    store: &S,
    kind: PolicyKind,
    candidates: Vec<AnyPolicy>,
    group_key: impl Fn(&AnyPolicy) -> String,
    is_strict_subset: impl Fn(&AnyPolicy, &AnyPolicy) -> bool,
    is_equivalent: impl Fn(&AnyPolicy, &AnyPolicy) -> bool,
    now: DateTime<Utc>,
) -> Result<(u64, u64)> {
    let existing = store.query(kind, PolicyFilter::default()).await?;
    let mut by_group: HashMap<String, Vec<AnyPolicy>> = HashMap::new();
    for policy in existing {
        by_group.entry(group_key(&policy)).or_default().push(policy);
    }

    let mut applied = 0u64;
    let mut dropped = 0u64;

    for candidate in candidates {
        let key = group_key(&candidate);
        let bucket = by_group.entry(key.clone()).or_default();

        if bucket
            .iter()
            .any(|existing| is_equivalent(existing, &candidate))
        {
            // Steady state: rediscovering the same behavior every round
            // must not insert a second "latest" policy for this group.
            dropped += 1;
            continue;
        }

        if let Some(pos) = bucket
            .iter()
            .position(|existing| is_strict_subset(existing, &candidate))
        {
            let old = bucket.remove(pos);
            store.mark_outdated(old.id(), candidate.id()).await?;
            store.upsert(vec![candidate.clone()]).await?;
            bucket.push(candidate);
            applied += 1;
            continue;
        }

        if bucket
            .iter()
            .any(|existing| is_strict_subset(&candidate, existing))
        {
            dropped += 1;
            continue;
        }

        store.upsert(vec![candidate.clone()]).await?;
        bucket.push(candidate);
        applied += 1;
    }

    tracing::debug!(applied, dropped, "reconciled round at {now}");
    Ok((applied, dropped))
}
