use async_trait::async_trait;
use chrono::{DateTime, Utc};
use policy_core::error::{DiscoveryError, Result};
use policy_core::ports::policy_store::{AnyPolicy, PolicyFilter, UpsertOutcome};
use policy_core::ports::log_source::{EventBatch, FlowBatch};
use policy_core::ports::{LogSource, PolicyStore};
use policy_model::PolicyKind;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

/// `sqlx`-backed `PolicyStore`/`LogSource`, chosen as the self-contained
/// demo/test backend: a reader can run the whole system against a single
/// file with no external services. Each logical table from the
/// persisted-state layout becomes one `CREATE TABLE IF NOT EXISTS`.
#[derive(Debug, Clone)]
pub struct SqlStore {
    pool: SqlitePool,
    schema_lock: std::sync::Arc<tokio::sync::Mutex<()>>,
}

impl SqlStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        info!(database_url, "connecting to policy store");
        let pool = SqlitePool::connect(database_url).await?;
        Ok(Self {
            pool,
            schema_lock: std::sync::Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    /// Schema setup is protected by a single global mutex, per the
    /// concurrency model's "global store mutex" requirement.
    pub async fn initialize_schema(&self) -> anyhow::Result<()> {
        let _guard = self.schema_lock.lock().await;
        debug!("initializing policy store schema");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS network_policy (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                namespace TEXT NOT NULL,
                cluster_id TEXT NOT NULL,
                workspace_id TEXT,
                labels TEXT NOT NULL,
                status TEXT NOT NULL,
                yaml TEXT NOT NULL,
                payload TEXT NOT NULL,
                generated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS system_policy (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                namespace TEXT NOT NULL,
                cluster_id TEXT NOT NULL,
                workspace_id TEXT,
                labels TEXT NOT NULL,
                status TEXT NOT NULL,
                yaml TEXT NOT NULL,
                payload TEXT NOT NULL,
                generated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS admission_policy (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                namespace TEXT NOT NULL,
                cluster_id TEXT NOT NULL,
                workspace_id TEXT,
                labels TEXT NOT NULL,
                status TEXT NOT NULL,
                yaml TEXT NOT NULL,
                payload TEXT NOT NULL,
                generated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS network_log (
                monotonic_id INTEGER PRIMARY KEY,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS system_log (
                monotonic_id INTEGER PRIMARY KEY,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS system_alert (
                id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS system_summary (
                id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                generated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workload_process_file_set (
                id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                generated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// `Admin(dbclear)`: truncates every policy and log table. Used to
    /// reset a demo cluster to a clean slate.
    pub async fn dbclear(&self) -> anyhow::Result<()> {
        for table in [
            "network_policy",
            "system_policy",
            "admission_policy",
            "network_log",
            "system_log",
            "system_alert",
            "system_summary",
            "workload_process_file_set",
        ] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&self.pool)
                .await?;
        }
        info!("store cleared by admin request");
        Ok(())
    }

    fn table_for(kind: PolicyKind) -> &'static str {
        match kind {
            PolicyKind::Network => "network_policy",
            PolicyKind::System => "system_policy",
            PolicyKind::Admission => "admission_policy",
        }
    }
}

fn row_to_policy(row: &sqlx::sqlite::SqliteRow) -> Result<AnyPolicy> {
    let payload: String = row.try_get("payload").map_err(sql_err)?;
    let kind: String = row.try_get("kind").map_err(sql_err)?;
    match kind.as_str() {
        "network" => serde_json::from_str(&payload)
            .map(AnyPolicy::Network)
            .map_err(|e| DiscoveryError::MalformedRecord(e.to_string())),
        "system" => serde_json::from_str(&payload)
            .map(AnyPolicy::System)
            .map_err(|e| DiscoveryError::MalformedRecord(e.to_string())),
        "admission" => serde_json::from_str(&payload)
            .map(AnyPolicy::Admission)
            .map_err(|e| DiscoveryError::MalformedRecord(e.to_string())),
        other => Err(DiscoveryError::MalformedRecord(format!(
            "unknown policy kind in store row: {other}"
        ))),
    }
}

fn sql_err(e: sqlx::Error) -> DiscoveryError {
    DiscoveryError::TransientIO(e.to_string())
}

#[async_trait]
impl PolicyStore for SqlStore {
    async fn upsert(&self, policies: Vec<AnyPolicy>) -> Result<Vec<UpsertOutcome>> {
        let mut outcomes = Vec::with_capacity(policies.len());
        for policy in policies {
            let table = Self::table_for(policy.kind());
            let id = policy.id().to_string();
            let kind = match policy.kind() {
                PolicyKind::Network => "network",
                PolicyKind::System => "system",
                PolicyKind::Admission => "admission",
            };
            let labels = serde_json::to_string(policy.labels()).map_err(json_err)?;
            let payload = match &policy {
                AnyPolicy::Network(p) => serde_json::to_string(p),
                AnyPolicy::System(p) => serde_json::to_string(p),
                AnyPolicy::Admission(p) => serde_json::to_string(p),
            }
            .map_err(json_err)?;
            let yaml = crate::yaml::to_policy_yaml(&policy).unwrap_or_default();
            let status = format!("{:?}", policy.status()).to_lowercase();
            let name = deterministic_name(&policy);

            let existing: Option<i64> = sqlx::query_scalar(&format!(
                "SELECT 1 FROM {table} WHERE id = ?"
            ))
            .bind(&id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_err)?;
            let created = existing.is_none();

            sqlx::query(&format!(
                r#"
                INSERT INTO {table}
                    (id, kind, name, namespace, cluster_id, workspace_id, labels, status, yaml, payload, generated_at)
                VALUES (?, ?, ?, ?, ?, NULL, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    yaml = excluded.yaml,
                    payload = excluded.payload,
                    generated_at = excluded.generated_at
                "#
            ))
            .bind(&id)
            .bind(kind)
            .bind(&name)
            .bind(policy.namespace())
            .bind(policy.cluster())
            .bind(&labels)
            .bind(&status)
            .bind(&yaml)
            .bind(&payload)
            .bind(policy.generated_at().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;

            outcomes.push(UpsertOutcome { id: policy.id(), created });
        }
        Ok(outcomes)
    }

    async fn mark_outdated(&self, old_id: Uuid, new_id: Uuid) -> Result<()> {
        // The row might live in any of the three policy tables; try each.
        for table in ["network_policy", "system_policy", "admission_policy"] {
            let status: Option<String> = sqlx::query_scalar(&format!(
                "SELECT status FROM {table} WHERE id = ?"
            ))
            .bind(old_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_err)?;

            let Some(status) = status else { continue };
            if status == "outdated" {
                return Err(DiscoveryError::PolicyConflict(format!(
                    "{old_id} is already outdated"
                )));
            }
            sqlx::query(&format!("UPDATE {table} SET status = 'outdated' WHERE id = ?"))
                .bind(old_id.to_string())
                .execute(&self.pool)
                .await
                .map_err(sql_err)?;
            debug!(%old_id, %new_id, "marked policy outdated");
            return Ok(());
        }
        Err(DiscoveryError::PolicyConflict(format!(
            "no such policy {old_id}"
        )))
    }

    async fn query(&self, kind: PolicyKind, filter: PolicyFilter) -> Result<Vec<AnyPolicy>> {
        let table = Self::table_for(kind);
        let mut sql = format!("SELECT * FROM {table} WHERE status = 'latest'");
        if filter.cluster.is_some() {
            sql.push_str(" AND cluster_id = ?");
        }
        if filter.namespace.is_some() {
            sql.push_str(" AND namespace = ?");
        }
        let mut query = sqlx::query(&sql);
        if let Some(cluster) = &filter.cluster {
            query = query.bind(cluster);
        }
        if let Some(namespace) = &filter.namespace {
            query = query.bind(namespace);
        }

        let rows = query.fetch_all(&self.pool).await.map_err(sql_err)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let policy = row_to_policy(row)?;
            if filter.labels.is_empty() || filter.matches(&policy) {
                out.push(policy);
            }
        }
        Ok(out)
    }

    async fn purge(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut removed = 0u64;
        for table in ["network_policy", "system_policy", "admission_policy"] {
            let result = sqlx::query(&format!(
                "DELETE FROM {table} WHERE status = 'outdated' AND generated_at < ?"
            ))
            .bind(before.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
            removed += result.rows_affected();
        }
        Ok(removed)
    }
}

#[async_trait]
impl LogSource for SqlStore {
    async fn read_flows(&self, after_id: i64, limit: u32) -> Result<FlowBatch> {
        let rows = sqlx::query(
            "SELECT monotonic_id, payload FROM network_log WHERE monotonic_id > ? ORDER BY monotonic_id ASC LIMIT ?",
        )
        .bind(after_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(sql_err)?;

        let mut records = Vec::with_capacity(rows.len());
        let mut max_id = None;
        for row in rows {
            let id: i64 = row.try_get("monotonic_id").map_err(sql_err)?;
            let payload: String = row.try_get("payload").map_err(sql_err)?;
            match serde_json::from_str(&payload) {
                Ok(record) => {
                    records.push(record);
                    max_id = Some(id);
                }
                Err(e) => {
                    tracing::warn!(error = %e, monotonic_id = id, "dropping malformed flow record");
                }
            }
        }
        Ok(FlowBatch { records, max_id })
    }

    async fn read_events(&self, after_id: i64, limit: u32) -> Result<EventBatch> {
        let rows = sqlx::query(
            "SELECT monotonic_id, payload FROM system_log WHERE monotonic_id > ? ORDER BY monotonic_id ASC LIMIT ?",
        )
        .bind(after_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(sql_err)?;

        let mut events = Vec::with_capacity(rows.len());
        let mut max_id = None;
        for row in rows {
            let id: i64 = row.try_get("monotonic_id").map_err(sql_err)?;
            let payload: String = row.try_get("payload").map_err(sql_err)?;
            match serde_json::from_str(&payload) {
                Ok(event) => {
                    events.push(event);
                    max_id = Some(id);
                }
                Err(e) => {
                    tracing::warn!(error = %e, monotonic_id = id, "dropping malformed system event");
                }
            }
        }
        Ok(EventBatch { events, max_id })
    }

    async fn purge(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut removed = 0u64;
        for table in ["network_log", "system_log"] {
            let result = sqlx::query(&format!("DELETE FROM {table} WHERE created_at < ?"))
                .bind(before.to_rfc3339())
                .execute(&self.pool)
                .await
                .map_err(sql_err)?;
            removed += result.rows_affected();
        }
        Ok(removed)
    }
}

fn json_err(e: serde_json::Error) -> DiscoveryError {
    DiscoveryError::MalformedRecord(e.to_string())
}

/// Deterministic name from `(cluster, identity-hash, direction, peer-hash)`
/// so repeated discovery yields stable names for the same logical policy.
fn deterministic_name(policy: &AnyPolicy) -> String {
    match policy {
        AnyPolicy::Network(p) => format!(
            "{}-{}-{:?}-{}",
            p.identity.cluster,
            p.identity.identity_hash(),
            p.direction,
            p.peer.peer_hash()
        )
        .to_lowercase(),
        AnyPolicy::System(p) => format!(
            "{}-{}-system",
            p.identity.cluster,
            p.identity.identity_hash()
        ),
        AnyPolicy::Admission(p) => format!(
            "{}-{}-admission",
            p.identity.cluster,
            p.identity.identity_hash()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy_model::{Action, Direction, Peer, PolicyStatus, WorkloadIdentity};
    use std::collections::BTreeMap;

    async fn store() -> SqlStore {
        let store = SqlStore::connect("sqlite::memory:").await.unwrap();
        store.initialize_schema().await.unwrap();
        store
    }

    fn sample_policy() -> AnyPolicy {
        AnyPolicy::Network(policy_model::DiscoveredNetworkPolicy {
            id: Uuid::new_v4(),
            identity: WorkloadIdentity::new("c1", "checkout", BTreeMap::new()),
            selector: BTreeMap::new(),
            direction: Direction::Egress,
            peer: Peer::ReservedEntity { name: "world".into() },
            ports: vec![],
            http_rules: vec![],
            action: Action::Allow,
            status: PolicyStatus::Latest,
            supersedes_id: None,
            generated_at: Utc::now(),
            flow_ids: vec![],
        })
    }

    #[tokio::test]
    async fn upsert_then_query_round_trips() {
        let store = store().await;
        let policy = sample_policy();
        let id = policy.id();

        let outcomes = store.upsert(vec![policy]).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].created);

        let found = store
            .query(PolicyKind::Network, PolicyFilter::default())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), id);
    }

    #[tokio::test]
    async fn second_upsert_of_same_id_is_an_update_not_a_create() {
        let store = store().await;
        let policy = sample_policy();
        let id = policy.id();
        store.upsert(vec![policy.clone()]).await.unwrap();

        let outcomes = store.upsert(vec![policy]).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].created);

        let found = store
            .query(PolicyKind::Network, PolicyFilter::default())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), id);
    }

    #[tokio::test]
    async fn mark_outdated_removes_row_from_latest_query() {
        let store = store().await;
        let policy = sample_policy();
        let id = policy.id();
        store.upsert(vec![policy]).await.unwrap();

        store.mark_outdated(id, Uuid::new_v4()).await.unwrap();

        let found = store
            .query(PolicyKind::Network, PolicyFilter::default())
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn mark_outdated_refuses_already_outdated_row() {
        let store = store().await;
        let policy = sample_policy();
        let id = policy.id();
        store.upsert(vec![policy]).await.unwrap();
        store.mark_outdated(id, Uuid::new_v4()).await.unwrap();

        let err = store.mark_outdated(id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::PolicyConflict(_)));
    }

    #[tokio::test]
    async fn purge_removes_old_outdated_but_keeps_latest() {
        let store = store().await;
        let old = sample_policy();
        let old_id = old.id();
        let latest = sample_policy();

        store.upsert(vec![old, latest.clone()]).await.unwrap();
        store.mark_outdated(old_id, latest.id()).await.unwrap();

        let removed = store.purge(Utc::now() + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(removed, 1);

        let found = store
            .query(PolicyKind::Network, PolicyFilter::default())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), latest.id());
    }

    #[tokio::test]
    async fn dbclear_empties_every_table() {
        let store = store().await;
        store.upsert(vec![sample_policy()]).await.unwrap();
        store.dbclear().await.unwrap();

        let found = store
            .query(PolicyKind::Network, PolicyFilter::default())
            .await
            .unwrap();
        assert!(found.is_empty());
    }
}
