use std::collections::BTreeSet;

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterInfoFrom {
    K8sClient,
    KvmService,
    Onboarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbDriver {
    Mysql,
    Sqlite,
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub limit: u32,
    pub trigger: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            limit: 500,
            trigger: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub db_driver: DbDriver,
    pub database_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_driver: DbDriver::Sqlite,
            database_url: "sqlite://policy.db".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PurgeConfig {
    pub enabled: bool,
    pub cron_expr: String,
    pub retain_days: i64,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cron_expr: "0 0 * * * *".to_string(),
            retain_days: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub network_cron_expr: String,
    pub system_cron_expr: String,
    pub admission_cron_expr: String,
    pub consumer_cron_expr: String,
    pub purge: PurgeConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            network_cron_expr: "0 */5 * * * *".to_string(),
            system_cron_expr: "0 */5 * * * *".to_string(),
            admission_cron_expr: "0 */10 * * * *".to_string(),
            consumer_cron_expr: "0 */1 * * * *".to_string(),
            purge: PurgeConfig::default(),
        }
    }
}

/// One configured admission target: the namespace+selector to watch, the
/// workload-object kind the validation pattern is written against, and
/// the base pattern itself.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AdmissionTemplateConfig {
    pub cluster: String,
    pub namespace: String,
    pub selector: std::collections::BTreeMap<String, String>,
    pub target_kind: String,
    pub pattern: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8181,
        }
    }
}

/// The fully-resolved, process-wide configuration: defaults overlaid by
/// an optional TOML file, then by environment variables, then by CLI
/// flags (applied by the binary, not by this crate).
#[derive(Debug, Clone)]
pub struct Config {
    pub cluster: String,
    pub cluster_info_from: ClusterInfoFrom,
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub network: BatchConfig,
    pub system: BatchConfig,
    pub ignore_labels: BTreeSet<String>,
    pub path_aggregation_threshold: u32,
    pub network_log_filters: Vec<String>,
    pub system_log_filters: Vec<String>,
    pub admission_templates: Vec<AdmissionTemplateConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster: "default".to_string(),
            cluster_info_from: ClusterInfoFrom::Onboarded,
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            scheduler: SchedulerConfig::default(),
            network: BatchConfig::default(),
            system: BatchConfig::default(),
            ignore_labels: BTreeSet::new(),
            path_aggregation_threshold: 3,
            network_log_filters: Vec::new(),
            system_log_filters: Vec::new(),
            admission_templates: Vec::new(),
        }
    }
}

/// The on-disk, partially-specified shape of a config file: every field
/// optional so a file only needs to override what it cares about.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    pub cluster: Option<String>,
    pub cluster_info_from: Option<ClusterInfoFrom>,
    pub server: Option<FileServerConfig>,
    pub store: Option<FileStoreConfig>,
    pub scheduler: Option<FileSchedulerConfig>,
    pub network: Option<FileBatchConfig>,
    pub system: Option<FileBatchConfig>,
    pub ignore_labels: Option<Vec<String>>,
    pub path_aggregation_threshold: Option<u32>,
    pub network_log_filters: Option<Vec<String>>,
    pub system_log_filters: Option<Vec<String>>,
    pub admission_templates: Option<Vec<AdmissionTemplateConfig>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FileServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FileStoreConfig {
    pub db_driver: Option<DbDriver>,
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FileBatchConfig {
    pub limit: Option<u32>,
    pub trigger: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FileSchedulerConfig {
    pub network_cron_expr: Option<String>,
    pub system_cron_expr: Option<String>,
    pub admission_cron_expr: Option<String>,
    pub consumer_cron_expr: Option<String>,
    pub purge_enabled: Option<bool>,
    pub purge_cron_expr: Option<String>,
    pub purge_retain_days: Option<i64>,
}
