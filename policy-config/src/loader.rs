use std::path::Path;

use crate::error::{ConfigLoadError, Result};
use crate::models::{ClusterInfoFrom, Config, DbDriver, FileConfig};

/// Loads configuration from defaults, an optional TOML file, and then
/// environment variables, in that overlay order. CLI flags are applied
/// on top of the result by the binary crate.
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load(file_path: Option<&Path>) -> Result<Config> {
        dotenvy::dotenv().ok();

        let mut config = Config::default();

        if let Some(path) = file_path {
            let file = read_file_config(path)?;
            apply_file_config(&mut config, file);
        }

        apply_env(&mut config)?;
        Ok(config)
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Read {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
        path: path.display().to_string(),
        source,
    })
}

fn apply_file_config(config: &mut Config, file: FileConfig) {
    if let Some(cluster) = file.cluster {
        config.cluster = cluster;
    }
    if let Some(from) = file.cluster_info_from {
        config.cluster_info_from = from;
    }
    if let Some(server) = file.server {
        if let Some(host) = server.host {
            config.server.host = host;
        }
        if let Some(port) = server.port {
            config.server.port = port;
        }
    }
    if let Some(store) = file.store {
        if let Some(driver) = store.db_driver {
            config.store.db_driver = driver;
        }
        if let Some(url) = store.database_url {
            config.store.database_url = url;
        }
    }
    if let Some(scheduler) = file.scheduler {
        if let Some(v) = scheduler.network_cron_expr {
            config.scheduler.network_cron_expr = v;
        }
        if let Some(v) = scheduler.system_cron_expr {
            config.scheduler.system_cron_expr = v;
        }
        if let Some(v) = scheduler.admission_cron_expr {
            config.scheduler.admission_cron_expr = v;
        }
        if let Some(v) = scheduler.consumer_cron_expr {
            config.scheduler.consumer_cron_expr = v;
        }
        if let Some(v) = scheduler.purge_enabled {
            config.scheduler.purge.enabled = v;
        }
        if let Some(v) = scheduler.purge_cron_expr {
            config.scheduler.purge.cron_expr = v;
        }
        if let Some(v) = scheduler.purge_retain_days {
            config.scheduler.purge.retain_days = v;
        }
    }
    if let Some(network) = file.network {
        if let Some(v) = network.limit {
            config.network.limit = v;
        }
        if let Some(v) = network.trigger {
            config.network.trigger = v;
        }
    }
    if let Some(system) = file.system {
        if let Some(v) = system.limit {
            config.system.limit = v;
        }
        if let Some(v) = system.trigger {
            config.system.trigger = v;
        }
    }
    if let Some(labels) = file.ignore_labels {
        config.ignore_labels = labels.into_iter().collect();
    }
    if let Some(threshold) = file.path_aggregation_threshold {
        config.path_aggregation_threshold = threshold;
    }
    if let Some(filters) = file.network_log_filters {
        config.network_log_filters = filters;
    }
    if let Some(filters) = file.system_log_filters {
        config.system_log_filters = filters;
    }
    if let Some(templates) = file.admission_templates {
        config.admission_templates = templates;
    }
}

fn apply_env(config: &mut Config) -> Result<()> {
    if let Ok(v) = std::env::var("POLICY_CLUSTER") {
        config.cluster = v;
    }
    if let Ok(v) = std::env::var("POLICY_CLUSTER_INFO_FROM") {
        config.cluster_info_from = match v.as_str() {
            "k8sclient" => ClusterInfoFrom::K8sClient,
            "kvmservice" => ClusterInfoFrom::KvmService,
            "onboarded" => ClusterInfoFrom::Onboarded,
            other => {
                return Err(ConfigLoadError::InvalidValue {
                    field: "POLICY_CLUSTER_INFO_FROM".to_string(),
                    reason: format!("unknown value {other}"),
                })
            }
        };
    }
    if let Ok(v) = std::env::var("POLICY_SERVER_HOST") {
        config.server.host = v;
    }
    if let Ok(v) = std::env::var("POLICY_SERVER_PORT") {
        config.server.port = parse_env("POLICY_SERVER_PORT", &v)?;
    }
    if let Ok(v) = std::env::var("POLICY_DB_DRIVER") {
        config.store.db_driver = match v.as_str() {
            "mysql" => DbDriver::Mysql,
            "sqlite" => DbDriver::Sqlite,
            other => {
                return Err(ConfigLoadError::InvalidValue {
                    field: "POLICY_DB_DRIVER".to_string(),
                    reason: format!("unknown value {other}"),
                })
            }
        };
    }
    if let Ok(v) = std::env::var("POLICY_DATABASE_URL") {
        config.store.database_url = v;
    }
    if let Ok(v) = std::env::var("POLICY_NETWORK_LIMIT") {
        config.network.limit = parse_env("POLICY_NETWORK_LIMIT", &v)?;
    }
    if let Ok(v) = std::env::var("POLICY_NETWORK_TRIGGER") {
        config.network.trigger = parse_env("POLICY_NETWORK_TRIGGER", &v)?;
    }
    if let Ok(v) = std::env::var("POLICY_SYSTEM_LIMIT") {
        config.system.limit = parse_env("POLICY_SYSTEM_LIMIT", &v)?;
    }
    if let Ok(v) = std::env::var("POLICY_SYSTEM_TRIGGER") {
        config.system.trigger = parse_env("POLICY_SYSTEM_TRIGGER", &v)?;
    }
    if let Ok(v) = std::env::var("POLICY_PATH_AGGREGATION_THRESHOLD") {
        config.path_aggregation_threshold = parse_env("POLICY_PATH_AGGREGATION_THRESHOLD", &v)?;
    }
    if let Ok(v) = std::env::var("POLICY_PURGE_ENABLED") {
        config.scheduler.purge.enabled = parse_env("POLICY_PURGE_ENABLED", &v)?;
    }
    if let Ok(v) = std::env::var("POLICY_PURGE_CRON_EXPR") {
        config.scheduler.purge.cron_expr = v;
    }
    if let Ok(v) = std::env::var("POLICY_IGNORE_LABELS") {
        config.ignore_labels = v.split(',').map(|s| s.trim().to_string()).collect();
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.parse().map_err(|_| ConfigLoadError::InvalidValue {
        field: name.to_string(),
        reason: format!("cannot parse {raw:?}"),
    })
}
