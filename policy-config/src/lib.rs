//! Layered environment + TOML configuration for the policy discovery
//! system: defaults, overlaid by an optional file, overlaid by
//! environment variables. CLI overrides are applied by the binary.

pub mod error;
pub mod loader;
pub mod models;

pub use error::ConfigLoadError;
pub use loader::ConfigLoader;
pub use models::{
    AdmissionTemplateConfig, BatchConfig, ClusterInfoFrom, Config, DbDriver, FileConfig,
    PurgeConfig, SchedulerConfig, ServerConfig, StoreConfig,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_overlay_wins_over_default() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            cluster = "prod-east"
            path_aggregation_threshold = 5

            [network]
            limit = 1000
            trigger = 20
            "#
        )
        .unwrap();

        let config = ConfigLoader::load(Some(file.path())).unwrap();
        assert_eq!(config.cluster, "prod-east");
        assert_eq!(config.path_aggregation_threshold, 5);
        assert_eq!(config.network.limit, 1000);
        assert_eq!(config.network.trigger, 20);
        // Untouched fields keep their defaults.
        assert_eq!(config.system.limit, BatchConfig::default().limit);
    }

    #[test]
    fn defaults_apply_with_no_file() {
        let config = Config::default();
        assert_eq!(config.path_aggregation_threshold, 3);
        assert!(matches!(config.store.db_driver, DbDriver::Sqlite));
    }
}
