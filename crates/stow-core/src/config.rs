use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level daemon configuration (loaded from stow.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StowConfig {
    pub daemon: DaemonConfig,
    pub metadata: MetadataConfig,
    pub sync: SyncConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// JSON catalog holding users, policies, and file records
    pub catalog: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Users reconciled concurrently (0 = cpu_count)
    pub workers: usize,
    /// Seconds between passes (0 = run once and exit)
    pub interval_secs: u64,
    /// Directories whose name contains this marker are pruned
    pub skip_dir_marker: String,
    /// Files whose name ends with this suffix are ignored
    pub skip_file_suffix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Refuse S3 policies whose endpoint is plaintext HTTP
    pub enforce_tls: bool,
    /// Environment variable holding the S3 access key id
    pub access_key_env: String,
    /// Environment variable holding the S3 secret key
    pub secret_key_env: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            catalog: PathBuf::from("/var/lib/stowd/catalog.json"),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            interval_secs: 0,
            skip_dir_marker: ".cache".into(),
            skip_file_suffix: "_thumb".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enforce_tls: false,
            access_key_env: "STOW_ACCESS_KEY_ID".into(),
            secret_key_env: "STOW_SECRET_ACCESS_KEY".into(),
        }
    }
}

impl SyncConfig {
    /// Effective worker count, resolving 0 to the number of CPUs.
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[daemon]
log_level = "debug"
log_format = "json"

[metadata]
catalog = "/tmp/catalog.json"

[sync]
workers = 4
interval_secs = 300
skip_dir_marker = ".tmp"
skip_file_suffix = "_preview"

[storage]
enforce_tls = true
access_key_env = "AWS_ACCESS_KEY_ID"
"#;
        let config: StowConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.daemon.log_format, "json");
        assert_eq!(config.metadata.catalog, PathBuf::from("/tmp/catalog.json"));
        assert_eq!(config.sync.workers, 4);
        assert_eq!(config.sync.effective_workers(), 4);
        assert_eq!(config.sync.interval_secs, 300);
        assert_eq!(config.sync.skip_dir_marker, ".tmp");
        assert_eq!(config.sync.skip_file_suffix, "_preview");
        assert!(config.storage.enforce_tls);
        assert_eq!(config.storage.access_key_env, "AWS_ACCESS_KEY_ID");
        assert_eq!(config.storage.secret_key_env, "STOW_SECRET_ACCESS_KEY");
    }

    #[test]
    fn test_parse_defaults() {
        let config: StowConfig = toml::from_str("").unwrap();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.daemon.log_format, "text");
        assert_eq!(
            config.metadata.catalog,
            PathBuf::from("/var/lib/stowd/catalog.json")
        );
        assert_eq!(config.sync.interval_secs, 0);
        assert_eq!(config.sync.skip_dir_marker, ".cache");
        assert_eq!(config.sync.skip_file_suffix, "_thumb");
        assert!(config.sync.effective_workers() >= 1);
        assert!(!config.storage.enforce_tls);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = StowConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: StowConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.metadata.catalog, parsed.metadata.catalog);
        assert_eq!(config.sync.skip_dir_marker, parsed.sync.skip_dir_marker);
    }
}
