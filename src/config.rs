//! YAML-driven configuration, loaded once at startup and overridable per
//! field by `CW_CONFIG_<SECTION>_<FIELD>` environment variables.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Reserved for future Controller-level options; empty today.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerConfig {
    pub log_dir: PathBuf,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./logs"),
        }
    }
}

/// Reserved for future Trigger-level options; empty today.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerConfig {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfigSection {
    pub work_dir: PathBuf,
    pub times_retry: u32,
    pub wait_retry_base: u64,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
}

impl Default for WorkerConfigSection {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("./scripts"),
            times_retry: 2,
            wait_retry_base: 30,
            webhook_url: None,
            webhook_secret: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub secret: String,
    pub host: String,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            secret: "changeme".to_string(),
            host: "127.0.0.1".to_string(),
            port: 9523,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./cronweb.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    pub level: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub logger: LoggerConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub worker: WorkerConfigSection,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
}

impl Config {
    /// Loads `path` as YAML, falling back to an all-defaults `Config` if the
    /// file is absent, then applies any `CW_CONFIG_*` environment overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config: Config = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            serde_yaml::from_str(&text)?
        } else {
            anyhow::bail!("config file not found: {}", path.display());
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        env_string("CW_CONFIG_LOGGER_LOG_DIR", |v| self.logger.log_dir = v.into());
        env_string("CW_CONFIG_WORKER_WORK_DIR", |v| self.worker.work_dir = v.into());
        env_parse("CW_CONFIG_WORKER_TIMES_RETRY", |v| self.worker.times_retry = v);
        env_parse("CW_CONFIG_WORKER_WAIT_RETRY_BASE", |v| self.worker.wait_retry_base = v);
        env_string("CW_CONFIG_WORKER_WEBHOOK_URL", |v| self.worker.webhook_url = Some(v));
        env_string("CW_CONFIG_WORKER_WEBHOOK_SECRET", |v| self.worker.webhook_secret = Some(v));
        env_string("CW_CONFIG_WEB_SECRET", |v| self.web.secret = v);
        env_string("CW_CONFIG_WEB_HOST", |v| self.web.host = v);
        env_parse("CW_CONFIG_WEB_PORT", |v| self.web.port = v);
        env_string("CW_CONFIG_STORAGE_DB_PATH", |v| self.storage.db_path = v.into());
        env_string("CW_CONFIG_TRACING_LEVEL", |v| self.tracing.level = v);
    }
}

fn env_string(key: &str, mut apply: impl FnMut(String)) {
    if let Ok(value) = std::env::var(key) {
        apply(value);
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, mut apply: impl FnMut(T)) {
    if let Ok(value) = std::env::var(key) {
        match value.parse() {
            Ok(parsed) => apply(parsed),
            Err(_) => tracing::warn!(key, value, "ignoring unparsable config override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_file_errors() {
        let err = Config::load(Path::new("/nonexistent/cronweb.yaml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn env_override_replaces_yaml_value() {
        let mut config = Config::default();
        std::env::set_var("CW_CONFIG_WEB_PORT", "7000");
        config.apply_env_overrides();
        std::env::remove_var("CW_CONFIG_WEB_PORT");
        assert_eq!(config.web.port, 7000);
    }
}
