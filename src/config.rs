use crate::backup::BackupConfig;
use crate::mined_relay_wal::WalConfig;
use crate::relayer_sessions::{RelayerSessionsConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// Root of live session stores and mined-relay WALs
    #[serde(default = "default_smt_store_path")]
    pub smt_store_path: String,
    /// Mirror of every live session store; unset disables mirroring
    #[serde(default)]
    pub mirror_store_path: Option<String>,
    #[serde(default)]
    pub wal: WalConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_smt_store_path() -> String {
    "./data/smt".to_string()
}

impl AppConfig {
    /// Load `config/{env}.yaml`.
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
            path: config_path.clone(),
            source,
        })?;
        let config = Self::from_yaml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: config_path.clone(),
                source,
            },
            other => other,
        })?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.smt_store_path.trim().is_empty() {
            return Err(ConfigError::Invalid("smt_store_path must not be empty".into()));
        }
        if let Some(mirror) = &self.mirror_store_path
            && mirror.trim() == self.smt_store_path.trim()
        {
            return Err(ConfigError::Invalid(
                "mirror_store_path must differ from smt_store_path".into(),
            ));
        }
        if self.wal.flush_threshold_bytes == 0 {
            return Err(ConfigError::Invalid(
                "wal.flush_threshold_bytes must be greater than zero".into(),
            ));
        }
        self.backup
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }

    pub fn sessions_config(&self) -> RelayerSessionsConfig {
        RelayerSessionsConfig {
            store_root: PathBuf::from(&self.smt_store_path),
            mirror_root: self.mirror_store_path.as_ref().map(PathBuf::from),
            wal: self.wal.clone(),
            retry: self.retry.clone(),
            ..Default::default()
        }
    }
}
