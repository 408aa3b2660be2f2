//! Configuration management for the Redfire Softphone core

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftphoneConfig {
    pub general: GeneralConfig,
    pub media: MediaConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub instance_id: String,
    pub user_agent: String,
    pub max_concurrent_calls: u32,
    pub call_timeout: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    pub ice_servers: Vec<String>,
    pub preferred_codecs: Vec<String>,
    pub receive_audio: bool,
    pub receive_video: bool,
    pub dtmf: DtmfConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtmfConfig {
    pub tone_duration_ms: u64,
    pub inter_tone_gap_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub retention_days: u32,
    pub max_call_logs: usize,
    pub max_state_transitions: usize,
    pub max_archived_sessions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogFormat {
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "compact")]
    Compact,
    #[serde(rename = "full")]
    Full,
}

impl Default for SoftphoneConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            media: MediaConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_id: "redfire-softphone-1".to_string(),
            user_agent: format!("Redfire-Softphone/{}", env!("CARGO_PKG_VERSION")),
            max_concurrent_calls: 4,
            call_timeout: 300,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            preferred_codecs: vec!["opus".to_string(), "PCMU".to_string(), "PCMA".to_string()],
            receive_audio: true,
            receive_video: false,
            dtmf: DtmfConfig::default(),
        }
    }
}

impl Default for DtmfConfig {
    fn default() -> Self {
        Self {
            tone_duration_ms: 200,
            inter_tone_gap_ms: 100,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            retention_days: 90,
            max_call_logs: 1000,
            max_state_transitions: 5000,
            max_archived_sessions: 1000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            file: None,
        }
    }
}

impl SoftphoneConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: SoftphoneConfig = toml::from_str(&contents)
            .map_err(|e| Error::parse(format!("Invalid TOML: {}", e)))?;
        Ok(config)
    }

    pub fn load_from_env() -> Result<Self> {
        let mut settings = config::Config::builder();

        // Load from environment variables with SOFTPHONE_ prefix
        settings = settings.add_source(
            config::Environment::with_prefix("SOFTPHONE")
                .separator("_")
        );

        let config = settings.build()?;
        let softphone_config = config.try_deserialize()?;
        Ok(softphone_config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.general.max_concurrent_calls == 0 {
            return Err(Error::parse("max_concurrent_calls must be at least 1"));
        }

        if self.media.dtmf.tone_duration_ms == 0 {
            return Err(Error::parse("DTMF tone duration must be non-zero"));
        }

        if self.storage.retention_days == 0 {
            return Err(Error::parse("retention_days must be at least 1"));
        }

        for server in &self.media.ice_servers {
            if !server.starts_with("stun:") && !server.starts_with("turn:") {
                return Err(Error::parse(format!("Invalid ICE server URI: {}", server)));
            }
        }

        Ok(())
    }
}
