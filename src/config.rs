use std::{
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::error::FlowError;

pub const HTTP_TIMEOUT_SECS: &str = "CHATFLOW_HTTP_TIMEOUT_SECS";
pub const MAX_STEPS: &str = "CHATFLOW_MAX_STEPS";
pub const HISTORY_WINDOW: &str = "CHATFLOW_HISTORY_WINDOW";
pub const STATE_TTL_SECS: &str = "CHATFLOW_STATE_TTL_SECS";
pub const STATE_DIR: &str = "CHATFLOW_STATE_DIR";
pub const MAX_FRAMES: &str = "CHATFLOW_MAX_FRAMES";
pub const GENERIC_ERROR: &str = "CHATFLOW_GENERIC_ERROR";

#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub fn env(env_file: impl Into<PathBuf>) -> Self {
        ConfigManager(EnvConfigManager::new(env_file.into()))
    }

    pub fn map<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let manager = MapConfigManager::new();
        for (k, v) in entries {
            manager.map.insert(k.into(), v.into());
        }
        ConfigManager(manager)
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).await
    }

    /// Read and parse `key`; an absent key yields `None`, an unparsable one an error.
    pub async fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, FlowError>
    where
        T::Err: std::fmt::Display,
    {
        match self.0.get(key).await {
            None => Ok(None),
            Some(raw) if raw.trim().is_empty() => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| FlowError::Config(format!("{key}={raw}: {e}"))),
        }
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, optionally seeded from a `.env` file.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!("loaded .env from {}", env_file.display()),
                Err(e) => warn!("could not parse {}: {e}", env_file.display()),
            }
        } else {
            debug!("no .env at {}", env_file.display());
        }
        Box::new(Self { env_file })
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Tunables shared by the flow engine, the session driver and the stores.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub http_timeout: Duration,
    pub max_steps: usize,
    pub history_window: usize,
    pub state_ttl: Duration,
    pub state_dir: Option<PathBuf>,
    pub max_frames_per_key: usize,
    pub generic_error: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(30),
            max_steps: 1000,
            history_window: 20,
            state_ttl: Duration::from_secs(86_400),
            state_dir: None,
            max_frames_per_key: 50,
            generic_error: "Sorry, something went wrong. Please try again.".to_string(),
        }
    }
}

impl EngineConfig {
    pub async fn load(config: &ConfigManager) -> Result<Self, FlowError> {
        let defaults = Self::default();
        let engine = Self {
            http_timeout: config
                .parse::<u64>(HTTP_TIMEOUT_SECS)
                .await?
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
            max_steps: config.parse(MAX_STEPS).await?.unwrap_or(defaults.max_steps),
            history_window: config
                .parse(HISTORY_WINDOW)
                .await?
                .unwrap_or(defaults.history_window),
            state_ttl: config
                .parse::<u64>(STATE_TTL_SECS)
                .await?
                .map(Duration::from_secs)
                .unwrap_or(defaults.state_ttl),
            state_dir: config.get(STATE_DIR).await.filter(|d| !d.trim().is_empty()).map(PathBuf::from),
            max_frames_per_key: config
                .parse(MAX_FRAMES)
                .await?
                .unwrap_or(defaults.max_frames_per_key),
            generic_error: config
                .get(GENERIC_ERROR)
                .await
                .filter(|m| !m.trim().is_empty())
                .unwrap_or(defaults.generic_error),
        };
        if engine.max_steps == 0 {
            return Err(FlowError::Config(format!("{MAX_STEPS} must be at least 1")));
        }
        Ok(engine)
    }
}

/// Parse a definition document, choosing YAML or JSON by file extension.
pub fn read_definition<T: DeserializeOwned>(path: &Path) -> Result<T, FlowError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| FlowError::Config(format!("cannot read {}: {e}", path.display())))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    );
    if is_yaml {
        serde_yaml_bw::from_str(&raw)
            .map_err(|e| FlowError::Config(format!("{}: {e}", path.display())))
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| FlowError::Config(format!("{}: {e}", path.display())))
    }
}
