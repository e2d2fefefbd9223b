use std::str::FromStr;
use std::time::Duration;
use std::{env, fs, path::PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use worker_client::http::{DEFAULT_PORT, DEFAULT_PREFIX};
use worker_client::{spawn_stdio_worker, HttpWorkerClient, WorkerClient};

pub const POLL_INTERVAL_KEY: &str = "PUBLISH_POLL_INTERVAL_MS";
pub const WORKER_URL_KEY: &str = "PUBLISH_WORKER_URL";
pub const WORKER_PORT_KEY: &str = "PUBLISH_WORKER_PORT";
pub const URL_PREFIX_KEY: &str = "PUBLISH_URL_PREFIX";
pub const WORKER_EXE_KEY: &str = "PUBLISH_WORKER_EXE";
pub const REQUEST_TIMEOUT_KEY: &str = "PUBLISH_REQUEST_TIMEOUT_MS";

const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{key} has an invalid value `{value}`")]
    Invalid { key: String, value: String },

    #[error("could not write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait::async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn del(&self, key: &str);
    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigError>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    /// Read `key` and parse it, falling back to `default` when it is unset.
    pub async fn parsed<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.0.get(key).await {
            None => Ok(default),
            Some(value) if value.trim().is_empty() => Ok(default),
            Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value,
            }),
        }
    }

    pub async fn non_empty(&self, key: &str) -> Option<String> {
        self.0
            .get(key)
            .await
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
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

/// Process environment, seeded from a `.env` file. `set` and `del` keep the
/// file in step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!("Loaded .env from {}", env_file.display()),
                Err(err) => warn!("could not parse {}: {}", env_file.display(), err),
            }
        } else {
            info!("no .env at {}, using the process environment", env_file.display());
        }

        Box::new(Self { env_file })
    }

    fn rewrite(&self, key: &str, value: Option<&str>) -> Result<(), ConfigError> {
        let content = fs::read_to_string(&self.env_file).unwrap_or_default();
        let mut lines: Vec<String> = Vec::new();
        let mut found = false;

        for line in content.lines() {
            match line.split_once('=') {
                Some((k, _)) if k.trim() == key => {
                    found = true;
                    if let Some(value) = value {
                        lines.push(format!("{key}={value}"));
                    }
                }
                _ => lines.push(line.to_string()),
            }
        }
        if !found {
            if let Some(value) = value {
                lines.push(format!("{key}={value}"));
            }
        }

        fs::write(&self.env_file, lines.join("\n")).map_err(|source| ConfigError::Write {
            path: self.env_file.clone(),
            source,
        })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        unsafe {
            env::set_var(key, value);
        };
        self.rewrite(key, Some(value))
    }

    async fn del(&self, key: &str) {
        unsafe {
            env::remove_var(key);
        };
        if self.env_file.exists() {
            if let Err(err) = self.rewrite(key, None) {
                warn!("{err}");
            }
        }
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MapConfigManager {
    #[schemars(with = "std::collections::HashMap<String, String>")]
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            map: DashMap::new(),
        })
    }

    pub fn from_pairs(pairs: &[(&str, &str)]) -> Box<Self> {
        let manager = Self::new();
        for (key, value) in pairs {
            manager.map.insert(key.to_string(), value.to_string());
        }
        manager
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Where the worker host lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerTarget {
    /// Child process speaking JSON-RPC over stdio.
    Stdio(PathBuf),
    /// REST host; the full base URL including the prefix.
    Http(String),
}

impl WorkerTarget {
    pub async fn connect(&self, timeout: Duration) -> anyhow::Result<WorkerClient> {
        match self {
            WorkerTarget::Stdio(exe) => {
                info!("spawning worker {}", exe.display());
                Ok(WorkerClient::Rpc(spawn_stdio_worker(exe).await?))
            }
            WorkerTarget::Http(base) => {
                info!("using worker host at {base}");
                Ok(WorkerClient::Http(HttpWorkerClient::new(base.clone(), timeout)?))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub worker: WorkerTarget,
}

impl EngineSettings {
    /// An executable wins over a URL; with neither, a local REST host on
    /// the configured port.
    pub async fn from_config(config: &ConfigManager) -> Result<Self, ConfigError> {
        let poll_ms: u64 = config.parsed(POLL_INTERVAL_KEY, DEFAULT_POLL_INTERVAL_MS).await?;
        if poll_ms == 0 {
            return Err(ConfigError::Invalid {
                key: POLL_INTERVAL_KEY.to_string(),
                value: "0".to_string(),
            });
        }
        let timeout_ms: u64 = config
            .parsed(REQUEST_TIMEOUT_KEY, DEFAULT_REQUEST_TIMEOUT_MS)
            .await?;

        let worker = if let Some(exe) = config.non_empty(WORKER_EXE_KEY).await {
            WorkerTarget::Stdio(PathBuf::from(exe))
        } else if let Some(url) = config.non_empty(WORKER_URL_KEY).await {
            WorkerTarget::Http(url.trim_end_matches('/').to_string())
        } else {
            let port: u16 = config.parsed(WORKER_PORT_KEY, DEFAULT_PORT).await?;
            let prefix = config
                .non_empty(URL_PREFIX_KEY)
                .await
                .unwrap_or_else(|| DEFAULT_PREFIX.to_string());
            WorkerTarget::Http(format!("http://127.0.0.1:{port}{prefix}"))
        };

        Ok(Self {
            poll_interval: Duration::from_millis(poll_ms),
            request_timeout: Duration::from_millis(timeout_ms),
            worker,
        })
    }
}
