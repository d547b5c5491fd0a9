//! Configuration for the cloudlet agent.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::catalog::CatalogConfig;
use crate::handoff::HandoffConfig;
use crate::image::BaseImageCacheConfig;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory for scratch files.
    pub data_dir: PathBuf,

    /// Directory holding cached base VM artifacts.
    pub cache_dir: PathBuf,

    /// Image catalog API URL.
    pub catalog_url: String,

    /// Auth token for catalog requests.
    pub catalog_token: Option<String>,

    /// Transfer worker used on the sending host.
    pub send_worker: PathBuf,

    /// Transfer worker used on the receiving host.
    pub recv_worker: PathBuf,

    /// Interval between transfer worker polls.
    pub poll_interval: Duration,

    /// How long a running worker may stay silent before it is declared stalled.
    pub max_stall: Duration,

    /// How long to wait for a spawned VM to reach the running state.
    pub boot_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let data_dir = PathBuf::from(
            std::env::var("CLOUDLET_DATA_DIR").unwrap_or_else(|_| "/var/lib/cloudlet".to_string()),
        );

        let cache_dir = std::env::var("CLOUDLET_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("_base"));

        let catalog_url = std::env::var("CLOUDLET_CATALOG_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:9292".to_string());

        let catalog_token = std::env::var("CLOUDLET_CATALOG_TOKEN").ok();

        let send_worker = std::env::var("CLOUDLET_SEND_WORKER")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/usr/local/bin/handoff-proc"));

        let recv_worker = std::env::var("CLOUDLET_RECV_WORKER")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/usr/local/bin/handoff-server-proc"));

        let poll_interval = Duration::from_millis(env_u64("CLOUDLET_POLL_INTERVAL_MS", 500)?);
        let max_stall = Duration::from_secs(env_u64("CLOUDLET_MAX_STALL_SECS", 1800)?);
        let boot_timeout = Duration::from_secs(env_u64("CLOUDLET_BOOT_TIMEOUT_SECS", 300)?);

        let log_level = std::env::var("CLOUDLET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            data_dir,
            cache_dir,
            catalog_url,
            catalog_token,
            send_worker,
            recv_worker,
            poll_interval,
            max_stall,
            boot_timeout,
            log_level,
        })
    }

    /// Defaults rooted at `data_dir`, without consulting the environment.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            cache_dir: data_dir.join("_base"),
            data_dir,
            catalog_url: "http://127.0.0.1:9292".to_string(),
            catalog_token: None,
            send_worker: PathBuf::from("/usr/local/bin/handoff-proc"),
            recv_worker: PathBuf::from("/usr/local/bin/handoff-server-proc"),
            poll_interval: Duration::from_millis(500),
            max_stall: Duration::from_secs(1800),
            boot_timeout: Duration::from_secs(300),
            log_level: "info".to_string(),
        }
    }

    /// Scratch directory for base extraction and overlay packaging.
    pub fn work_dir(&self) -> PathBuf {
        self.data_dir.join("work")
    }

    /// Base image cache settings.
    pub fn cache(&self) -> BaseImageCacheConfig {
        BaseImageCacheConfig {
            cache_dir: self.cache_dir.clone(),
        }
    }

    /// Handoff engine settings.
    pub fn handoff(&self) -> HandoffConfig {
        HandoffConfig {
            send_worker: self.send_worker.clone(),
            recv_worker: self.recv_worker.clone(),
            work_dir: self.data_dir.join("handoff"),
            poll_interval: self.poll_interval,
            max_stall: self.max_stall,
        }
    }

    /// Catalog client settings.
    pub fn catalog(&self) -> CatalogConfig {
        CatalogConfig {
            base_url: self.catalog_url.clone(),
            auth_token: self.catalog_token.clone(),
            ..Default::default()
        }
    }
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{name} must be an unsigned integer, got {raw:?}")),
        Err(_) => Ok(default),
    }
}
