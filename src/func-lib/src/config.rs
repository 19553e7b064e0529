use crate::{FnError, FnResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PLATFORM_CONFIG_PATH: &str = "/opt/funcplat/etc/platform.json";
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_RUN_RECORD_QUEUE_SIZE: usize = 1024;
pub const DEFAULT_HISTORY_PAGE_SIZE_LIMIT: u32 = 100;
pub const DEFAULT_BUS_URL: &str = "nats://localhost:4222";

/// Which transport `bus_url` selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEndpoint {
    /// NATS server; `nats://`, `tls://` or a bare `host:port`.
    Nats(String),
    /// Bus gateway reached over HTTP.
    Http(String),
    /// In-process bus, for tests and single-process setups.
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    #[serde(alias = "db_path", alias = "meta_db")]
    pub meta_db_path: PathBuf,
    /// Messaging endpoint, see [`BusEndpoint`]. Empty means in-process bus.
    #[serde(alias = "nats_url", alias = "bus_endpoint")]
    pub bus_url: String,
    #[serde(alias = "timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(alias = "record_queue_size")]
    pub run_record_queue_size: usize,
    #[serde(alias = "max_page_size")]
    pub history_page_size_limit: u32,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            meta_db_path: PathBuf::from("/opt/funcplat/var/func_meta.db"),
            bus_url: DEFAULT_BUS_URL.to_string(),
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            run_record_queue_size: DEFAULT_RUN_RECORD_QUEUE_SIZE,
            history_page_size_limit: DEFAULT_HISTORY_PAGE_SIZE_LIMIT,
        }
    }
}

impl PlatformConfig {
    /// Reads a JSON config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> FnResult<Self> {
        if !path.exists() {
            log::debug!("config {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| FnError::IoError(format!("read {} failed: {}", path.display(), e)))?;
        serde_json::from_str::<PlatformConfig>(&content)
            .map_err(|e| FnError::InvalidParam(format!("parse {} failed: {}", path.display(), e)))
    }

    pub fn bus_endpoint(&self) -> FnResult<BusEndpoint> {
        let url = self.bus_url.trim();
        if url.is_empty() {
            return Ok(BusEndpoint::Local);
        }
        let scheme = match url.find("://") {
            Some(pos) => url[..pos].to_ascii_lowercase(),
            None => return Ok(BusEndpoint::Nats(format!("nats://{}", url))),
        };
        match scheme.as_str() {
            "nats" | "tls" => Ok(BusEndpoint::Nats(url.to_string())),
            "http" | "https" => Ok(BusEndpoint::Http(url.to_string())),
            other => Err(FnError::InvalidParam(format!(
                "unsupported bus scheme {} in {}",
                other, url
            ))),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        if self.call_timeout_ms == 0 {
            return Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS);
        }
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn run_record_queue_size(&self) -> usize {
        self.run_record_queue_size.max(1)
    }

    pub fn history_page_size_limit(&self) -> u32 {
        self.history_page_size_limit.max(1)
    }
}
