use crate::{
    cache::{megabytes_to_bytes, DEFAULT_SOFT_CAP_MB},
    item::{PackageExtension, DEFAULT_EXTENSION},
    remote::{WorkshopClient, DEFAULT_API_URL},
};
use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const HOME_ENV: &str = "MODSYNC_HOME";
const CONFIG_FILE: &str = "config.json";
const CACHE_FILE: &str = "cache.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub source_root: Option<PathBuf>,
    #[serde(default)]
    pub target_root: Option<PathBuf>,
    #[serde(default = "default_extension")]
    pub package_extension: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_parallel_actions")]
    pub max_parallel_actions: usize,
    #[serde(default = "default_soft_cap")]
    pub cache_soft_cap_mb: u64,
    #[serde(default = "default_true")]
    pub confirm_delete: bool,
}

impl AppConfig {
    fn with_defaults(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            source_root: None,
            target_root: None,
            package_extension: default_extension(),
            api_url: default_api_url(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            max_parallel_actions: default_parallel_actions(),
            cache_soft_cap_mb: default_soft_cap(),
            confirm_delete: true,
        }
    }

    pub fn load_or_create(dir_override: Option<&Path>) -> Result<Self> {
        let data_dir = resolve_data_dir(dir_override)?;
        Self::load_or_create_in(data_dir)
    }

    pub fn load_or_create_in(data_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&data_dir).context("create app data dir")?;
        let path = data_dir.join(CONFIG_FILE);
        if path.exists() {
            let raw = fs::read_to_string(&path).context("read app config")?;
            let mut config: AppConfig = serde_json::from_str(&raw).context("parse app config")?;
            config.data_dir = data_dir;
            config.max_parallel_actions = config.max_parallel_actions.max(1);
            return Ok(config);
        }

        let config = AppConfig::with_defaults(data_dir);
        config.save()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir).context("create app data dir")?;
        let raw = serde_json::to_string_pretty(self).context("serialize app config")?;
        fs::write(self.config_path(), raw).context("write app config")?;
        Ok(())
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join(CACHE_FILE)
    }

    pub fn extension(&self) -> PackageExtension {
        PackageExtension::new(&self.package_extension)
    }

    pub fn soft_cap_bytes(&self) -> u64 {
        megabytes_to_bytes(self.cache_soft_cap_mb)
    }

    pub fn workshop_client(&self) -> WorkshopClient {
        WorkshopClient::new(self.api_url.clone()).with_timeouts(
            Duration::from_secs(self.connect_timeout_secs),
            Duration::from_secs(self.read_timeout_secs),
        )
    }
}

fn resolve_data_dir(dir_override: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = dir_override {
        return Ok(dir.to_path_buf());
    }
    if let Some(dir) = std::env::var_os(HOME_ENV).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("modsync"))
}

fn default_extension() -> String {
    DEFAULT_EXTENSION.to_string()
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_read_timeout() -> u64 {
    10
}

fn default_parallel_actions() -> usize {
    4
}

fn default_soft_cap() -> u64 {
    DEFAULT_SOFT_CAP_MB
}

fn default_true() -> bool {
    true
}
