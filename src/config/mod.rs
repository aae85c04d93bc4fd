use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "TS3MUTE_";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub ts3: Ts3Config,
    pub homeassistant: HaConfig,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Ts3Config {
    pub address: String,
    pub api_key: Option<String>,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for Ts3Config {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:25639".to_string(),
            api_key: None,
            connect_timeout_ms: 10_000,
            read_timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HaConfig {
    pub base_url: Option<String>,
    pub token: Option<String>,
    pub entity_id: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token: None,
            entity_id: None,
            request_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_ms: u64,
    pub retry_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            retry_interval_ms: 1_000,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        // Start with default config
        let mut config = Self::default();
        let config_path = active_config_path();

        // Load from file if it exists
        if let Ok(raw) = fs::read_to_string(&config_path) {
            if let Ok(file_config) = toml::from_str::<Config>(&raw) {
                config = file_config;
            }
        }

        // Override with environment variables
        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        // TS3 ClientQuery settings
        if let Ok(val) = env::var(format!("{}TS3_ADDRESS", ENV_PREFIX)) {
            self.ts3.address = val;
        }
        if let Ok(val) = env::var(format!("{}TS3_API_KEY", ENV_PREFIX)) {
            self.ts3.api_key = Some(val);
        }
        if let Ok(val) = env::var(format!("{}TS3_CONNECT_TIMEOUT_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.ts3.connect_timeout_ms = ms;
            }
        }
        if let Ok(val) = env::var(format!("{}TS3_READ_TIMEOUT_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.ts3.read_timeout_ms = ms;
            }
        }

        // Home Assistant settings
        if let Ok(val) = env::var(format!("{}HA_BASE_URL", ENV_PREFIX)) {
            self.homeassistant.base_url = Some(val);
        }
        if let Ok(val) = env::var(format!("{}HA_TOKEN", ENV_PREFIX)) {
            self.homeassistant.token = Some(val);
        }
        if let Ok(val) = env::var(format!("{}HA_ENTITY_ID", ENV_PREFIX)) {
            self.homeassistant.entity_id = Some(val);
        }
        if let Ok(val) = env::var(format!("{}HA_REQUEST_TIMEOUT_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.homeassistant.request_timeout_ms = ms;
            }
        }

        // Monitor cadence
        if let Ok(val) = env::var(format!("{}POLL_INTERVAL_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.monitor.poll_interval_ms = ms;
            }
        }
        if let Ok(val) = env::var(format!("{}RETRY_INTERVAL_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.monitor.retry_interval_ms = ms;
            }
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.ts3.address.trim().is_empty() {
            return Err("ts3.address must be set".into());
        }
        if self.ts3.api_key.as_deref().unwrap_or("").trim().is_empty() {
            return Err("ts3.api_key is required".into());
        }
        if self.ts3.connect_timeout_ms == 0 {
            return Err("ts3.connect_timeout_ms must be non-zero".into());
        }
        if self.ts3.read_timeout_ms == 0 {
            return Err("ts3.read_timeout_ms must be non-zero".into());
        }
        if self.homeassistant.base_url.as_deref().unwrap_or("").trim().is_empty() {
            return Err("homeassistant.base_url is required".into());
        }
        if self.homeassistant.token.as_deref().unwrap_or("").trim().is_empty() {
            return Err("homeassistant.token is required".into());
        }
        if self
            .homeassistant
            .entity_id
            .as_deref()
            .unwrap_or("")
            .trim()
            .is_empty()
        {
            return Err("homeassistant.entity_id is required".into());
        }
        if self.homeassistant.request_timeout_ms == 0 {
            return Err("homeassistant.request_timeout_ms must be non-zero".into());
        }
        if self.monitor.poll_interval_ms == 0 {
            return Err("monitor.poll_interval_ms must be non-zero".into());
        }
        if self.monitor.retry_interval_ms == 0 {
            return Err("monitor.retry_interval_ms must be non-zero".into());
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err("config.toml already exists".into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home)
        .join(".config")
        .join("ts3-mute-bridge")
        .join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}
