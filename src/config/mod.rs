use crate::lmstudio::DEFAULT_API_URL;
use crate::metrics::DEFAULT_PUBLIC_IP_URL;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "MAC2MQTT_";
const DEFAULT_IDLE_THRESHOLD_SECS: u64 = 10;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub device: DeviceConfig,
    pub activity: ActivityConfig,
    pub schedule: ScheduleConfig,
    pub media: MediaConfig,
    pub lmstudio: LmStudioConfig,
    pub metrics: MetricsConfig,
    pub vault: VaultConfig,
    pub startup: StartupConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Vault key holding the broker password; wins over `password`.
    pub password_key: Option<String>,
    pub ssl: bool,
    /// Topic root; the sanitized hostname is appended.
    pub topic: Option<String>,
    pub discovery_prefix: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub reconnect_interval_secs: u64,
    pub max_reconnect_interval_secs: u64,
    pub probe_timeout_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            user: None,
            password: None,
            password_key: None,
            ssl: false,
            topic: None,
            discovery_prefix: "homeassistant".to_string(),
            keep_alive_secs: 60,
            connect_timeout_secs: 15,
            reconnect_interval_secs: 15,
            max_reconnect_interval_secs: 120,
            probe_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct DeviceConfig {
    /// Overrides the system hostname in topics and discovery.
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ActivityConfig {
    pub idle_threshold_secs: u64,
    pub sample_interval_ms: u64,
    pub active_floor_secs: u64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            idle_threshold_secs: DEFAULT_IDLE_THRESHOLD_SECS,
            sample_interval_ms: 500,
            active_floor_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub status_interval_secs: u64,
    pub metrics_interval_secs: u64,
    pub power_interval_secs: u64,
    pub network_check_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            status_interval_secs: 60,
            metrics_interval_secs: 60,
            power_interval_secs: 60,
            network_check_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MediaConfig {
    pub enabled: bool,
    pub command: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: "media-control".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LmStudioConfig {
    pub enabled: bool,
    pub api_url: String,
    pub cli: String,
    pub timeout_ms: u64,
}

impl Default for LmStudioConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: DEFAULT_API_URL.to_string(),
            cli: crate::lmstudio::DEFAULT_CLI.to_string(),
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub public_ip_url: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            public_ip_url: DEFAULT_PUBLIC_IP_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct VaultConfig {
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StartupConfig {
    pub enable_autostart: bool,
    pub app_name: String,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            enable_autostart: false,
            app_name: "mac2mqtt".to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let path = active_config_path();
        let mut config = Self::load_from(&path)?;
        config.apply_env_overrides();
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Reads `path` if it exists. A missing file yields the defaults; a file
    /// that does not parse is an error.
    pub fn load_from(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        match fs::read_to_string(path) {
            Ok(raw) => toml::from_str::<Config>(&raw)
                .map_err(|err| format!("invalid {}: {}", path.display(), err).into()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn apply_env_overrides(&mut self) {
        // Broker settings
        if let Ok(val) = env::var(format!("{}MQTT_HOST", ENV_PREFIX)) {
            self.mqtt.host = val;
        }
        if let Ok(val) = env::var(format!("{}MQTT_PORT", ENV_PREFIX)) {
            if let Ok(port) = val.parse() {
                self.mqtt.port = port;
            }
        }
        if let Ok(val) = env::var(format!("{}MQTT_USER", ENV_PREFIX)) {
            self.mqtt.user = Some(val);
        }
        if let Ok(val) = env::var(format!("{}MQTT_PASSWORD", ENV_PREFIX)) {
            self.mqtt.password = Some(val);
        }
        if let Ok(val) = env::var(format!("{}MQTT_PASSWORD_KEY", ENV_PREFIX)) {
            self.mqtt.password_key = Some(val);
        }
        if let Ok(val) = env::var(format!("{}MQTT_SSL", ENV_PREFIX)) {
            self.mqtt.ssl = val.parse().unwrap_or(false);
        }
        if let Ok(val) = env::var(format!("{}MQTT_TOPIC", ENV_PREFIX)) {
            self.mqtt.topic = Some(val);
        }
        if let Ok(val) = env::var(format!("{}DISCOVERY_PREFIX", ENV_PREFIX)) {
            self.mqtt.discovery_prefix = val;
        }

        if let Ok(val) = env::var(format!("{}HOSTNAME", ENV_PREFIX)) {
            self.device.hostname = Some(val);
        }
        if let Ok(val) = env::var(format!("{}IDLE_THRESHOLD_SECS", ENV_PREFIX)) {
            if let Ok(secs) = val.parse() {
                self.activity.idle_threshold_secs = secs;
            }
        }

        // LM Studio settings
        if let Ok(val) = env::var(format!("{}LMSTUDIO_ENABLED", ENV_PREFIX)) {
            self.lmstudio.enabled = val.parse().unwrap_or(false);
        }
        if let Ok(val) = env::var(format!("{}LMSTUDIO_API_URL", ENV_PREFIX)) {
            self.lmstudio.api_url = val;
        }

        if let Ok(val) = env::var(format!("{}VAULT_PATH", ENV_PREFIX)) {
            self.vault.path = Some(val);
        }
        if let Ok(val) = env::var(format!("{}AUTOSTART", ENV_PREFIX)) {
            self.startup.enable_autostart = val.parse().unwrap_or(false);
        }
    }

    fn normalize(&mut self) {
        if self.activity.idle_threshold_secs == 0 {
            tracing::info!(
                "No idle threshold configured, using default {} seconds",
                DEFAULT_IDLE_THRESHOLD_SECS
            );
            self.activity.idle_threshold_secs = DEFAULT_IDLE_THRESHOLD_SECS;
        }
        if self.mqtt.discovery_prefix.trim().is_empty() {
            self.mqtt.discovery_prefix = MqttConfig::default().discovery_prefix;
        }
        if self.lmstudio.api_url.trim().is_empty() && !self.lmstudio.enabled {
            self.lmstudio.api_url = DEFAULT_API_URL.to_string();
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.mqtt.host.trim().is_empty() {
            return Err("mqtt.host must be set".into());
        }
        if self.mqtt.port == 0 {
            return Err("mqtt.port must be non-zero".into());
        }
        if self.mqtt.keep_alive_secs == 0 || self.mqtt.connect_timeout_secs == 0 {
            return Err("mqtt.keep_alive_secs and mqtt.connect_timeout_secs must be non-zero".into());
        }
        if self.mqtt.probe_timeout_ms == 0 {
            return Err("mqtt.probe_timeout_ms must be non-zero".into());
        }
        if self.mqtt.reconnect_interval_secs == 0 {
            return Err("mqtt.reconnect_interval_secs must be non-zero".into());
        }
        if self.mqtt.reconnect_interval_secs > self.mqtt.max_reconnect_interval_secs {
            return Err(
                "mqtt.reconnect_interval_secs must not exceed mqtt.max_reconnect_interval_secs"
                    .into(),
            );
        }
        if self.activity.idle_threshold_secs == 0 {
            return Err("activity.idle_threshold_secs must be non-zero".into());
        }
        if self.activity.sample_interval_ms == 0 {
            return Err("activity.sample_interval_ms must be non-zero".into());
        }
        let s = &self.schedule;
        if [
            s.status_interval_secs,
            s.metrics_interval_secs,
            s.power_interval_secs,
            s.network_check_interval_secs,
        ]
        .contains(&0)
        {
            return Err("schedule intervals must be non-zero".into());
        }
        if self.media.enabled && self.media.command.trim().is_empty() {
            return Err("media.command is required when media.enabled = true".into());
        }
        if self.lmstudio.enabled && self.lmstudio.api_url.trim().is_empty() {
            return Err("lmstudio.api_url is required when lmstudio.enabled = true".into());
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

    pub fn save(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.save_to(&active_config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        self.validate()?;
        let data = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
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
        .join("mac2mqtt")
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
