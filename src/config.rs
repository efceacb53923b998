use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::relay::protocol::max_transfer_bytes;

pub static CONFIG: OnceCell<Config> = OnceCell::new();

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Trim and lowercase a log level, replacing it with `default` when it isn't recognised
fn ensure_log_level(value: &mut String, name: &str, default: &str) {
    let original = value.clone();
    *value = value.trim().to_ascii_lowercase();
    if !LOG_LEVELS.contains(&value.as_str()) {
        eprintln!(
            "Config error: {} log level of '{}' is invalid - using default of '{}'",
            name, original, default
        );
        *value = default.to_owned();
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoggingConfig {
    pub docsweep: String,
    pub lopdf: String,
}

impl LoggingConfig {
    const DOCSWEEP_LEVEL: &str = "info";
    const LOPDF_LEVEL: &str = "error";

    /// Level specification understood by flexi_logger, e.g. "docsweep=info, lopdf=error"
    pub fn spec(&self) -> String {
        format!("docsweep={}, lopdf={}", self.docsweep, self.lopdf)
    }

    fn ensure_valid(&mut self) {
        ensure_log_level(&mut self.docsweep, "docsweep", Self::DOCSWEEP_LEVEL);
        ensure_log_level(&mut self.lopdf, "lopdf", Self::LOPDF_LEVEL);
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            docsweep: Self::DOCSWEEP_LEVEL.to_string(),
            lopdf: Self::LOPDF_LEVEL.to_string(),
        }
    }
}

/// Collaborator-facing HTTP API served by `docsweep serve`
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,
    pub agent_token: String,
    pub controller_token: String,
    pub registration_timeout_secs: u64,
}

impl HubConfig {
    fn ensure_valid(&mut self) {
        if self.agent_token.trim().is_empty() || self.controller_token.trim().is_empty() {
            eprintln!("Config warning: hub tokens are empty - registrations for that class will be refused");
        }
        if self.registration_timeout_secs == 0 {
            self.registration_timeout_secs = Self::default().registration_timeout_secs;
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            host: "0.0.0.0".to_string(),
            port: 8765,
            agent_token: String::new(),
            controller_token: String::new(),
            registration_timeout_secs: 10,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AgentConfig {
    pub hub_url: String,
    pub token: String,
    /// Overrides the detected hostname when set
    pub hostname: Option<String>,
    pub metrics_interval_secs: u64,
    pub reconnect_delay_secs: u64,
    pub max_download_bytes: u64,
}

impl AgentConfig {
    fn ensure_valid(&mut self) {
        let defaults = Self::default();
        if self.metrics_interval_secs == 0 {
            self.metrics_interval_secs = defaults.metrics_interval_secs;
        }
        if self.reconnect_delay_secs == 0 {
            self.reconnect_delay_secs = defaults.reconnect_delay_secs;
        }
        if self.max_download_bytes == 0 {
            self.max_download_bytes = defaults.max_download_bytes;
        }
        let transport_limit = max_transfer_bytes();
        if self.max_download_bytes > transport_limit {
            eprintln!(
                "Config warning: agent.max_download_bytes {} exceeds what one relay frame carries, using {}",
                self.max_download_bytes, transport_limit
            );
            self.max_download_bytes = transport_limit;
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            hub_url: "ws://127.0.0.1:8765/ws".to_string(),
            token: String::new(),
            hostname: None,
            metrics_interval_secs: 60,
            reconnect_delay_secs: 5,
            max_download_bytes: 50 * 1024 * 1024,
        }
    }
}

/// The controller's own connection to the hub
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ControllerConfig {
    pub hub_url: String,
    pub token: String,
    pub command_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
}

impl ControllerConfig {
    fn ensure_valid(&mut self) {
        let defaults = Self::default();
        if self.command_timeout_secs == 0 {
            self.command_timeout_secs = defaults.command_timeout_secs;
        }
        if self.reconnect_delay_secs == 0 {
            self.reconnect_delay_secs = defaults.reconnect_delay_secs;
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            hub_url: "ws://127.0.0.1:8765/ws".to_string(),
            token: String::new(),
            command_timeout_secs: 120,
            reconnect_delay_secs: 5,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    Share,
    Relay,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ScanConfig {
    pub workers: usize,
    pub destination: PathBuf,
    pub user_folders: Vec<String>,
    pub max_depth: usize,
    /// "share" mounts the endpoint's administrative share, "relay" goes through the agent
    pub source: String,
    pub share_name: String,
    /// Where CIFS shares are mounted on non-Windows controllers
    pub mount_root: PathBuf,
    pub admin: Option<Credential>,
    /// Endpoint-specific credentials keyed by hostname
    pub credentials: BTreeMap<String, Credential>,
}

impl ScanConfig {
    const SOURCES: [&str; 2] = ["share", "relay"];
    const SOURCE_SHARE: &str = "share";
    const SOURCE_RELAY: &str = "relay";

    pub fn source_mode(&self) -> SourceMode {
        match self.source.as_str() {
            Self::SOURCE_RELAY => SourceMode::Relay,
            _ => SourceMode::Share,
        }
    }

    fn ensure_valid(&mut self) {
        let str_original = self.source.clone();
        self.source = self.source.trim().to_ascii_lowercase();
        if !Self::SOURCES.contains(&self.source.as_str()) {
            eprintln!(
                "Config error: scan source of '{}' is invalid - using default of '{}'",
                str_original,
                Self::SOURCE_SHARE
            );
            self.source = Self::SOURCE_SHARE.to_owned();
        }

        if self.workers == 0 {
            eprintln!("Config error: scan workers must be at least 1 - using 1");
            self.workers = 1;
        }

        if self.user_folders.is_empty() {
            self.user_folders = Self::default().user_folders;
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            workers: 3,
            destination: PathBuf::from("collected"),
            user_folders: vec![
                "Desktop".to_string(),
                "Documents".to_string(),
                "Downloads".to_string(),
            ],
            max_depth: 4,
            source: Self::SOURCE_SHARE.to_string(),
            share_name: "C$".to_string(),
            mount_root: std::env::temp_dir().join("docsweep-mounts"),
            admin: None,
            credentials: BTreeMap::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ScheduleConfig {
    /// IANA zone every schedule is evaluated in, independent of the host zone
    pub timezone: String,
    pub poll_interval_secs: u64,
}

impl ScheduleConfig {
    const TIMEZONE: &str = "Europe/Paris";

    pub fn tz(&self) -> chrono_tz::Tz {
        self.timezone.parse().unwrap_or(chrono_tz::Europe::Paris)
    }

    fn ensure_valid(&mut self) {
        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            eprintln!(
                "Config error: schedule timezone of '{}' is invalid - using default of '{}'",
                self.timezone,
                Self::TIMEZONE
            );
            self.timezone = Self::TIMEZONE.to_owned();
        }
        if self.poll_interval_secs == 0 {
            self.poll_interval_secs = Self::default().poll_interval_secs;
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig {
            timezone: Self::TIMEZONE.to_string(),
            poll_interval_secs: 30,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub hub: HubConfig,
    pub agent: AgentConfig,
    pub controller: ControllerConfig,
    pub scan: ScanConfig,
    pub schedule: ScheduleConfig,
}

impl Config {
    /// Loads the configuration from a TOML file located in the app's data directory,
    /// then applies `DOCSWEEP_` environment overrides (`__` separates nested keys).
    /// If the file is missing or fails to parse, defaults are used.
    /// Additionally, writes the default config to disk if no file exists.
    pub fn load_config(project_dirs: &ProjectDirs) -> Self {
        let config_path = project_dirs.data_local_dir().join("config.toml");

        let default_config = Config::default();

        if !config_path.exists() {
            if let Some(parent) = config_path.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    eprintln!(
                        "Failed to create configuration directory {}: {}",
                        parent.display(),
                        e
                    );
                }
            }
            if let Ok(toml_string) = toml::to_string_pretty(&default_config) {
                if let Err(e) = fs::write(&config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            } else {
                eprintln!("Failed to serialize default config.");
            }
        }

        let figment = Figment::from(Serialized::defaults(default_config.clone()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("DOCSWEEP_").split("__"));

        let mut config = figment.extract().unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            default_config
        });

        config.ensure_valid();

        config
    }

    /// The loaded configuration, or defaults when nothing was loaded (tests, embedding)
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(Config::default)
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.hub.ensure_valid();
        self.agent.ensure_valid();
        self.controller.ensure_valid();
        self.scan.ensure_valid();
        self.schedule.ensure_valid();
    }
}
