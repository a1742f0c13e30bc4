use crate::broadcast::DEFAULT_BASE_URL;
use crate::remote::Endpoint;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.toml";
const APP_DIR: &str = "SlobsRemoteBridge";
const ENV_PREFIX: &str = "SLOBS_BRIDGE_";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub remote: RemoteConfig,
    pub facade: FacadeConfig,
    pub broadcast: BroadcastConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tcp,
    Pipe,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    pub pipe_name: String,
    pub transport: Transport,
    /// Name of the environment variable holding the remote-control token.
    pub token_env: Option<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 59650,
            pipe_name: "slobs".to_string(),
            transport: Transport::Tcp,
            token_env: None,
        }
    }
}

impl RemoteConfig {
    pub fn endpoint(&self) -> Result<Endpoint, Box<dyn std::error::Error>> {
        match self.transport {
            Transport::Tcp => Ok(Endpoint::Tcp {
                host: self.host.clone(),
                port: self.port,
            }),
            #[cfg(windows)]
            Transport::Pipe => Ok(Endpoint::NamedPipe(self.pipe_name.clone())),
            #[cfg(not(windows))]
            Transport::Pipe => Err("remote.transport = \"pipe\" is only supported on Windows".into()),
        }
    }

    pub fn token(&self) -> Option<String> {
        self.token_env
            .as_deref()
            .and_then(|key| env::var(key).ok())
            .filter(|token| !token.trim().is_empty())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FacadeConfig {
    pub stop_retry_interval_ms: u64,
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            stop_retry_interval_ms: 1000,
        }
    }
}

impl FacadeConfig {
    pub fn stop_retry_interval(&self) -> Duration {
        Duration::from_millis(self.stop_retry_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub enabled: bool,
    pub base_url: Option<String>,
    /// Name of the environment variable holding an OAuth bearer token.
    pub access_token_env: Option<String>,
    pub poll_interval_ms: u64,
    /// Unset means the confirmation wait is unbounded.
    pub timeout_secs: Option<u64>,
    pub request_timeout_secs: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: Some(DEFAULT_BASE_URL.to_string()),
            access_token_env: None,
            poll_interval_ms: 1000,
            timeout_secs: None,
            request_timeout_secs: 15,
        }
    }
}

impl BroadcastConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn access_token(&self) -> Result<String, Box<dyn std::error::Error>> {
        let key = self
            .access_token_env
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or("broadcast.access_token_env is not set")?;
        env::var(key).map_err(|_| format!("environment variable {key} is not set").into())
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            config = toml::from_str::<Config>(&raw)
                .map_err(|err| format!("{}: {err}", config_path.display()))?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(val) = env_var("REMOTE_HOST") {
            self.remote.host = val;
        }
        if let Some(port) = env_var("REMOTE_PORT").and_then(|val| val.parse().ok()) {
            self.remote.port = port;
        }
        if let Some(val) = env_var("REMOTE_PIPE_NAME") {
            self.remote.pipe_name = val;
        }
        match env_var("REMOTE_TRANSPORT").as_deref() {
            Some("tcp") => self.remote.transport = Transport::Tcp,
            Some("pipe") => self.remote.transport = Transport::Pipe,
            _ => {}
        }
        if let Some(val) = env_var("REMOTE_TOKEN_ENV") {
            self.remote.token_env = Some(val);
        }

        if let Some(interval) = env_var("STOP_RETRY_INTERVAL_MS").and_then(|val| val.parse().ok())
        {
            self.facade.stop_retry_interval_ms = interval;
        }

        if let Some(val) = env_var("BROADCAST_ENABLED") {
            self.broadcast.enabled = val.parse().unwrap_or(false);
        }
        if let Some(val) = env_var("BROADCAST_BASE_URL") {
            self.broadcast.base_url = Some(val);
        }
        if let Some(val) = env_var("BROADCAST_ACCESS_TOKEN_ENV") {
            self.broadcast.access_token_env = Some(val);
        }
        if let Some(interval) = env_var("BROADCAST_POLL_INTERVAL_MS").and_then(|val| val.parse().ok())
        {
            self.broadcast.poll_interval_ms = interval;
        }
        if let Some(secs) = env_var("BROADCAST_TIMEOUT_SECS").and_then(|val| val.parse().ok()) {
            self.broadcast.timeout_secs = Some(secs);
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        match self.remote.transport {
            Transport::Tcp => {
                if self.remote.port == 0 {
                    return Err("remote.port must be non-zero".into());
                }
                if self.remote.host.trim().is_empty() {
                    return Err("remote.host must be set".into());
                }
            }
            Transport::Pipe => {
                if self.remote.pipe_name.trim().is_empty() {
                    return Err("remote.pipe_name is required when remote.transport = \"pipe\"".into());
                }
            }
        }
        if self.facade.stop_retry_interval_ms < 100 {
            return Err("facade.stop_retry_interval_ms must be >= 100".into());
        }
        if self.broadcast.poll_interval_ms < 100 {
            return Err("broadcast.poll_interval_ms must be >= 100".into());
        }
        if self.broadcast.enabled {
            if self.broadcast.base_url.as_deref().unwrap_or("").trim().is_empty() {
                return Err("broadcast.base_url is required when broadcast.enabled = true".into());
            }
            if self
                .broadcast
                .access_token_env
                .as_deref()
                .unwrap_or("")
                .trim()
                .is_empty()
            {
                return Err(
                    "broadcast.access_token_env is required when broadcast.enabled = true".into(),
                );
            }
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err(format!("{} already exists", path.as_ref().display()).into());
        }
        write_toml(path.as_ref(), &Config::default())
    }

    pub fn save(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.validate()?;
        write_toml(&active_config_path(), self)
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn env_var(suffix: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{suffix}")).ok()
}

fn write_toml(path: &Path, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, toml::to_string_pretty(config)?)?;
    Ok(())
}

fn managed_config_path() -> PathBuf {
    if let Some(path) = env_var("CONFIG_PATH") {
        return PathBuf::from(path);
    }
    let appdata = env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
    Path::new(&appdata).join(APP_DIR).join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = Config::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.remote.port, 59650);
        assert_eq!(parsed.facade.stop_retry_interval(), Duration::from_secs(1));
        assert!(parsed.broadcast.timeout().is_none());
    }

    #[test]
    fn partial_file_keeps_section_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [remote]
            port = 60000

            [broadcast]
            timeout_secs = 90
            "#,
        )
        .unwrap();
        assert_eq!(cfg.remote.host, "127.0.0.1");
        assert_eq!(cfg.remote.port, 60000);
        assert_eq!(cfg.remote.transport, Transport::Tcp);
        assert_eq!(cfg.broadcast.poll_interval(), Duration::from_secs(1));
        assert_eq!(cfg.broadcast.timeout(), Some(Duration::from_secs(90)));
    }

    #[test]
    fn tcp_endpoint_uses_host_and_port() {
        let cfg = Config::default();
        let endpoint = cfg.remote.endpoint().unwrap();
        assert_eq!(endpoint.to_string(), "tcp://127.0.0.1:59650");
    }

    #[test]
    fn validate_rejects_zero_port_and_empty_pipe() {
        let mut cfg = Config::default();
        cfg.remote.port = 0;
        assert!(cfg.validate().is_err());

        cfg.remote.transport = Transport::Pipe;
        assert!(cfg.validate().is_ok());
        cfg.remote.pipe_name = " ".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_too_low_intervals() {
        let mut cfg = Config::default();
        cfg.facade.stop_retry_interval_ms = 10;
        assert!(cfg.validate().is_err());

        cfg.facade.stop_retry_interval_ms = 1000;
        cfg.broadcast.poll_interval_ms = 50;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_requires_broadcast_fields_when_enabled() {
        let mut cfg = Config::default();
        cfg.broadcast.enabled = true;
        assert!(cfg.validate().is_err());

        cfg.broadcast.access_token_env = Some("YOUTUBE_ACCESS_TOKEN".to_string());
        assert!(cfg.validate().is_ok());

        cfg.broadcast.base_url = None;
        assert!(cfg.validate().is_err());
    }
}
