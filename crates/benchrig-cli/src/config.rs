//! Rig configuration – reads/writes `~/.benchrig/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use benchrig_hal::PotRails;
use benchrig_runtime::ServiceConfig;
use benchrig_types::Topics;

/// Which pulse-generator driver to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorDriver {
    /// Fully simulated rig; nothing leaves the process.
    #[default]
    Sim,
    /// SCPI generator over a serial port.
    Serial,
}

impl std::fmt::Display for GeneratorDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GeneratorDriver::Sim => write!(f, "sim"),
            GeneratorDriver::Serial => write!(f, "serial"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    #[serde(default)]
    pub driver: GeneratorDriver,

    /// Serial port tried first (e.g. `/dev/ttyUSB0`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Further ports tried after `port`, before the `/dev` scan.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scan_ports: Vec<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            driver: GeneratorDriver::default(),
            port: None,
            baud_rate: default_baud_rate(),
            scan_ports: Vec::new(),
        }
    }
}

/// Supply rails of the digital potentiometer, in volts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PotentiometerConfig {
    #[serde(default = "default_vdd")]
    pub vdd: f64,
    #[serde(default)]
    pub vss: f64,
}

impl Default for PotentiometerConfig {
    fn default() -> Self {
        Self {
            vdd: default_vdd(),
            vss: 0.0,
        }
    }
}

/// Persisted rig configuration stored in `~/.benchrig/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Bind address of the WebSocket bridge UI clients connect to.
    #[serde(default = "default_bridge_addr")]
    pub bridge_addr: String,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default = "default_command_topic")]
    pub command_topic: String,
    #[serde(default = "default_response_topic")]
    pub response_topic: String,
    #[serde(default = "default_status_topic")]
    pub status_topic: String,
    #[serde(default = "default_temperature_topic")]
    pub temperature_topic: String,
    #[serde(default = "default_progress_topic")]
    pub progress_topic: String,

    #[serde(default = "default_temperature_interval")]
    pub temperature_interval_secs: u64,

    /// Commands allowed to wait behind a running sequence.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// SQLite journal file. The journal lives in memory when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal_path: Option<PathBuf>,

    #[serde(default)]
    pub generator: GeneratorConfig,

    #[serde(default)]
    pub potentiometer: PotentiometerConfig,
}

fn default_bridge_addr() -> String {
    "0.0.0.0:1884".to_string()
}
fn default_client_id() -> String {
    "benchrig".to_string()
}
fn default_command_topic() -> String {
    Topics::default().command
}
fn default_response_topic() -> String {
    Topics::default().response
}
fn default_status_topic() -> String {
    Topics::default().status
}
fn default_temperature_topic() -> String {
    Topics::default().temperature
}
fn default_progress_topic() -> String {
    Topics::default().progress
}
fn default_temperature_interval() -> u64 {
    5
}
fn default_queue_capacity() -> usize {
    4
}
fn default_baud_rate() -> u32 {
    57_600
}
fn default_vdd() -> f64 {
    5.0
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bridge_addr: default_bridge_addr(),
            client_id: default_client_id(),
            command_topic: default_command_topic(),
            response_topic: default_response_topic(),
            status_topic: default_status_topic(),
            temperature_topic: default_temperature_topic(),
            progress_topic: default_progress_topic(),
            temperature_interval_secs: default_temperature_interval(),
            queue_capacity: default_queue_capacity(),
            journal_path: None,
            generator: GeneratorConfig::default(),
            potentiometer: PotentiometerConfig::default(),
        }
    }
}

impl Config {
    pub fn topics(&self) -> Topics {
        Topics {
            command: self.command_topic.clone(),
            response: self.response_topic.clone(),
            status: self.status_topic.clone(),
            temperature: self.temperature_topic.clone(),
            progress: self.progress_topic.clone(),
        }
    }

    pub fn rails(&self) -> PotRails {
        PotRails {
            vdd: self.potentiometer.vdd,
            vss: self.potentiometer.vss,
        }
    }

    pub fn bridge_socket(&self) -> Result<SocketAddr, String> {
        self.bridge_addr
            .parse()
            .map_err(|e| format!("Invalid bridge_addr '{}': {}", self.bridge_addr, e))
    }

    pub fn service(&self) -> ServiceConfig {
        ServiceConfig {
            topics: self.topics(),
            queue_capacity: self.queue_capacity,
            temperature_interval: Duration::from_secs(self.temperature_interval_secs),
            rails: self.rails(),
        }
    }

    /// Reject settings the rig cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        self.bridge_socket()?;
        if self.potentiometer.vdd <= self.potentiometer.vss {
            return Err(format!(
                "potentiometer vdd ({}) must be above vss ({})",
                self.potentiometer.vdd, self.potentiometer.vss
            ));
        }
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Return the path to `~/.benchrig/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".benchrig").join("config.toml")
}

/// Load the config from disk, falling back to defaults when the file does
/// not exist. Environment overrides apply either way.
pub fn load() -> Result<Config, String> {
    let mut cfg = load_from(&config_path())?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the config from a specific path. `None` if the file does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `BENCHRIG_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `BENCHRIG_BRIDGE_ADDR` | `bridge_addr` |
/// | `BENCHRIG_SERIAL_PORT` | `generator.port` (also selects the serial driver) |
/// | `BENCHRIG_TEMP_INTERVAL` | `temperature_interval_secs` |
/// | `BENCHRIG_JOURNAL` | `journal_path` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("BENCHRIG_BRIDGE_ADDR") {
        if v.parse::<SocketAddr>().is_ok() {
            cfg.bridge_addr = v;
        }
    }
    if let Ok(v) = std::env::var("BENCHRIG_SERIAL_PORT") {
        if !v.trim().is_empty() {
            cfg.generator.port = Some(v);
            cfg.generator.driver = GeneratorDriver::Serial;
        }
    }
    if let Ok(v) = std::env::var("BENCHRIG_TEMP_INTERVAL") {
        if let Ok(secs) = v.parse::<u64>() {
            cfg.temperature_interval_secs = secs;
        }
    }
    if let Ok(v) = std::env::var("BENCHRIG_JOURNAL") {
        if !v.trim().is_empty() {
            cfg.journal_path = Some(PathBuf::from(v));
        }
    }
}

/// Save the config to disk, creating `~/.benchrig/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_rig() {
        let cfg = Config::default();
        assert_eq!(cfg.bridge_addr, "0.0.0.0:1884");
        assert_eq!(cfg.temperature_interval_secs, 5);
        assert_eq!(cfg.queue_capacity, 4);
        assert_eq!(cfg.generator.driver, GeneratorDriver::Sim);
        assert_eq!(cfg.generator.baud_rate, 57_600);
        assert_eq!(cfg.rails(), PotRails { vdd: 5.0, vss: 0.0 });
        assert_eq!(cfg.topics(), Topics::default());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            command_topic = "/rig/cmd"

            [generator]
            driver = "serial"
            port = "/dev/ttyUSB3"

            [potentiometer]
            vdd = 10.0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.topics().command, "/rig/cmd");
        assert_eq!(cfg.topics().response, "/control_response");
        assert_eq!(cfg.generator.driver, GeneratorDriver::Serial);
        assert_eq!(cfg.generator.port.as_deref(), Some("/dev/ttyUSB3"));
        assert_eq!(cfg.generator.baud_rate, 57_600);
        assert_eq!(cfg.rails().vdd, 10.0);
        assert_eq!(cfg.service().temperature_interval, Duration::from_secs(5));
    }

    #[test]
    fn validate_rejects_inverted_rails_and_bad_addr() {
        let mut cfg = Config::default();
        cfg.potentiometer.vss = 6.0;
        assert!(cfg.validate().unwrap_err().contains("vdd"));

        let mut cfg = Config::default();
        cfg.bridge_addr = "nowhere".to_string();
        assert!(cfg.validate().unwrap_err().contains("bridge_addr"));

        let mut cfg = Config::default();
        cfg.queue_capacity = 0;
        assert!(cfg.validate().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = fs::metadata(&path).expect("file").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = fs::metadata(path.parent().unwrap())
            .expect("dir")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn roundtrip_saved_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = Config::default();
        cfg.journal_path = Some(dir.path().join("journal.db"));
        cfg.generator.scan_ports = vec!["/dev/ttyS0".to_string()];
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn config_path_points_to_benchrig_dir() {
        let p = config_path_for_home("/home/operator");
        assert_eq!(p, PathBuf::from("/home/operator/.benchrig/config.toml"));
    }

    // Every env override test lives in one function; the variables are
    // process-global.
    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        // SAFETY: the only test in this crate touching these variables.
        unsafe {
            std::env::set_var("BENCHRIG_BRIDGE_ADDR", "127.0.0.1:9001");
            std::env::set_var("BENCHRIG_SERIAL_PORT", "/dev/ttyACM1");
            std::env::set_var("BENCHRIG_TEMP_INTERVAL", "not-a-number");
            std::env::set_var("BENCHRIG_JOURNAL", "/var/lib/benchrig/journal.db");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.bridge_addr, "127.0.0.1:9001");
        assert_eq!(cfg.generator.port.as_deref(), Some("/dev/ttyACM1"));
        assert_eq!(cfg.generator.driver, GeneratorDriver::Serial);
        assert_eq!(cfg.temperature_interval_secs, 5);
        assert_eq!(
            cfg.journal_path,
            Some(PathBuf::from("/var/lib/benchrig/journal.db"))
        );

        unsafe {
            std::env::set_var("BENCHRIG_BRIDGE_ADDR", "bogus");
            std::env::set_var("BENCHRIG_TEMP_INTERVAL", "2");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.bridge_addr, "0.0.0.0:1884");
        assert_eq!(cfg.temperature_interval_secs, 2);

        unsafe {
            std::env::remove_var("BENCHRIG_BRIDGE_ADDR");
            std::env::remove_var("BENCHRIG_SERIAL_PORT");
            std::env::remove_var("BENCHRIG_TEMP_INTERVAL");
            std::env::remove_var("BENCHRIG_JOURNAL");
        }
    }
}
