//! Persistent configuration for mobitest.
//!
//! Configuration is a JSON document. It is looked up, in order, at the path in
//! `MOBITEST_CONFIG`, at `./mobitest.json`, and at `~/.mobitest/config.json`.
//! Any missing field takes its default, and a missing file yields
//! [`MobitestConfig::default`].
//!
//! # Example
//!
//! ```no_run
//! use mobitest_core::config::MobitestConfig;
//! use mobitest_core::platform::Platform;
//!
//! let config = MobitestConfig::load();
//! let uri = config.device_uri(Platform::Android).unwrap();
//! println!("connecting to {}", uri.raw);
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::platform::Platform;

/// Environment variable pointing at an explicit config file.
pub const CONFIG_ENV: &str = "MOBITEST_CONFIG";

const CONFIG_FILENAME: &str = "config.json";
/// Project-local config file, looked up in the working directory.
pub const LOCAL_CONFIG_FILENAME: &str = "mobitest.json";

/// Returns the mobitest home directory (`~/.mobitest`).
pub fn mobitest_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mobitest")
}

/// Errors raised while reading or interpreting configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The platform has no entry in the `devices` map.
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(Platform),

    /// A device URI did not have the `<Scheme>:///<rest>` shape.
    #[error("Invalid device uri: {0}")]
    InvalidUri(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Allure result and report directories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AllureConfig {
    pub report_dir: PathBuf,
    pub result_dir: PathBuf,
}

impl Default for AllureConfig {
    fn default() -> Self {
        Self {
            report_dir: PathBuf::from("allure_report"),
            result_dir: PathBuf::from("allure_result"),
        }
    }
}

/// Line format of stderr log output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging defaults. `RUST_LOG` still overrides `level`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    /// Optional file (relative to the export dir) that receives a copy of the log.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

/// How to reach one platform's device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct DeviceConfig {
    pub uri: String,
    /// Backend tuning knobs, passed through to the driver.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
    /// Serial or UDID to use instead of the first attached device.
    pub specific_device: Option<String>,
}

/// WebDriverAgent settings for iOS devices.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WdaConfig {
    pub url: String,
    pub local_port: u16,
    pub device_port: u16,
    /// Extra WebDriverAgent checkouts, searched before the built-in locations.
    pub project_paths: Vec<PathBuf>,
    pub startup_timeout_secs: u64,
}

impl Default for WdaConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8100".to_string(),
            local_port: 8100,
            device_port: 8100,
            project_paths: Vec::new(),
            startup_timeout_secs: 60,
        }
    }
}

/// The app under test and where its packages come from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub bundle_id: String,
    pub pkgs_dir: PathBuf,
    pub ipa_download_url: String,
    pub android_download_url: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bundle_id: "com.vv.work".to_string(),
            pkgs_dir: PathBuf::from("pkgs"),
            ipa_download_url: String::new(),
            android_download_url: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// MobitestConfig
// ---------------------------------------------------------------------------

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MobitestConfig {
    pub export_dir: PathBuf,
    pub allure: AllureConfig,
    pub log: LogConfig,
    /// Keyed by [`Platform::config_key`].
    pub devices: BTreeMap<String, DeviceConfig>,
    pub wda: WdaConfig,
    pub app: AppConfig,
}

impl Default for MobitestConfig {
    fn default() -> Self {
        let mut devices = BTreeMap::new();
        devices.insert(
            "IOS".to_string(),
            DeviceConfig {
                uri: "iOS:///http://127.0.0.1:8100".to_string(),
                ..Default::default()
            },
        );
        devices.insert(
            "ANDROID".to_string(),
            DeviceConfig {
                uri: "Android:///".to_string(),
                options: [
                    ("cap_method", "JAVACAP"),
                    ("touch_method", "ADBTOUCH"),
                    ("ori_method", "ADBORI"),
                    ("ime_method", "ADBIME"),
                ]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
                specific_device: None,
            },
        );
        devices.insert(
            "WINDOWS".to_string(),
            DeviceConfig {
                uri: "Windows:///".to_string(),
                ..Default::default()
            },
        );

        Self {
            export_dir: PathBuf::from("export_dir"),
            allure: AllureConfig::default(),
            log: LogConfig::default(),
            devices,
            wda: WdaConfig::default(),
            app: AppConfig::default(),
        }
    }
}

impl MobitestConfig {
    /// Loads configuration from the first existing candidate file.
    ///
    /// Returns [`Default`] if no file exists. A file that cannot be parsed is
    /// reported with a warning and also yields the defaults.
    pub fn load() -> Self {
        for path in Self::candidate_paths() {
            if path.exists() {
                return Self::load_from(&path).unwrap_or_else(|e| {
                    warn!(path = %path.display(), error = %e, "invalid config, using defaults");
                    Self::default()
                });
            }
        }
        debug!("no config file found, using defaults");
        Self::default()
    }

    /// Loads configuration from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&text)?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Files consulted by [`load`](Self::load), in priority order.
    pub fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Ok(explicit) = std::env::var(CONFIG_ENV) {
            if !explicit.is_empty() {
                paths.push(PathBuf::from(explicit));
            }
        }
        paths.push(PathBuf::from(LOCAL_CONFIG_FILENAME));
        paths.push(mobitest_dir().join(CONFIG_FILENAME));
        paths
    }

    /// Saves configuration as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Returns the device entry for a platform.
    pub fn device(&self, platform: Platform) -> Result<&DeviceConfig, ConfigError> {
        self.devices
            .get(platform.config_key())
            .ok_or(ConfigError::UnsupportedPlatform(platform))
    }

    /// Parses the configured device URI for a platform.
    ///
    /// `specific_device` fills in the target when the URI leaves it empty.
    pub fn device_uri(&self, platform: Platform) -> Result<DeviceUri, ConfigError> {
        let device = self.device(platform)?;
        let mut uri = DeviceUri::parse(&device.uri)?;
        if uri.target.is_empty() {
            if let Some(serial) = &device.specific_device {
                uri.target = serial.clone();
            }
        }
        Ok(uri)
    }
}

// ---------------------------------------------------------------------------
// Device URIs
// ---------------------------------------------------------------------------

/// A parsed `<Scheme>:///<target>?<params>` device URI.
///
/// For Android the target is a device serial (empty = first attached device).
/// For iOS it is the WebDriverAgent base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceUri {
    pub raw: String,
    pub scheme: String,
    pub target: String,
    pub params: BTreeMap<String, String>,
}

impl DeviceUri {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let (scheme, rest) = raw
            .split_once(":///")
            .ok_or_else(|| ConfigError::InvalidUri(raw.to_string()))?;
        if scheme.is_empty() {
            return Err(ConfigError::InvalidUri(raw.to_string()));
        }

        // Only Android-style URIs carry query params; an iOS target is itself
        // a URL and keeps its own query string.
        let (target, params) = match rest.split_once('?') {
            Some((target, query)) if !target.contains("://") => {
                let params = query
                    .split('&')
                    .filter(|kv| !kv.is_empty())
                    .map(|kv| match kv.split_once('=') {
                        Some((k, v)) => (k.to_string(), v.to_string()),
                        None => (kv.to_string(), String::new()),
                    })
                    .collect();
                (target.to_string(), params)
            }
            _ => (rest.to_string(), BTreeMap::new()),
        };

        Ok(Self {
            raw: raw.to_string(),
            scheme: scheme.to_string(),
            target,
            params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_three_platforms() {
        let config = MobitestConfig::default();
        assert_eq!(config.export_dir, PathBuf::from("export_dir"));
        assert_eq!(config.allure.result_dir, PathBuf::from("allure_result"));
        assert_eq!(config.allure.report_dir, PathBuf::from("allure_report"));
        assert_eq!(config.devices.len(), 3);

        let android = config.device(Platform::Android).unwrap();
        assert_eq!(android.options.get("cap_method").map(String::as_str), Some("JAVACAP"));
        assert!(android.specific_device.is_none());
    }

    #[test]
    fn macos_is_unsupported_by_default() {
        let config = MobitestConfig::default();
        let err = config.device_uri(Platform::MacOs).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedPlatform(Platform::MacOs)));
        assert!(err.to_string().contains("macos"));
    }

    #[test]
    fn ios_uri_keeps_wda_url() {
        let uri = MobitestConfig::default().device_uri(Platform::Ios).unwrap();
        assert_eq!(uri.scheme, "iOS");
        assert_eq!(uri.target, "http://127.0.0.1:8100");
        assert!(uri.params.is_empty());
    }

    #[test]
    fn android_uri_with_serial_and_params() {
        let uri = DeviceUri::parse("Android:///emulator-5554?cap_method=JAVACAP&touch_method=ADBTOUCH").unwrap();
        assert_eq!(uri.target, "emulator-5554");
        assert_eq!(uri.params.get("touch_method").map(String::as_str), Some("ADBTOUCH"));
    }

    #[test]
    fn specific_device_fills_empty_target() {
        let mut config = MobitestConfig::default();
        config.devices.get_mut("ANDROID").unwrap().specific_device = Some("R58M123".into());
        let uri = config.device_uri(Platform::Android).unwrap();
        assert_eq!(uri.target, "R58M123");
    }

    #[test]
    fn invalid_uri_is_rejected() {
        assert!(DeviceUri::parse("android").is_err());
        assert!(DeviceUri::parse(":///x").is_err());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: MobitestConfig =
            serde_json::from_str(r#"{"export_dir": "out", "app": {"bundle_id": "com.example"}}"#).unwrap();
        assert_eq!(config.export_dir, PathBuf::from("out"));
        assert_eq!(config.app.bundle_id, "com.example");
        assert_eq!(config.app.pkgs_dir, PathBuf::from("pkgs"));
        assert_eq!(config.wda.local_port, 8100);
    }

    #[test]
    fn log_format_reads_lowercase() {
        let config: MobitestConfig = serde_json::from_str(r#"{"log": {"format": "json"}}"#).unwrap();
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.log.level, "info");
        assert_eq!(MobitestConfig::default().log.format, LogFormat::Text);
    }

    #[test]
    fn save_then_load_from() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mobitest.json");
        let mut config = MobitestConfig::default();
        config.log.level = "debug".into();
        config.save(&path).unwrap();

        let loaded = MobitestConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn load_from_invalid_json_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            MobitestConfig::load_from(&path),
            Err(ConfigError::JsonParse(_))
        ));
    }
}
