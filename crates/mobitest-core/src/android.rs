//! Android-specific device operations built on [`Adb`].
//!
//! These helpers back the Android demo suites and `mobitest device-info`.
//! Getters degrade to sentinel values (`"unknown"`, `-1`, `false`) when the
//! device does not answer, so a flaky property never fails a report.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::adb::{Adb, AdbError};

/// Snapshot of device properties for reports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AndroidDeviceInfo {
    pub serial: String,
    pub android_version: String,
    pub api_level: String,
    pub brand: String,
    pub model: String,
    pub manufacturer: String,
    pub resolution: String,
    pub battery_level: i32,
    pub wifi_enabled: bool,
}

/// Package metadata from `dumpsys package`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppInfo {
    pub package: String,
    pub version_name: Option<String>,
    pub version_code: Option<String>,
    pub install_path: Option<String>,
}

/// Total PSS memory of one package.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MemoryInfo {
    pub total_kb: u64,
    pub total_mb: f64,
}

/// A connected Android device addressed by serial.
#[derive(Debug, Clone)]
pub struct AndroidDevice {
    serial: String,
}

impl AndroidDevice {
    pub fn new(serial: impl Into<String>) -> Self {
        Self { serial: serial.into() }
    }

    /// Uses the first attached device.
    pub fn first() -> Result<Self, AdbError> {
        Adb::devices()?
            .into_iter()
            .next()
            .map(Self::new)
            .ok_or(AdbError::NoDevice)
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    fn prop(&self, key: &str) -> String {
        match Adb::getprop(&self.serial, key) {
            Ok(v) if !v.is_empty() => v,
            Ok(_) => "unknown".to_string(),
            Err(e) => {
                warn!(key, error = %e, "getprop failed");
                "unknown".to_string()
            }
        }
    }

    fn shell_or_empty(&self, cmd: &str) -> String {
        Adb::shell(&self.serial, cmd).unwrap_or_else(|e| {
            warn!(cmd, error = %e, "shell command failed");
            String::new()
        })
    }

    pub fn device_info(&self) -> AndroidDeviceInfo {
        AndroidDeviceInfo {
            serial: self.serial.clone(),
            android_version: self.prop("ro.build.version.release"),
            api_level: self.prop("ro.build.version.sdk"),
            brand: self.prop("ro.product.brand"),
            model: self.prop("ro.product.model"),
            manufacturer: self.prop("ro.product.manufacturer"),
            resolution: self.screen_resolution(),
            battery_level: self.battery_level(),
            wifi_enabled: self.wifi_status(),
        }
    }

    /// `WIDTHxHEIGHT` from `wm size`, or `"unknown"`.
    pub fn screen_resolution(&self) -> String {
        parse_screen_resolution(&self.shell_or_empty("wm size"))
            .map(|(w, h)| format!("{w}x{h}"))
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Battery percentage, or `-1` when unavailable.
    pub fn battery_level(&self) -> i32 {
        parse_battery_level(&self.shell_or_empty("dumpsys battery")).unwrap_or(-1)
    }

    pub fn wifi_status(&self) -> bool {
        parse_wifi_enabled(&self.shell_or_empty("dumpsys wifi"))
    }

    /// Third-party packages. Empty on failure.
    pub fn installed_apps(&self) -> Vec<String> {
        Adb::list_packages(&self.serial, true).unwrap_or_else(|e| {
            warn!(error = %e, "failed to list packages");
            Vec::new()
        })
    }

    pub fn app_info(&self, package: &str) -> AppInfo {
        let output = self.shell_or_empty(&format!("dumpsys package {package}"));
        parse_app_info(package, &output)
    }

    pub fn force_stop_app(&self, package: &str) -> bool {
        log_outcome("force stop", package, Adb::force_stop(&self.serial, package))
    }

    pub fn clear_app_cache(&self, package: &str) -> bool {
        match Adb::clear_app(&self.serial, package) {
            Ok(ok) => ok,
            Err(e) => {
                warn!(package, error = %e, "pm clear failed");
                false
            }
        }
    }

    pub fn grant_permission(&self, package: &str, permission: &str) -> bool {
        let result = Adb::shell(&self.serial, &format!("pm grant {package} {permission}"));
        log_outcome("grant permission", permission, result)
    }

    pub fn revoke_permission(&self, package: &str, permission: &str) -> bool {
        let result = Adb::shell(&self.serial, &format!("pm revoke {package} {permission}"));
        log_outcome("revoke permission", permission, result)
    }

    /// `package/activity` of the focused window, or `"unknown"`.
    pub fn current_activity(&self) -> String {
        parse_current_activity(&self.shell_or_empty("dumpsys window windows"))
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn memory_info(&self, package: &str) -> Option<MemoryInfo> {
        parse_memory_info(&self.shell_or_empty(&format!("dumpsys meminfo {package}")))
    }

    pub fn enable_wifi(&self) -> bool {
        log_outcome("wifi", "enable", Adb::shell(&self.serial, "svc wifi enable"))
    }

    pub fn disable_wifi(&self) -> bool {
        log_outcome("wifi", "disable", Adb::shell(&self.serial, "svc wifi disable"))
    }

    pub fn set_airplane_mode(&self, enabled: bool) -> bool {
        let value = if enabled { 1 } else { 0 };
        let result = Adb::shell(
            &self.serial,
            &format!("settings put global airplane_mode_on {value}"),
        )
        .and_then(|_| {
            Adb::shell(
                &self.serial,
                &format!(
                    "am broadcast -a android.intent.action.AIRPLANE_MODE --ez state {enabled}"
                ),
            )
        });
        log_outcome("airplane mode", if enabled { "on" } else { "off" }, result)
    }

    /// Writes `adb bugreport` output to `dest` (a zip on modern devices).
    pub fn take_bug_report(&self, dest: &std::path::Path) -> Option<PathBuf> {
        let output = std::process::Command::new("adb")
            .args(["-s", &self.serial, "bugreport", &dest.to_string_lossy()])
            .output();
        match output {
            Ok(o) if o.status.success() => {
                info!(path = %dest.display(), "bug report saved");
                Some(dest.to_path_buf())
            }
            Ok(o) => {
                warn!(stderr = %String::from_utf8_lossy(&o.stderr), "bugreport failed");
                None
            }
            Err(e) => {
                warn!(error = %e, "bugreport failed");
                None
            }
        }
    }

    /// Core device properties keyed the way reports print them.
    pub fn basic_properties(&self) -> BTreeMap<String, String> {
        let mut info = BTreeMap::new();
        info.insert("device_id".to_string(), self.serial.clone());
        info.insert("android_version".to_string(), self.prop("ro.build.version.release"));
        info.insert("api_level".to_string(), self.prop("ro.build.version.sdk"));
        info.insert("brand".to_string(), self.prop("ro.product.brand"));
        info.insert("model".to_string(), self.prop("ro.product.model"));
        info
    }
}

fn log_outcome<T>(what: &str, target: &str, result: Result<T, AdbError>) -> bool {
    match result {
        Ok(_) => {
            info!(what, target, "ok");
            true
        }
        Err(e) => {
            warn!(what, target, error = %e, "failed");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).unwrap_or_else(|e| panic!("bad regex {pattern}: {e}")))
}

/// Parses `wm size`. An override size wins over the physical one.
pub fn parse_screen_resolution(output: &str) -> Option<(u32, u32)> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = regex(&RE, r"(\d+)x(\d+)");
    let line = output
        .lines()
        .find(|l| l.contains("Override size"))
        .or_else(|| output.lines().find(|l| l.contains("size")))
        .unwrap_or(output);
    let caps = re.captures(line)?;
    Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
}

pub fn parse_battery_level(output: &str) -> Option<i32> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let caps = regex(&RE, r"level: (\d+)").captures(output)?;
    caps[1].parse().ok()
}

pub fn parse_wifi_enabled(output: &str) -> bool {
    output
        .lines()
        .find(|l| l.contains("Wi-Fi is"))
        .is_some_and(|l| l.contains("enabled"))
}

pub fn parse_app_info(package: &str, output: &str) -> AppInfo {
    let field = |key: &str| {
        output.lines().find_map(|line| {
            let line = line.trim();
            let start = line.find(key)? + key.len();
            let value = line[start..].split_whitespace().next()?;
            Some(value.to_string())
        })
    };
    AppInfo {
        package: package.to_string(),
        version_name: field("versionName="),
        version_code: field("versionCode="),
        install_path: field("codePath="),
    }
}

pub fn parse_current_activity(output: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = regex(&RE, r"([\w\.]+/[\w\.\$]+)");
    output
        .lines()
        .filter(|l| l.contains("mCurrentFocus") || l.contains("mFocusedApp"))
        .find_map(|l| re.captures(l).map(|c| c[1].to_string()))
}

pub fn parse_memory_info(output: &str) -> Option<MemoryInfo> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let caps = regex(&RE, r"TOTAL\s+(\d+)").captures(output)?;
    let total_kb: u64 = caps[1].parse().ok()?;
    let total_mb = (total_kb as f64 / 1024.0 * 100.0).round() / 100.0;
    Some(MemoryInfo { total_kb, total_mb })
}
