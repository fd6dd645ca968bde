//! Android environment diagnostics (`mobitest doctor`).
//!
//! Each check produces a [`CheckOutcome`]; evaluation is split from the adb
//! calls so the verdicts can be tested without a device.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::adb::{Adb, AdbError};
use crate::android::AndroidDevice;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckOutcome {
    pub name: String,
    pub passed: bool,
    pub detail: String,
    /// What to try when the check failed.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<String>,
}

impl CheckOutcome {
    fn pass(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            detail: detail.into(),
            hints: Vec::new(),
        }
    }

    fn fail(name: &str, detail: impl Into<String>, hints: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            detail: detail.into(),
            hints: hints.iter().map(|h| h.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnvReport {
    pub checks: Vec<CheckOutcome>,
}

impl EnvReport {
    /// `(passed, total)`
    pub fn summary(&self) -> (usize, usize) {
        (self.checks.iter().filter(|c| c.passed).count(), self.checks.len())
    }

    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }
}

/// Version number from `adb version` output (`Android Debug Bridge version 1.0.41`).
pub fn parse_adb_version(output: &str) -> Option<String> {
    let first = output.lines().next()?;
    let mut words = first.split_whitespace();
    words.by_ref().find(|w| w.eq_ignore_ascii_case("version"))?;
    words.next().map(str::to_string)
}

pub fn evaluate_adb(version: Result<String, AdbError>) -> CheckOutcome {
    const NAME: &str = "adb installed";
    match version {
        Ok(output) => {
            let v = parse_adb_version(&output).unwrap_or_else(|| output.trim().to_string());
            CheckOutcome::pass(NAME, format!("adb {v}"))
        }
        Err(AdbError::NotInstalled) => CheckOutcome::fail(
            NAME,
            "adb not found on PATH",
            &[
                "install the Android SDK platform tools",
                "add the directory containing adb to PATH",
            ],
        ),
        Err(e) => CheckOutcome::fail(NAME, format!("adb version failed: {e}"), &[]),
    }
}

pub fn evaluate_devices(devices: &[String]) -> CheckOutcome {
    const NAME: &str = "devices attached";
    if devices.is_empty() {
        CheckOutcome::fail(
            NAME,
            "no Android device found",
            &[
                "connect a device with USB debugging enabled",
                "start an Android emulator",
                "check the device driver",
            ],
        )
    } else {
        CheckOutcome::pass(NAME, format!("{} device(s): {}", devices.len(), devices.join(", ")))
    }
}

pub fn evaluate_device_info(serial: Option<&str>, info: &BTreeMap<String, String>) -> CheckOutcome {
    const NAME: &str = "device capabilities";
    let Some(serial) = serial else {
        return CheckOutcome::fail(NAME, "skipped: no device", &[]);
    };
    let known: Vec<String> = info
        .iter()
        .filter(|(_, v)| !v.is_empty() && v.as_str() != "unknown")
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    if known.len() <= 1 {
        CheckOutcome::fail(NAME, format!("could not read properties of {serial}"), &["unlock the device and accept the debugging prompt"])
    } else {
        CheckOutcome::pass(NAME, known.join(", "))
    }
}

pub fn evaluate_screenshot(serial: Option<&str>, png: Result<Vec<u8>, AdbError>) -> CheckOutcome {
    const NAME: &str = "screenshot";
    const PNG_MAGIC: &[u8] = b"\x89PNG";
    match (serial, png) {
        (None, _) => CheckOutcome::fail(NAME, "skipped: no device", &[]),
        (Some(_), Ok(bytes)) if bytes.starts_with(PNG_MAGIC) => CheckOutcome::pass(NAME, format!("{} bytes captured", bytes.len())),
        (Some(_), Ok(_)) => CheckOutcome::fail(NAME, "screencap did not return a PNG", &["check the device screen is on"]),
        (Some(_), Err(e)) => CheckOutcome::fail(NAME, format!("screencap failed: {e}"), &[]),
    }
}

/// Runs every check against the local adb and the first attached device.
///
/// Blocking; call from `spawn_blocking` in async contexts.
pub fn run_android_checks() -> EnvReport {
    let mut report = EnvReport::default();
    report.checks.push(evaluate_adb(Adb::version()));

    let devices = Adb::devices().unwrap_or_else(|e| {
        debug!(error = %e, "adb devices failed");
        Vec::new()
    });
    report.checks.push(evaluate_devices(&devices));

    let first = devices.first().map(String::as_str);
    let info = first
        .map(|serial| AndroidDevice::new(serial).basic_properties())
        .unwrap_or_default();
    report.checks.push(evaluate_device_info(first, &info));

    let png = match first {
        Some(serial) => Adb::screencap(serial),
        None => Err(AdbError::NoDevice),
    };
    report.checks.push(evaluate_screenshot(first, png));
    report
}
