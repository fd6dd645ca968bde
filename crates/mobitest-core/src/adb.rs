//! Interface to the Android Debug Bridge (`adb`) command-line tool.
//!
//! This module wraps the `adb` commands used by the Android driver and the
//! device manager: device listing, server restarts, shell commands, package
//! installation, input injection and screen capture.
//!
//! # Requirements
//!
//! The Android platform tools must be installed and `adb` must be on `PATH`.
//!
//! # Example
//!
//! ```no_run
//! use mobitest_core::adb::Adb;
//!
//! let devices = Adb::devices().unwrap();
//! if let Some(serial) = devices.first() {
//!     let model = Adb::getprop(serial, "ro.product.model").unwrap();
//!     let png = Adb::screencap(serial).unwrap();
//!     println!("{model}: {} byte screenshot", png.len());
//! }
//! ```

use std::io::ErrorKind;
use std::path::Path;
use std::process::{Command, Output};

use thiserror::Error;

/// Errors that can occur when interacting with adb.
#[derive(Error, Debug)]
pub enum AdbError {
    /// The `adb` binary could not be found on `PATH`.
    #[error("adb is not installed or not on PATH")]
    NotInstalled,

    /// An adb command exited with a non-zero status.
    #[error("Command execution failed: {0}")]
    CommandFailed(String),

    /// No device in the `device` state is attached.
    #[error("No Android device connected")]
    NoDevice,

    /// The requested serial is not in the attached device list.
    #[error("Device {0} not found")]
    DeviceNotFound(String),

    #[error("IO error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for AdbError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == ErrorKind::NotFound {
            AdbError::NotInstalled
        } else {
            AdbError::Io(e)
        }
    }
}

/// Wrapper for `adb` commands.
///
/// Provides static methods for interacting with Android devices.
/// All methods are synchronous and execute shell commands; async callers
/// should run them on `tokio::task::spawn_blocking`.
pub struct Adb;

impl Adb {
    fn run(args: &[&str]) -> Result<Output, AdbError> {
        let output = Command::new("adb").args(args).output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let msg = if stderr.is_empty() {
                String::from_utf8_lossy(&output.stdout).trim().to_string()
            } else {
                stderr
            };
            return Err(AdbError::CommandFailed(msg));
        }
        Ok(output)
    }

    fn run_on(serial: &str, args: &[&str]) -> Result<Output, AdbError> {
        let mut full = vec!["-s", serial];
        full.extend_from_slice(args);
        Self::run(&full)
    }

    fn stdout(output: Output) -> String {
        String::from_utf8_lossy(&output.stdout).to_string()
    }

    /// Returns the first line of `adb version`.
    ///
    /// # Errors
    ///
    /// - [`AdbError::NotInstalled`] if adb is missing
    pub fn version() -> Result<String, AdbError> {
        let output = Self::run(&["version"])?;
        Ok(Self::stdout(output).lines().next().unwrap_or_default().trim().to_string())
    }

    /// Lists the serials of attached devices in the `device` state.
    ///
    /// Devices that are `offline` or `unauthorized` are skipped.
    pub fn devices() -> Result<Vec<String>, AdbError> {
        let output = Self::run(&["devices"])?;
        Ok(Self::parse_devices(&Self::stdout(output)))
    }

    /// Parses `adb devices` output into serials.
    ///
    /// Exposed for testing. The header line is skipped and only
    /// `<serial>\tdevice` rows are kept.
    pub fn parse_devices(output: &str) -> Vec<String> {
        output
            .lines()
            .skip(1)
            .filter(|line| line.contains('\t'))
            .filter_map(|line| {
                let mut fields = line.split('\t');
                let serial = fields.next()?.trim();
                let state = fields.next()?.trim();
                (state == "device" && !serial.is_empty()).then(|| serial.to_string())
            })
            .collect()
    }

    pub fn kill_server() -> Result<(), AdbError> {
        Self::run(&["kill-server"]).map(|_| ())
    }

    pub fn start_server() -> Result<(), AdbError> {
        Self::run(&["start-server"]).map(|_| ())
    }

    /// Kills and restarts the adb server.
    pub fn restart_server() -> Result<(), AdbError> {
        Self::kill_server()?;
        Self::start_server()
    }

    /// Runs `adb -s <serial> shell <cmd>` and returns stdout.
    pub fn shell(serial: &str, cmd: &str) -> Result<String, AdbError> {
        let output = Self::run_on(serial, &["shell", cmd])?;
        Ok(Self::stdout(output))
    }

    /// Reads one system property. Empty when the property is unset.
    pub fn getprop(serial: &str, key: &str) -> Result<String, AdbError> {
        Ok(Self::shell(serial, &format!("getprop {key}"))?.trim().to_string())
    }

    /// Installs (or replaces) an APK.
    pub fn install(serial: &str, apk: &Path) -> Result<(), AdbError> {
        let apk = apk.to_string_lossy();
        let output = Self::run_on(serial, &["install", "-r", &apk])?;
        let stdout = Self::stdout(output);
        if stdout.contains("Failure") {
            return Err(AdbError::CommandFailed(stdout.trim().to_string()));
        }
        Ok(())
    }

    pub fn uninstall(serial: &str, package: &str) -> Result<(), AdbError> {
        let output = Self::run_on(serial, &["uninstall", package])?;
        let stdout = Self::stdout(output);
        if stdout.contains("Failure") {
            return Err(AdbError::CommandFailed(stdout.trim().to_string()));
        }
        Ok(())
    }

    /// Captures the screen as PNG bytes via `exec-out screencap -p`.
    pub fn screencap(serial: &str) -> Result<Vec<u8>, AdbError> {
        let output = Self::run_on(serial, &["exec-out", "screencap", "-p"])?;
        if output.stdout.is_empty() {
            return Err(AdbError::CommandFailed("screencap returned no data".to_string()));
        }
        Ok(output.stdout)
    }

    pub fn push(serial: &str, local: &Path, remote: &str) -> Result<(), AdbError> {
        Self::run_on(serial, &["push", &local.to_string_lossy(), remote]).map(|_| ())
    }

    pub fn pull(serial: &str, remote: &str, local: &Path) -> Result<(), AdbError> {
        Self::run_on(serial, &["pull", remote, &local.to_string_lossy()]).map(|_| ())
    }

    // -----------------------------------------------------------------------
    // Input
    // -----------------------------------------------------------------------

    pub fn tap(serial: &str, x: i32, y: i32) -> Result<(), AdbError> {
        Self::shell(serial, &format!("input tap {x} {y}")).map(|_| ())
    }

    /// Swipes between two points; equal points with a long duration act as a long press.
    pub fn swipe(
        serial: &str,
        from: (i32, i32),
        to: (i32, i32),
        duration_ms: u64,
    ) -> Result<(), AdbError> {
        Self::shell(
            serial,
            &format!("input swipe {} {} {} {} {duration_ms}", from.0, from.1, to.0, to.1),
        )
        .map(|_| ())
    }

    /// Sends a key event by name (`HOME`, `KEYCODE_ENTER`) or numeric code.
    pub fn keyevent(serial: &str, key: &str) -> Result<(), AdbError> {
        Self::shell(serial, &format!("input keyevent {}", Self::normalize_keycode(key))).map(|_| ())
    }

    /// Types text. Spaces are encoded as `%s` as required by `input text`.
    pub fn input_text(serial: &str, text: &str) -> Result<(), AdbError> {
        Self::shell(serial, &format!("input text {}", Self::escape_input_text(text))).map(|_| ())
    }

    /// Maps `HOME` to `KEYCODE_HOME`; codes and prefixed names pass through.
    pub fn normalize_keycode(key: &str) -> String {
        let key = key.trim();
        if key.chars().all(|c| c.is_ascii_digit()) || key.to_uppercase().starts_with("KEYCODE_") {
            key.to_uppercase()
        } else {
            format!("KEYCODE_{}", key.to_uppercase())
        }
    }

    /// Escapes text for `adb shell input text`.
    pub fn escape_input_text(text: &str) -> String {
        let mut escaped = String::with_capacity(text.len() * 2);
        for c in text.chars() {
            match c {
                ' ' => escaped.push_str("%s"),
                '\'' | '"' | '\\' | '&' | '|' | ';' | '<' | '>' | '(' | ')' | '$' | '`' | '*'
                | '?' | '~' | '#' | '!' => {
                    escaped.push('\\');
                    escaped.push(c);
                }
                _ => escaped.push(c),
            }
        }
        escaped
    }

    // -----------------------------------------------------------------------
    // Apps
    // -----------------------------------------------------------------------

    /// Launches the default activity of a package.
    pub fn start_app(serial: &str, package: &str) -> Result<(), AdbError> {
        let out = Self::shell(
            serial,
            &format!("monkey -p {package} -c android.intent.category.LAUNCHER 1"),
        )?;
        if out.contains("No activities found") || out.contains("monkey aborted") {
            return Err(AdbError::CommandFailed(out.trim().to_string()));
        }
        Ok(())
    }

    pub fn force_stop(serial: &str, package: &str) -> Result<(), AdbError> {
        Self::shell(serial, &format!("am force-stop {package}")).map(|_| ())
    }

    /// Clears app data. Returns whether adb reported `Success`.
    pub fn clear_app(serial: &str, package: &str) -> Result<bool, AdbError> {
        Ok(Self::shell(serial, &format!("pm clear {package}"))?.contains("Success"))
    }

    /// Lists packages; `third_party` restricts to user-installed ones (`-3`).
    pub fn list_packages(serial: &str, third_party: bool) -> Result<Vec<String>, AdbError> {
        let cmd = if third_party { "pm list packages -3" } else { "pm list packages" };
        Ok(Self::parse_packages(&Self::shell(serial, cmd)?))
    }

    /// Parses `pm list packages` output, stripping the `package:` prefix.
    pub fn parse_packages(output: &str) -> Vec<String> {
        output
            .lines()
            .filter_map(|line| line.trim().strip_prefix("package:"))
            .map(|pkg| pkg.trim().to_string())
            .filter(|pkg| !pkg.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_DEVICES: &str = "List of devices attached\n\
        emulator-5554\tdevice\n\
        R58M12ABCDE\tdevice\n\
        0123456789ABCDEF\tunauthorized\n\
        192.168.1.20:5555\toffline\n\n";

    #[test]
    fn test_parse_devices_keeps_only_ready_devices() {
        let devices = Adb::parse_devices(SAMPLE_DEVICES);
        assert_eq!(devices, vec!["emulator-5554", "R58M12ABCDE"]);
    }

    #[test]
    fn test_parse_devices_header_only() {
        assert!(Adb::parse_devices("List of devices attached\n\n").is_empty());
        assert!(Adb::parse_devices("").is_empty());
    }

    #[test]
    fn test_parse_devices_ignores_daemon_noise() {
        let output = "* daemon not running; starting now at tcp:5037\n\
            * daemon started successfully\n\
            List of devices attached\n\
            emulator-5556\tdevice\n";
        assert_eq!(Adb::parse_devices(output), vec!["emulator-5556"]);
    }

    #[test]
    fn test_parse_packages() {
        let output = "package:com.example.app\npackage:com.android.settings\n\nnoise\n";
        assert_eq!(
            Adb::parse_packages(output),
            vec!["com.example.app", "com.android.settings"]
        );
    }

    #[test]
    fn test_normalize_keycode() {
        assert_eq!(Adb::normalize_keycode("home"), "KEYCODE_HOME");
        assert_eq!(Adb::normalize_keycode("KEYCODE_ENTER"), "KEYCODE_ENTER");
        assert_eq!(Adb::normalize_keycode("66"), "66");
    }

    #[test]
    fn test_escape_input_text() {
        assert_eq!(Adb::escape_input_text("hello world"), "hello%sworld");
        assert_eq!(Adb::escape_input_text("a&b"), "a\\&b");
        assert_eq!(Adb::escape_input_text("user@example.com"), "user@example.com");
    }

    #[test]
    fn test_missing_binary_maps_to_not_installed() {
        let err: AdbError = std::io::Error::new(ErrorKind::NotFound, "no adb").into();
        assert!(matches!(err, AdbError::NotInstalled));

        let err: AdbError = std::io::Error::new(ErrorKind::PermissionDenied, "denied").into();
        assert!(matches!(err, AdbError::Io(_)));
    }

    #[test]
    fn test_adb_error_display() {
        assert!(AdbError::DeviceNotFound("emulator-1".into()).to_string().contains("emulator-1"));
        assert!(AdbError::NoDevice.to_string().contains("No Android device"));
    }
}
