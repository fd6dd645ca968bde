//! Target platforms and platform detection.
//!
//! Test files are grouped by directory name (`android/`, `ios/`, ...), so the
//! platform of a test module can be inferred from its path. The runner's
//! `--device` flag is exported as `MOBITEST_DEVICE` and takes precedence.
//!
//! # Example
//!
//! ```
//! use mobitest_core::platform::{detect_from_path, Platform};
//!
//! assert_eq!(detect_from_path("tests/android/login.rs"), Platform::Android);
//! assert_eq!(detect_from_path("tests/home.rs"), Platform::Ios);
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable carrying the platform chosen on the runner command line.
pub const DEVICE_ENV: &str = "MOBITEST_DEVICE";

/// Error returned when a platform name cannot be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown platform: {0}")]
pub struct UnknownPlatform(pub String);

/// A device platform that test cases can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    Windows,
    #[serde(rename = "macos")]
    MacOs,
}

impl Platform {
    /// All platforms, in config order.
    pub const ALL: [Platform; 4] = [
        Platform::Ios,
        Platform::Android,
        Platform::Windows,
        Platform::MacOs,
    ];

    /// Key used for this platform in the `devices` config map.
    pub fn config_key(&self) -> &'static str {
        match self {
            Platform::Ios => "IOS",
            Platform::Android => "ANDROID",
            Platform::Windows => "WINDOWS",
            Platform::MacOs => "MACOS",
        }
    }

    /// File extension (with dot) of installable app packages.
    pub fn package_extension(&self) -> &'static str {
        match self {
            Platform::Ios => ".ipa",
            Platform::Android => ".apk",
            Platform::Windows => ".exe",
            Platform::MacOs => ".app",
        }
    }

    /// Short lowercase name, as accepted by [`FromStr`].
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
            Platform::Windows => "windows",
            Platform::MacOs => "macos",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ios" => Ok(Platform::Ios),
            "android" => Ok(Platform::Android),
            "windows" | "win" => Ok(Platform::Windows),
            "macos" | "mac" => Ok(Platform::MacOs),
            other => Err(UnknownPlatform(other.to_string())),
        }
    }
}

/// Infers the platform of a test module from its file path.
///
/// Matching is done on the lowercased path. `andriod` is accepted as a
/// misspelling of `android` since older suites used that directory name.
/// Paths naming no platform default to iOS.
pub fn detect_from_path(path: impl AsRef<Path>) -> Platform {
    let path = path.as_ref().to_string_lossy().to_lowercase();

    if path.contains("android") || path.contains("andriod") {
        Platform::Android
    } else if path.contains("windows") || path.contains("win") {
        Platform::Windows
    } else if path.contains("macos") || path.contains("mac") {
        Platform::MacOs
    } else {
        Platform::Ios
    }
}

/// Resolves the platform for a test module.
///
/// A valid [`DEVICE_ENV`] value wins over path detection; an invalid value is
/// ignored with a warning.
pub fn resolve_platform(path: impl AsRef<Path>) -> Platform {
    resolve_with_override(std::env::var(DEVICE_ENV).ok().as_deref(), path)
}

fn resolve_with_override(env_value: Option<&str>, path: impl AsRef<Path>) -> Platform {
    if let Some(value) = env_value.filter(|v| !v.trim().is_empty()) {
        match value.parse() {
            Ok(platform) => return platform,
            Err(e) => tracing::warn!(error = %e, "ignoring {}", DEVICE_ENV),
        }
    }
    detect_from_path(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_android_including_legacy_spelling() {
        assert_eq!(detect_from_path("cases/android/test1/test_demo.rs"), Platform::Android);
        assert_eq!(detect_from_path("cases/andriod/test1/test_login.rs"), Platform::Android);
        assert_eq!(detect_from_path("Cases/ANDROID/x.rs"), Platform::Android);
    }

    #[test]
    fn detects_windows_and_macos() {
        assert_eq!(detect_from_path("cases/windows/smoke.rs"), Platform::Windows);
        assert_eq!(detect_from_path("cases/win/smoke.rs"), Platform::Windows);
        assert_eq!(detect_from_path("cases/macos/smoke.rs"), Platform::MacOs);
    }

    #[test]
    fn android_takes_priority_over_windows() {
        assert_eq!(detect_from_path("windows/android/x.rs"), Platform::Android);
    }

    #[test]
    fn defaults_to_ios() {
        assert_eq!(detect_from_path("cases/home/test_home.rs"), Platform::Ios);
        assert_eq!(detect_from_path(""), Platform::Ios);
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("iOS".parse::<Platform>().unwrap(), Platform::Ios);
        assert_eq!("ANDROID".parse::<Platform>().unwrap(), Platform::Android);
        assert_eq!(" Windows ".parse::<Platform>().unwrap(), Platform::Windows);
        assert!("symbian".parse::<Platform>().is_err());
    }

    #[test]
    fn env_override_wins_over_path() {
        assert_eq!(
            resolve_with_override(Some("android"), "cases/ios/home.rs"),
            Platform::Android
        );
    }

    #[test]
    fn invalid_or_empty_override_falls_back_to_path() {
        assert_eq!(resolve_with_override(Some("nokia"), "cases/android/a.rs"), Platform::Android);
        assert_eq!(resolve_with_override(Some(""), "cases/android/a.rs"), Platform::Android);
        assert_eq!(resolve_with_override(None, "cases/home.rs"), Platform::Ios);
    }

    #[test]
    fn config_keys_and_extensions() {
        assert_eq!(Platform::Ios.config_key(), "IOS");
        assert_eq!(Platform::Android.package_extension(), ".apk");
        assert_eq!(Platform::Windows.package_extension(), ".exe");
        assert_eq!(Platform::MacOs.to_string(), "macos");
    }
}
