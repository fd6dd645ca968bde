//! Device driver trait for platform-agnostic UI automation.
//!
//! This module defines the [`DeviceDriver`] trait, the primitive device
//! operations (screenshot, touch, text, shell, app management) that the rest
//! of the crate is written against. Backends implement it for a platform:
//!
//! - [`AndroidDriver`](crate::android_driver::AndroidDriver) drives `adb`
//! - [`IosDriver`](crate::ios_driver::IosDriver) drives WebDriverAgent
//!
//! Coordinates are always screenshot pixels. Capabilities a backend lacks
//! fall back to the default methods, which return [`DriverError::Unsupported`].
//!
//! # Example
//!
//! ```no_run
//! use mobitest_core::android_driver::AndroidDriver;
//! use mobitest_core::driver::DeviceDriver;
//!
//! # async fn example() -> Result<(), mobitest_core::driver::DriverError> {
//! let mut driver = AndroidDriver::new(None);
//! driver.connect().await?;
//! driver.tap(540, 960).await?;
//! let png = driver.screenshot().await?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::adb::AdbError;
use crate::ios::WdaLifecycleError;
use crate::platform::Platform;
use crate::wda::WdaError;

/// Errors that can occur during device driver operations.
///
/// This enum unifies errors from all backends behind a single type.
#[derive(Error, Debug)]
pub enum DriverError {
    /// A device command failed with the given message.
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// The driver has not been connected yet, or was disconnected.
    #[error("Not connected to a device")]
    NotConnected,

    /// No device matching the request is attached.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The backend does not implement this operation.
    #[error("{operation} is not supported on {platform}")]
    Unsupported {
        platform: Platform,
        operation: &'static str,
    },

    #[error("Operation timed out")]
    Timeout,

    #[error("adb error: {0}")]
    Adb(#[from] AdbError),

    #[error("WDA error: {0}")]
    Wda(#[from] WdaError),

    #[error("WDA lifecycle error: {0}")]
    WdaLifecycle(#[from] WdaLifecycleError),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    pub fn unsupported(platform: Platform, operation: &'static str) -> Self {
        DriverError::Unsupported { platform, operation }
    }
}

/// An installed application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppEntry {
    pub id: String,
    pub name: String,
    pub version: String,
}

/// A driver shared between the device manager and the active session.
///
/// Operations take the read lock; `connect` and `disconnect` take the write lock.
pub type SharedDriver = Arc<tokio::sync::RwLock<Box<dyn DeviceDriver>>>;

/// Wraps a driver for sharing.
pub fn shared(driver: impl DeviceDriver + 'static) -> SharedDriver {
    Arc::new(tokio::sync::RwLock::new(Box::new(driver)))
}

/// Backend-agnostic interface over one device.
///
/// Implementations must be `Send + Sync` so a driver can be shared behind an
/// `Arc` between the session and popup handlers.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Establishes the connection (resolves the device, opens sessions).
    async fn connect(&mut self) -> Result<(), DriverError>;

    /// Releases the connection. Must be safe to call when not connected.
    async fn disconnect(&mut self) -> Result<(), DriverError>;

    fn is_connected(&self) -> bool;

    fn platform(&self) -> Platform;

    /// Serial / UDID / endpoint identifying the device, once connected.
    fn device_id(&self) -> Option<String>;

    /// Captures the screen as PNG bytes.
    async fn screenshot(&self) -> Result<Vec<u8>, DriverError>;

    /// Screen size in screenshot pixels.
    async fn screen_size(&self) -> Result<(u32, u32), DriverError> {
        let png = self.screenshot().await?;
        let img = image::load_from_memory(&png)?;
        Ok((img.width(), img.height()))
    }

    async fn tap(&self, x: i32, y: i32) -> Result<(), DriverError>;

    async fn double_tap(&self, x: i32, y: i32) -> Result<(), DriverError> {
        self.tap(x, y).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.tap(x, y).await
    }

    async fn swipe(&self, from: (i32, i32), to: (i32, i32), duration: Duration) -> Result<(), DriverError>;

    async fn long_press(&self, x: i32, y: i32, duration: Duration) -> Result<(), DriverError> {
        self.swipe((x, y), (x, y), duration).await
    }

    /// Sends a key by name (`HOME`, `ENTER`, `BACK`, ...).
    async fn keyevent(&self, key: &str) -> Result<(), DriverError>;

    /// Types text into the focused field, optionally pressing enter afterwards.
    async fn text(&self, text: &str, enter: bool) -> Result<(), DriverError>;

    async fn home(&self) -> Result<(), DriverError> {
        self.keyevent("HOME").await
    }

    async fn wake(&self) -> Result<(), DriverError> {
        self.keyevent("WAKEUP").await
    }

    async fn start_app(&self, app_id: &str) -> Result<(), DriverError>;

    async fn stop_app(&self, app_id: &str) -> Result<(), DriverError>;

    async fn clear_app(&self, _app_id: &str) -> Result<(), DriverError> {
        Err(DriverError::unsupported(self.platform(), "clear_app"))
    }

    async fn install_app(&self, _package: &Path) -> Result<(), DriverError> {
        Err(DriverError::unsupported(self.platform(), "install_app"))
    }

    async fn uninstall_app(&self, _app_id: &str) -> Result<(), DriverError> {
        Err(DriverError::unsupported(self.platform(), "uninstall_app"))
    }

    async fn list_apps(&self) -> Result<Vec<AppEntry>, DriverError> {
        Err(DriverError::unsupported(self.platform(), "list_apps"))
    }

    async fn shell(&self, _cmd: &str) -> Result<String, DriverError> {
        Err(DriverError::unsupported(self.platform(), "shell"))
    }

    async fn get_clipboard(&self) -> Result<String, DriverError> {
        Err(DriverError::unsupported(self.platform(), "get_clipboard"))
    }

    async fn set_clipboard(&self, _text: &str) -> Result<(), DriverError> {
        Err(DriverError::unsupported(self.platform(), "set_clipboard"))
    }

    async fn push(&self, _local: &Path, _remote: &str) -> Result<(), DriverError> {
        Err(DriverError::unsupported(self.platform(), "push"))
    }

    async fn pull(&self, _remote: &str, _local: &Path) -> Result<(), DriverError> {
        Err(DriverError::unsupported(self.platform(), "pull"))
    }
}
