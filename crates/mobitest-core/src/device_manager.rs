//! Device connection and session lifecycle.
//!
//! [`DeviceManager`] owns the one connected driver of the process. Test
//! modules ask it for a [`DeviceSession`] through [`DeviceManager::init_device`];
//! a second call for the same platform reuses the live connection.
//!
//! The Android helpers (`get_android_devices`, `check_adb_connection`,
//! `wait_for_device`, ...) keep a boolean contract: failures are logged and
//! reported as `false` or an empty list.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use mobitest_core::device_manager::DeviceManager;
//! use mobitest_core::platform::Platform;
//!
//! # async fn example() -> Result<(), mobitest_core::device_manager::ManagerError> {
//! let manager = DeviceManager::global();
//! let session = manager
//!     .init_device(Path::new("cases/android/test_login.rs"), Path::new("cases/android/log"), Platform::Android)
//!     .await?;
//! session.keyevent("HOME").await?;
//! manager.disconnect().await;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::adb::Adb;
use crate::android::AndroidDevice;
use crate::android_driver::AndroidDriver;
use crate::config::{ConfigError, DeviceUri, MobitestConfig};
use crate::driver::{DeviceDriver, DriverError, SharedDriver};
use crate::ios_driver::IosDriver;
use crate::platform::Platform;
use crate::session::{DeviceSession, SessionError, SessionOptions};

/// Poll interval of [`DeviceManager::wait_for_device`].
pub const DEVICE_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Invalid test file path: {0}")]
    InvalidTestFile(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Builds an unconnected driver for a platform and its device URI.
pub type Connector =
    Box<dyn Fn(Platform, &DeviceUri, &MobitestConfig) -> Result<Box<dyn DeviceDriver>, DriverError> + Send + Sync>;

/// Default driver factory: adb for Android, WDA for iOS.
pub fn default_connector(
    platform: Platform,
    uri: &DeviceUri,
    config: &MobitestConfig,
) -> Result<Box<dyn DeviceDriver>, DriverError> {
    match platform {
        Platform::Android => {
            let mut options = config.device(platform).map(|d| d.options.clone()).unwrap_or_default();
            options.extend(uri.params.clone());
            let serial = Some(uri.target.clone()).filter(|s| !s.is_empty());
            Ok(Box::new(AndroidDriver::new(serial).with_options(options)))
        }
        Platform::Ios => {
            let url = if uri.target.is_empty() {
                config.wda.url.clone()
            } else {
                uri.target.clone()
            };
            Ok(Box::new(IosDriver::new(&url)))
        }
        Platform::Windows | Platform::MacOs => Err(DriverError::unsupported(platform, "connect")),
    }
}

/// Owner of the process's device connection.
pub struct DeviceManager {
    config: MobitestConfig,
    connector: Connector,
    session_options: SessionOptions,
    current: Mutex<Option<(Platform, SharedDriver)>>,
}

static GLOBAL: OnceLock<DeviceManager> = OnceLock::new();

impl DeviceManager {
    pub fn new(config: MobitestConfig) -> Self {
        Self {
            config,
            connector: Box::new(default_connector),
            session_options: SessionOptions::default(),
            current: Mutex::new(None),
        }
    }

    /// Replaces the driver factory.
    pub fn with_connector(mut self, connector: Connector) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_session_options(mut self, options: SessionOptions) -> Self {
        self.session_options = options;
        self
    }

    /// The process-wide manager, configured from [`MobitestConfig::load`] on first use.
    pub fn global() -> &'static DeviceManager {
        GLOBAL.get_or_init(|| DeviceManager::new(MobitestConfig::load()))
    }

    pub fn config(&self) -> &MobitestConfig {
        &self.config
    }

    /// The connected driver, if any.
    pub async fn current(&self) -> Option<(Platform, SharedDriver)> {
        self.current.lock().await.clone()
    }

    /// Connects the configured device for `platform` without opening a session.
    pub async fn connect_device(&self, platform: Platform) -> Result<SharedDriver, ManagerError> {
        let uri = self.config.device_uri(platform)?;
        self.connect(platform, &uri).await
    }

    /// Connects the device for `platform` and opens a session logging into
    /// `<log_dir>/<test file stem>`.
    pub async fn init_device(&self, test_file: &Path, log_dir: &Path, platform: Platform) -> Result<DeviceSession, ManagerError> {
        let result = self.try_init_device(test_file, log_dir, platform).await;
        if let Err(e) = &result {
            error!(platform = %platform, error = %e, "device initialisation failed");
        }
        result
    }

    async fn try_init_device(&self, test_file: &Path, log_dir: &Path, platform: Platform) -> Result<DeviceSession, ManagerError> {
        let script_name = test_file
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .ok_or_else(|| ManagerError::InvalidTestFile(test_file.display().to_string()))?;
        let script_log_dir = log_dir.join(&script_name);
        std::fs::create_dir_all(&script_log_dir)?;

        let uri = self.config.device_uri(platform)?;
        let driver = self.connect(platform, &uri).await?;
        let session = DeviceSession::new(driver, &script_log_dir, self.session_options.clone()).await?;

        info!(
            platform = %platform,
            log_dir = %script_log_dir.display(),
            "device initialised"
        );
        Ok(session)
    }

    /// Returns the live driver for `platform`, connecting a new one if needed.
    async fn connect(&self, platform: Platform, uri: &DeviceUri) -> Result<SharedDriver, ManagerError> {
        let mut current = self.current.lock().await;
        if let Some((p, driver)) = current.as_ref() {
            let live = driver.read().await;
            if *p == platform && live.is_connected() && targets_device(platform, uri, live.device_id().as_deref()) {
                info!(platform = %platform, "reusing connected device");
                return Ok(driver.clone());
            }
        }

        let mut fresh = (self.connector)(platform, uri, &self.config)?;
        fresh.connect().await?;
        let shared: SharedDriver = std::sync::Arc::new(tokio::sync::RwLock::new(fresh));

        if let Some((_, old)) = current.replace((platform, shared.clone())) {
            if let Err(e) = old.write().await.disconnect().await {
                warn!(error = %e, "failed to disconnect previous device");
            }
        }
        Ok(shared)
    }

    /// Disconnects the current device. Logs a warning when nothing is connected.
    pub async fn disconnect(&self) {
        let taken = self.current.lock().await.take();
        match taken {
            Some((platform, driver)) => match driver.write().await.disconnect().await {
                Ok(()) => info!(platform = %platform, "device disconnected"),
                Err(e) => error!(platform = %platform, error = %e, "failed to disconnect device"),
            },
            None => warn!("no connected device to disconnect"),
        }
    }

    // -----------------------------------------------------------------------
    // Android helpers
    // -----------------------------------------------------------------------

    /// Serials of attached Android devices; empty when adb is missing or fails.
    pub async fn get_android_devices() -> Vec<String> {
        match tokio::task::spawn_blocking(Adb::devices).await {
            Ok(Ok(devices)) => {
                info!(?devices, "android devices");
                devices
            }
            Ok(Err(e)) => {
                error!(error = %e, "failed to list android devices");
                Vec::new()
            }
            Err(e) => {
                error!(error = %e, "adb task failed");
                Vec::new()
            }
        }
    }

    /// Connects an Android device, the first attached one when `serial` is `None`.
    pub async fn connect_android_device(&self, serial: Option<&str>) -> bool {
        let devices = Self::get_android_devices().await;
        self.connect_listed_android_device(serial, &devices).await
    }

    /// Connects `serial` (or the first of `devices`) if it is in `devices`.
    pub async fn connect_listed_android_device(&self, serial: Option<&str>, devices: &[String]) -> bool {
        if devices.is_empty() {
            error!("no android device available");
            return false;
        }
        let target = serial.map(str::to_string).unwrap_or_else(|| devices[0].clone());
        if !devices.iter().any(|d| *d == target) {
            error!(serial = %target, "requested device is not attached");
            return false;
        }

        let uri = DeviceUri {
            raw: format!("Android:///{target}"),
            scheme: "Android".to_string(),
            target: target.clone(),
            params: BTreeMap::new(),
        };
        match self.connect(Platform::Android, &uri).await {
            Ok(_) => {
                info!(serial = %target, "android device connected");
                true
            }
            Err(e) => {
                error!(serial = %target, error = %e, "failed to connect android device");
                false
            }
        }
    }

    /// Basic properties of the connected device, or an `error` entry.
    pub async fn get_device_info(&self, platform: Platform) -> BTreeMap<String, String> {
        let mut info = BTreeMap::new();
        let Some((connected_platform, driver)) = self.current().await else {
            info.insert("error".to_string(), "no device connected".to_string());
            return info;
        };
        let Some(device_id) = driver.read().await.device_id() else {
            info.insert("error".to_string(), "no device connected".to_string());
            return info;
        };

        info.insert("platform".to_string(), platform.to_string());
        match connected_platform {
            Platform::Android => {
                let device = AndroidDevice::new(device_id);
                match tokio::task::spawn_blocking(move || device.basic_properties()).await {
                    Ok(props) => info.extend(props),
                    Err(e) => {
                        info.insert("error".to_string(), e.to_string());
                    }
                }
            }
            _ => {
                info.insert("device_id".to_string(), device_id);
                info.insert("ios_version".to_string(), "unknown".to_string());
                info.insert("device_name".to_string(), "unknown".to_string());
            }
        }
        info
    }

    pub async fn check_adb_connection() -> bool {
        match tokio::task::spawn_blocking(Adb::version).await {
            Ok(Ok(version)) => {
                info!(version = %version.lines().next().unwrap_or_default(), "adb available");
                true
            }
            Ok(Err(e)) => {
                error!(error = %e, "adb unavailable; check the Android SDK installation");
                false
            }
            Err(e) => {
                error!(error = %e, "adb task failed");
                false
            }
        }
    }

    pub async fn restart_adb() -> bool {
        match tokio::task::spawn_blocking(Adb::restart_server).await {
            Ok(Ok(())) => {
                info!("adb server restarted");
                true
            }
            Ok(Err(e)) => {
                error!(error = %e, "adb restart failed");
                false
            }
            Err(e) => {
                error!(error = %e, "adb task failed");
                false
            }
        }
    }

    /// Polls for an attached Android device every [`DEVICE_POLL_INTERVAL`].
    pub async fn wait_for_device(timeout: Duration) -> bool {
        wait_for_device_with(timeout, DEVICE_POLL_INTERVAL, Self::get_android_devices).await
    }
}

/// Whether a live driver with `device_id` is the device `uri` asks for.
///
/// An Android URI naming a serial only matches a driver on that serial; any
/// other URI matches the live driver of its platform.
fn targets_device(platform: Platform, uri: &DeviceUri, device_id: Option<&str>) -> bool {
    match platform {
        Platform::Android if !uri.target.is_empty() => device_id == Some(uri.target.as_str()),
        _ => true,
    }
}

/// Polls `lister` every `interval` until it returns a device or `timeout` elapses.
pub async fn wait_for_device_with<F, Fut>(timeout: Duration, interval: Duration, mut lister: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Vec<String>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        let devices = lister().await;
        if let Some(first) = devices.first() {
            info!(serial = %first, "device connected");
            return true;
        }
        info!("waiting for device...");
        tokio::time::sleep(interval).await;
    }
    error!(timeout_secs = timeout.as_secs(), "timed out waiting for device");
    false
}
