//! [`DeviceDriver`] backend for Android devices over `adb`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::adb::{Adb, AdbError};
use crate::driver::{AppEntry, DeviceDriver, DriverError};
use crate::platform::Platform;

/// Runs a blocking adb call off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, DriverError>
where
    F: FnOnce() -> Result<T, AdbError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DriverError::CommandFailed(format!("adb task failed: {e}")))?
        .map_err(DriverError::from)
}

/// Android device driven through `adb shell input` and friends.
pub struct AndroidDriver {
    requested: Option<String>,
    serial: Option<String>,
    options: BTreeMap<String, String>,
}

impl AndroidDriver {
    /// `serial` selects a device; `None` picks the first attached one on connect.
    pub fn new(serial: Option<String>) -> Self {
        Self {
            requested: serial.filter(|s| !s.is_empty()),
            serial: None,
            options: BTreeMap::new(),
        }
    }

    /// Attaches backend options from the device config (`cap_method`, `touch_method`, ...).
    pub fn with_options(mut self, options: BTreeMap<String, String>) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    fn serial(&self) -> Result<String, DriverError> {
        self.serial.clone().ok_or(DriverError::NotConnected)
    }

    /// Picks the device to use from the attached serials.
    pub fn choose_serial(requested: Option<&str>, attached: &[String]) -> Result<String, AdbError> {
        match requested {
            Some(serial) if attached.iter().any(|s| s == serial) => Ok(serial.to_string()),
            Some(serial) => Err(AdbError::DeviceNotFound(serial.to_string())),
            None => attached.first().cloned().ok_or(AdbError::NoDevice),
        }
    }
}

#[async_trait]
impl DeviceDriver for AndroidDriver {
    async fn connect(&mut self) -> Result<(), DriverError> {
        let attached = blocking(Adb::devices).await?;
        let serial = Self::choose_serial(self.requested.as_deref(), &attached)?;
        info!(serial = %serial, "connected to Android device");
        self.serial = Some(serial);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), DriverError> {
        if let Some(serial) = self.serial.take() {
            debug!(serial = %serial, "disconnected");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.serial.is_some()
    }

    fn platform(&self) -> Platform {
        Platform::Android
    }

    fn device_id(&self) -> Option<String> {
        self.serial.clone()
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        let serial = self.serial()?;
        blocking(move || Adb::screencap(&serial)).await
    }

    async fn tap(&self, x: i32, y: i32) -> Result<(), DriverError> {
        let serial = self.serial()?;
        blocking(move || Adb::tap(&serial, x, y)).await
    }

    async fn swipe(&self, from: (i32, i32), to: (i32, i32), duration: Duration) -> Result<(), DriverError> {
        let serial = self.serial()?;
        let ms = duration.as_millis() as u64;
        blocking(move || Adb::swipe(&serial, from, to, ms)).await
    }

    async fn keyevent(&self, key: &str) -> Result<(), DriverError> {
        let serial = self.serial()?;
        let key = key.to_string();
        blocking(move || Adb::keyevent(&serial, &key)).await
    }

    async fn text(&self, text: &str, enter: bool) -> Result<(), DriverError> {
        let serial = self.serial()?;
        let text = text.to_string();
        blocking(move || {
            Adb::input_text(&serial, &text)?;
            if enter {
                Adb::keyevent(&serial, "ENTER")?;
            }
            Ok(())
        })
        .await
    }

    async fn start_app(&self, app_id: &str) -> Result<(), DriverError> {
        let serial = self.serial()?;
        let package = app_id.to_string();
        blocking(move || Adb::start_app(&serial, &package)).await
    }

    async fn stop_app(&self, app_id: &str) -> Result<(), DriverError> {
        let serial = self.serial()?;
        let package = app_id.to_string();
        blocking(move || Adb::force_stop(&serial, &package)).await
    }

    async fn clear_app(&self, app_id: &str) -> Result<(), DriverError> {
        let serial = self.serial()?;
        let package = app_id.to_string();
        let cleared = blocking(move || Adb::clear_app(&serial, &package)).await?;
        if !cleared {
            return Err(DriverError::CommandFailed(format!("pm clear {app_id} did not succeed")));
        }
        Ok(())
    }

    async fn install_app(&self, package: &Path) -> Result<(), DriverError> {
        let serial = self.serial()?;
        let apk: PathBuf = package.to_path_buf();
        blocking(move || Adb::install(&serial, &apk)).await
    }

    async fn uninstall_app(&self, app_id: &str) -> Result<(), DriverError> {
        let serial = self.serial()?;
        let package = app_id.to_string();
        blocking(move || Adb::uninstall(&serial, &package)).await
    }

    async fn list_apps(&self) -> Result<Vec<AppEntry>, DriverError> {
        let serial = self.serial()?;
        let packages = blocking({
            let serial = serial.clone();
            move || Adb::list_packages(&serial, true)
        })
        .await?;

        let mut apps = Vec::with_capacity(packages.len());
        for package in packages {
            let info = {
                let serial = serial.clone();
                let package = package.clone();
                blocking(move || Adb::shell(&serial, &format!("dumpsys package {package}"))).await?
            };
            let info = crate::android::parse_app_info(&package, &info);
            apps.push(AppEntry {
                name: package.clone(),
                id: package,
                version: info.version_name.unwrap_or_default(),
            });
        }
        Ok(apps)
    }

    async fn shell(&self, cmd: &str) -> Result<String, DriverError> {
        let serial = self.serial()?;
        let cmd = cmd.to_string();
        blocking(move || Adb::shell(&serial, &cmd)).await
    }

    async fn push(&self, local: &Path, remote: &str) -> Result<(), DriverError> {
        let serial = self.serial()?;
        let (local, remote) = (local.to_path_buf(), remote.to_string());
        blocking(move || Adb::push(&serial, &local, &remote)).await
    }

    async fn pull(&self, remote: &str, local: &Path) -> Result<(), DriverError> {
        let serial = self.serial()?;
        let (local, remote) = (local.to_path_buf(), remote.to_string());
        blocking(move || Adb::pull(&serial, &remote, &local)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attached() -> Vec<String> {
        vec!["emulator-5554".to_string(), "R58M12ABCDE".to_string()]
    }

    #[test]
    fn choose_first_when_unspecified() {
        assert_eq!(AndroidDriver::choose_serial(None, &attached()).unwrap(), "emulator-5554");
    }

    #[test]
    fn choose_requested_serial() {
        assert_eq!(
            AndroidDriver::choose_serial(Some("R58M12ABCDE"), &attached()).unwrap(),
            "R58M12ABCDE"
        );
    }

    #[test]
    fn requested_serial_must_be_attached() {
        let err = AndroidDriver::choose_serial(Some("missing"), &attached()).unwrap_err();
        assert!(matches!(err, AdbError::DeviceNotFound(ref s) if s == "missing"));
    }

    #[test]
    fn no_devices_is_an_error() {
        assert!(matches!(
            AndroidDriver::choose_serial(None, &[]),
            Err(AdbError::NoDevice)
        ));
    }

    #[tokio::test]
    async fn operations_require_connect() {
        let driver = AndroidDriver::new(Some(String::new()));
        assert!(!driver.is_connected());
        assert!(driver.device_id().is_none());
        assert!(matches!(driver.tap(1, 1).await, Err(DriverError::NotConnected)));
        assert!(matches!(driver.get_clipboard().await, Err(DriverError::Unsupported { .. })));
    }
}
