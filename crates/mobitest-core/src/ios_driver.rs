//! [`DeviceDriver`] backend for iOS devices through WebDriverAgent.
//!
//! WDA takes coordinates in points while screenshots are in pixels, so the
//! driver measures the display scale (screenshot width / window width) once
//! and converts every gesture.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::driver::{AppEntry, DeviceDriver, DriverError};
use crate::ios::{self, start_app_by_wda, LaunchOptions, WdaLifecycleError};
use crate::platform::Platform;
use crate::wda::WdaClient;

/// iOS device driven through a WebDriverAgent endpoint.
pub struct IosDriver {
    client: WdaClient,
    udid: Option<String>,
    connected: bool,
    scale: Mutex<Option<f64>>,
    launch_options: LaunchOptions,
}

impl IosDriver {
    /// `wda_url` is the forwarded WDA endpoint, e.g. `http://127.0.0.1:8100`.
    pub fn new(wda_url: &str) -> Self {
        Self {
            client: WdaClient::new(wda_url),
            udid: None,
            connected: false,
            scale: Mutex::new(None),
            launch_options: LaunchOptions::default(),
        }
    }

    /// Pins the device UDID used for `ideviceinstaller` calls.
    pub fn with_udid(mut self, udid: impl Into<String>) -> Self {
        self.udid = Some(udid.into());
        self
    }

    pub fn with_launch_options(mut self, options: LaunchOptions) -> Self {
        self.launch_options = options;
        self
    }

    pub fn client(&self) -> &WdaClient {
        &self.client
    }

    fn ensure_connected(&self) -> Result<(), DriverError> {
        if self.connected {
            Ok(())
        } else {
            Err(DriverError::NotConnected)
        }
    }

    fn udid(&self) -> Result<String, DriverError> {
        self.udid
            .clone()
            .ok_or_else(|| DriverError::DeviceNotFound("no UDID for ideviceinstaller".to_string()))
    }

    /// Pixels per point, measured on first use.
    async fn scale(&self) -> Result<f64, DriverError> {
        if let Ok(guard) = self.scale.lock() {
            if let Some(scale) = *guard {
                return Ok(scale);
            }
        }
        let (px_width, _) = self.screen_size().await?;
        let window = self.client.window_size().await?;
        let scale = if window.width > 0.0 {
            px_width as f64 / window.width
        } else {
            1.0
        };
        debug!(scale, "display scale measured");
        if let Ok(mut guard) = self.scale.lock() {
            *guard = Some(scale);
        }
        Ok(scale)
    }

    async fn to_points(&self, x: i32, y: i32) -> Result<(f64, f64), DriverError> {
        let scale = self.scale().await?;
        Ok((x as f64 / scale, y as f64 / scale))
    }

    async fn installer<T, F>(&self, f: F) -> Result<T, DriverError>
    where
        F: FnOnce(String) -> Result<T, WdaLifecycleError> + Send + 'static,
        T: Send + 'static,
    {
        let udid = self.udid()?;
        tokio::task::spawn_blocking(move || f(udid))
            .await
            .map_err(|e| DriverError::CommandFailed(format!("installer task failed: {e}")))?
            .map_err(DriverError::from)
    }
}

#[async_trait]
impl DeviceDriver for IosDriver {
    async fn connect(&mut self) -> Result<(), DriverError> {
        self.client.status().await?;
        self.client.create_session().await?;

        if self.udid.is_none() {
            match tokio::task::spawn_blocking(ios::list_udids).await {
                Ok(Ok(udids)) => self.udid = udids.into_iter().next(),
                Ok(Err(e)) => debug!(error = %e, "idevice_id unavailable"),
                Err(e) => debug!(error = %e, "idevice_id task failed"),
            }
        }

        self.connected = true;
        info!(url = %self.client.base_url(), udid = ?self.udid, "connected to iOS device");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), DriverError> {
        self.client.reset_session().await;
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn platform(&self) -> Platform {
        Platform::Ios
    }

    fn device_id(&self) -> Option<String> {
        if !self.connected {
            return None;
        }
        Some(self.udid.clone().unwrap_or_else(|| self.client.base_url().to_string()))
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        self.ensure_connected()?;
        Ok(self.client.screenshot().await?)
    }

    async fn tap(&self, x: i32, y: i32) -> Result<(), DriverError> {
        self.ensure_connected()?;
        let (px, py) = self.to_points(x, y).await?;
        Ok(self.client.tap(px, py).await?)
    }

    async fn double_tap(&self, x: i32, y: i32) -> Result<(), DriverError> {
        self.ensure_connected()?;
        let (px, py) = self.to_points(x, y).await?;
        Ok(self.client.double_tap(px, py).await?)
    }

    async fn swipe(&self, from: (i32, i32), to: (i32, i32), duration: Duration) -> Result<(), DriverError> {
        self.ensure_connected()?;
        let from = self.to_points(from.0, from.1).await?;
        let to = self.to_points(to.0, to.1).await?;
        Ok(self.client.drag(from, to, duration).await?)
    }

    async fn long_press(&self, x: i32, y: i32, duration: Duration) -> Result<(), DriverError> {
        self.ensure_connected()?;
        let (px, py) = self.to_points(x, y).await?;
        Ok(self.client.touch_and_hold(px, py, duration).await?)
    }

    async fn keyevent(&self, key: &str) -> Result<(), DriverError> {
        self.ensure_connected()?;
        match key.trim().to_uppercase().trim_start_matches("KEYCODE_") {
            "HOME" => Ok(self.client.home().await?),
            "VOLUMEUP" | "VOLUME_UP" => Ok(self.client.press_button("volumeUp").await?),
            "VOLUMEDOWN" | "VOLUME_DOWN" => Ok(self.client.press_button("volumeDown").await?),
            "ENTER" | "RETURN" => Ok(self.client.send_keys("\n").await?),
            "WAKEUP" => Ok(self.client.unlock().await?),
            _ => Err(DriverError::CommandFailed(format!("unsupported iOS key: {key}"))),
        }
    }

    async fn text(&self, text: &str, enter: bool) -> Result<(), DriverError> {
        self.ensure_connected()?;
        let mut value = text.to_string();
        if enter {
            value.push('\n');
        }
        Ok(self.client.send_keys(&value).await?)
    }

    async fn home(&self) -> Result<(), DriverError> {
        self.ensure_connected()?;
        Ok(self.client.home().await?)
    }

    async fn wake(&self) -> Result<(), DriverError> {
        self.ensure_connected()?;
        Ok(self.client.unlock().await?)
    }

    async fn start_app(&self, app_id: &str) -> Result<(), DriverError> {
        self.ensure_connected()?;
        if start_app_by_wda(&self.client, app_id, &self.launch_options).await? {
            Ok(())
        } else {
            warn!(app_id, "app never reached the foreground");
            Err(DriverError::Timeout)
        }
    }

    async fn stop_app(&self, app_id: &str) -> Result<(), DriverError> {
        self.ensure_connected()?;
        Ok(self.client.app_terminate(app_id).await?)
    }

    async fn install_app(&self, package: &Path) -> Result<(), DriverError> {
        let ipa = package.to_path_buf();
        self.installer(move |udid| ios::install_ipa(&udid, &ipa)).await
    }

    async fn uninstall_app(&self, app_id: &str) -> Result<(), DriverError> {
        let bundle = app_id.to_string();
        self.installer(move |udid| ios::uninstall_app(&udid, &bundle)).await
    }

    async fn list_apps(&self) -> Result<Vec<AppEntry>, DriverError> {
        let apps = self.installer(|udid| ios::list_installed_apps(&udid)).await?;
        Ok(apps
            .into_iter()
            .map(|(id, name, version)| AppEntry { id, name, version })
            .collect())
    }

    async fn get_clipboard(&self) -> Result<String, DriverError> {
        self.ensure_connected()?;
        Ok(self.client.get_pasteboard().await?)
    }

    async fn set_clipboard(&self, text: &str) -> Result<(), DriverError> {
        self.ensure_connected()?;
        Ok(self.client.set_pasteboard(text).await?)
    }
}
