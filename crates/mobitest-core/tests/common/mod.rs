//! Shared test helpers for mobitest-core integration tests.
//!
//! Provides a scripted in-memory [`DeviceDriver`], synthetic screens for
//! template matching, and a minimal HTTP server standing in for WebDriverAgent.

#![allow(dead_code)]

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use image::{imageops, DynamicImage, GrayImage, ImageFormat, Luma};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use mobitest_core::driver::{AppEntry, DeviceDriver, DriverError};
use mobitest_core::platform::Platform;

// ---------------------------------------------------------------------------
// Synthetic screens
// ---------------------------------------------------------------------------

/// A deterministic textured screen; every window has a distinct signature.
pub fn textured_screen(w: u32, h: u32) -> GrayImage {
    GrayImage::from_fn(w, h, |x, y| {
        let v = (x.wrapping_mul(7919) ^ y.wrapping_mul(104729)).wrapping_mul(2654435761) >> 24;
        Luma([v as u8])
    })
}

pub fn png_bytes(img: &GrayImage) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(img.clone())
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

/// Crops `screen` and saves the patch as `<dir>/<name>`.
pub fn save_patch(screen: &GrayImage, dir: &Path, name: &str, x: u32, y: u32, w: u32, h: u32) -> PathBuf {
    let patch = imageops::crop_imm(screen, x, y, w, h).to_image();
    let path = dir.join(name);
    patch.save(&path).unwrap();
    path
}

// ---------------------------------------------------------------------------
// MockDriver
// ---------------------------------------------------------------------------

/// Everything a [`MockDriver`] was asked to do, in order.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, call: impl Into<String>) {
        self.0.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

/// In-memory driver that serves a fixed screen and records calls.
pub struct MockDriver {
    pub platform: Platform,
    pub connected: bool,
    pub screen: Arc<Mutex<Vec<u8>>>,
    pub calls: CallLog,
    pub connects: Arc<AtomicUsize>,
    pub clipboard: Mutex<Option<String>>,
    pub fail_taps: bool,
    /// Reported as the device id once connected; `mock-device` when unset.
    pub serial: Option<String>,
}

impl MockDriver {
    pub fn new(platform: Platform, screen: &GrayImage) -> Self {
        Self {
            platform,
            connected: false,
            screen: Arc::new(Mutex::new(png_bytes(screen))),
            calls: CallLog::default(),
            connects: Arc::new(AtomicUsize::new(0)),
            clipboard: Mutex::new(None),
            fail_taps: false,
            serial: None,
        }
    }

    /// A driver whose `tap` always fails.
    pub fn failing_taps(mut self) -> Self {
        self.fail_taps = true;
        self
    }

    /// Supports the clipboard (like the iOS backend).
    pub fn with_clipboard(self) -> Self {
        *self.clipboard.lock().unwrap() = Some(String::new());
        self
    }

    fn check(&self) -> Result<(), DriverError> {
        if self.connected {
            Ok(())
        } else {
            Err(DriverError::NotConnected)
        }
    }
}

#[async_trait]
impl DeviceDriver for MockDriver {
    async fn connect(&mut self) -> Result<(), DriverError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.calls.push("connect");
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), DriverError> {
        self.calls.push("disconnect");
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn platform(&self) -> Platform {
        self.platform
    }

    fn device_id(&self) -> Option<String> {
        self.connected
            .then(|| self.serial.clone().unwrap_or_else(|| "mock-device".to_string()))
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        self.check()?;
        Ok(self.screen.lock().unwrap().clone())
    }

    async fn tap(&self, x: i32, y: i32) -> Result<(), DriverError> {
        self.check()?;
        self.calls.push(format!("tap {x} {y}"));
        if self.fail_taps {
            return Err(DriverError::CommandFailed("input tap failed".into()));
        }
        Ok(())
    }

    async fn swipe(&self, from: (i32, i32), to: (i32, i32), duration: Duration) -> Result<(), DriverError> {
        self.check()?;
        self.calls
            .push(format!("swipe {} {} {} {} {}", from.0, from.1, to.0, to.1, duration.as_millis()));
        Ok(())
    }

    async fn keyevent(&self, key: &str) -> Result<(), DriverError> {
        self.check()?;
        self.calls.push(format!("key {key}"));
        Ok(())
    }

    async fn text(&self, text: &str, enter: bool) -> Result<(), DriverError> {
        self.check()?;
        self.calls.push(format!("text {text} {enter}"));
        Ok(())
    }

    async fn start_app(&self, app_id: &str) -> Result<(), DriverError> {
        self.check()?;
        self.calls.push(format!("start {app_id}"));
        Ok(())
    }

    async fn stop_app(&self, app_id: &str) -> Result<(), DriverError> {
        self.check()?;
        self.calls.push(format!("stop {app_id}"));
        Ok(())
    }

    async fn list_apps(&self) -> Result<Vec<AppEntry>, DriverError> {
        Ok(vec![AppEntry {
            id: "com.vv.work".into(),
            name: "Work".into(),
            version: "2.9.26".into(),
        }])
    }

    async fn get_clipboard(&self) -> Result<String, DriverError> {
        self.clipboard
            .lock()
            .unwrap()
            .clone()
            .ok_or(DriverError::unsupported(self.platform, "get_clipboard"))
    }

    async fn set_clipboard(&self, text: &str) -> Result<(), DriverError> {
        let mut clip = self.clipboard.lock().unwrap();
        match clip.as_mut() {
            Some(c) => {
                *c = text.to_string();
                self.calls.push(format!("clipboard {text}"));
                Ok(())
            }
            None => Err(DriverError::unsupported(self.platform, "set_clipboard")),
        }
    }
}

// ---------------------------------------------------------------------------
// Mock WebDriverAgent
// ---------------------------------------------------------------------------

/// One request received by [`MockWda`].
#[derive(Debug, Clone)]
pub struct MockRequest {
    pub method: String,
    pub path: String,
    pub body: String,
}

pub type Handler = Arc<dyn Fn(&MockRequest) -> (u16, Value) + Send + Sync>;

/// HTTP/1.1 server answering each request from a handler, one request per connection.
pub struct MockWda {
    pub url: String,
    requests: Arc<Mutex<Vec<MockRequest>>>,
}

impl MockWda {
    pub async fn start(handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = requests.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let handler = handler.clone();
                let log = log.clone();
                tokio::spawn(async move {
                    let Some(request) = read_request(&mut stream).await else {
                        return;
                    };
                    let (status, body) = handler(&request);
                    log.lock().unwrap().push(request);
                    let body = body.to_string();
                    let response = format!(
                        "HTTP/1.1 {status} OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.flush().await;
                });
            }
        });

        Self {
            url: format!("http://{addr}"),
            requests,
        }
    }

    pub fn requests(&self) -> Vec<MockRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of requests whose method and path end match.
    pub fn count(&self, method: &str, path_suffix: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == method && r.path.ends_with(path_suffix))
            .count()
    }
}

async fn read_request(stream: &mut tokio::net::TcpStream) -> Option<MockRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let mut first = lines.next()?.split_whitespace();
    let method = first.next()?.to_string();
    let path = first.next()?.to_string();
    let content_length = lines
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let end = buf.len().min(header_end + content_length);
    let body = String::from_utf8_lossy(&buf[header_end..end]).to_string();
    Some(MockRequest { method, path, body })
}

/// `{"value": ...}` envelope as WDA returns it.
pub fn wda_value(value: Value) -> (u16, Value) {
    (200, serde_json::json!({ "value": value, "sessionId": "mock-session" }))
}
