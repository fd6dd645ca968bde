//! Device sessions: the UI-automation API used by test bodies.
//!
//! A [`DeviceSession`] wraps a connected driver and records every operation
//! as a [`StepLog`]. Steps are kept in memory for the report and appended to
//! `log.jsonl` in the script log directory. After visible actions the screen is
//! captured into the same directory, so the directory is a complete artifact
//! bundle for one test script.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use mobitest_core::session::DeviceSession;
//! use mobitest_core::template::Template;
//!
//! # async fn example(session: &DeviceSession) -> Result<(), mobitest_core::session::SessionError> {
//! session.keyevent("HOME").await?;
//! session.start_app("com.android.settings").await?;
//! session.touch(Template::new("templates/search.png")).await?;
//! session.text("wifi", true).await?;
//! session.sleep(Duration::from_secs(1)).await;
//! # Ok(())
//! # }
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::action::{StepKind, StepLog, StepResult, TargetRef};
use crate::driver::{DriverError, SharedDriver};
use crate::platform::Platform;
use crate::template::{Match, Template, TemplateError};

/// Name of the JSON Lines step log inside a script log directory.
pub const STEP_LOG_FILENAME: &str = "log.jsonl";

/// Errors surfaced to test bodies.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    /// A template was not on screen when a step needed it.
    #[error("Target not found on screen: {0}")]
    TargetNotFound(String),

    /// `wait` gave up.
    #[error("Timed out after {timeout:?} waiting for {template}")]
    WaitTimeout { template: String, timeout: Duration },

    /// A test assertion failed.
    #[error("Assertion failed: {0}")]
    Assertion(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Whether this error is a test failure rather than a broken environment.
    pub fn is_assertion(&self) -> bool {
        matches!(
            self,
            SessionError::Assertion(_) | SessionError::TargetNotFound(_) | SessionError::WaitTimeout { .. }
        )
    }
}

/// Where to act: a fixed screen point or wherever a template matches.
#[derive(Debug, Clone)]
pub enum Target {
    Point(i32, i32),
    Template(Template),
}

impl From<(i32, i32)> for Target {
    fn from((x, y): (i32, i32)) -> Self {
        Target::Point(x, y)
    }
}

impl From<Template> for Target {
    fn from(t: Template) -> Self {
        Target::Template(t)
    }
}

impl From<&Template> for Target {
    fn from(t: &Template) -> Self {
        Target::Template(t.clone())
    }
}

impl Target {
    fn to_ref(&self) -> TargetRef {
        match self {
            Target::Point(x, y) => TargetRef::Point { x: *x, y: *y },
            Target::Template(t) => template_ref(t),
        }
    }
}

fn template_ref(t: &Template) -> TargetRef {
    TargetRef::Template {
        path: t.path.to_string_lossy().to_string(),
        threshold: t.threshold,
    }
}

/// Tunables for a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Capture a screenshot after every visible action.
    pub capture_screenshots: bool,
    pub wait_timeout: Duration,
    pub wait_interval: Duration,
    pub swipe_duration: Duration,
    /// Directory relative template paths are resolved against.
    pub template_dir: Option<PathBuf>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            capture_screenshots: true,
            wait_timeout: Duration::from_secs(20),
            wait_interval: Duration::from_millis(500),
            swipe_duration: Duration::from_millis(500),
            template_dir: None,
        }
    }
}

/// Appends one JSON line for `step` and flushes.
fn append_step<W: Write>(writer: &mut W, step: &StepLog) -> std::io::Result<()> {
    serde_json::to_writer(&mut *writer, step)?;
    writer.write_all(b"\n")?;
    writer.flush()
}

/// One connected device plus the step log of the script using it.
pub struct DeviceSession {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    platform: Platform,
    device_id: Option<String>,
    driver: SharedDriver,
    log_dir: PathBuf,
    options: SessionOptions,
    steps: Mutex<Vec<StepLog>>,
    log_writer: Mutex<Option<BufWriter<File>>>,
    screenshot_seq: AtomicU32,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("id", &self.id)
            .field("platform", &self.platform)
            .field("device_id", &self.device_id)
            .field("log_dir", &self.log_dir)
            .finish()
    }
}

impl DeviceSession {
    /// Creates a session writing into `log_dir` (created if missing).
    pub async fn new(driver: SharedDriver, log_dir: impl Into<PathBuf>, options: SessionOptions) -> Result<Self, SessionError> {
        let log_dir = log_dir.into();
        std::fs::create_dir_all(&log_dir)?;
        let writer = File::create(log_dir.join(STEP_LOG_FILENAME)).map(BufWriter::new)?;

        let (platform, device_id) = {
            let guard = driver.read().await;
            (guard.platform(), guard.device_id())
        };

        Ok(Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            platform,
            device_id,
            driver,
            log_dir,
            options,
            steps: Mutex::new(Vec::new()),
            log_writer: Mutex::new(Some(writer)),
            screenshot_seq: AtomicU32::new(0),
        })
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn driver(&self) -> SharedDriver {
        self.driver.clone()
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// All steps recorded so far.
    pub async fn steps(&self) -> Vec<StepLog> {
        self.steps.lock().await.clone()
    }

    /// Flushes and closes the step log file. Later steps stay in memory only.
    pub async fn close(&self) {
        if let Some(mut writer) = self.log_writer.lock().await.take() {
            if let Err(e) = writer.flush() {
                warn!(error = %e, "failed to flush step log");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Recording
    // -----------------------------------------------------------------------

    async fn record(&self, step: StepKind, result: StepResult, screenshot: Option<String>, started: Instant) -> StepLog {
        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            StepResult::Success => debug!(step = step.name(), duration_ms, "step ok"),
            StepResult::Failure(msg) => warn!(step = step.name(), duration_ms, error = %msg, "step failed"),
        }
        let log = StepLog::new(step, result, screenshot, Some(duration_ms));

        self.steps.lock().await.push(log.clone());

        let mut writer_guard = self.log_writer.lock().await;
        if let Some(ref mut writer) = *writer_guard {
            if let Err(e) = append_step(writer, &log) {
                warn!(step = log.step.name(), error = %e, "failed to write step log");
            }
        }
        log
    }

    /// Records a step from its outcome and passes the outcome through.
    async fn finish<T>(&self, step: StepKind, started: Instant, capture: bool, outcome: Result<T, SessionError>) -> Result<T, SessionError> {
        let screenshot = if capture { self.capture().await } else { None };
        let result = match &outcome {
            Ok(_) => StepResult::Success,
            Err(e) => StepResult::Failure(e.to_string()),
        };
        self.record(step, result, screenshot, started).await;
        outcome
    }

    /// Saves a screenshot as the next `step_NNN.png`; failures are logged only.
    async fn capture(&self) -> Option<String> {
        if !self.options.capture_screenshots {
            return None;
        }
        let seq = self.screenshot_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let name = format!("step_{seq:03}.png");
        match self.save_screenshot(&name).await {
            Ok(_) => Some(name),
            Err(e) => {
                warn!(error = %e, "step screenshot failed");
                None
            }
        }
    }

    async fn save_screenshot(&self, name: &str) -> Result<PathBuf, SessionError> {
        let png = self.driver.read().await.screenshot().await?;
        let path = self.log_dir.join(name);
        tokio::fs::write(&path, png).await?;
        Ok(path)
    }

    fn resolve_template(&self, template: &Template) -> Template {
        match &self.options.template_dir {
            Some(dir) => template.clone().in_dir(dir),
            None => template.clone(),
        }
    }

    async fn locate(&self, template: &Template) -> Result<Option<Match>, SessionError> {
        let png = self.driver.read().await.screenshot().await?;
        let template = self.resolve_template(template);
        // Matching is CPU-bound; keep it off the async workers.
        let found = tokio::task::spawn_blocking(move || template.match_in_png(&png))
            .await
            .map_err(|e| DriverError::CommandFailed(format!("matcher task failed: {e}")))??;
        Ok(found)
    }

    async fn resolve(&self, target: &Target) -> Result<(i32, i32), SessionError> {
        match target {
            Target::Point(x, y) => Ok((*x, *y)),
            Target::Template(t) => self
                .locate(t)
                .await?
                .map(|m| m.center)
                .ok_or_else(|| SessionError::TargetNotFound(t.to_string())),
        }
    }

    // -----------------------------------------------------------------------
    // Gestures
    // -----------------------------------------------------------------------

    /// Taps a point or the center of a matched template.
    pub async fn touch(&self, target: impl Into<Target>) -> Result<(i32, i32), SessionError> {
        let target = target.into();
        let started = Instant::now();
        let span = info_span!("touch", target = ?target.to_ref());
        let outcome = async {
            let pos = self.resolve(&target).await?;
            self.driver.read().await.tap(pos.0, pos.1).await?;
            Ok(pos)
        }
        .instrument(span)
        .await;
        let step = StepKind::Touch {
            target: target.to_ref(),
            pos: outcome.as_ref().ok().copied(),
        };
        self.finish(step, started, true, outcome).await
    }

    /// Alias of [`touch`](Self::touch).
    pub async fn click(&self, target: impl Into<Target>) -> Result<(i32, i32), SessionError> {
        self.touch(target).await
    }

    pub async fn double_click(&self, target: impl Into<Target>) -> Result<(i32, i32), SessionError> {
        let target = target.into();
        let started = Instant::now();
        let outcome = async {
            let pos = self.resolve(&target).await?;
            self.driver.read().await.double_tap(pos.0, pos.1).await?;
            Ok(pos)
        }
        .await;
        let step = StepKind::DoubleClick {
            target: target.to_ref(),
            pos: outcome.as_ref().ok().copied(),
        };
        self.finish(step, started, true, outcome).await
    }

    pub async fn long_press(&self, target: impl Into<Target>, duration: Duration) -> Result<(), SessionError> {
        let target = target.into();
        let started = Instant::now();
        let outcome = async {
            let pos = self.resolve(&target).await?;
            self.driver.read().await.long_press(pos.0, pos.1, duration).await?;
            Ok(())
        }
        .await;
        let step = StepKind::LongPress {
            target: target.to_ref(),
            duration_ms: duration.as_millis() as u64,
        };
        self.finish(step, started, true, outcome).await
    }

    /// Swipes between two targets using the session's swipe duration.
    pub async fn swipe(&self, from: impl Into<Target>, to: impl Into<Target>) -> Result<(), SessionError> {
        let (from, to) = (from.into(), to.into());
        let started = Instant::now();
        let outcome = async {
            let a = self.resolve(&from).await?;
            let b = self.resolve(&to).await?;
            self.driver.read().await.swipe(a, b, self.options.swipe_duration).await?;
            Ok(())
        }
        .await;
        let step = StepKind::Swipe {
            from: from.to_ref(),
            to: to.to_ref(),
        };
        self.finish(step, started, true, outcome).await
    }

    pub async fn keyevent(&self, key: &str) -> Result<(), SessionError> {
        let started = Instant::now();
        let outcome = self.driver.read().await.keyevent(key).await.map_err(SessionError::from);
        self.finish(StepKind::Keyevent { key: key.to_string() }, started, true, outcome).await
    }

    pub async fn text(&self, text: &str, enter: bool) -> Result<(), SessionError> {
        let started = Instant::now();
        let outcome = self.driver.read().await.text(text, enter).await.map_err(SessionError::from);
        let step = StepKind::Text { text: text.to_string(), enter };
        self.finish(step, started, true, outcome).await
    }

    /// Pastes `text` through the clipboard where the backend has one, typing it otherwise.
    pub async fn paste(&self, text: &str, enter: bool) -> Result<(), SessionError> {
        let started = Instant::now();
        let outcome = async {
            let driver = self.driver.read().await;
            match driver.set_clipboard(text).await {
                Ok(()) | Err(DriverError::Unsupported { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            driver.text(text, enter).await?;
            Ok(())
        }
        .await;
        self.finish(StepKind::Paste { enter }, started, true, outcome).await
    }

    pub async fn home(&self) -> Result<(), SessionError> {
        let started = Instant::now();
        let outcome = self.driver.read().await.home().await.map_err(SessionError::from);
        self.finish(StepKind::Home, started, true, outcome).await
    }

    pub async fn wake(&self) -> Result<(), SessionError> {
        let started = Instant::now();
        let outcome = self.driver.read().await.wake().await.map_err(SessionError::from);
        self.finish(StepKind::Wake, started, true, outcome).await
    }

    pub async fn sleep(&self, duration: Duration) {
        let started = Instant::now();
        tokio::time::sleep(duration).await;
        let step = StepKind::Sleep { secs: duration.as_secs_f64() };
        self.record(step, StepResult::Success, None, started).await;
    }

    // -----------------------------------------------------------------------
    // Looking at the screen
    // -----------------------------------------------------------------------

    /// Waits for a template with the session's default timeout and interval.
    pub async fn wait(&self, template: &Template) -> Result<Match, SessionError> {
        self.wait_with(template, self.options.wait_timeout, self.options.wait_interval).await
    }

    /// Polls the screen until `template` appears or `timeout` elapses.
    pub async fn wait_with(&self, template: &Template, timeout: Duration, interval: Duration) -> Result<Match, SessionError> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let outcome = loop {
            match self.locate(template).await {
                Ok(Some(m)) => break Ok(m),
                Ok(None) => {}
                Err(e @ SessionError::Template(_)) => break Err(e),
                Err(e) => debug!(error = %e, "wait poll failed"),
            }
            if tokio::time::Instant::now() >= deadline {
                break Err(SessionError::WaitTimeout {
                    template: template.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(interval).await;
        };
        let step = StepKind::Wait {
            template: template.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };
        self.finish(step, started, true, outcome).await
    }

    /// Returns the match if the template is currently on screen.
    pub async fn exists(&self, template: &Template) -> Result<Option<Match>, SessionError> {
        let started = Instant::now();
        let outcome = self.locate(template).await;
        let step = StepKind::Exists {
            template: template.to_string(),
            found: matches!(outcome, Ok(Some(_))),
        };
        self.finish(step, started, false, outcome).await
    }

    pub async fn find_all(&self, template: &Template) -> Result<Vec<Match>, SessionError> {
        let started = Instant::now();
        let outcome = async {
            let png = self.driver.read().await.screenshot().await?;
            let screen = image::load_from_memory(&png).map_err(TemplateError::from)?;
            let template = self.resolve_template(template);
            Ok(template.match_all(&screen)?)
        }
        .await;
        let step = StepKind::FindAll {
            template: template.to_string(),
            count: outcome.as_ref().map(Vec::len).unwrap_or(0),
        };
        self.finish(step, started, false, outcome).await
    }

    /// Saves a screenshot into the log directory and returns its path.
    ///
    /// Without a file name the next `step_NNN.png` name is used.
    pub async fn snapshot(&self, filename: Option<&str>, msg: Option<&str>) -> Result<PathBuf, SessionError> {
        let started = Instant::now();
        let name = match filename {
            Some(name) => name.to_string(),
            None => {
                let seq = self.screenshot_seq.fetch_add(1, Ordering::SeqCst) + 1;
                format!("step_{seq:03}.png")
            }
        };
        let outcome = self.save_screenshot(&name).await;
        let screenshot = outcome.as_ref().ok().map(|_| name.clone());
        let result = match &outcome {
            Ok(_) => StepResult::Success,
            Err(e) => StepResult::Failure(e.to_string()),
        };
        let step = StepKind::Snapshot { msg: msg.map(str::to_string) };
        self.record(step, result, screenshot, started).await;
        outcome
    }

    // -----------------------------------------------------------------------
    // Apps and device
    // -----------------------------------------------------------------------

    pub async fn start_app(&self, app: &str) -> Result<(), SessionError> {
        let started = Instant::now();
        let span = info_span!("start_app", app);
        let outcome = async { self.driver.read().await.start_app(app).await.map_err(SessionError::from) }
            .instrument(span)
            .await;
        self.finish(StepKind::StartApp { app: app.to_string() }, started, true, outcome).await
    }

    pub async fn stop_app(&self, app: &str) -> Result<(), SessionError> {
        let started = Instant::now();
        let outcome = self.driver.read().await.stop_app(app).await.map_err(SessionError::from);
        self.finish(StepKind::StopApp { app: app.to_string() }, started, false, outcome).await
    }

    pub async fn clear_app(&self, app: &str) -> Result<(), SessionError> {
        let started = Instant::now();
        let outcome = self.driver.read().await.clear_app(app).await.map_err(SessionError::from);
        self.finish(StepKind::ClearApp { app: app.to_string() }, started, false, outcome).await
    }

    pub async fn install(&self, package: &Path) -> Result<(), SessionError> {
        let started = Instant::now();
        let outcome = self.driver.read().await.install_app(package).await.map_err(SessionError::from);
        let step = StepKind::Install { package: package.display().to_string() };
        self.finish(step, started, false, outcome).await
    }

    pub async fn uninstall(&self, app: &str) -> Result<(), SessionError> {
        let started = Instant::now();
        let outcome = self.driver.read().await.uninstall_app(app).await.map_err(SessionError::from);
        self.finish(StepKind::Uninstall { app: app.to_string() }, started, false, outcome).await
    }

    pub async fn shell(&self, cmd: &str) -> Result<String, SessionError> {
        let started = Instant::now();
        let outcome = self.driver.read().await.shell(cmd).await.map_err(SessionError::from);
        self.finish(StepKind::Shell { cmd: cmd.to_string() }, started, false, outcome).await
    }

    pub async fn get_clipboard(&self) -> Result<String, SessionError> {
        let started = Instant::now();
        let outcome = self.driver.read().await.get_clipboard().await.map_err(SessionError::from);
        self.finish(StepKind::GetClipboard, started, false, outcome).await
    }

    pub async fn set_clipboard(&self, text: &str) -> Result<(), SessionError> {
        let started = Instant::now();
        let outcome = self.driver.read().await.set_clipboard(text).await.map_err(SessionError::from);
        self.finish(StepKind::SetClipboard { text: text.to_string() }, started, false, outcome).await
    }

    pub async fn push(&self, local: &Path, remote: &str) -> Result<(), SessionError> {
        let started = Instant::now();
        let outcome = self.driver.read().await.push(local, remote).await.map_err(SessionError::from);
        let step = StepKind::Push {
            local: local.display().to_string(),
            remote: remote.to_string(),
        };
        self.finish(step, started, false, outcome).await
    }

    pub async fn pull(&self, remote: &str, local: &Path) -> Result<(), SessionError> {
        let started = Instant::now();
        let outcome = self.driver.read().await.pull(remote, local).await.map_err(SessionError::from);
        let step = StepKind::Pull {
            remote: remote.to_string(),
            local: local.display().to_string(),
        };
        self.finish(step, started, false, outcome).await
    }

    // -----------------------------------------------------------------------
    // Notes and assertions
    // -----------------------------------------------------------------------

    pub async fn comment(&self, message: &str) {
        let step = StepKind::Comment { message: message.to_string() };
        self.record(step, StepResult::Success, None, Instant::now()).await;
    }

    /// Records an assertion and fails with [`SessionError::Assertion`] when `condition` is false.
    pub async fn assert_true(&self, condition: bool, message: &str) -> Result<(), SessionError> {
        let outcome = if condition {
            Ok(())
        } else {
            Err(SessionError::Assertion(message.to_string()))
        };
        let step = StepKind::Assert { message: message.to_string() };
        self.finish(step, Instant::now(), !condition, outcome).await
    }

    /// Asserts that a template is on screen.
    pub async fn assert_exists(&self, template: &Template, message: &str) -> Result<Match, SessionError> {
        let found = self.exists(template).await?;
        self.assert_true(found.is_some(), message).await?;
        found.ok_or_else(|| SessionError::Assertion(message.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "disk gone"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn home_step() -> StepLog {
        StepLog::new(StepKind::Keyevent { key: "HOME".into() }, StepResult::Success, None, Some(3))
    }

    #[test]
    fn step_is_one_json_line() {
        let mut buf = Vec::new();
        append_step(&mut buf, &home_step()).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(text.lines().count(), 1);
        let back: StepLog = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(back.step.name(), "keyevent");
    }

    #[test]
    fn write_failure_is_reported() {
        let err = append_step(&mut BrokenPipe, &home_step()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
    }
}
