//! Dismissal of interrupting popups (upgrade prompts, ads, permission dialogs).
//!
//! Wrap a step with [`PopupHandler::run_guarded`] to sweep known popups off the
//! screen after it runs.

use std::future::Future;
use std::time::Duration;

use tracing::{error, info};

use crate::session::{DeviceSession, SessionError};
use crate::template::Template;

/// A popup to look for and the template to tap to close it.
#[derive(Debug, Clone)]
pub struct PopupConfig {
    pub template: Template,
    pub name: String,
}

impl PopupConfig {
    pub fn new(template: impl Into<Template>, name: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            name: name.into(),
        }
    }

    /// Upgrade, advertisement and permission popups.
    pub fn defaults() -> Vec<PopupConfig> {
        vec![
            PopupConfig::new(Template::new("update_close.png"), "upgrade popup"),
            PopupConfig::new(Template::new("ad_close.png"), "advertisement popup"),
            PopupConfig::new(Template::new("allow_button.png"), "permission popup"),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct PopupHandler {
    pub configs: Vec<PopupConfig>,
    /// How long one sweep keeps looking.
    pub timeout: Duration,
    pub interval: Duration,
    /// Failed sweeps tolerated before giving up.
    pub retry_times: u32,
}

impl Default for PopupHandler {
    fn default() -> Self {
        Self::new(PopupConfig::defaults())
    }
}

impl PopupHandler {
    pub fn new(configs: Vec<PopupConfig>) -> Self {
        Self {
            configs,
            timeout: Duration::from_secs(2),
            interval: Duration::from_millis(500),
            retry_times: 3,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_retry_times(mut self, retry_times: u32) -> Self {
        self.retry_times = retry_times;
        self
    }

    /// Taps every visible popup for `timeout`. Returns how many were closed.
    ///
    /// A sweep that hits an error is retried after `interval`, up to
    /// `retry_times` times. Errors are logged, never returned.
    pub async fn dismiss(&self, session: &DeviceSession) -> usize {
        let mut closed = 0;
        let mut retries = 0;
        while retries < self.retry_times {
            match self.sweep(session, &mut closed).await {
                Ok(()) => break,
                Err(e) => {
                    error!(error = %e, "popup handling failed");
                    retries += 1;
                    tokio::time::sleep(self.interval).await;
                }
            }
        }
        closed
    }

    async fn sweep(&self, session: &DeviceSession, closed: &mut usize) -> Result<(), SessionError> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        while tokio::time::Instant::now() < deadline {
            let mut any = false;
            for config in &self.configs {
                if let Some(found) = session.exists(&config.template).await? {
                    info!(popup = %config.name, "popup detected");
                    session.touch(found.center).await?;
                    *closed += 1;
                    any = true;
                    tokio::time::sleep(self.interval).await;
                }
            }
            if !any {
                tokio::time::sleep(self.interval).await;
            }
        }
        Ok(())
    }

    /// Runs `step`, then dismisses popups. The step's own result is returned.
    pub async fn run_guarded<T, F, Fut>(&self, session: &DeviceSession, step: F) -> Result<T, SessionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SessionError>>,
    {
        let result = step().await;
        self.dismiss(session).await;
        result
    }
}
