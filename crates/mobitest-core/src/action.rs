//! Step types and the per-script step log.
//!
//! Every UI operation issued through a [`DeviceSession`](crate::session::DeviceSession)
//! is recorded as a [`StepLog`] entry. The log is persisted as JSON Lines next
//! to the step screenshots and later rendered into the HTML report.
//!
//! # Example
//!
//! ```
//! use mobitest_core::action::{StepKind, StepLog, StepResult};
//!
//! let step = StepLog::new(StepKind::Keyevent { key: "HOME".into() }, StepResult::Success, None, Some(12));
//! assert_eq!(step.step.name(), "keyevent");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The result of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepResult {
    Success,
    Failure(String),
}

impl StepResult {
    pub fn is_success(&self) -> bool {
        matches!(self, StepResult::Success)
    }
}

/// What a step targeted: a fixed point or a template image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetRef {
    Point { x: i32, y: i32 },
    Template { path: String, threshold: f64 },
}

/// Types of steps a test can perform.
///
/// Serialized with a `type` tag so the log stays readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StepKind {
    Touch {
        target: TargetRef,
        /// Resolved screen position, when the target was found.
        #[serde(skip_serializing_if = "Option::is_none")]
        pos: Option<(i32, i32)>,
    },
    DoubleClick {
        target: TargetRef,
        #[serde(skip_serializing_if = "Option::is_none")]
        pos: Option<(i32, i32)>,
    },
    LongPress {
        target: TargetRef,
        duration_ms: u64,
    },
    Swipe {
        from: TargetRef,
        to: TargetRef,
    },
    Keyevent {
        key: String,
    },
    Text {
        text: String,
        enter: bool,
    },
    Paste {
        enter: bool,
    },
    Sleep {
        secs: f64,
    },
    Wait {
        template: String,
        timeout_ms: u64,
    },
    Exists {
        template: String,
        found: bool,
    },
    FindAll {
        template: String,
        count: usize,
    },
    Snapshot {
        #[serde(skip_serializing_if = "Option::is_none")]
        msg: Option<String>,
    },
    Home,
    Wake,
    StartApp {
        app: String,
    },
    StopApp {
        app: String,
    },
    ClearApp {
        app: String,
    },
    Install {
        package: String,
    },
    Uninstall {
        app: String,
    },
    Shell {
        cmd: String,
    },
    GetClipboard,
    SetClipboard {
        text: String,
    },
    Push {
        local: String,
        remote: String,
    },
    Pull {
        remote: String,
        local: String,
    },
    /// A free-form note, e.g. a test section heading.
    Comment {
        message: String,
    },
    /// An assertion evaluated by the test body.
    Assert {
        message: String,
    },
}

impl StepKind {
    /// Short, static name for logs and report tables.
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Touch { .. } => "touch",
            StepKind::DoubleClick { .. } => "double_click",
            StepKind::LongPress { .. } => "long_press",
            StepKind::Swipe { .. } => "swipe",
            StepKind::Keyevent { .. } => "keyevent",
            StepKind::Text { .. } => "text",
            StepKind::Paste { .. } => "paste",
            StepKind::Sleep { .. } => "sleep",
            StepKind::Wait { .. } => "wait",
            StepKind::Exists { .. } => "exists",
            StepKind::FindAll { .. } => "find_all",
            StepKind::Snapshot { .. } => "snapshot",
            StepKind::Home => "home",
            StepKind::Wake => "wake",
            StepKind::StartApp { .. } => "start_app",
            StepKind::StopApp { .. } => "stop_app",
            StepKind::ClearApp { .. } => "clear_app",
            StepKind::Install { .. } => "install",
            StepKind::Uninstall { .. } => "uninstall",
            StepKind::Shell { .. } => "shell",
            StepKind::GetClipboard => "get_clipboard",
            StepKind::SetClipboard { .. } => "set_clipboard",
            StepKind::Push { .. } => "push",
            StepKind::Pull { .. } => "pull",
            StepKind::Comment { .. } => "comment",
            StepKind::Assert { .. } => "assert",
        }
    }

    /// One-line human description used in the HTML report.
    pub fn describe(&self) -> String {
        fn target(t: &TargetRef) -> String {
            match t {
                TargetRef::Point { x, y } => format!("({x}, {y})"),
                TargetRef::Template { path, .. } => path.clone(),
            }
        }
        match self {
            StepKind::Touch { target: t, .. } | StepKind::DoubleClick { target: t, .. } => target(t),
            StepKind::LongPress { target: t, duration_ms } => format!("{} for {duration_ms} ms", target(t)),
            StepKind::Swipe { from, to } => format!("{} -> {}", target(from), target(to)),
            StepKind::Keyevent { key } => key.clone(),
            StepKind::Text { text, enter } => {
                if *enter {
                    format!("{text:?} + enter")
                } else {
                    format!("{text:?}")
                }
            }
            StepKind::Paste { .. } => "clipboard".to_string(),
            StepKind::Sleep { secs } => format!("{secs}s"),
            StepKind::Wait { template, timeout_ms } => format!("{template} (timeout {timeout_ms} ms)"),
            StepKind::Exists { template, found } => format!("{template}: {found}"),
            StepKind::FindAll { template, count } => format!("{template}: {count} found"),
            StepKind::Snapshot { msg } => msg.clone().unwrap_or_default(),
            StepKind::Home | StepKind::Wake | StepKind::GetClipboard => String::new(),
            StepKind::StartApp { app }
            | StepKind::StopApp { app }
            | StepKind::ClearApp { app }
            | StepKind::Uninstall { app } => app.clone(),
            StepKind::Install { package } => package.clone(),
            StepKind::Shell { cmd } => cmd.clone(),
            StepKind::SetClipboard { text } => format!("{text:?}"),
            StepKind::Push { local, remote } => format!("{local} -> {remote}"),
            StepKind::Pull { remote, local } => format!("{remote} -> {local}"),
            StepKind::Comment { message } | StepKind::Assert { message } => message.clone(),
        }
    }
}

/// A logged step with metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLog {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub step: StepKind,
    pub result: StepResult,
    /// Screenshot file name, relative to the script log directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl StepLog {
    pub fn new(step: StepKind, result: StepResult, screenshot: Option<String>, duration_ms: Option<u64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            step,
            result,
            screenshot,
            duration_ms,
        }
    }
}
