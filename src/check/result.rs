//! 检查结果：状态 + 单条结果

use serde::{Deserialize, Serialize};

pub const NOT_AVAILABLE: &str = "N/A";

/// Outcome label of one observation. Ordering is for display only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Info,
    Pass,
    Warn,
    Fail,
    Error,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Info  => "INFO",
            Status::Pass  => "PASS",
            Status::Warn  => "WARN",
            Status::Fail  => "FAIL",
            Status::Error => "ERROR",
        };
        f.pad(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub title: String,
    pub value: String,
    pub status: Status,
    pub message: String,
}

impl CheckResult {
    pub fn new(
        title: impl Into<String>,
        value: impl Into<String>,
        status: Status,
        message: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            value: value.into(),
            status,
            message: message.into(),
        }
    }

    pub fn info(title: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(title, value, Status::Info, "")
    }

    pub fn pass(title: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(title, value, Status::Pass, "")
    }

    pub fn warn(
        title: impl Into<String>,
        value: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(title, value, Status::Warn, message)
    }

    pub fn fail(
        title: impl Into<String>,
        value: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(title, value, Status::Fail, message)
    }

    /// The single result a check returns when it could not reach a verdict.
    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(title, NOT_AVAILABLE, Status::Error, message)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}
