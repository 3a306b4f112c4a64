//! Plugin contract and the built-in handlers.
//!
//! Plugins are offered commands in registration order; the first to return
//! [`PluginVote::Handled`] wins. Faults are values, not unwound panics: a
//! handler returns a [`StepFault`] carrying the status line the executor
//! turns into a response.

mod db;
mod harness;
mod status;

use async_trait::async_trait;

pub use db::DbPlugin;
pub use harness::TestHarnessPlugin;
pub use status::StatusPlugin;

use stratum_cluster::cluster::{EngineError, SqlSession};

use crate::command::{Command, Headers};

/// Log lane a fault is reported on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Alert,
    Warn,
    Hmmm,
    Info,
}

/// Early-return outcome of a peek or process step.
#[derive(Clone, Debug)]
pub struct StepFault {
    /// Response status line, e.g. `430 Unrecognized command`.
    pub status: String,
    pub headers: Headers,
    pub body: String,
    /// Explicit lane; faults without one fall back to the legacy substring
    /// tags (`_ALERT_`, `_WARN_`, `_HMMM_`, leading `50`).
    pub severity: Option<Severity>,
}

impl StepFault {
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            headers: Headers::new(),
            body: String::new(),
            severity: None,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }
}

impl From<EngineError> for StepFault {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Timeout => StepFault::status("555 Timeout"),
            EngineError::Busy(reason) => {
                StepFault::status(format!("502 Storage busy: {reason}"))
            }
            EngineError::IndexGap { .. } | EngineError::Other(_) => {
                StepFault::status("500 Internal error").with_severity(Severity::Alert)
            }
        }
    }
}

pub type StepResult<T> = Result<T, StepFault>;

/// What a plugin did with an offered command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PluginVote {
    /// Not ours; offer it to the next plugin.
    Decline,
    Handled,
    /// Park the command until `resume_at_us` (microseconds since epoch),
    /// e.g. while an outbound HTTP request is in flight. The transaction is
    /// rolled back and a fresh one begun on resume.
    Suspend { resume_at_us: u64 },
}

#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn peek(
        &self,
        _db: &mut dyn SqlSession,
        _cmd: &mut Command,
    ) -> StepResult<PluginVote> {
        Ok(PluginVote::Decline)
    }

    async fn process(
        &self,
        _db: &mut dyn SqlSession,
        _cmd: &mut Command,
    ) -> StepResult<PluginVote> {
        Ok(PluginVote::Decline)
    }
}

/// Ordered plugin registry. Registration order is dispatch order.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: impl Plugin) {
        self.plugins.push(Box::new(plugin));
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Plugin> {
        self.plugins.iter().map(|p| p.as_ref())
    }
}
