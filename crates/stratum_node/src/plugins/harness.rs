//! Load and failover test commands, enabled by flag.
//!
//! `testcommand` is peek-only, `idcollision` is a plain write, and
//! `sendrequest` exercises the HTTP-wait suspension path: its first peek
//! parks the command as if an outbound request were in flight, and the
//! resumed pass writes the delivery record.

use std::time::Duration;

use async_trait::async_trait;

use stratum_cluster::cluster::SqlSession;

use super::{Plugin, PluginVote, StepFault, StepResult};
use crate::command::{now_micros, Command};

/// Simulated round trip of the outbound request `sendrequest` waits on.
const HTTP_WAIT: Duration = Duration::from_millis(20);

#[derive(Default)]
pub struct TestHarnessPlugin;

impl TestHarnessPlugin {
    pub fn new() -> Self {
        Self
    }

    fn sleep_header(cmd: &Command, name: &str) -> Option<Duration> {
        cmd.request
            .headers
            .get(name)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
    }

    fn apply_response_header(cmd: &mut Command) {
        if let Some(status) = cmd.request.headers.get("response") {
            cmd.response.method_line = status.to_string();
        }
    }
}

#[async_trait]
impl Plugin for TestHarnessPlugin {
    fn name(&self) -> &'static str {
        "testharness"
    }

    async fn peek(
        &self,
        _db: &mut dyn SqlSession,
        cmd: &mut Command,
    ) -> StepResult<PluginVote> {
        match cmd.request.method() {
            "testcommand" => {
                if let Some(sleep) = Self::sleep_header(cmd, "peekSleep") {
                    tokio::time::sleep(sleep).await;
                }
                Self::apply_response_header(cmd);
                Ok(PluginVote::Handled)
            }
            "idcollision" => {
                if let Some(sleep) = Self::sleep_header(cmd, "peekSleep") {
                    tokio::time::sleep(sleep).await;
                }
                Ok(PluginVote::Decline)
            }
            "sendrequest" => {
                if cmd.suspend_count == 0 {
                    // First pass: the outbound request goes on the wire and
                    // the command waits for it off-worker.
                    return Ok(PluginVote::Suspend {
                        resume_at_us: now_micros() + HTTP_WAIT.as_micros() as u64,
                    });
                }
                Ok(PluginVote::Decline)
            }
            _ => Ok(PluginVote::Decline),
        }
    }

    async fn process(
        &self,
        db: &mut dyn SqlSession,
        cmd: &mut Command,
    ) -> StepResult<PluginVote> {
        match cmd.request.method() {
            "idcollision" => {
                if let Some(sleep) = Self::sleep_header(cmd, "processSleep") {
                    tokio::time::sleep(sleep).await;
                }
                db.execute(&format!(
                    "INSERT INTO test (id, created) VALUES ({}, {})",
                    cmd.id,
                    now_micros()
                ))
                .map_err(StepFault::from)?;
                Self::apply_response_header(cmd);
                Ok(PluginVote::Handled)
            }
            "sendrequest" => {
                db.execute(&format!(
                    "INSERT INTO delivered (command, created) VALUES ({}, {})",
                    cmd.id,
                    now_micros()
                ))
                .map_err(StepFault::from)?;
                Self::apply_response_header(cmd);
                Ok(PluginVote::Handled)
            }
            _ => Ok(PluginVote::Decline),
        }
    }
}
