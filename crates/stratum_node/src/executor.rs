//! Two-phase command executor.
//!
//! Peek is speculative and read-oriented; process is authoritative and may
//! write. Both phases run inside one concurrent transaction per attempt so
//! anything checked in peek stays valid through process. Faults short-circuit
//! as values and are materialized into responses here; nothing escapes to the
//! worker loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use stratum_cluster::cluster::SqlSession;

use crate::command::Command;
use crate::plugins::{PluginRegistry, PluginVote, Severity, StepFault, StepResult};

/// Wall budget for one peek or process attempt.
pub const TIMING_BUDGET: Duration = Duration::from_micros(5_000_000);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeekOutcome {
    /// The response is filled in and the command is complete.
    Responded,
    /// No plugin claimed the command; it must be processed.
    NeedsProcess,
    /// Park the command until the given microsecond timestamp.
    Suspend(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    Responded,
    /// The transaction holds uncommitted writes; the replication layer must
    /// commit (or roll back) before the command completes.
    NeedsCommit,
    Suspend(u64),
}

enum Claim {
    Nobody,
    Handled,
    Suspend(u64),
}

pub struct CommandExecutor {
    registry: Arc<PluginRegistry>,
}

impl CommandExecutor {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }

    pub async fn peek(&self, session: &mut dyn SqlSession, cmd: &mut Command) -> PeekOutcome {
        let timer = Instant::now();
        cmd.peek_count += 1;
        tracing::debug!(method = cmd.request.method(), "peeking");
        session.start_timing(TIMING_BUDGET);

        let outcome = match self.peek_step(&mut *session, cmd).await {
            Ok(Claim::Nobody) => {
                tracing::info!(
                    method = cmd.request.method(),
                    "command is not peekable, queuing for processing"
                );
                session.rollback();
                PeekOutcome::NeedsProcess
            }
            Ok(Claim::Suspend(resume_at)) => {
                // The transaction cannot straddle the wait; a fresh one is
                // begun when the command resumes.
                session.rollback();
                PeekOutcome::Suspend(resume_at)
            }
            Ok(Claim::Handled) => {
                if cmd.response.method_line.is_empty() {
                    cmd.response.method_line = "200 OK".into();
                }
                self.finish_response(&*session, cmd);
                tracing::info!(
                    response = cmd.response.method_line,
                    method = cmd.request.method(),
                    "responding to read-only command"
                );
                cmd.complete = true;
                // Back out of the current transaction, it has nothing to do.
                session.rollback();
                PeekOutcome::Responded
            }
            Err(fault) => {
                self.handle_fault(&mut *session, cmd, fault, false);
                cmd.complete = true;
                PeekOutcome::Responded
            }
        };
        session.reset_timing();
        cmd.peek_us += timer.elapsed().as_micros().min(u128::from(u64::MAX)) as u64;
        outcome
    }

    async fn peek_step(
        &self,
        session: &mut dyn SqlSession,
        cmd: &mut Command,
    ) -> StepResult<Claim> {
        if session.begin_concurrent().is_err() {
            return Err(StepFault::status(
                "501 Failed to begin concurrent transaction",
            ));
        }
        for plugin in self.registry.iter() {
            match plugin.peek(&mut *session, cmd).await? {
                PluginVote::Decline => continue,
                PluginVote::Handled => {
                    tracing::info!(
                        plugin = plugin.name(),
                        method = cmd.request.method(),
                        "plugin peeked command"
                    );
                    return Ok(Claim::Handled);
                }
                PluginVote::Suspend { resume_at_us } => {
                    return Ok(Claim::Suspend(resume_at_us));
                }
            }
        }
        Ok(Claim::Nobody)
    }

    pub async fn process(
        &self,
        session: &mut dyn SqlSession,
        cmd: &mut Command,
    ) -> ProcessOutcome {
        let timer = Instant::now();
        cmd.process_count += 1;
        tracing::debug!(method = cmd.request.method(), "processing");
        session.start_timing(TIMING_BUDGET);

        let outcome = match self.process_step(&mut *session, cmd).await {
            Ok(Claim::Nobody) => {
                tracing::warn!(method = cmd.request.method(), "command does not exist");
                let fault = StepFault::status("430 Unrecognized command");
                self.handle_fault(&mut *session, cmd, fault, true);
                cmd.complete = true;
                ProcessOutcome::Responded
            }
            Ok(Claim::Suspend(resume_at)) => {
                session.rollback();
                ProcessOutcome::Suspend(resume_at)
            }
            Ok(Claim::Handled) => {
                let needs_commit = !session.uncommitted_query().is_empty();
                if !needs_commit {
                    // Nothing to commit; back out of the empty transaction.
                    session.rollback();
                }
                if cmd.response.method_line.is_empty() {
                    cmd.response.method_line = "200 OK".into();
                }
                self.finish_response(&*session, cmd);
                tracing::info!(
                    response = cmd.response.method_line,
                    method = cmd.request.method(),
                    needs_commit,
                    "processed command"
                );
                if needs_commit {
                    // Not complete until the commit resolves.
                    ProcessOutcome::NeedsCommit
                } else {
                    cmd.complete = true;
                    ProcessOutcome::Responded
                }
            }
            Err(fault) => {
                self.handle_fault(&mut *session, cmd, fault, true);
                cmd.complete = true;
                ProcessOutcome::Responded
            }
        };
        session.reset_timing();
        cmd.process_us += timer.elapsed().as_micros().min(u128::from(u64::MAX)) as u64;
        outcome
    }

    async fn process_step(
        &self,
        session: &mut dyn SqlSession,
        cmd: &mut Command,
    ) -> StepResult<Claim> {
        // Peek may have closed its transaction to wait on an HTTP call; open
        // a new one in that case.
        if !session.inside_transaction() && session.begin_concurrent().is_err() {
            return Err(StepFault::status(
                "501 Failed to begin concurrent transaction",
            ));
        }
        for plugin in self.registry.iter() {
            match plugin.process(&mut *session, cmd).await? {
                PluginVote::Decline => continue,
                PluginVote::Handled => {
                    tracing::info!(
                        plugin = plugin.name(),
                        method = cmd.request.method(),
                        "plugin processed command"
                    );
                    return Ok(Claim::Handled);
                }
                PluginVote::Suspend { resume_at_us } => {
                    return Ok(Claim::Suspend(resume_at_us));
                }
            }
        }
        Ok(Claim::Nobody)
    }

    /// Stamp the commit count and serialize structured content into the body.
    fn finish_response(&self, session: &dyn SqlSession, cmd: &mut Command) {
        cmd.response
            .headers
            .set("commitCount", session.commit_count().to_string());
        if cmd.json_content.is_empty() {
            return;
        }
        let new_content =
            serde_json::to_string(&cmd.json_content).unwrap_or_else(|_| "{}".into());
        if cmd.response.body != new_content.as_bytes() {
            if !cmd.response.body.is_empty() {
                tracing::warn!(
                    method = cmd.request.method(),
                    "replacing existing response content"
                );
            }
            cmd.response.body = new_content.into_bytes();
        }
    }

    /// Materialize a fault into the response. The current transaction is
    /// rolled back unconditionally, peek or process alike.
    fn handle_fault(
        &self,
        session: &mut dyn SqlSession,
        cmd: &mut Command,
        fault: StepFault,
        was_processing: bool,
    ) {
        session.rollback();
        session.reset_timing();
        let phase = if was_processing { "processing" } else { "peeking" };
        let severity = fault
            .severity
            .unwrap_or_else(|| classify_severity(&fault.status));
        let method = cmd.request.method().to_string();
        match severity {
            Severity::Alert => {
                tracing::error!(alert = true, method, phase, status = fault.status, "command failed");
            }
            Severity::Warn => {
                tracing::warn!(method, phase, status = fault.status, "command failed");
            }
            Severity::Hmmm => {
                tracing::warn!(hmmm = true, method, phase, status = fault.status, "command failed");
            }
            Severity::Info => {
                tracing::info!(method, phase, status = fault.status, "command failed");
            }
        }
        if !fault.status.is_empty() {
            cmd.response.method_line = fault.status;
        }
        if !fault.headers.is_empty() {
            cmd.response.headers = fault.headers;
        }
        if !fault.body.is_empty() {
            cmd.response.body = fault.body.into_bytes();
        }
        cmd.response
            .headers
            .set("commitCount", session.commit_count().to_string());
    }
}

/// Legacy severity tags carried in fault text by third-party handlers.
fn classify_severity(text: &str) -> Severity {
    if text.contains("_ALERT_") {
        Severity::Alert
    } else if text.contains("_WARN_") {
        Severity::Warn
    } else if text.contains("_HMMM_") {
        Severity::Hmmm
    } else if text.starts_with("50") {
        Severity::Alert
    } else {
        Severity::Info
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use stratum_cluster::cluster::SqlEngine;

    use super::*;
    use crate::command::{Command, Envelope, ResponseRoute};
    use crate::plugins::Plugin;
    use crate::storage::JournalEngine;

    struct ReadPlugin;

    #[async_trait]
    impl Plugin for ReadPlugin {
        fn name(&self) -> &'static str {
            "read"
        }

        async fn peek(
            &self,
            db: &mut dyn SqlSession,
            cmd: &mut Command,
        ) -> StepResult<PluginVote> {
            if cmd.request.method() != "read" {
                return Ok(PluginVote::Decline);
            }
            db.execute("SELECT 1").map_err(StepFault::from)?;
            cmd.json_content.insert("ok".into(), serde_json::json!(true));
            Ok(PluginVote::Handled)
        }
    }

    struct WritePlugin;

    #[async_trait]
    impl Plugin for WritePlugin {
        fn name(&self) -> &'static str {
            "write"
        }

        async fn process(
            &self,
            db: &mut dyn SqlSession,
            cmd: &mut Command,
        ) -> StepResult<PluginVote> {
            if cmd.request.method() != "write" {
                return Ok(PluginVote::Decline);
            }
            db.execute("INSERT INTO test VALUES (1)")
                .map_err(StepFault::from)?;
            Ok(PluginVote::Handled)
        }
    }

    struct FaultPlugin;

    #[async_trait]
    impl Plugin for FaultPlugin {
        fn name(&self) -> &'static str {
            "fault"
        }

        async fn peek(
            &self,
            _db: &mut dyn SqlSession,
            cmd: &mut Command,
        ) -> StepResult<PluginVote> {
            if cmd.request.method() != "fault" {
                return Ok(PluginVote::Decline);
            }
            let mut fault = StepFault::status("400 _HMMM_ bad input");
            fault.body = "details".into();
            Err(fault)
        }
    }

    fn fixture() -> (tempfile::TempDir, Arc<JournalEngine>, CommandExecutor) {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(JournalEngine::open_dir(dir.path()).unwrap());
        let mut registry = PluginRegistry::new();
        registry.register(ReadPlugin);
        registry.register(WritePlugin);
        registry.register(FaultPlugin);
        let executor = CommandExecutor::new(Arc::new(registry));
        (dir, engine, executor)
    }

    fn command(method: &str) -> Command {
        Command::from_request(1, Envelope::new(method), ResponseRoute::Forgotten)
    }

    #[tokio::test]
    async fn peeked_read_responds_without_commit() {
        let (_dir, engine, executor) = fixture();
        let mut session = engine.session();
        let before = SqlEngine::commit_count(&*engine);

        let mut cmd = command("read");
        let outcome = executor.peek(&mut *session, &mut cmd).await;
        assert_eq!(outcome, PeekOutcome::Responded);
        assert!(cmd.complete);
        assert_eq!(cmd.response.method_line, "200 OK");
        assert_eq!(cmd.response.headers.get("commitCount"), Some("0"));
        assert_eq!(cmd.response.body, br#"{"ok":true}"#.to_vec());
        // Peek purity: nothing was committed and nothing is pending.
        assert_eq!(SqlEngine::commit_count(&*engine), before);
        assert!(session.uncommitted_query().is_empty());
        assert!(!session.inside_transaction());
        assert_eq!(cmd.peek_count, 1);
    }

    #[tokio::test]
    async fn unpeekable_write_needs_process_and_commit() {
        let (_dir, engine, executor) = fixture();
        let mut session = engine.session();
        let mut cmd = command("write");

        assert_eq!(
            executor.peek(&mut *session, &mut cmd).await,
            PeekOutcome::NeedsProcess
        );
        assert!(!cmd.complete);

        let outcome = executor.process(&mut *session, &mut cmd).await;
        assert_eq!(outcome, ProcessOutcome::NeedsCommit);
        assert!(!cmd.complete);
        assert!(!session.uncommitted_query().is_empty());

        // The replication layer resolves the commit.
        let index = session.commit(None, 1, cmd.id).unwrap();
        assert_eq!(index, 1);
        assert_eq!(SqlEngine::commit_count(&*engine), 1);
    }

    #[tokio::test]
    async fn unrecognized_command_gets_430() {
        let (_dir, engine, executor) = fixture();
        let mut session = engine.session();
        let mut cmd = command("nosuchthing");

        assert_eq!(
            executor.peek(&mut *session, &mut cmd).await,
            PeekOutcome::NeedsProcess
        );
        assert_eq!(
            executor.process(&mut *session, &mut cmd).await,
            ProcessOutcome::Responded
        );
        assert!(cmd.complete);
        assert_eq!(cmd.response.method_line, "430 Unrecognized command");
        assert_eq!(cmd.response.headers.get("commitCount"), Some("0"));
        assert!(!session.inside_transaction());
    }

    #[tokio::test]
    async fn fault_overwrites_response_and_rolls_back() {
        let (_dir, engine, executor) = fixture();
        let mut session = engine.session();
        let mut cmd = command("fault");

        assert_eq!(
            executor.peek(&mut *session, &mut cmd).await,
            PeekOutcome::Responded
        );
        assert!(cmd.complete);
        assert_eq!(cmd.response.method_line, "400 _HMMM_ bad input");
        assert_eq!(cmd.response.body, b"details".to_vec());
        assert!(cmd.response.headers.get("commitCount").is_some());
        assert!(!session.inside_transaction());
    }

    #[tokio::test]
    async fn begin_failure_responds_501() {
        let (_dir, engine, executor) = fixture();
        let mut session = engine.session();
        // Hold a transaction open so the executor's begin fails.
        session.begin_concurrent().unwrap();
        let mut cmd = command("read");

        assert_eq!(
            executor.peek(&mut *session, &mut cmd).await,
            PeekOutcome::Responded
        );
        assert_eq!(
            cmd.response.method_line,
            "501 Failed to begin concurrent transaction"
        );
    }

    #[test]
    fn severity_tags_classify() {
        assert_eq!(classify_severity("400 _ALERT_ broken"), Severity::Alert);
        assert_eq!(classify_severity("400 _WARN_ odd"), Severity::Warn);
        assert_eq!(classify_severity("400 _HMMM_ strange"), Severity::Hmmm);
        assert_eq!(classify_severity("500 Commit conflict"), Severity::Alert);
        assert_eq!(classify_severity("555 Timeout"), Severity::Info);
        assert_eq!(classify_severity("430 Unrecognized command"), Severity::Info);
    }
}
