//! Worker pool: drains the command queue through the executor and routes
//! responses.
//!
//! Each worker owns one storage session. Writes hand off to the cluster task
//! for replication and commit-index assignment; on a follower the whole
//! command escalates to the leader instead, holding the client socket until
//! the leader's response comes back.

use std::sync::Arc;

use stratum_cluster::cluster::{
    ClusterHandle, CommitError, SqlEngine, SqlSession, State,
};

use crate::command::{now_micros, Command, Envelope, ResponseRoute};
use crate::executor::{CommandExecutor, PeekOutcome, ProcessOutcome};
use crate::queue::CommandQueue;

/// Bounded retries for transient (non-fatal `5xx`) failures.
const MAX_RETRIES: u32 = 3;
/// How long a command waits before re-checking for an elected leader.
const NO_LEADER_BACKOFF_US: u64 = 100_000;

#[derive(Clone)]
pub struct WorkerContext {
    pub queue: Arc<CommandQueue>,
    pub executor: Arc<CommandExecutor>,
    pub handle: ClusterHandle,
    pub engine: Arc<dyn SqlEngine>,
}

pub async fn run_worker(worker_id: usize, ctx: WorkerContext) {
    let mut session = ctx.engine.session();
    tracing::debug!(worker_id, "worker started");
    while let Some(cmd) = ctx.queue.next().await {
        execute_command(&ctx, session.as_mut(), cmd).await;
    }
    tracing::debug!(worker_id, "worker stopped");
}

async fn execute_command(ctx: &WorkerContext, session: &mut dyn SqlSession, mut cmd: Command) {
    // Peek runs at most once per attempt; a resumed or deferred command goes
    // straight to the decision below.
    if cmd.peek_count == 0 {
        match ctx.executor.peek(&mut *session, &mut cmd).await {
            PeekOutcome::Responded => {
                finish(ctx, cmd).await;
                return;
            }
            PeekOutcome::Suspend(resume_at) => {
                cmd.suspend_count += 1;
                cmd.execute_after = resume_at;
                ctx.queue.requeue(cmd);
                return;
            }
            PeekOutcome::NeedsProcess => {}
        }
    }

    let state = match ctx.handle.status().await {
        Some(status) => State::from_name(&status.state).unwrap_or(State::Unknown),
        None => State::Unknown,
    };
    match state {
        State::Leading | State::StandingDown => {
            process_locally(ctx, session, cmd).await;
        }
        State::Following => {
            escalate(ctx, cmd);
        }
        _ => {
            // No usable role yet; check again shortly.
            cmd.execute_after = now_micros() + NO_LEADER_BACKOFF_US;
            ctx.queue.requeue(cmd);
        }
    }
}

async fn process_locally(ctx: &WorkerContext, session: &mut dyn SqlSession, mut cmd: Command) {
    match ctx.executor.process(&mut *session, &mut cmd).await {
        ProcessOutcome::Responded => {
            finish(ctx, cmd).await;
        }
        ProcessOutcome::Suspend(resume_at) => {
            cmd.suspend_count += 1;
            cmd.execute_after = resume_at;
            ctx.queue.requeue(cmd);
        }
        ProcessOutcome::NeedsCommit => {
            let sql = session.uncommitted_query().to_string();
            match ctx.handle.commit_write(sql, cmd.id, cmd.consistency).await {
                Ok(ticket) => {
                    match session.commit(Some(ticket.index), ticket.epoch, cmd.id) {
                        Ok(index) => {
                            ctx.handle.commit_finished(index, true).await;
                            cmd.complete = true;
                            finish(ctx, cmd).await;
                        }
                        Err(err) => {
                            tracing::error!(
                                alert = true,
                                index = ticket.index,
                                error = %err,
                                "granted commit failed locally"
                            );
                            session.rollback();
                            ctx.handle.commit_finished(ticket.index, false).await;
                            respond_conflict(ctx, session, cmd).await;
                        }
                    }
                }
                Err(CommitError::NotLeader) => {
                    // Leadership moved between the role check and the commit;
                    // the next attempt escalates.
                    session.rollback();
                    cmd.execute_after = now_micros() + NO_LEADER_BACKOFF_US;
                    ctx.queue.requeue(cmd);
                }
                Err(_) => {
                    session.rollback();
                    respond_conflict(ctx, session, cmd).await;
                }
            }
        }
    }
}

async fn respond_conflict(ctx: &WorkerContext, session: &dyn SqlSession, mut cmd: Command) {
    cmd.response.method_line = "500 Commit conflict".into();
    cmd.response
        .headers
        .set("commitCount", session.commit_count().to_string());
    cmd.complete = true;
    finish(ctx, cmd).await;
}

/// Forward the command to the leader off-worker; the client socket stays
/// open until the leader's verbatim response is relayed back.
fn escalate(ctx: &WorkerContext, mut cmd: Command) {
    cmd.escalated = true;
    let handle = ctx.handle.clone();
    let queue = ctx.queue.clone();
    tokio::spawn(async move {
        let payload = cmd.request.serialize();
        match handle.escalate(payload).await {
            Ok(bytes) => match Envelope::parse(&bytes) {
                Ok(response) => {
                    cmd.response = response;
                    cmd.complete = true;
                    respond(&handle, cmd).await;
                }
                Err(err) => {
                    tracing::error!(alert = true, error = %err, "malformed escalation response");
                    cmd.response = Envelope::new("500 Malformed escalation response");
                    cmd.complete = true;
                    respond(&handle, cmd).await;
                }
            },
            Err(CommitError::ShuttingDown) => {
                cmd.response = Envelope::new("002 Socket Failed");
                cmd.complete = true;
                respond(&handle, cmd).await;
            }
            Err(err) => {
                tracing::debug!(error = %err, "escalation bounced, requeueing");
                cmd.execute_after = now_micros() + NO_LEADER_BACKOFF_US;
                queue.requeue(cmd);
            }
        }
    });
}

/// Retry transient failures, then route the response.
async fn finish(ctx: &WorkerContext, mut cmd: Command) {
    if is_transient_failure(&cmd) && cmd.retries < MAX_RETRIES {
        tracing::info!(
            method = cmd.request.method(),
            status = cmd.response.method_line,
            retries = cmd.retries,
            "retrying transient failure"
        );
        cmd.reset_for_retry();
        ctx.queue.requeue(cmd);
        return;
    }
    respond(&ctx.handle, cmd).await;
}

/// `5xx` failures outside the fatal `50x` block may be retried.
fn is_transient_failure(cmd: &Command) -> bool {
    let Some(code) = cmd.response.status_code() else {
        return false;
    };
    code.starts_with('5') && !code.starts_with("50")
}

async fn respond(handle: &ClusterHandle, cmd: Command) {
    let Command {
        response, route, ..
    } = cmd;
    match route {
        ResponseRoute::Client(tx) => {
            let _ = tx.send(response);
        }
        ResponseRoute::Peer {
            node,
            escalation_id,
        } => {
            handle
                .escalation_reply(node, escalation_id, response.serialize())
                .await;
        }
        ResponseRoute::Forgotten => {}
    }
}
