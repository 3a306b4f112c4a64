//! Prioritized command queue with future execute times.
//!
//! Ordering is execute-time first (future-dated commands stay inert), then
//! priority, then arrival. The drain loop's wake time converges on the
//! earliest scheduled command; shutdown stops intake and lets workers finish
//! what is in flight.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time;

use crate::command::{now_micros, Command};

struct Scheduled {
    execute_at: u64,
    priority: i64,
    seq: u64,
    cmd: Command,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Scheduled {}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap: earliest execute time, then highest
        // priority, then earliest arrival comes out first.
        other
            .execute_at
            .cmp(&self.execute_at)
            .then(self.priority.cmp(&other.priority))
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    heap: BinaryHeap<Scheduled>,
    next_seq: u64,
}

pub struct CommandQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    shutdown: AtomicBool,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Accept a command unless the queue is shutting down.
    pub fn enqueue(&self, cmd: Command) -> bool {
        if self.shutdown.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut inner = self.inner.lock().expect("queue lock");
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(Scheduled {
                execute_at: cmd.execute_after,
                priority: cmd.priority,
                seq,
                cmd,
            });
        }
        self.notify.notify_waiters();
        true
    }

    /// Re-insert a command the executor parked or deferred. Allowed during
    /// shutdown so in-flight work can finish draining.
    pub fn requeue(&self, cmd: Command) {
        {
            let mut inner = self.inner.lock().expect("queue lock");
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(Scheduled {
                execute_at: cmd.execute_after,
                priority: cmd.priority,
                seq,
                cmd,
            });
        }
        self.notify.notify_waiters();
    }

    /// Next ready command; waits until one is due. Returns `None` once the
    /// queue is shut down and empty of ready work.
    pub async fn next(&self) -> Option<Command> {
        loop {
            // Register for wakeups before inspecting the heap so an enqueue
            // racing with the check cannot be missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait = {
                let mut inner = self.inner.lock().expect("queue lock");
                let now = now_micros();
                match inner.heap.peek() {
                    Some(top) if top.execute_at <= now => {
                        return Some(inner.heap.pop().expect("peeked").cmd);
                    }
                    Some(top) => Some(Duration::from_micros(top.execute_at - now)),
                    None => None,
                }
            };
            // No command is ready right now; during shutdown that means we
            // are done (future-dated commands do not block shutdown).
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }
            match wait {
                Some(wait) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = time::sleep(wait) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock").heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
