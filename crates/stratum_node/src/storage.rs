//! Journaled storage engine behind the transactional storage surface.
//!
//! The engine is deliberately SQL-opaque: it journals committed statement
//! text by commit index and leaves query evaluation to the embedded engine
//! this surface fronts. The journal is an append-only file of crc-framed
//! records, replayed at open; it doubles as the replication log served to
//! synchronizing peers.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use tokio::time::Instant;

use stratum_cluster::cluster::{EngineError, ReplicationRecord, SqlEngine, SqlSession};

const JOURNAL_FILE: &str = "journal.log";

/// Default per-transaction timing budget.
pub const DEFAULT_TIMING_BUDGET: Duration = Duration::from_micros(5_000_000);

struct JournalState {
    /// Committed records; `records[i].index == i + 1`.
    records: Vec<ReplicationRecord>,
    file: File,
}

struct EngineInner {
    state: RwLock<JournalState>,
    commit_count: AtomicU64,
    path: PathBuf,
}

pub struct JournalEngine {
    inner: Arc<EngineInner>,
}

impl JournalEngine {
    /// Open (or create) the journal under `dir` and replay committed records.
    pub fn open_dir(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).context("create journal dir")?;
        let path = dir.join(JOURNAL_FILE);
        let records = replay(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open journal {}", path.display()))?;
        let commit_count = records.last().map(|r| r.index).unwrap_or(0);
        if commit_count > 0 {
            tracing::info!(commit_count, path = %path.display(), "journal replayed");
        }
        Ok(Self {
            inner: Arc::new(EngineInner {
                state: RwLock::new(JournalState { records, file }),
                commit_count: AtomicU64::new(commit_count),
                path,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

impl EngineInner {
    fn append(
        &self,
        assign_index: Option<u64>,
        sql: String,
        epoch: u64,
        command_id: u64,
    ) -> Result<u64, EngineError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| EngineError::Busy("journal lock poisoned".into()))?;
        let expected = state.records.last().map(|r| r.index).unwrap_or(0) + 1;
        let index = match assign_index {
            Some(assigned) if assigned != expected => {
                return Err(EngineError::IndexGap { assigned, expected });
            }
            Some(assigned) => assigned,
            None => expected,
        };
        let record = ReplicationRecord::new(index, sql, epoch, command_id);
        let payload = serde_json::to_vec(&record)
            .map_err(|err| EngineError::Other(anyhow::Error::from(err)))?;
        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);
        state
            .file
            .write_all(&frame)
            .and_then(|()| state.file.sync_data())
            .map_err(|err| EngineError::Other(anyhow::Error::from(err)))?;
        state.records.push(record);
        self.commit_count.store(index, Ordering::Release);
        Ok(index)
    }
}

/// Load every complete record from the journal, ignoring a torn tail.
fn replay(path: &Path) -> anyhow::Result<Vec<ReplicationRecord>> {
    let mut bytes = Vec::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_end(&mut bytes).context("read journal")?;
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).context("open journal"),
    }

    let mut records: Vec<ReplicationRecord> = Vec::new();
    let mut offset = 0usize;
    while offset + 8 <= bytes.len() {
        let len = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(bytes[offset + 4..offset + 8].try_into().unwrap());
        let start = offset + 8;
        if start + len > bytes.len() {
            break;
        }
        let payload = &bytes[start..start + len];
        if crc32fast::hash(payload) != crc {
            tracing::warn!(offset, "journal crc mismatch, truncating replay");
            break;
        }
        let record: ReplicationRecord =
            serde_json::from_slice(payload).context("decode journal record")?;
        let expected = records.last().map(|r| r.index + 1).unwrap_or(1);
        anyhow::ensure!(
            record.index == expected,
            "journal gap: found index {} expected {}",
            record.index,
            expected
        );
        records.push(record);
        offset = start + len;
    }
    if offset < bytes.len() {
        tracing::warn!(
            torn_bytes = bytes.len() - offset,
            "dropping torn journal tail"
        );
    }
    Ok(records)
}

impl SqlEngine for JournalEngine {
    fn session(&self) -> Box<dyn SqlSession> {
        Box::new(JournalSession {
            inner: self.inner.clone(),
            in_txn: false,
            snapshot: 0,
            uncommitted: String::new(),
            started: None,
            budget: DEFAULT_TIMING_BUDGET,
        })
    }

    fn commit_count(&self) -> u64 {
        self.inner.commit_count.load(Ordering::Acquire)
    }

    fn records_from(&self, from: u64, limit: usize) -> Vec<ReplicationRecord> {
        let Ok(state) = self.inner.state.read() else {
            return Vec::new();
        };
        if from == 0 || from as usize > state.records.len() {
            return Vec::new();
        }
        let start = (from - 1) as usize;
        let end = state.records.len().min(start + limit);
        state.records[start..end].to_vec()
    }
}

/// One worker's connection to the engine.
struct JournalSession {
    inner: Arc<EngineInner>,
    in_txn: bool,
    /// Commit count observed when the transaction began.
    snapshot: u64,
    uncommitted: String,
    started: Option<Instant>,
    budget: Duration,
}

impl JournalSession {
    fn check_deadline(&self) -> Result<(), EngineError> {
        if let Some(started) = self.started {
            if started.elapsed() > self.budget {
                return Err(EngineError::Timeout);
            }
        }
        Ok(())
    }
}

/// Statements whose leading keyword marks them as read-only.
fn is_read_only(sql: &str) -> bool {
    let keyword = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    matches!(keyword.as_str(), "select" | "explain" | "pragma" | "with")
}

impl SqlSession for JournalSession {
    fn begin_concurrent(&mut self) -> Result<(), EngineError> {
        if self.in_txn {
            return Err(EngineError::Busy("transaction already open".into()));
        }
        self.in_txn = true;
        self.snapshot = self.inner.commit_count.load(Ordering::Acquire);
        self.uncommitted.clear();
        Ok(())
    }

    fn inside_transaction(&self) -> bool {
        self.in_txn
    }

    fn start_timing(&mut self, budget: Duration) {
        self.started = Some(Instant::now());
        self.budget = budget;
    }

    fn reset_timing(&mut self) {
        self.started = None;
        self.budget = DEFAULT_TIMING_BUDGET;
    }

    fn execute(&mut self, sql: &str) -> Result<Vec<Vec<String>>, EngineError> {
        self.check_deadline()?;
        if !self.in_txn {
            return Err(EngineError::Busy("execute outside transaction".into()));
        }
        let sql = sql.trim();
        if sql.is_empty() {
            return Ok(Vec::new());
        }
        if is_read_only(sql) {
            // Reads resolve against the snapshot; the journal surface serves
            // commit metadata only, so result rows stay empty here.
            return Ok(Vec::new());
        }
        self.uncommitted.push_str(sql);
        if !sql.ends_with(';') {
            self.uncommitted.push(';');
        }
        Ok(Vec::new())
    }

    fn uncommitted_query(&self) -> &str {
        &self.uncommitted
    }

    fn commit(
        &mut self,
        assign_index: Option<u64>,
        epoch: u64,
        command_id: u64,
    ) -> Result<u64, EngineError> {
        if !self.in_txn {
            return Err(EngineError::Busy("commit outside transaction".into()));
        }
        let sql = std::mem::take(&mut self.uncommitted);
        match self.inner.append(assign_index, sql, epoch, command_id) {
            Ok(index) => {
                self.in_txn = false;
                self.snapshot = index;
                Ok(index)
            }
            Err(err) => {
                // The transaction stays open; the caller decides whether to
                // retry or roll back.
                Err(err)
            }
        }
    }

    fn rollback(&mut self) {
        self.in_txn = false;
        self.uncommitted.clear();
    }

    fn commit_count(&self) -> u64 {
        if self.in_txn {
            self.snapshot
        } else {
            self.inner.commit_count.load(Ordering::Acquire)
        }
    }
}
