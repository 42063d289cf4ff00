use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::AppResult;

const AUDIT_LOG_STEM: &str = "poi-audit";

#[derive(Debug, Serialize)]
pub struct TelemetryEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Audit events from the engine (provider links, sync failures, startup),
/// queued in memory and appended to a JSONL log in batches. A failed write
/// leaves the batch queued for the next flush.
#[derive(Clone)]
pub struct TelemetryClient {
    enabled: Arc<AtomicBool>,
    pending: Arc<Mutex<Vec<TelemetryEvent>>>,
    log: Arc<AuditLog>,
    batch_size: usize,
}

impl TelemetryClient {
    pub fn new<P: AsRef<Path>>(data_dir: P, config: &AppConfig) -> AppResult<Self> {
        let log = AuditLog::open(
            data_dir.as_ref(),
            config.telemetry_buffer_max_bytes,
            config.telemetry_buffer_max_files,
        )?;
        Ok(Self {
            enabled: Arc::new(AtomicBool::new(config.telemetry_enabled_by_default)),
            pending: Arc::new(Mutex::new(Vec::new())),
            log: Arc::new(log),
            batch_size: config.telemetry_batch_size.max(1),
        })
    }

    pub fn record(&self, name: impl Into<String>, payload: serde_json::Value) -> AppResult<()> {
        if !self.enabled.load(Ordering::Relaxed) {
            return Ok(());
        }
        let mut pending = self.pending.lock();
        pending.push(TelemetryEvent {
            name: name.into(),
            timestamp: Utc::now(),
            payload,
        });
        if pending.len() < self.batch_size {
            return Ok(());
        }
        self.drain(&mut pending)
    }

    /// Like [`record`](Self::record), but a write failure is only logged.
    pub fn record_quietly(&self, name: &str, payload: serde_json::Value) {
        if let Err(err) = self.record(name, payload) {
            warn!(target: "telemetry", ?err, event = name, "audit event not written");
        }
    }

    pub fn flush(&self) -> AppResult<()> {
        self.drain(&mut self.pending.lock())
    }

    pub fn queue_depth(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn buffer_path(&self) -> &Path {
        &self.log.path
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn drain(&self, pending: &mut Vec<TelemetryEvent>) -> AppResult<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let mut chunk = Vec::new();
        for event in pending.iter() {
            serde_json::to_writer(&mut chunk, event)?;
            chunk.push(b'\n');
        }
        self.log.append(&chunk)?;
        debug!(target: "telemetry", events = pending.len(), "audit batch written");
        pending.clear();
        Ok(())
    }
}

/// `poi-audit.jsonl` plus numbered generations `poi-audit.1.jsonl` (newest)
/// up to `max_files - 1`.
struct AuditLog {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
}

impl AuditLog {
    fn open(dir: &Path, max_bytes: u64, max_files: usize) -> AppResult<Self> {
        fs::create_dir_all(dir)?;
        let log = Self {
            path: dir.join(format!("{AUDIT_LOG_STEM}.jsonl")),
            max_bytes,
            max_files: max_files.max(1),
        };
        OpenOptions::new().create(true).append(true).open(&log.path)?;
        Ok(log)
    }

    fn append(&self, chunk: &[u8]) -> AppResult<()> {
        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err.into()),
        };
        if size > 0 && size + chunk.len() as u64 > self.max_bytes {
            self.roll()?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(chunk)?;
        file.flush()?;
        Ok(())
    }

    /// Shifts every generation up by one, dropping the oldest.
    fn roll(&self) -> AppResult<()> {
        let keep = self.max_files - 1;
        if keep == 0 {
            fs::File::create(&self.path)?;
            return Ok(());
        }
        remove_quietly(&self.generation(keep));
        for index in (1..keep).rev() {
            let from = self.generation(index);
            if from.exists() {
                fs::rename(&from, self.generation(index + 1))?;
            }
        }
        fs::rename(&self.path, self.generation(1))?;
        debug!(target: "telemetry", path = %self.path.display(), "audit log rolled");
        Ok(())
    }

    fn generation(&self, index: usize) -> PathBuf {
        self.path
            .with_file_name(format!("{AUDIT_LOG_STEM}.{index}.jsonl"))
    }
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(target: "telemetry", ?err, path = %path.display(), "stale audit log kept"),
    }
}
