//! Per-queue counters and worker self-monitoring.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use sysinfo::{Pid, System};

/// Rolling window used for the average batch time.
const DURATION_WINDOW: usize = 100;

/// Counters accumulated for one queue since the last flush.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub ignored: u64,
    pub retried: u64,
    pub discarded: u64,
    pub handed_off: u64,
}

impl QueueStatsSnapshot {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Counts from one processed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCounts {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub ignored: u64,
    pub handed_off: u64,
}

/// Per-queue accumulator flushed once a threshold is crossed.
#[derive(Debug, Clone)]
pub struct QueueStats {
    current: QueueStatsSnapshot,
    processed_threshold: u64,
    failed_threshold: u64,
}

impl QueueStats {
    pub fn new(processed_threshold: u64, failed_threshold: u64) -> Self {
        Self {
            current: QueueStatsSnapshot::default(),
            processed_threshold,
            failed_threshold,
        }
    }

    pub fn record_batch(&mut self, counts: BatchCounts) {
        self.current.processed += counts.processed;
        self.current.succeeded += counts.succeeded;
        self.current.failed += counts.failed;
        self.current.ignored += counts.ignored;
        self.current.handed_off += counts.handed_off;
    }

    pub fn record_retries(&mut self, count: u64) {
        self.current.retried += count;
    }

    pub fn record_discards(&mut self, count: u64) {
        self.current.discarded += count;
    }

    pub fn should_flush(&self) -> bool {
        self.current.processed >= self.processed_threshold || self.current.failed >= self.failed_threshold
    }

    /// Take the counters and start over.
    pub fn take(&mut self) -> QueueStatsSnapshot {
        std::mem::take(&mut self.current)
    }

    pub fn current(&self) -> &QueueStatsSnapshot {
        &self.current
    }
}

/// Identity of this worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerInfo {
    pub id: String,
    pub hostname: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

impl WorkerInfo {
    pub fn current() -> Self {
        let hostname = System::host_name()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        let pid = std::process::id();
        let started_at = Utc::now();
        Self {
            id: format!("{hostname}:{pid}:{}", started_at.timestamp_millis()),
            hostname,
            pid,
            started_at,
        }
    }
}

/// Totals reported in heartbeats.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub ignored: u64,
    pub handed_off: u64,
    pub batches: u64,
    /// Mean batch time over the most recent batches.
    pub avg_batch_ms: f64,
    /// Resident set size, where the platform exposes it.
    pub memory_bytes: Option<u64>,
    pub uptime_secs: u64,
}

#[derive(Default)]
struct MonitorState {
    totals: BatchCounts,
    batches: u64,
    durations: VecDeque<Duration>,
}

/// Running totals for this worker.
pub struct WorkerMonitor {
    info: WorkerInfo,
    state: Mutex<MonitorState>,
    system: Mutex<System>,
}

impl WorkerMonitor {
    pub fn new(info: WorkerInfo) -> Self {
        Self {
            info,
            state: Mutex::new(MonitorState::default()),
            system: Mutex::new(System::new()),
        }
    }

    pub fn info(&self) -> &WorkerInfo {
        &self.info
    }

    pub fn record_batch(&self, counts: BatchCounts, duration: Duration) {
        let mut state = self.state.lock();
        state.totals.processed += counts.processed;
        state.totals.succeeded += counts.succeeded;
        state.totals.failed += counts.failed;
        state.totals.ignored += counts.ignored;
        state.totals.handed_off += counts.handed_off;
        state.batches += 1;
        if state.durations.len() == DURATION_WINDOW {
            state.durations.pop_front();
        }
        state.durations.push_back(duration);
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        let memory_bytes = self.resident_memory();
        let state = self.state.lock();
        let avg_batch_ms = if state.durations.is_empty() {
            0.0
        } else {
            let total: f64 = state.durations.iter().map(|d| d.as_secs_f64() * 1000.0).sum();
            total / state.durations.len() as f64
        };
        WorkerStatsSnapshot {
            processed: state.totals.processed,
            succeeded: state.totals.succeeded,
            failed: state.totals.failed,
            ignored: state.totals.ignored,
            handed_off: state.totals.handed_off,
            batches: state.batches,
            avg_batch_ms,
            memory_bytes,
            uptime_secs: (Utc::now() - self.info.started_at).num_seconds().max(0) as u64,
        }
    }

    /// Resident memory of this process in bytes.
    fn resident_memory(&self) -> Option<u64> {
        let pid = Pid::from_u32(self.info.pid);
        let mut system = self.system.lock();
        if !system.refresh_process(pid) {
            return None;
        }
        system.process(pid).map(|process| process.memory())
    }
}
