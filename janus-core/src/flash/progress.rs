//! Progress plumbing shared by the stage executors.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::mpsc;

use janus_model::StageUpdate;

/// Maximum lines retained per job.
pub const LOG_TAIL_CAPACITY: usize = 200;

/// Fixed-capacity ring of output lines.
///
/// Appended to by one executor thread at a time (the pipeline is strictly
/// sequential within a job) and snapshotted by the scheduling loop before
/// serialization.
#[derive(Debug)]
pub struct LogRing {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append a line, evicting the oldest when full.
    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new(LOG_TAIL_CAPACITY)
    }
}

/// Eager cancellation signal observed by stage executors.
///
/// Distinct from the cooperative cancel flag the job manager polls between
/// stages: raising this terminates the running external process within one
/// readiness-poll interval.
#[derive(Debug, Clone, Default)]
pub struct KillSignal(Arc<AtomicBool>);

impl KillSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Worker-side handle for reporting stage progress.
///
/// Executors never touch the job table; every report crosses this channel
/// back to the scheduling loop, which merges it and publishes the update.
#[derive(Debug, Clone)]
pub struct StageSink {
    tx: mpsc::UnboundedSender<StageUpdate>,
}

impl StageSink {
    pub fn new(tx: mpsc::UnboundedSender<StageUpdate>) -> Self {
        Self { tx }
    }

    /// Channel pair for a stage run.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StageUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn send(&self, update: StageUpdate) {
        // Receiver gone means the pipeline was torn down; nothing to report to.
        let _ = self.tx.send(update);
    }

    /// Report a bare progress value.
    pub fn progress(&self, progress: f64) {
        self.send(StageUpdate {
            progress: Some(progress),
            ..Default::default()
        });
    }
}

// dd reports e.g. "1048576 bytes (1.0 MB, 1.0 MiB) copied, 2 s, 524 kB/s";
// some locales group digits with spaces.
static RE_COPIED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\d[\d\s]*)\s+bytes?\b.*copied").expect("static regex")
});

/// Extract the copied-byte count from a dd progress line.
pub fn parse_copied_bytes(line: &str) -> Option<u64> {
    let caps = RE_COPIED.captures(line)?;
    let digits: String = caps[1].chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Round a progress fraction to four decimals for the wire.
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
