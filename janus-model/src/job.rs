use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{JobStage, JobState};

/// Post-write processing switches shared by every job in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    pub verify: bool,
    pub expand_partition: bool,
    pub resize_filesystem: bool,
    pub eject_after_done: bool,
}

/// Operator request to flash one image to a set of grid cells.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStartRequest {
    pub image_name: String,
    pub cell_ids: Vec<String>,
    #[serde(default)]
    pub options: BatchOptions,
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
}

fn default_concurrency() -> u32 {
    1
}

/// A group of jobs sharing an image and options.
///
/// Retained after the batch finishes so retries can look options back up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInfo {
    pub batch_id: String,
    pub image_name: String,
    pub options: BatchOptions,
    pub concurrency: u32,
    pub cell_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Progress fields reported by a stage executor.
///
/// Executors run on worker threads and cannot touch the job table; they send
/// these records over a channel and the scheduling loop merges them via
/// [`JobInfo::apply`]. Every field is optional so a stage can report progress
/// alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageUpdate {
    pub progress: Option<f64>,
    pub speed_bytes: Option<f64>,
    pub speed_human: Option<String>,
    pub eta_sec: Option<f64>,
    pub eta_human: Option<String>,
}

/// The central orchestration record: one flash pipeline on one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: String,
    pub cell_id: String,
    pub device_path: String,
    pub image_name: String,
    pub state: JobState,
    pub stage: JobStage,
    /// 0..=1 within the current stage; resets to 0 on stage transition.
    pub progress: f64,
    pub speed_bytes: f64,
    pub speed_human: String,
    pub eta_sec: f64,
    pub eta_human: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub warning: Option<String>,
    /// Last lines of stage output, at most 200.
    pub log_tail: Vec<String>,
}

impl JobInfo {
    /// Fresh queued job for a cell/device pair.
    pub fn new(
        job_id: impl Into<String>,
        cell_id: impl Into<String>,
        device_path: impl Into<String>,
        image_name: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            cell_id: cell_id.into(),
            device_path: device_path.into(),
            image_name: image_name.into(),
            state: JobState::Queued,
            stage: JobStage::Write,
            progress: 0.0,
            speed_bytes: 0.0,
            speed_human: String::new(),
            eta_sec: 0.0,
            eta_human: String::new(),
            started_at: None,
            finished_at: None,
            error: None,
            warning: None,
            log_tail: Vec::new(),
        }
    }

    /// Merge a stage executor report into this record.
    pub fn apply(&mut self, update: &StageUpdate) {
        if let Some(p) = update.progress {
            self.progress = p;
        }
        if let Some(s) = update.speed_bytes {
            self.speed_bytes = s;
        }
        if let Some(s) = &update.speed_human {
            self.speed_human = s.clone();
        }
        if let Some(e) = update.eta_sec {
            self.eta_sec = e;
        }
        if let Some(e) = &update.eta_human {
            self.eta_human = e.clone();
        }
    }

    /// Reset per-stage progress fields on entry to a new stage.
    pub fn enter_stage(&mut self, state: JobState, stage: JobStage) {
        self.state = state;
        self.stage = stage;
        self.progress = 0.0;
        self.speed_bytes = 0.0;
        self.speed_human.clear();
        self.eta_sec = 0.0;
        self.eta_human.clear();
    }
}
