//! Job manager: admission, safety checks, concurrency gating, pipelines.
//!
//! The manager exclusively owns the job, batch and task tables. Pipelines
//! run as tokio tasks; stage executors run on blocking worker threads and
//! report back over channels, never touching the tables directly. Every
//! mutation ends with a `job_update` event carrying the full job snapshot.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use uuid::Uuid;

use janus_model::{
    BatchInfo, BatchOptions, BatchStartRequest, DriveInfo, JobInfo, JobStage, JobState, PortCell,
};

use crate::bus::EventBus;
use crate::flash::{KillSignal, LogRing, StageRunner, StageSink};
use crate::images::ImageCatalog;
use crate::inventory::DeviceInventory;
use crate::layout::LayoutStore;

const JOB_UPDATE: &str = "job_update";

/// Reject writing to a device that is absent, non-removable, or backing the
/// running system. Returns the error message to record, or None when safe.
pub fn safety_check(drive: Option<&DriveInfo>, device_path: &str) -> Option<String> {
    if device_path.is_empty() {
        return Some("No device bound to this cell".to_string());
    }
    let Some(drive) = drive else {
        return Some(format!("Device {device_path} not found / not connected"));
    };
    if drive.is_system {
        return Some(format!(
            "BLOCKED: {device_path} contains system/root partition"
        ));
    }
    if !drive.removable {
        return Some(format!("BLOCKED: {device_path} is not removable"));
    }
    None
}

/// Cooperative cancel flag plus the eager kill signal for one job.
#[derive(Debug, Default)]
struct CancelState {
    flag: AtomicBool,
    kill: KillSignal,
}

struct JobEntry {
    info: JobInfo,
    ring: Arc<LogRing>,
    cancel: Arc<CancelState>,
}

impl JobEntry {
    fn new(info: JobInfo) -> Self {
        Self {
            info,
            ring: Arc::new(LogRing::default()),
            cancel: Arc::new(CancelState::default()),
        }
    }

    /// Serializable view with the log tail filled in from the ring.
    fn snapshot(&self) -> JobInfo {
        let mut info = self.info.clone();
        info.log_tail = self.ring.snapshot();
        info
    }
}

/// Orchestrates flash pipelines across concurrent jobs.
pub struct JobManager {
    jobs: RwLock<HashMap<String, JobEntry>>,
    batches: RwLock<HashMap<String, BatchInfo>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    /// Admission gate, re-created per batch with the batch's concurrency.
    semaphore: Mutex<Arc<Semaphore>>,
    inventory: Arc<dyn DeviceInventory>,
    catalog: Arc<ImageCatalog>,
    layout: Arc<LayoutStore>,
    stages: Arc<dyn StageRunner>,
    bus: Arc<EventBus>,
}

impl fmt::Debug for JobManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobManager")
            .field("jobs", &self.jobs.read().len())
            .field("batches", &self.batches.read().len())
            .finish_non_exhaustive()
    }
}

impl JobManager {
    pub fn new(
        inventory: Arc<dyn DeviceInventory>,
        catalog: Arc<ImageCatalog>,
        layout: Arc<LayoutStore>,
        stages: Arc<dyn StageRunner>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            jobs: RwLock::new(HashMap::new()),
            batches: RwLock::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            // Replaced on every batch start; retries outside a batch reuse
            // whatever gate is current.
            semaphore: Mutex::new(Arc::new(Semaphore::new(2))),
            inventory,
            catalog,
            layout,
            stages,
            bus,
        })
    }

    // ── Public API ───────────────────────────────────────────────────

    pub fn list_jobs(&self) -> Vec<JobInfo> {
        self.jobs.read().values().map(JobEntry::snapshot).collect()
    }

    pub fn get_job(&self, job_id: &str) -> Option<JobInfo> {
        self.jobs.read().get(job_id).map(JobEntry::snapshot)
    }

    /// Create jobs for the requested cells and schedule their pipelines.
    ///
    /// Cells that are unknown or disabled are skipped. Cells that fail the
    /// safety check are recorded as FAILED jobs so the grid can show them.
    pub async fn start_batch(self: &Arc<Self>, req: BatchStartRequest) -> Vec<JobInfo> {
        let layout = self.layout.load();
        let cell_map: HashMap<&str, &PortCell> = layout
            .cells
            .iter()
            .map(|c| (c.cell_id.as_str(), c))
            .collect();

        let drives = self.inventory.list_drives(false).await;
        let mut drive_by_path: HashMap<&str, &DriveInfo> = HashMap::new();
        for drive in &drives {
            drive_by_path.insert(drive.device_path.as_str(), drive);
            if !drive.by_path.is_empty() {
                drive_by_path.insert(drive.by_path.as_str(), drive);
            }
        }

        let batch_id = Uuid::new_v4().to_string();
        self.batches.write().insert(
            batch_id.clone(),
            BatchInfo {
                batch_id,
                image_name: req.image_name.clone(),
                options: req.options,
                concurrency: req.concurrency,
                cell_ids: req.cell_ids.clone(),
                created_at: Utc::now(),
            },
        );

        let semaphore = Arc::new(Semaphore::new(req.concurrency.max(1) as usize));
        *self.semaphore.lock() = Arc::clone(&semaphore);

        let mut created = Vec::new();
        for cell_id in &req.cell_ids {
            let Some(cell) = cell_map.get(cell_id.as_str()) else {
                continue;
            };
            if !cell.enabled {
                continue;
            }

            let drive = drive_by_path.get(cell.port_id.as_str()).copied();
            // An unresolvable port falls through with the port id as device
            // path so the safety check records the miss as a FAILED job.
            let device_path = drive
                .map(|d| d.device_path.clone())
                .unwrap_or_else(|| cell.port_id.clone());

            let job_id = Uuid::new_v4().to_string();
            let job = JobInfo::new(&job_id, cell_id, &device_path, &req.image_name);

            if let Some(error) = safety_check(drive, &device_path) {
                created.push(self.record_failed(job, error));
                continue;
            }

            let entry = JobEntry::new(job);
            created.push(entry.snapshot());
            self.jobs.write().insert(job_id.clone(), entry);
            self.spawn_pipeline(job_id, req.options, Arc::clone(&semaphore));
        }
        created
    }

    /// Cancel a job. No-op (returns false) on unknown or terminal jobs.
    ///
    /// Sets the cooperative flag, raises the kill signal so any running
    /// external process dies, marks the job CANCELLED and aborts its task.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        let cancel = {
            let jobs = self.jobs.read();
            let Some(entry) = jobs.get(job_id) else {
                return false;
            };
            if entry.info.state.is_terminal() {
                return false;
            }
            Arc::clone(&entry.cancel)
        };
        cancel.flag.store(true, Ordering::SeqCst);
        cancel.kill.raise();
        self.with_job(job_id, |job| {
            job.state = JobState::Cancelled;
            job.finished_at = Some(Utc::now());
        });
        if let Some(handle) = self.tasks.lock().remove(job_id) {
            handle.abort();
        }
        true
    }

    /// Re-run a FAILED or CANCELLED job as a fresh job on the same cell.
    ///
    /// The old record is replaced by the new one; options come from any
    /// batch containing the cell, defaults otherwise.
    pub async fn retry_job(self: &Arc<Self>, job_id: &str) -> Option<JobInfo> {
        let old = {
            let jobs = self.jobs.read();
            let entry = jobs.get(job_id)?;
            if !matches!(entry.info.state, JobState::Failed | JobState::Cancelled) {
                return None;
            }
            entry.info.clone()
        };

        let new_id = Uuid::new_v4().to_string();
        let job = JobInfo::new(&new_id, &old.cell_id, &old.device_path, &old.image_name);

        let drives = self.inventory.list_drives(false).await;
        let drive = drives.iter().find(|d| d.device_path == old.device_path);
        if let Some(error) = safety_check(drive, &old.device_path) {
            return Some(self.record_failed(job, error));
        }

        let entry = JobEntry::new(job);
        let snapshot = entry.snapshot();
        {
            let mut jobs = self.jobs.write();
            jobs.insert(new_id.clone(), entry);
            jobs.remove(job_id);
        }
        self.tasks.lock().remove(job_id);

        let options = {
            let batches = self.batches.read();
            batches
                .values()
                .find(|b| b.cell_ids.iter().any(|c| c == &old.cell_id))
                .map(|b| b.options)
                .unwrap_or_default()
        };

        let semaphore = self.semaphore.lock().clone();
        self.spawn_pipeline(new_id, options, semaphore);
        Some(snapshot)
    }

    /// Resolve a cell to its current drive and power it off.
    pub async fn eject_cell(&self, cell_id: &str) -> (bool, String) {
        let layout = self.layout.load();
        let Some(cell) = layout.cell(cell_id) else {
            return (false, "Cell not found or no device bound".to_string());
        };
        if cell.port_id.is_empty() {
            return (false, "Cell not found or no device bound".to_string());
        }

        let drives = self.inventory.list_drives(false).await;
        let Some(drive) = drives
            .iter()
            .find(|d| d.device_path == cell.port_id || d.by_path == cell.port_id)
        else {
            return (false, "Device not connected".to_string());
        };
        self.inventory.eject_device(&drive.device_path).await
    }

    /// Cancel every non-terminal job.
    pub fn cancel_all(&self) {
        let ids: Vec<String> = self
            .jobs
            .read()
            .iter()
            .filter(|(_, entry)| !entry.info.state.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            self.cancel_job(&id);
        }
    }

    /// Retry every FAILED job; returns the replacement jobs.
    pub async fn retry_all_failed(self: &Arc<Self>) -> Vec<JobInfo> {
        let ids: Vec<String> = self
            .jobs
            .read()
            .iter()
            .filter(|(_, entry)| entry.info.state == JobState::Failed)
            .map(|(id, _)| id.clone())
            .collect();
        let mut retried = Vec::new();
        for id in ids {
            if let Some(job) = self.retry_job(&id).await {
                retried.push(job);
            }
        }
        retried
    }

    // ── Internal ─────────────────────────────────────────────────────

    /// Mutate a non-terminal job and publish the resulting snapshot.
    /// Returns false when the job is unknown or already terminal.
    fn with_job<F: FnOnce(&mut JobInfo)>(&self, job_id: &str, mutate: F) -> bool {
        let snapshot = {
            let mut jobs = self.jobs.write();
            let Some(entry) = jobs.get_mut(job_id) else {
                return false;
            };
            if entry.info.state.is_terminal() {
                return false;
            }
            mutate(&mut entry.info);
            entry.snapshot()
        };
        self.bus.publish(JOB_UPDATE, &snapshot);
        true
    }

    fn publish_update(&self, job_id: &str) {
        let snapshot = self.jobs.read().get(job_id).map(JobEntry::snapshot);
        if let Some(snapshot) = snapshot {
            self.bus.publish(JOB_UPDATE, &snapshot);
        }
    }

    /// Record a job straight into FAILED and publish it.
    fn record_failed(&self, mut job: JobInfo, error: String) -> JobInfo {
        tracing::warn!(job_id = %job.job_id, cell_id = %job.cell_id, %error, "job rejected");
        job.state = JobState::Failed;
        job.error = Some(error);
        job.finished_at = Some(Utc::now());
        let entry = JobEntry::new(job);
        let snapshot = entry.snapshot();
        self.jobs.write().insert(snapshot.job_id.clone(), entry);
        self.bus.publish(JOB_UPDATE, &snapshot);
        snapshot
    }

    fn fail_job(&self, job_id: &str, error: impl Into<String>) {
        let error = error.into();
        self.with_job(job_id, |job| {
            job.state = JobState::Failed;
            job.error = Some(error);
            job.finished_at = Some(Utc::now());
        });
    }

    fn mark_cancelled(&self, job_id: &str) {
        self.with_job(job_id, |job| {
            job.state = JobState::Cancelled;
            job.finished_at = Some(Utc::now());
        });
    }

    fn set_started(&self, job_id: &str) {
        let mut jobs = self.jobs.write();
        if let Some(entry) = jobs.get_mut(job_id)
            && !entry.info.state.is_terminal()
        {
            entry.info.started_at = Some(Utc::now());
        }
    }

    fn enter_stage(&self, job_id: &str, state: JobState, stage: JobStage) {
        self.with_job(job_id, |job| job.enter_stage(state, stage));
    }

    fn cancel_requested(&self, job_id: &str) -> bool {
        self.jobs
            .read()
            .get(job_id)
            .is_some_and(|entry| entry.cancel.flag.load(Ordering::SeqCst))
    }

    fn cancelled_or_killed(&self, job_id: &str) -> bool {
        self.jobs.read().get(job_id).is_some_and(|entry| {
            entry.cancel.flag.load(Ordering::SeqCst) || entry.cancel.kill.is_raised()
        })
    }

    fn spawn_pipeline(
        self: &Arc<Self>,
        job_id: String,
        options: BatchOptions,
        semaphore: Arc<Semaphore>,
    ) {
        let manager = Arc::clone(self);
        let id = job_id.clone();
        let handle = tokio::spawn(async move {
            manager.run_job(id, options, semaphore).await;
        });
        self.tasks.lock().insert(job_id, handle);
    }

    async fn run_job(self: Arc<Self>, job_id: String, options: BatchOptions, semaphore: Arc<Semaphore>) {
        // Held for the whole pipeline: this is the parallelism bound.
        let Ok(_permit) = semaphore.acquire_owned().await else {
            return;
        };
        if self.cancel_requested(&job_id) {
            return;
        }
        self.execute_pipeline(&job_id, &options).await;
        self.tasks.lock().remove(&job_id);
    }

    /// Run one stage executor on a worker thread, forwarding its progress
    /// reports into the job table as they arrive.
    async fn run_blocking_stage<F>(self: &Arc<Self>, job_id: &str, stage: JobStage, run: F) -> bool
    where
        F: FnOnce(StageSink) -> bool + Send + 'static,
    {
        let (sink, mut rx) = StageSink::channel();
        let manager = Arc::clone(self);
        let id = job_id.to_string();
        let forwarder = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                manager.with_job(&id, |job| {
                    job.stage = stage;
                    job.apply(&update);
                });
            }
        });
        let result = tokio::task::spawn_blocking(move || run(sink))
            .await
            .unwrap_or(false);
        let _ = forwarder.await;
        result
    }

    async fn execute_pipeline(self: &Arc<Self>, job_id: &str, options: &BatchOptions) {
        let (device, image_name, ring, cancel) = {
            let jobs = self.jobs.read();
            let Some(entry) = jobs.get(job_id) else { return };
            (
                entry.info.device_path.clone(),
                entry.info.image_name.clone(),
                Arc::clone(&entry.ring),
                Arc::clone(&entry.cancel),
            )
        };

        self.set_started(job_id);

        let image = match self.catalog.find(&image_name) {
            Ok(Some(image)) => image,
            _ => {
                self.fail_job(job_id, format!("Image '{image_name}' not found"));
                return;
            }
        };
        let image_path = PathBuf::from(&image.path);
        let image_size = image.size_bytes;

        // Mounted partitions would race the raw write.
        let (ok, msg) = self.inventory.unmount_device(&device).await;
        if !ok {
            ring.push(format!("WARN: unmount: {msg}"));
        }

        // ── WRITE ────────────────────────────────────────────────────
        self.enter_stage(job_id, JobState::Writing, JobStage::Write);
        let ok = self
            .run_blocking_stage(job_id, JobStage::Write, {
                let stages = Arc::clone(&self.stages);
                let image = image_path.clone();
                let device = device.clone();
                let ring = Arc::clone(&ring);
                let kill = cancel.kill.clone();
                move |sink| stages.write(&image, &device, image_size, &sink, &ring, &kill)
            })
            .await;
        if self.cancelled_or_killed(job_id) {
            self.mark_cancelled(job_id);
            return;
        }
        if !ok {
            self.fail_job(job_id, "Write failed");
            return;
        }

        // ── VERIFY ───────────────────────────────────────────────────
        if options.verify {
            self.enter_stage(job_id, JobState::Verifying, JobStage::Verify);
            let ok = self
                .run_blocking_stage(job_id, JobStage::Verify, {
                    let stages = Arc::clone(&self.stages);
                    let image = image_path.clone();
                    let device = device.clone();
                    let ring = Arc::clone(&ring);
                    let kill = cancel.kill.clone();
                    move |sink| stages.verify(&image, &device, &sink, &ring, &kill)
                })
                .await;
            if self.cancelled_or_killed(job_id) {
                self.mark_cancelled(job_id);
                return;
            }
            if !ok {
                self.fail_job(job_id, "Verification failed");
                return;
            }
        }

        // ── EXPAND ───────────────────────────────────────────────────
        if options.expand_partition {
            if cancel.kill.is_raised() {
                self.mark_cancelled(job_id);
                return;
            }
            self.enter_stage(job_id, JobState::Expanding, JobStage::Expand);
            let ok = self
                .run_blocking_stage(job_id, JobStage::Expand, {
                    let stages = Arc::clone(&self.stages);
                    let device = device.clone();
                    let ring = Arc::clone(&ring);
                    let kill = cancel.kill.clone();
                    move |sink| stages.expand(&device, &sink, &ring, &kill)
                })
                .await;
            if !ok {
                ring.push("WARN: expand failed, continuing");
                self.with_job(job_id, |job| {
                    job.warning = Some("Expand partition failed (non-fatal)".to_string());
                });
            }
        }

        // ── RESIZE ───────────────────────────────────────────────────
        if options.resize_filesystem {
            if cancel.kill.is_raised() {
                self.mark_cancelled(job_id);
                return;
            }
            self.enter_stage(job_id, JobState::Resizing, JobStage::Resize);
            let ok = self
                .run_blocking_stage(job_id, JobStage::Resize, {
                    let stages = Arc::clone(&self.stages);
                    let device = device.clone();
                    let ring = Arc::clone(&ring);
                    let kill = cancel.kill.clone();
                    move |sink| stages.resize(&device, &sink, &ring, &kill)
                })
                .await;
            if !ok {
                ring.push("WARN: resize failed, continuing");
                self.with_job(job_id, |job| {
                    let prior = job.warning.take().unwrap_or_default();
                    job.warning = Some(format!("{prior}; Resize failed (non-fatal)"));
                });
            }
        }

        // ── DONE ─────────────────────────────────────────────────────
        self.with_job(job_id, |job| {
            job.state = JobState::Done;
            job.progress = 1.0;
            job.finished_at = Some(Utc::now());
        });

        // ── EJECT ────────────────────────────────────────────────────
        if options.eject_after_done {
            let (ok, msg) = self.inventory.eject_device(&device).await;
            if ok {
                ring.push("Ejected successfully");
            } else {
                ring.push(format!("WARN: eject: {msg}"));
            }
            self.publish_update(job_id);
        }
    }
}

#[cfg(test)]
#[path = "jobs_tests.rs"]
mod tests;
