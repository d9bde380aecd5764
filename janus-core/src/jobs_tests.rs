use std::sync::Arc;
use std::time::Duration;

use janus_model::{BatchOptions, BatchStartRequest, JobInfo, JobState};

use crate::bus::EventBus;
use crate::flash::StageRunner;
use crate::images::ImageCatalog;
use crate::jobs::{JobManager, safety_check};
use crate::layout::LayoutStore;
use crate::test_support::{FakeInventory, StageGate, StubStages, removable_drive};

struct Rig {
    _tmp: tempfile::TempDir,
    manager: Arc<JobManager>,
    bus: Arc<EventBus>,
    inventory: Arc<FakeInventory>,
}

/// Manager over a fake inventory, a one-image catalog and the default grid
/// with the given `(cell_id, port_id)` bindings applied.
fn rig(
    stages: Arc<dyn StageRunner>,
    drives: Vec<janus_model::DriveInfo>,
    bindings: &[(&str, &str)],
) -> Rig {
    let tmp = tempfile::tempdir().unwrap();
    let images_dir = tmp.path().join("images");
    std::fs::create_dir_all(&images_dir).unwrap();
    std::fs::write(images_dir.join("test.img"), vec![0u8; 4096]).unwrap();
    let catalog = Arc::new(ImageCatalog::new(images_dir));

    let store = Arc::new(LayoutStore::new(tmp.path().join("data").join("layout.json")));
    let mut layout = store.load();
    for (cell_id, port_id) in bindings {
        let cell = layout
            .cells
            .iter_mut()
            .find(|c| c.cell_id == *cell_id)
            .unwrap();
        cell.port_id = port_id.to_string();
    }
    store.save(&layout).unwrap();

    let bus = Arc::new(EventBus::new());
    let inventory = Arc::new(FakeInventory::new(drives));
    let manager = JobManager::new(
        inventory.clone(),
        catalog,
        store,
        stages,
        Arc::clone(&bus),
    );
    Rig {
        _tmp: tmp,
        manager,
        bus,
        inventory,
    }
}

fn batch(cells: &[&str], options: BatchOptions, concurrency: u32) -> BatchStartRequest {
    BatchStartRequest {
        image_name: "test.img".to_string(),
        cell_ids: cells.iter().map(|c| c.to_string()).collect(),
        options,
        concurrency,
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_for_state(manager: &JobManager, job_id: &str, state: JobState) {
    let id = job_id.to_string();
    wait_until(
        || manager.get_job(&id).map(|j| j.state) == Some(state),
        &format!("job to reach {state:?}"),
    )
    .await;
}

// ── Safety check ─────────────────────────────────────────────────────

#[test]
fn safety_check_covers_all_rejections() {
    let good = removable_drive("/dev/sdx", "bp-x");
    assert_eq!(safety_check(Some(&good), "/dev/sdx"), None);

    assert_eq!(
        safety_check(Some(&good), "").as_deref(),
        Some("No device bound to this cell")
    );
    assert_eq!(
        safety_check(None, "/dev/sdx").as_deref(),
        Some("Device /dev/sdx not found / not connected")
    );

    let mut system = removable_drive("/dev/sda", "bp-a");
    system.is_system = true;
    assert!(
        safety_check(Some(&system), "/dev/sda")
            .unwrap()
            .contains("system/root")
    );

    let mut fixed = removable_drive("/dev/sdb", "bp-b");
    fixed.removable = false;
    assert!(
        safety_check(Some(&fixed), "/dev/sdb")
            .unwrap()
            .contains("not removable")
    );
}

// ── Pipelines ────────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_runs_to_done() {
    let rig = rig(
        Arc::new(StubStages::succeeding()),
        vec![removable_drive("/dev/sdx", "bp-x")],
        &[("A1", "bp-x")],
    );

    let jobs = rig
        .manager
        .start_batch(batch(&["A1"], BatchOptions::default(), 1))
        .await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, JobState::Queued);
    assert_eq!(jobs[0].device_path, "/dev/sdx");

    wait_for_state(&rig.manager, &jobs[0].job_id, JobState::Done).await;
    let done = rig.manager.get_job(&jobs[0].job_id).unwrap();
    assert_eq!(done.progress, 1.0);
    assert!(done.error.is_none());
    assert!(done.warning.is_none());
    assert!(done.started_at.is_some());
    assert!(done.finished_at.is_some());
    assert!(done.log_tail.iter().any(|l| l == "stub: writing"));
    // Default options: no verify, no eject.
    assert!(rig.inventory.ejected.lock().is_empty());
    assert_eq!(rig.inventory.unmounted.lock().as_slice(), ["/dev/sdx"]);
}

#[tokio::test]
async fn published_updates_follow_the_pipeline_order() {
    let rig = rig(
        Arc::new(StubStages::succeeding()),
        vec![removable_drive("/dev/sdx", "bp-x")],
        &[("A1", "bp-x")],
    );
    let (_id, mut rx) = rig.bus.subscribe();

    let jobs = rig
        .manager
        .start_batch(batch(&["A1"], BatchOptions::default(), 1))
        .await;
    wait_for_state(&rig.manager, &jobs[0].job_id, JobState::Done).await;

    let mut states = Vec::new();
    while let Ok(event) = rx.try_recv() {
        assert_eq!(event.event_type, "job_update");
        let job: JobInfo = serde_json::from_str(&event.payload).unwrap();
        states.push(job.state);
    }
    assert_eq!(states.first(), Some(&JobState::Writing));
    assert_eq!(states.last(), Some(&JobState::Done));
    // Terminal state is a sink: nothing after DONE.
    assert_eq!(states.iter().filter(|s| **s == JobState::Done).count(), 1);
}

#[tokio::test]
async fn safety_rejection_records_failed_job_with_one_event() {
    let mut system = removable_drive("/dev/sda", "bp-sys");
    system.is_system = true;
    let rig = rig(
        Arc::new(StubStages::succeeding()),
        vec![system],
        &[("A1", "bp-sys")],
    );
    let (_id, mut rx) = rig.bus.subscribe();

    let jobs = rig
        .manager
        .start_batch(batch(&["A1"], BatchOptions::default(), 1))
        .await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, JobState::Failed);
    assert!(jobs[0].error.as_ref().unwrap().contains("system/root"));
    assert!(jobs[0].finished_at.is_some());
    assert!(jobs[0].started_at.is_none());

    // Exactly one update for the rejected job.
    let first = rx.try_recv().unwrap();
    let job: JobInfo = serde_json::from_str(&first.payload).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn unresolved_port_is_recorded_not_skipped() {
    let rig = rig(
        Arc::new(StubStages::succeeding()),
        vec![],
        &[("A1", "bp-gone")],
    );
    let jobs = rig
        .manager
        .start_batch(batch(&["A1"], BatchOptions::default(), 1))
        .await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, JobState::Failed);
    assert_eq!(
        jobs[0].error.as_deref(),
        Some("Device bp-gone not found / not connected")
    );
}

#[tokio::test]
async fn unknown_and_disabled_cells_are_skipped() {
    let rig = rig(
        Arc::new(StubStages::succeeding()),
        vec![removable_drive("/dev/sdx", "bp-x")],
        &[("A1", "bp-x")],
    );
    // Disable A2 after binding nothing to it.
    let layout_store = LayoutStore::new(rig._tmp.path().join("data").join("layout.json"));
    let mut layout = layout_store.load();
    layout.cells.iter_mut().find(|c| c.cell_id == "A2").unwrap().enabled = false;
    layout_store.save(&layout).unwrap();

    let jobs = rig
        .manager
        .start_batch(batch(&["A1", "A2", "ZZ"], BatchOptions::default(), 1))
        .await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].cell_id, "A1");
}

#[tokio::test]
async fn missing_image_fails_the_job() {
    let rig = rig(
        Arc::new(StubStages::succeeding()),
        vec![removable_drive("/dev/sdx", "bp-x")],
        &[("A1", "bp-x")],
    );
    let mut req = batch(&["A1"], BatchOptions::default(), 1);
    req.image_name = "nope.img".to_string();

    let jobs = rig.manager.start_batch(req).await;
    wait_for_state(&rig.manager, &jobs[0].job_id, JobState::Failed).await;
    let job = rig.manager.get_job(&jobs[0].job_id).unwrap();
    assert_eq!(job.error.as_deref(), Some("Image 'nope.img' not found"));
}

#[tokio::test]
async fn verify_mismatch_fails_terminally() {
    let rig = rig(
        Arc::new(StubStages::with_results(true, false, true, true)),
        vec![removable_drive("/dev/sdx", "bp-x")],
        &[("A1", "bp-x")],
    );
    let options = BatchOptions {
        verify: true,
        ..Default::default()
    };
    let jobs = rig.manager.start_batch(batch(&["A1"], options, 1)).await;
    wait_for_state(&rig.manager, &jobs[0].job_id, JobState::Failed).await;
    let job = rig.manager.get_job(&jobs[0].job_id).unwrap();
    assert_eq!(job.error.as_deref(), Some("Verification failed"));
    assert!(job.finished_at.is_some());
}

#[tokio::test]
async fn expand_failure_is_nonfatal() {
    let rig = rig(
        Arc::new(StubStages::with_results(true, true, false, true)),
        vec![removable_drive("/dev/sdx", "bp-x")],
        &[("A1", "bp-x")],
    );
    let options = BatchOptions {
        expand_partition: true,
        ..Default::default()
    };
    let jobs = rig.manager.start_batch(batch(&["A1"], options, 1)).await;
    wait_for_state(&rig.manager, &jobs[0].job_id, JobState::Done).await;
    let job = rig.manager.get_job(&jobs[0].job_id).unwrap();
    assert!(job.warning.as_ref().unwrap().contains("Expand"));
    assert!(job.error.is_none());
    assert_eq!(job.progress, 1.0);
}

#[tokio::test]
async fn resize_failure_appends_to_warning() {
    let rig = rig(
        Arc::new(StubStages::with_results(true, true, false, false)),
        vec![removable_drive("/dev/sdx", "bp-x")],
        &[("A1", "bp-x")],
    );
    let options = BatchOptions {
        expand_partition: true,
        resize_filesystem: true,
        ..Default::default()
    };
    let jobs = rig.manager.start_batch(batch(&["A1"], options, 1)).await;
    wait_for_state(&rig.manager, &jobs[0].job_id, JobState::Done).await;
    let warning = rig.manager.get_job(&jobs[0].job_id).unwrap().warning.unwrap();
    assert!(warning.contains("Expand"));
    assert!(warning.contains("Resize"));
}

#[tokio::test]
async fn eject_after_done_is_logged_only() {
    let rig = rig(
        Arc::new(StubStages::succeeding()),
        vec![removable_drive("/dev/sdx", "bp-x")],
        &[("A1", "bp-x")],
    );
    let options = BatchOptions {
        eject_after_done: true,
        ..Default::default()
    };
    let jobs = rig.manager.start_batch(batch(&["A1"], options, 1)).await;
    wait_for_state(&rig.manager, &jobs[0].job_id, JobState::Done).await;
    let manager = Arc::clone(&rig.manager);
    let job_id = jobs[0].job_id.clone();
    wait_until(
        || {
            manager
                .get_job(&job_id)
                .is_some_and(|j| j.log_tail.iter().any(|l| l == "Ejected successfully"))
        },
        "eject log line",
    )
    .await;
    assert_eq!(rig.inventory.ejected.lock().as_slice(), ["/dev/sdx"]);
}

#[tokio::test]
async fn concurrency_gate_bounds_active_writes() {
    let stages = Arc::new(StubStages::gated(StageGate::new()));
    let gate = stages.gate_handle().unwrap();
    let drives: Vec<_> = (0..5)
        .map(|i| removable_drive(&format!("/dev/sd{i}"), &format!("bp-{i}")))
        .collect();
    let bindings: Vec<(String, String)> = ["A1", "A2", "A3", "A4", "B1"]
        .iter()
        .enumerate()
        .map(|(i, cell)| (cell.to_string(), format!("bp-{i}")))
        .collect();
    let binding_refs: Vec<(&str, &str)> = bindings
        .iter()
        .map(|(c, p)| (c.as_str(), p.as_str()))
        .collect();
    let rig = rig(stages.clone(), drives, &binding_refs);

    let jobs = rig
        .manager
        .start_batch(batch(
            &["A1", "A2", "A3", "A4", "B1"],
            BatchOptions::default(),
            2,
        ))
        .await;
    assert_eq!(jobs.len(), 5);

    // Two pipelines admitted, three held at the gate.
    let manager = Arc::clone(&rig.manager);
    wait_until(
        || {
            manager
                .list_jobs()
                .iter()
                .filter(|j| j.state == JobState::Writing)
                .count()
                == 2
        },
        "two jobs in WRITING",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let snapshot = rig.manager.list_jobs();
    assert_eq!(
        snapshot.iter().filter(|j| j.state == JobState::Writing).count(),
        2
    );
    assert_eq!(
        snapshot.iter().filter(|j| j.state == JobState::Queued).count(),
        3
    );

    gate.release();
    for job in &jobs {
        wait_for_state(&rig.manager, &job.job_id, JobState::Done).await;
    }
    assert!(stages.max_active_writes() <= 2);
}

#[tokio::test]
async fn cancel_during_write_reaches_cancelled_quickly() {
    let stages = Arc::new(StubStages::gated(StageGate::new()));
    let rig = rig(
        stages,
        vec![removable_drive("/dev/sdx", "bp-x")],
        &[("A1", "bp-x")],
    );
    let jobs = rig
        .manager
        .start_batch(batch(&["A1"], BatchOptions::default(), 1))
        .await;
    wait_for_state(&rig.manager, &jobs[0].job_id, JobState::Writing).await;

    assert!(rig.manager.cancel_job(&jobs[0].job_id));
    let job = rig.manager.get_job(&jobs[0].job_id).unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    assert!(job.finished_at.is_some());

    // Cancelling a terminal job is a no-op.
    assert!(!rig.manager.cancel_job(&jobs[0].job_id));
}

#[tokio::test]
async fn cancel_queued_job_never_runs() {
    let stages = Arc::new(StubStages::gated(StageGate::new()));
    let gate = stages.gate_handle().unwrap();
    let rig = rig(
        stages,
        vec![
            removable_drive("/dev/sdx", "bp-x"),
            removable_drive("/dev/sdy", "bp-y"),
        ],
        &[("A1", "bp-x"), ("A2", "bp-y")],
    );
    let jobs = rig
        .manager
        .start_batch(batch(&["A1", "A2"], BatchOptions::default(), 1))
        .await;
    wait_for_state(&rig.manager, &jobs[0].job_id, JobState::Writing).await;
    assert_eq!(
        rig.manager.get_job(&jobs[1].job_id).unwrap().state,
        JobState::Queued
    );

    assert!(rig.manager.cancel_job(&jobs[1].job_id));
    assert!(!rig.manager.cancel_job(&jobs[1].job_id));

    gate.release();
    wait_for_state(&rig.manager, &jobs[0].job_id, JobState::Done).await;
    // The cancelled job stays cancelled; it never entered WRITING.
    assert_eq!(
        rig.manager.get_job(&jobs[1].job_id).unwrap().state,
        JobState::Cancelled
    );
}

#[tokio::test]
async fn cancel_all_hits_every_nonterminal_job() {
    let stages = Arc::new(StubStages::gated(StageGate::new()));
    let rig = rig(
        stages,
        vec![
            removable_drive("/dev/sdx", "bp-x"),
            removable_drive("/dev/sdy", "bp-y"),
        ],
        &[("A1", "bp-x"), ("A2", "bp-y")],
    );
    let jobs = rig
        .manager
        .start_batch(batch(&["A1", "A2"], BatchOptions::default(), 1))
        .await;
    wait_for_state(&rig.manager, &jobs[0].job_id, JobState::Writing).await;

    rig.manager.cancel_all();
    for job in &jobs {
        assert_eq!(
            rig.manager.get_job(&job.job_id).unwrap().state,
            JobState::Cancelled
        );
    }
}

// ── Retry ────────────────────────────────────────────────────────────

#[tokio::test]
async fn retry_replaces_the_failed_record() {
    let rig = rig(
        Arc::new(StubStages::with_results(false, true, true, true)),
        vec![removable_drive("/dev/sdx", "bp-x")],
        &[("A1", "bp-x")],
    );
    let jobs = rig
        .manager
        .start_batch(batch(&["A1"], BatchOptions::default(), 1))
        .await;
    wait_for_state(&rig.manager, &jobs[0].job_id, JobState::Failed).await;
    assert_eq!(
        rig.manager.get_job(&jobs[0].job_id).unwrap().error.as_deref(),
        Some("Write failed")
    );

    let retried = rig.manager.retry_job(&jobs[0].job_id).await.unwrap();
    assert_ne!(retried.job_id, jobs[0].job_id);
    assert_eq!(retried.cell_id, "A1");
    // Retry replaces history: the old record is gone.
    assert!(rig.manager.get_job(&jobs[0].job_id).is_none());

    // Same stages, so the retry fails again; it must still be a fresh job.
    wait_for_state(&rig.manager, &retried.job_id, JobState::Failed).await;
}

#[tokio::test]
async fn retry_requires_a_terminal_failure() {
    let rig = rig(
        Arc::new(StubStages::succeeding()),
        vec![removable_drive("/dev/sdx", "bp-x")],
        &[("A1", "bp-x")],
    );
    let jobs = rig
        .manager
        .start_batch(batch(&["A1"], BatchOptions::default(), 1))
        .await;
    wait_for_state(&rig.manager, &jobs[0].job_id, JobState::Done).await;

    assert!(rig.manager.retry_job(&jobs[0].job_id).await.is_none());
    assert!(rig.manager.retry_job("no-such-job").await.is_none());
}

#[tokio::test]
async fn retry_reruns_the_safety_check() {
    let rig = rig(
        Arc::new(StubStages::with_results(false, true, true, true)),
        vec![removable_drive("/dev/sdx", "bp-x")],
        &[("A1", "bp-x")],
    );
    let jobs = rig
        .manager
        .start_batch(batch(&["A1"], BatchOptions::default(), 1))
        .await;
    wait_for_state(&rig.manager, &jobs[0].job_id, JobState::Failed).await;

    // The drive vanished between failure and retry.
    rig.inventory.set_drives(vec![]);
    let retried = rig.manager.retry_job(&jobs[0].job_id).await.unwrap();
    assert_eq!(retried.state, JobState::Failed);
    assert!(retried.error.as_ref().unwrap().contains("not found"));
}

#[tokio::test]
async fn retry_all_failed_is_a_noop_without_failures() {
    let rig = rig(
        Arc::new(StubStages::succeeding()),
        vec![removable_drive("/dev/sdx", "bp-x")],
        &[("A1", "bp-x")],
    );
    assert!(rig.manager.retry_all_failed().await.is_empty());
}

// ── Eject ────────────────────────────────────────────────────────────

#[tokio::test]
async fn eject_cell_resolves_through_the_layout() {
    let rig = rig(
        Arc::new(StubStages::succeeding()),
        vec![removable_drive("/dev/sdx", "bp-x")],
        &[("A1", "bp-x")],
    );

    let (ok, msg) = rig.manager.eject_cell("A1").await;
    assert!(ok, "{msg}");
    assert_eq!(rig.inventory.ejected.lock().as_slice(), ["/dev/sdx"]);

    let (ok, msg) = rig.manager.eject_cell("A2").await;
    assert!(!ok);
    assert_eq!(msg, "Cell not found or no device bound");

    let (ok, msg) = rig.manager.eject_cell("nope").await;
    assert!(!ok);
    assert_eq!(msg, "Cell not found or no device bound");

    rig.inventory.set_drives(vec![]);
    let (ok, msg) = rig.manager.eject_cell("A1").await;
    assert!(!ok);
    assert_eq!(msg, "Device not connected");
}
