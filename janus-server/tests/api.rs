//! API-level tests over an in-memory app with fake inventory and stages.

use std::sync::Arc;
use std::time::Duration;

use axum_test::TestServer;
use serde_json::{Value, json};

use janus_core::test_support::{FakeInventory, StubStages, removable_drive};
use janus_core::{EventBus, ImageCatalog, JobManager, LayoutStore, StageRunner};
use janus_model::{DriveInfo, ImageInfo, JobInfo, JobState, LayoutConfig};
use janus_server::{AppState, create_app};

struct TestCtx {
    server: TestServer,
    state: AppState,
    _tmp: tempfile::TempDir,
}

fn test_app(
    stages: Arc<dyn StageRunner>,
    drives: Vec<DriveInfo>,
    bindings: &[(&str, &str)],
) -> TestCtx {
    let tmp = tempfile::tempdir().unwrap();
    let images_dir = tmp.path().join("images");
    std::fs::create_dir_all(&images_dir).unwrap();
    std::fs::write(images_dir.join("raspios.img"), vec![0u8; 4096]).unwrap();

    let layout = Arc::new(LayoutStore::new(tmp.path().join("data").join("layout.json")));
    let mut grid = layout.load();
    for (cell_id, port_id) in bindings {
        let cell = grid
            .cells
            .iter_mut()
            .find(|c| c.cell_id == *cell_id)
            .unwrap();
        cell.port_id = port_id.to_string();
    }
    layout.save(&grid).unwrap();

    let bus = Arc::new(EventBus::new());
    let inventory = Arc::new(FakeInventory::new(drives));
    let catalog = Arc::new(ImageCatalog::new(images_dir));
    let jobs = JobManager::new(
        inventory.clone(),
        Arc::clone(&catalog),
        Arc::clone(&layout),
        stages,
        Arc::clone(&bus),
    );

    let state = AppState {
        bus,
        inventory,
        catalog,
        layout,
        jobs,
    };
    let server = TestServer::new(create_app(state.clone(), None)).unwrap();
    TestCtx {
        server,
        state,
        _tmp: tmp,
    }
}

fn default_ctx() -> TestCtx {
    test_app(
        Arc::new(StubStages::succeeding()),
        vec![removable_drive("/dev/sdx", "bp-x")],
        &[("A1", "bp-x")],
    )
}

async fn wait_for_job_state(ctx: &TestCtx, job_id: &str, state: JobState) {
    for _ in 0..500 {
        let response = ctx.server.get(&format!("/api/jobs/{job_id}")).await;
        if response.status_code() == 200 && response.json::<JobInfo>().state == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never reached {state:?}");
}

#[tokio::test]
async fn layout_defaults_and_round_trips() {
    let ctx = default_ctx();

    let response = ctx.server.get("/api/layout").await;
    response.assert_status_ok();
    let layout: LayoutConfig = response.json();
    assert_eq!((layout.rows, layout.cols), (2, 4));
    assert_eq!(layout.cells.len(), 8);

    let mut modified = layout.clone();
    modified.cells[2].label = "spare".to_string();
    modified.cells[2].enabled = false;
    let response = ctx.server.put("/api/layout").json(&modified).await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>(), json!({ "ok": true }));

    let reloaded: LayoutConfig = ctx.server.get("/api/layout").await.json();
    assert_eq!(reloaded, modified);
}

#[tokio::test]
async fn layout_export_is_a_download() {
    let ctx = default_ctx();
    let response = ctx.server.get("/api/layout/export").await;
    response.assert_status_ok();
    assert_eq!(
        response.header("content-disposition"),
        "attachment; filename=layout.json"
    );
    let exported: LayoutConfig = serde_json::from_str(&response.text()).unwrap();
    assert_eq!(exported.cells.len(), 8);
}

#[tokio::test]
async fn drives_listing_honours_removable_filter() {
    let mut fixed = removable_drive("/dev/sda", "bp-a");
    fixed.removable = false;
    let ctx = test_app(
        Arc::new(StubStages::succeeding()),
        vec![fixed, removable_drive("/dev/sdx", "bp-x")],
        &[("A1", "bp-x")],
    );

    let all: Vec<DriveInfo> = ctx.server.get("/api/drives").await.json();
    assert_eq!(all.len(), 2);

    let removable: Vec<DriveInfo> = ctx.server.get("/api/drives?removable=1").await.json();
    assert_eq!(removable.len(), 1);
    assert_eq!(removable[0].device_path, "/dev/sdx");
}

#[tokio::test]
async fn images_are_listed_from_the_catalog() {
    let ctx = default_ctx();
    let images: Vec<ImageInfo> = ctx.server.get("/api/images").await.json();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].name, "raspios.img");
    assert_eq!(images[0].img_type, "img");
    assert_eq!(images[0].size_bytes, 4096);
}

#[tokio::test]
async fn batch_start_records_safety_rejections() {
    let mut system = removable_drive("/dev/sda", "bp-sys");
    system.is_system = true;
    let ctx = test_app(
        Arc::new(StubStages::succeeding()),
        vec![system],
        &[("A1", "bp-sys")],
    );

    let response = ctx
        .server
        .post("/api/batch/start")
        .json(&json!({
            "image_name": "raspios.img",
            "cell_ids": ["A1"],
            "concurrency": 1
        }))
        .await;
    response.assert_status_ok();
    let jobs: Vec<JobInfo> = response.json();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, JobState::Failed);
    let error = jobs[0].error.as_deref().unwrap();
    assert!(error.contains("system") || error.contains("root"), "{error}");
}

#[tokio::test]
async fn batch_runs_to_done_via_the_api() {
    let ctx = default_ctx();

    let response = ctx
        .server
        .post("/api/batch/start")
        .json(&json!({
            "image_name": "raspios.img",
            "cell_ids": ["A1"],
            "options": { "verify": true },
            "concurrency": 1
        }))
        .await;
    response.assert_status_ok();
    let jobs: Vec<JobInfo> = response.json();
    assert_eq!(jobs.len(), 1);
    let job_id = jobs[0].job_id.clone();

    wait_for_job_state(&ctx, &job_id, JobState::Done).await;
    let job: JobInfo = ctx.server.get(&format!("/api/jobs/{job_id}")).await.json();
    assert_eq!(job.progress, 1.0);
    assert!(job.error.is_none());

    // Terminal job: cancel refuses, retry refuses.
    let response = ctx.server.post(&format!("/api/jobs/{job_id}/cancel")).await;
    response.assert_status_not_found();
    let response = ctx.server.post(&format!("/api/jobs/{job_id}/retry")).await;
    response.assert_status_not_found();

    // Nothing failed, so a batch retry is a no-op.
    let retried: Vec<JobInfo> = ctx.server.post("/api/batch/retry").await.json();
    assert!(retried.is_empty());
}

#[tokio::test]
async fn unknown_job_endpoints_return_404() {
    let ctx = default_ctx();
    ctx.server.get("/api/jobs/missing").await.assert_status_not_found();
    ctx.server
        .post("/api/jobs/missing/cancel")
        .await
        .assert_status_not_found();
    ctx.server
        .post("/api/jobs/missing/retry")
        .await
        .assert_status_not_found();
}

#[tokio::test]
async fn eject_cell_maps_failures_to_400() {
    let ctx = default_ctx();

    let response = ctx.server.post("/api/cells/A1/eject").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["ok"], json!(true));

    let response = ctx.server.post("/api/cells/ZZ/eject").await;
    response.assert_status_bad_request();
}

#[tokio::test]
async fn jobs_listing_reflects_the_table() {
    let ctx = default_ctx();
    let jobs: Vec<JobInfo> = ctx.server.get("/api/jobs").await.json();
    assert!(jobs.is_empty());

    ctx.server
        .post("/api/batch/start")
        .json(&json!({ "image_name": "raspios.img", "cell_ids": ["A1"] }))
        .await
        .assert_status_ok();

    let jobs: Vec<JobInfo> = ctx.server.get("/api/jobs").await.json();
    assert_eq!(jobs.len(), 1);
    assert_eq!(ctx.state.jobs.list_jobs().len(), 1);
}
