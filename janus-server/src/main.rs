use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use janus_core::{
    DeviceInventory, EventBus, ImageCatalog, JobManager, LayoutStore, SystemInventory,
    SystemStages,
};
use janus_server::{AppState, config::Config, create_app};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "janus_server=info,janus_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Raw block-device access normally needs root; degrade loudly, not fatally.
    if nix::unistd::Uid::effective().is_root() {
        info!("running as root: full USB access enabled");
    } else {
        warn!("not running as root; USB access may be limited and flashing may fail");
    }

    config.ensure_directories()?;
    info!(
        images_dir = %config.images_dir.display(),
        data_dir = %config.data_dir.display(),
        "directories ready"
    );

    let bus = Arc::new(EventBus::new());
    let inventory: Arc<dyn DeviceInventory> = Arc::new(SystemInventory::new());
    let catalog = Arc::new(ImageCatalog::new(config.images_dir.clone()));
    let layout = Arc::new(LayoutStore::new(config.layout_path()));
    // Warm up: synthesizes and persists the default grid on first run.
    let initial = layout.load();
    info!(cells = initial.cells.len(), "layout loaded");

    let jobs = JobManager::new(
        Arc::clone(&inventory),
        Arc::clone(&catalog),
        Arc::clone(&layout),
        Arc::new(SystemStages),
        Arc::clone(&bus),
    );

    let state = AppState {
        bus,
        inventory,
        catalog,
        layout,
        jobs,
    };
    let app = create_app(state, Some(&config.web_dir));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Janus listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}
