use anyhow::{Context, Result};
use facegate_core::ScrfdDetector;
use facegate_hw::CaptureLoop;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

mod access;
mod config;
mod dbus_interface;
mod engine;
mod session;
mod store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "facegated starting");

    let config = config::Config::load().context("invalid configuration")?;

    // Load the model and open the camera up front (fail-fast).
    let model_path = config.scrfd_model_path();
    let detector = ScrfdDetector::load(&model_path)
        .with_context(|| format!("failed to load detector {}", model_path.display()))?;
    tracing::info!(path = %model_path.display(), "SCRFD detector loaded");

    let pipeline = session::Pipeline::new(Arc::new(detector), &config)?;

    let store = Arc::new(Mutex::new(store::UserStore::open(&config.db_path)?));

    let mut capture = CaptureLoop::spawn(&config.camera_device, config.warmup_frames)
        .with_context(|| format!("failed to open camera {}", config.camera_device))?;

    let (status_tx, status_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    let engine = engine::spawn_engine(
        pipeline,
        Box::new(capture.frames()),
        Arc::clone(&store),
        Box::new(status_tx),
        engine::EngineSettings::from_config(&config),
    )?;

    let service = dbus_interface::FacegateService::new(
        engine,
        store,
        config.camera_device.clone(),
        model_path.display().to_string(),
    );

    let use_session_bus = std::env::var("FACEGATE_SESSION_BUS").map(|v| v == "1").unwrap_or(false);
    let builder = if use_session_bus {
        tracing::info!("using session bus");
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let connection = builder
        .name(dbus_interface::BUS_NAME)?
        .serve_at(dbus_interface::OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    let forwarder = tokio::spawn(dbus_interface::forward_status(connection.clone(), status_rx));

    tracing::info!(
        bus_name = dbus_interface::BUS_NAME,
        path = dbus_interface::OBJECT_PATH,
        "facegated ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("facegated shutting down");

    forwarder.abort();
    capture.close();
    drop(connection);

    Ok(())
}
