use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use wicket_core::{spawn_flow, FlowDeps, HttpVerifier, RqrrDecoder};
use wicket_hw::V4l2Source;

mod config;
mod dbus_interface;

use dbus_interface::{KioskService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("wicketd starting");

    let config = config::Config::from_env();
    tracing::info!(
        qr_camera = %config.qr_camera_device,
        face_camera = %config.face_camera_device,
        verify_url = %config.verify_url,
        "configuration loaded"
    );

    let verifier = HttpVerifier::new(config.verify_url.clone(), config.verify_timeout())?;
    let deps = FlowDeps {
        source: Arc::new(V4l2Source::new(config.v4l2_devices())),
        decoder: Arc::new(RqrrDecoder),
        verifier: Arc::new(verifier),
    };
    let (flow, flow_task) = spawn_flow(config.flow_config(), deps);

    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, KioskService::new(flow.clone()))?
        .build()
        .await?;
    tracing::info!(
        name = BUS_NAME,
        path = OBJECT_PATH,
        system_bus = config.system_bus,
        "D-Bus interface registered"
    );

    let relay = tokio::spawn(dbus_interface::forward_events(
        connection.clone(),
        flow.subscribe(),
    ));

    flow.start_scan().await?;
    tracing::info!("wicketd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("wicketd shutting down");

    flow.shutdown();
    flow_task.await?;
    relay.abort();

    Ok(())
}
