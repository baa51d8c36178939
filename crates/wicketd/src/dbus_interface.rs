use tokio::sync::broadcast::{self, error::RecvError};
use wicket_core::{FlowError, FlowEvent, FlowHandle};
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.wicket.Kiosk1";
pub const OBJECT_PATH: &str = "/org/wicket/Kiosk1";

/// D-Bus interface for the kiosk daemon.
///
/// Bus name: org.wicket.Kiosk1
/// Object path: /org/wicket/Kiosk1
pub struct KioskService {
    flow: FlowHandle,
}

impl KioskService {
    pub fn new(flow: FlowHandle) -> Self {
        Self { flow }
    }
}

fn to_fdo(err: FlowError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(err.to_string())
}

#[interface(name = "org.wicket.Kiosk1")]
impl KioskService {
    /// Open the QR camera and start polling for a badge.
    async fn start_scan(&self) -> zbus::fdo::Result<()> {
        tracing::info!("start scan requested");
        self.flow.start_scan().await.map_err(to_fdo)
    }

    async fn stop_scan(&self) -> zbus::fdo::Result<()> {
        tracing::info!("stop scan requested");
        self.flow.stop_scan().await.map_err(to_fdo)
    }

    /// Keystroke-level edit of the badge field; settles after the debounce.
    async fn manual_input(&self, value: &str) -> zbus::fdo::Result<()> {
        self.flow.manual_input(value).await.map_err(to_fdo)
    }

    /// Submit a typed badge code immediately.
    async fn submit_code(&self, value: &str) -> zbus::fdo::Result<()> {
        tracing::info!(code = value, "manual submit requested");
        self.flow.submit_code(value).await.map_err(to_fdo)
    }

    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let snapshot = self.flow.snapshot().await.map_err(to_fdo)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "flow": snapshot,
        })
        .to_string())
    }

    #[zbus(signal)]
    pub async fn status_changed(
        emitter: &SignalEmitter<'_>,
        message: &str,
        severity: &str,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn verification_finished(
        emitter: &SignalEmitter<'_>,
        outcome: &str,
        message: &str,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn reset_complete(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;
}

/// Relay flow events as D-Bus signals until the event channel closes.
pub async fn forward_events(
    connection: zbus::Connection,
    mut events: broadcast::Receiver<FlowEvent>,
) -> zbus::Result<()> {
    let emitter = SignalEmitter::new(&connection, OBJECT_PATH)?;
    loop {
        let sent = match events.recv().await {
            Ok(FlowEvent::Status(update)) => {
                KioskService::status_changed(
                    &emitter,
                    &update.message,
                    &update.severity.to_string(),
                )
                .await
            }
            Ok(FlowEvent::Finished(result)) => {
                KioskService::verification_finished(&emitter, result.outcome(), &result.detail())
                    .await
            }
            Ok(FlowEvent::ResetComplete) => KioskService::reset_complete(&emitter).await,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "signal relay lagged behind flow events");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if let Err(err) = sent {
            tracing::warn!(error = %err, "failed to emit D-Bus signal");
        }
    }
    Ok(())
}
