//! Timed multi-frame face capture.
//!
//! A single still is trivially spoofed with a photo, so the kiosk collects a
//! short burst across a window in which the user blinks or moves, and the
//! verifier judges liveness from the sequence.

use crate::types::FrameBurst;
use std::time::Duration;
use tokio::time::Instant;
use wicket_hw::CameraSession;

/// Bounds for one capture burst.
#[derive(Debug, Clone)]
pub struct BurstConfig {
    pub max_frames: usize,
    /// Pause between grabs.
    pub interval: Duration,
    /// Hard cap on burst wall time.
    pub max_duration: Duration,
    pub jpeg_quality: u8,
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            max_frames: 6,
            interval: Duration::from_millis(350),
            max_duration: Duration::from_millis(2500),
            jpeg_quality: 95,
        }
    }
}

/// Grab, encode and collect frames until the burst is full, the window
/// closes, or `should_stop` returns true.
///
/// `should_stop` is consulted before every grab. Frames that are not ready
/// or fail to encode are skipped; the result may be empty.
pub async fn capture_burst<F>(
    session: &mut CameraSession,
    config: &BurstConfig,
    should_stop: F,
) -> FrameBurst
where
    F: Fn() -> bool,
{
    let mut burst = FrameBurst::default();
    let started = Instant::now();
    let mut grabs = 0usize;

    while burst.len() < config.max_frames && started.elapsed() < config.max_duration {
        if should_stop() {
            tracing::debug!(captured = burst.len(), "burst cancelled");
            break;
        }

        grabs += 1;
        if let Some(frame) = session.current_frame().await {
            match frame.encode_jpeg(config.jpeg_quality) {
                Ok(jpeg) => {
                    burst.push(jpeg);
                }
                Err(err) => {
                    tracing::debug!(seq = frame.sequence, error = %err, "frame encode failed");
                }
            }
        }

        if burst.len() >= config.max_frames {
            break;
        }
        tokio::time::sleep(config.interval).await;
    }

    tracing::debug!(
        captured = burst.len(),
        grabs,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "burst finished"
    );
    burst
}
