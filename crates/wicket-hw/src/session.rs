//! Camera session: one opened stream with facing-mode negotiation.

use crate::camera::{CameraError, Constraints, FacingMode, StreamSource, VideoStream};
use crate::frame::Frame;

/// An open camera stream owned by a single consumer.
///
/// `close` is idempotent and also runs on drop, so a session can never leak
/// its device.
pub struct CameraSession {
    stream: Option<Box<dyn VideoStream>>,
    facing: Option<FacingMode>,
    label: String,
}

impl CameraSession {
    /// Open a stream, trying the preferred facing mode first and then the
    /// same constraints without any facing requirement.
    pub async fn open(
        source: &dyn StreamSource,
        preferred: Constraints,
    ) -> Result<Self, CameraError> {
        let mut attempts = vec![preferred];
        if preferred.facing.is_some() {
            attempts.push(preferred.without_facing());
        }

        let mut last = None;
        for (i, constraints) in attempts.iter().enumerate() {
            match source.request_stream(constraints).await {
                Ok(stream) => {
                    let label = stream.label().to_string();
                    tracing::info!(
                        device = %label,
                        facing = ?constraints.facing,
                        attempt = i + 1,
                        "camera session opened"
                    );
                    return Ok(Self {
                        stream: Some(stream),
                        facing: constraints.facing,
                        label,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        facing = ?constraints.facing,
                        error = %err,
                        "camera acquisition failed"
                    );
                    last = Some(err);
                }
            }
        }

        Err(CameraError::Unavailable {
            attempts: attempts.len(),
            last: last.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    /// Grab the current frame if the stream is delivering decodable data.
    ///
    /// Capture errors are not fatal at frame rate; they are logged and
    /// reported as "no frame yet".
    pub async fn current_frame(&mut self) -> Option<Frame> {
        let stream = self.stream.as_mut()?;
        match stream.next_frame().await {
            Ok(Some(frame)) if frame.is_decodable() => Some(frame),
            Ok(Some(frame)) => {
                tracing::trace!(?frame, "frame not ready");
                None
            }
            Ok(None) => None,
            Err(err) => {
                tracing::debug!(device = %self.label, error = %err, "frame capture failed");
                None
            }
        }
    }

    /// Stop the stream. Safe to call on a closed session.
    pub fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
            tracing::info!(device = %self.label, "camera session closed");
        }
    }

    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    /// Facing mode that was actually granted (`None` after fallback).
    pub fn facing(&self) -> Option<FacingMode> {
        self.facing
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        self.close();
    }
}
