use chrono::{DateTime, Utc};
use serde::Serialize;

/// Codes at or above this length are rejected before entering the flow.
pub const MAX_CODE_LEN: usize = 1000;

/// Most frames the verifier accepts in one multi-frame request.
pub const MAX_SUBMITTED_FRAMES: usize = 6;

/// A badge code as read from the camera or typed in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedCode {
    pub value: String,
    pub observed_at: DateTime<Utc>,
}

impl DecodedCode {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            observed_at: Utc::now(),
        }
    }

    /// Technical sanity check only. Whether the badge exists is the
    /// verifier's call.
    pub fn is_plausible(&self) -> bool {
        !self.value.trim().is_empty() && self.value.len() < MAX_CODE_LEN
    }
}

/// Ordered JPEG stills from one liveness burst.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameBurst {
    frames: Vec<Vec<u8>>,
}

impl FrameBurst {
    /// Append an encoded frame. Empty buffers are dropped.
    pub fn push(&mut self, jpeg: Vec<u8>) -> bool {
        if jpeg.is_empty() {
            return false;
        }
        self.frames.push(jpeg);
        true
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[Vec<u8>] {
        &self.frames
    }
}

/// How a request's frames go on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload<'a> {
    /// One still under the legacy `image` field.
    Single(&'a [u8]),
    /// Ordered stills under repeated `images` fields.
    Multi(&'a [Vec<u8>]),
}

/// The one submission a cycle produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRequest {
    pub code: String,
    pub frames: FrameBurst,
}

impl VerificationRequest {
    pub fn new(code: impl Into<String>, frames: FrameBurst) -> Self {
        Self {
            code: code.into(),
            frames,
        }
    }

    /// Multi-frame when there are at least two stills (capped at
    /// [`MAX_SUBMITTED_FRAMES`]), single-image for exactly one, `None` for an
    /// empty burst.
    pub fn payload(&self) -> Option<Payload<'_>> {
        match self.frames.frames() {
            [] => None,
            [only] => Some(Payload::Single(only)),
            many => Some(Payload::Multi(
                &many[..many.len().min(MAX_SUBMITTED_FRAMES)],
            )),
        }
    }
}

/// Status severity shown next to kiosk messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Success => "success",
            Severity::Warning => "warning",
            Severity::Error => "error",
        })
    }
}

/// Outcome of one verification cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VerificationResult {
    Granted {
        first_name: Option<String>,
        last_name: Option<String>,
        message: String,
    },
    Denied {
        message: String,
    },
    /// Possible spoofing or badge/face mismatch flagged by the verifier.
    Suspicious {
        message: String,
    },
    /// The request never produced a verdict.
    TransportError {
        message: String,
    },
}

impl VerificationResult {
    pub fn severity(&self) -> Severity {
        match self {
            VerificationResult::Granted { .. } => Severity::Success,
            VerificationResult::Suspicious { .. } => Severity::Warning,
            VerificationResult::Denied { .. } | VerificationResult::TransportError { .. } => {
                Severity::Error
            }
        }
    }

    pub fn outcome(&self) -> &'static str {
        match self {
            VerificationResult::Granted { .. } => "granted",
            VerificationResult::Denied { .. } => "denied",
            VerificationResult::Suspicious { .. } => "suspicious",
            VerificationResult::TransportError { .. } => "transport_error",
        }
    }

    /// Short status line for the kiosk.
    pub fn headline(&self) -> &'static str {
        match self {
            VerificationResult::Granted { .. } => "Access granted!",
            VerificationResult::Denied { .. } => "Access denied",
            VerificationResult::Suspicious { .. } => "Suspicious activity detected!",
            VerificationResult::TransportError { .. } => {
                "Verification failed. Please try again."
            }
        }
    }

    /// Full result text, including the greeting for granted access.
    pub fn detail(&self) -> String {
        match self {
            VerificationResult::Granted {
                first_name,
                last_name,
                message,
            } => {
                let name = match (first_name, last_name) {
                    (Some(first), Some(last)) => format!("{first} {last}"),
                    _ => "User".to_string(),
                };
                format!("WELCOME {}! {message}", name.to_uppercase())
            }
            VerificationResult::Denied { message } => format!("✗ {message}"),
            VerificationResult::Suspicious { message } => format!("⚠ {message}"),
            VerificationResult::TransportError { message } => message.clone(),
        }
    }
}

/// A status line pushed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusUpdate {
    pub message: String,
    pub severity: Severity,
}

/// Events published by the flow controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEvent {
    Status(StatusUpdate),
    Finished(VerificationResult),
    ResetComplete,
}
