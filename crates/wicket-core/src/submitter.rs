//! Verification submission: wire format, response classification, and the
//! single-flight latches.

use crate::types::{Payload, VerificationRequest, VerificationResult};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// `result` discriminator the verifier uses to flag possible spoofing.
pub const RESULT_SUSPICIOUS: &str = "SUSPICIOUS";

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("a verification is already in flight")]
    InFlight,
    #[error("verification already completed for this cycle")]
    AlreadyCompleted,
    #[error("no frames captured")]
    EmptyBurst,
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("verifier returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid verifier response: {0}")]
    InvalidResponse(#[from] serde_json::Error),
}

/// JSON body returned by the verification endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub success: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub match_score: Option<f32>,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub log_id: Option<i64>,
}

impl VerifyResponse {
    pub fn classify(self) -> VerificationResult {
        if self.success {
            return VerificationResult::Granted {
                first_name: self.first_name,
                last_name: self.last_name,
                message: self.message,
            };
        }
        match self.result.as_deref() {
            Some(RESULT_SUSPICIOUS) => VerificationResult::Suspicious {
                message: self.message,
            },
            _ => VerificationResult::Denied {
                message: self.message,
            },
        }
    }
}

/// The remote verification service.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, request: &VerificationRequest) -> Result<VerifyResponse, SubmitError>;
}

/// Multipart POST to an HTTP verification endpoint.
pub struct HttpVerifier {
    client: reqwest::Client,
    url: String,
}

impl HttpVerifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, SubmitError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    fn form(request: &VerificationRequest) -> Result<Form, SubmitError> {
        let form = Form::new().text("qr_code", request.code.clone());
        let form = match request.payload().ok_or(SubmitError::EmptyBurst)? {
            Payload::Single(jpeg) => form.part("image", jpeg_part(jpeg, "photo.jpg".into())?),
            Payload::Multi(frames) => {
                let mut form = form;
                for (idx, jpeg) in frames.iter().enumerate() {
                    form = form.part("images", jpeg_part(jpeg, format!("frame{}.jpg", idx + 1))?);
                }
                form
            }
        };
        Ok(form)
    }
}

fn jpeg_part(jpeg: &[u8], file_name: String) -> Result<Part, SubmitError> {
    Ok(Part::bytes(jpeg.to_vec())
        .file_name(file_name)
        .mime_str("image/jpeg")?)
}

#[async_trait]
impl Verifier for HttpVerifier {
    async fn verify(&self, request: &VerificationRequest) -> Result<VerifyResponse, SubmitError> {
        let form = Self::form(request)?;
        tracing::debug!(
            url = %self.url,
            code = %request.code,
            frames = request.frames.len(),
            "posting verification request"
        );

        let response = self.client.post(&self.url).multipart(form).send().await?;
        let status = response.status();
        let body = response.text().await?;

        // The verifier answers denials with a verdict body too, so a parsable
        // verdict wins over the status code.
        match serde_json::from_str::<VerifyResponse>(&body) {
            Ok(verdict) => Ok(verdict),
            Err(_) if !status.is_success() => Err(SubmitError::Status {
                status: status.as_u16(),
                body,
            }),
            Err(err) => Err(err.into()),
        }
    }
}

/// Single-flight and terminal latches for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Latches {
    pub in_progress: bool,
    pub completed: bool,
}

impl Latches {
    /// Neither latch set: capture and submission may proceed.
    pub fn is_clear(&self) -> bool {
        !self.in_progress && !self.completed
    }
}

/// Guards submission so each cycle produces at most one request.
#[derive(Debug, Default)]
pub struct Submitter {
    latches: Latches,
}

impl Submitter {
    pub fn latches(&self) -> Latches {
        self.latches
    }

    fn ensure_ready(&self) -> Result<(), SubmitError> {
        if self.latches.in_progress {
            return Err(SubmitError::InFlight);
        }
        if self.latches.completed {
            return Err(SubmitError::AlreadyCompleted);
        }
        Ok(())
    }

    /// Submit once. Any outcome, including a transport failure, leaves the
    /// cycle completed; only [`reset`](Self::reset) reopens it.
    pub async fn submit(
        &mut self,
        verifier: &dyn Verifier,
        request: &VerificationRequest,
    ) -> Result<VerificationResult, SubmitError> {
        self.ensure_ready()?;
        if request.frames.is_empty() {
            return Err(SubmitError::EmptyBurst);
        }

        self.latches.in_progress = true;
        let outcome = verifier.verify(request).await;
        self.latches = Latches {
            in_progress: false,
            completed: true,
        };

        Ok(match outcome {
            Ok(response) => response.classify(),
            Err(err) => {
                tracing::warn!(error = %err, "verification request failed");
                VerificationResult::TransportError {
                    message: err.to_string(),
                }
            }
        })
    }

    /// End the cycle without a submission (e.g. the face camera failed).
    pub fn mark_completed(&mut self) {
        self.latches = Latches {
            in_progress: false,
            completed: true,
        };
    }

    pub fn reset(&mut self) {
        self.latches = Latches::default();
    }
}
