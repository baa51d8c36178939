//! wicket-core — QR badge scanning, liveness capture and verification flow.
//!
//! The [`flow`] module owns the kiosk cycle. The other modules are the
//! pieces it drives: QR decoding, the timed face burst, and the single-flight
//! submission to the remote verifier.

pub mod decoder;
pub mod flow;
pub mod liveness;
pub mod scanner;
pub mod submitter;
pub mod types;

pub use decoder::{DecodeError, QrDecoder, RqrrDecoder};
pub use flow::{
    spawn_flow, FlowConfig, FlowController, FlowDeps, FlowError, FlowHandle, FlowSnapshot,
    FlowState,
};
pub use liveness::BurstConfig;
pub use submitter::{HttpVerifier, Latches, SubmitError, Verifier, VerifyResponse};
pub use types::{FlowEvent, Severity, StatusUpdate, VerificationRequest, VerificationResult};
