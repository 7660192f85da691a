//! Error taxonomy for the detection and callback pipeline.
//!
//! Infrastructure code (config loading, migrations, the CLI) uses
//! [`anyhow::Result`] throughout. The pipeline stages use [`PipelineError`]
//! so the orchestrator and HTTP handlers can map each failure to the right
//! externally visible outcome.
//!
//! | Variant | Raised by | Visible as |
//! |---------|-----------|------------|
//! | `InvalidSignature` | signature check | HTTP 401, cause never revealed |
//! | `MalformedMessage` | webhook payload parse | `success: false` |
//! | `RetrievalFailed` | image download | per image; fatal only if all fail |
//! | `DetectionFailed` | decode / detector / label table | `success: false`, nothing stored |
//! | `Persistence` | store backend | `success: false` |
//!
//! A duplicate fingerprint is not an error: the store reports it through
//! `is_new = false`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("image retrieval failed: {0}")]
    RetrievalFailed(String),

    #[error("detection failed: {0}")]
    DetectionFailed(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] anyhow::Error),
}

impl PipelineError {
    /// Short machine-readable code used in logs and orchestrator traces.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::InvalidSignature => "invalid_signature",
            PipelineError::MalformedMessage(_) => "malformed_message",
            PipelineError::RetrievalFailed(_) => "retrieval_failed",
            PipelineError::DetectionFailed(_) => "detection_failed",
            PipelineError::Persistence(_) => "persistence",
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
