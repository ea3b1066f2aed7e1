//! Recorder error kinds.
//!
//! Errors are classified by how the pipeline reacts to them: transient
//! faults are retried locally, degraded conditions continue with
//! annotation, data loss is filled and logged, stream restarts reset the
//! channel, and fatal errors terminate the process.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecorderError {
    /// Retry locally with bounded backoff (socket reopen, NTP unavailable).
    #[error("transient: {0}")]
    Transient(String),

    /// Continue with annotation (no tone, no NTP, lowered confidence).
    #[error("degraded: {0}")]
    Degraded(String),

    /// Sequence gap within tolerance; samples were zero-filled.
    #[error("data loss: {missing} samples filled at rtp {rtp}")]
    DataLoss { rtp: u32, missing: u32 },

    /// RTP jump beyond tolerance; channel anchors were reset.
    #[error("stream restart: rtp jumped from {rtp_before} to {rtp_after}")]
    StreamRestart { rtp_before: u32, rtp_after: u32 },

    /// Unrecoverable (config parse error, unsupported sample format).
    #[error("fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RecorderError>;
