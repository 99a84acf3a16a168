//! Error types for the haptic rods session controller

use std::path::PathBuf;

use thiserror::Error;

/// Errors that abort a session or one of its stages.
///
/// Answer parse failures and per-problem alignment failures are recoverable and
/// have their own types ([`crate::rational::ParseError`],
/// [`crate::align::AlignmentError`]); they never surface here.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Device connection failed at {endpoint}: {source}")]
    Connection {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Device protocol failure: {0}")]
    Protocol(#[source] std::io::Error),

    #[error("Device closed the connection while {0}")]
    DeviceClosed(String),

    #[error("Participant data directory already exists: {}", .0.display())]
    DuplicateParticipant(PathBuf),

    #[error("Invalid session transition: {0}")]
    InvalidTransition(String),

    #[error("Failed to load problem {index}: {reason}")]
    ProblemLoad { index: usize, reason: String },

    #[error("Sensor process error: {0}")]
    SensorProcess(String),

    #[error("Sensor log error: {0}")]
    SensorLog(String),

    #[error("Artifact transfer failed: {0}")]
    Transfer(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
