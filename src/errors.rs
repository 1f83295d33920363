//! Error types for invite-core
//!
//! Programmer errors are returned synchronously from the public session API
//! and never transition session state. Everything that happens on the wire or
//! in the media path is reported through the session event surface instead
//! (see [`crate::events::SessionEvent`]).

use thiserror::Error;

use crate::types::SessionStatus;

/// Errors surfaced by the public session operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The operation is not legal in the session's current status.
    #[error("invalid state for operation: {0:?}")]
    InvalidState(SessionStatus),

    /// The operation is not available for this session's direction,
    /// or the media subsystem cannot support it.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// The target could not be parsed as a SIP URI.
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// A status code outside the range the operation accepts.
    #[error("invalid status code: {0}")]
    InvalidStatusCode(u16),

    /// Empty tone string or a character outside `[0-9A-D#*,]`.
    #[error("invalid DTMF tones: {0:?}")]
    InvalidTones(String),

    /// A DTMF duration or inter-tone gap that is not a positive number.
    #[error("invalid DTMF timing value: {0}")]
    InvalidDtmfTiming(u64),

    /// Dialog construction or update failed.
    #[error("dialog error: {0}")]
    Dialog(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
