//! Media handler seam
//!
//! The session core never touches a media engine directly; it drives the SDP
//! offer/answer exchange and stream attachment through this trait. A concrete
//! implementation wraps a peer connection (optionally constructed with
//! DTLS/SRTP constraints); tests use a scripted mock.

use async_trait::async_trait;
use thiserror::Error;

/// Opaque handle to a local or remote media stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    pub id: String,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Constraints for local media acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self { audio: true, video: true }
    }
}

/// Which side of the offer/answer exchange a remote description is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl std::fmt::Display for SdpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SdpKind::Offer => write!(f, "offer"),
            SdpKind::Answer => write!(f, "answer"),
        }
    }
}

/// Failures reported by a media handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("user denied media access")]
    PermissionDenied,

    #[error("media subsystem unsupported: {0}")]
    Unsupported(String),

    #[error("SDP rejected: {0}")]
    Sdp(String),

    #[error("media failure: {0}")]
    Internal(String),
}

/// Per-session media engine interface.
///
/// All methods are suspension points for the session; the session re-enters
/// its event loop between a call and the use of its result.
#[async_trait]
pub trait MediaHandler: Send + Sync {
    /// Whether a media session can be established at all. Checked as a
    /// precondition of `connect()`.
    fn supported(&self) -> bool {
        true
    }

    /// Acquire a local capture stream.
    async fn acquire_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, MediaError>;

    /// Attach a local stream to the peer connection.
    async fn add_stream(&self, stream: &MediaStream) -> Result<(), MediaError>;

    /// Produce a local SDP offer.
    async fn create_offer(&self) -> Result<String, MediaError>;

    /// Produce a local SDP answer to a previously ingested offer.
    async fn create_answer(&self) -> Result<String, MediaError>;

    /// Ingest a remote SDP offer or answer.
    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), MediaError>;

    /// Release the peer connection and every local stream. Must be safe to
    /// call more than once.
    async fn close(&self);

    fn local_streams(&self) -> Vec<MediaStream>;

    fn remote_streams(&self) -> Vec<MediaStream>;
}

impl MediaError {
    /// The termination cause this failure maps to.
    pub(crate) fn cause(&self) -> crate::types::Cause {
        match self {
            MediaError::PermissionDenied => crate::types::Cause::UserDeniedMediaAccess,
            MediaError::Sdp(_) => crate::types::Cause::BadMediaDescription,
            MediaError::Unsupported(_) | MediaError::Internal(_) => {
                crate::types::Cause::WebrtcError
            }
        }
    }
}
