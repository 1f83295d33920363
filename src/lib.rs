//! # invite-core
//!
//! Per-call INVITE session core: the state machine that drives a single
//! SIP call through its whole lifecycle, mediating between a signaling layer
//! (requests, responses, dialogs, transactions) and a media layer (SDP
//! offer/answer, stream attachment).
//!
//! The crate deliberately owns only the hard middle of a user agent:
//!
//! - UAC and UAS obligations on the INVITE dialog (RFC 3261 §13–§15),
//!   including forked 2xx release, crossed CANCEL, missing-ACK recovery and
//!   application-level 200 retransmission;
//! - orchestration of the asynchronous media handler through the offer/answer
//!   exchange;
//! - the four safety-critical session timers;
//! - exactly-once resource release on every exit path;
//! - out-of-band DTMF scheduling.
//!
//! Transport, parsing, transactions and the concrete media engine are
//! collaborator seams: [`signaling::SipDriver`] outbound,
//! [`media::MediaHandler`] for media, with inbound traffic delivered to the
//! [`session::Session`] handle by the embedding stack.
//!
//! ## Structure
//!
//! Each session runs as one spawned task owning all of its mutable state;
//! public operations, inbound messages, media results and timer fires are
//! commands on a single queue. Transitions are therefore serialized without
//! locks, and every continuation re-checks the session status when it
//! re-enters the loop.

pub mod config;
pub mod dialog;
pub mod errors;
pub mod events;
pub mod media;
pub mod registry;
pub mod session;
pub mod signaling;
pub mod types;

pub use config::{
    AnswerOptions, ConnectOptions, DtmfOptions, SessionConfig, TerminateOptions, TimerSettings,
};
pub use errors::{Result, SessionError};
pub use events::{event_channel, EventReceiver, EventSender, SessionEvent};
pub use media::{MediaConstraints, MediaError, MediaHandler, MediaStream, SdpKind};
pub use registry::SessionRegistry;
pub use session::{Session, SessionState};
pub use signaling::{
    DriverError, Header, Headers, Method, Reason, ServerTransaction, SipDriver, SipRequest,
    SipResponse, SipUri, TransactionState,
};
pub use types::{Cause, Direction, Originator, SessionId, SessionStatus};
