//! Session configuration and per-operation option records
//!
//! Dynamic option bags become typed records with defaults here; validation of
//! the values happens at the operation entry points.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::media::{MediaConstraints, MediaStream};
use crate::signaling::{Header, SipUri};
use crate::types::Cause;

/// RFC 3261 transport timer constants.
///
/// `timer_h` is the ACK wait (64·T1 by default); `t1`/`t2` drive the
/// application-level 2xx retransmission, which starts at T1 and doubles each
/// fire up to T2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSettings {
    pub t1: Duration,
    pub t2: Duration,
    pub timer_h: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        let t1 = Duration::from_millis(500);
        Self { t1, t2: Duration::from_secs(4), timer_h: 64 * t1 }
    }
}

/// Per-session configuration supplied by the embedding user agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Local identity placed in From (outgoing) / asserted on answers.
    pub local_uri: SipUri,
    /// Display name accompanying the local identity.
    pub display_name: Option<String>,
    /// Contact URI advertised in INVITEs and dialog-forming responses.
    pub contact_uri: SipUri,
    /// How long an incoming call may ring before it is answered.
    pub no_answer_timeout: Duration,
    pub timers: TimerSettings,
}

impl SessionConfig {
    pub fn new(local_uri: SipUri, contact_uri: SipUri) -> Self {
        Self {
            local_uri,
            display_name: None,
            contact_uri,
            no_answer_timeout: Duration::from_secs(60),
            timers: TimerSettings::default(),
        }
    }
}

/// Options for [`crate::session::Session::connect`].
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Replace the From identity with the anonymous URI and add
    /// `P-Preferred-Identity` / `Privacy: id` headers.
    pub anonymous: bool,
    pub media_constraints: MediaConstraints,
    /// Caller-provided stream; bypasses user-media acquisition.
    pub media_stream: Option<MediaStream>,
    pub extra_headers: Vec<Header>,
}

/// Options for [`crate::session::Session::answer`].
#[derive(Debug, Clone, Default)]
pub struct AnswerOptions {
    pub media_constraints: MediaConstraints,
    pub media_stream: Option<MediaStream>,
    pub extra_headers: Vec<Header>,
}

/// Options for [`crate::session::Session::terminate`].
#[derive(Debug, Clone, Default)]
pub struct TerminateOptions {
    /// Reject code (UAS, [300, 700)) or Reason cause (elsewhere, [200, 700)).
    pub status_code: Option<u16>,
    pub reason_phrase: Option<String>,
    /// Cause reported on the terminal event; defaults per role and state.
    pub cause: Option<Cause>,
    pub extra_headers: Vec<Header>,
    pub body: Option<String>,
}

/// Options for [`crate::session::Session::send_dtmf`]; values in
/// milliseconds, clamped against the scheduler bounds.
#[derive(Debug, Clone, Copy, Default)]
pub struct DtmfOptions {
    pub duration: Option<u64>,
    pub inter_tone_gap: Option<u64>,
}
