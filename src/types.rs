//! Core session types
//!
//! Identifiers, the session status enum, call direction, event originators and
//! the termination-cause taxonomy, plus the status-code to cause/phrase
//! mappings used when the remote side rejects an INVITE.

use serde::{Deserialize, Serialize};

/// Unique session identifier.
///
/// Composed as `call_id ⧺ from_tag`, which is unique per INVITE transaction
/// for both directions: outgoing sessions use the locally generated from-tag,
/// incoming sessions the tag the peer sent.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(call_id: &str, from_tag: &str) -> Self {
        Self(format!("{call_id}{from_tag}"))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether this endpoint initiated the call (UAC) or received it (UAS).
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Which side produced an observable event.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Originator {
    Local,
    Remote,
    System,
}

/// Session lifecycle status.
///
/// Transitions are restricted by protocol rules and gated by every public
/// operation and inbound event; `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Fresh session, nothing on the wire yet.
    Null,
    /// UAC: initial INVITE transmitted.
    InviteSent,
    /// UAC: a 1xx with a To-tag arrived.
    Provisional,
    /// UAS: INVITE received, offer not yet accepted.
    InviteReceived,
    /// UAS: offer accepted, 180 sent, waiting for the application to answer.
    WaitingForAnswer,
    /// UAS: `answer()` in progress.
    Answered,
    /// UAS: 200 sent, waiting for the peer's ACK.
    WaitingForAck,
    /// Dialog confirmed, media established.
    Confirmed,
    /// UAS: inbound CANCEL won the race.
    Canceled,
    /// Final resting state; no operation may mutate the session afterwards.
    Terminated,
}

/// Why a session ended or failed.
///
/// Surfaced on the `Ended` and `Failed` events.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Cause {
    // user
    UserDeniedMediaAccess,
    Rejected,
    Canceled,
    // protocol
    Busy,
    Redirected,
    Unavailable,
    NotFound,
    AddressIncomplete,
    IncompatibleSdp,
    AuthenticationError,
    Bye,
    NoAnswer,
    Expires,
    NoAck,
    BadMediaDescription,
    SipFailureCode,
    // system
    ConnectionError,
    RequestTimeout,
    WebrtcError,
    DialogError,
    InternalError,
}

impl std::fmt::Display for Cause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Cause::UserDeniedMediaAccess => "User Denied Media Access",
            Cause::Rejected => "Rejected",
            Cause::Canceled => "Canceled",
            Cause::Busy => "Busy",
            Cause::Redirected => "Redirected",
            Cause::Unavailable => "Unavailable",
            Cause::NotFound => "Not Found",
            Cause::AddressIncomplete => "Address Incomplete",
            Cause::IncompatibleSdp => "Incompatible SDP",
            Cause::AuthenticationError => "Authentication Error",
            Cause::Bye => "Terminated",
            Cause::NoAnswer => "No Answer",
            Cause::Expires => "Expires",
            Cause::NoAck => "No ACK",
            Cause::BadMediaDescription => "Bad Media Description",
            Cause::SipFailureCode => "SIP Failure Code",
            Cause::ConnectionError => "Connection Error",
            Cause::RequestTimeout => "Request Timeout",
            Cause::WebrtcError => "WebRTC Error",
            Cause::DialogError => "Dialog Error",
            Cause::InternalError => "Internal Error",
        };
        write!(f, "{text}")
    }
}

/// Map a SIP failure status code to a termination cause.
pub fn cause_for_status(status_code: u16) -> Cause {
    match status_code {
        300..=399 => Cause::Redirected,
        401 | 407 => Cause::AuthenticationError,
        403 | 603 => Cause::Rejected,
        404 | 604 => Cause::NotFound,
        408 | 410 | 430 | 480 => Cause::Unavailable,
        484 => Cause::AddressIncomplete,
        486 | 600 => Cause::Busy,
        488 | 606 => Cause::IncompatibleSdp,
        _ => Cause::SipFailureCode,
    }
}

/// Default reason phrase for a SIP status code.
pub fn reason_phrase(status_code: u16) -> &'static str {
    match status_code {
        100 => "Trying",
        180 => "Ringing",
        181 => "Call Is Being Forwarded",
        182 => "Queued",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Moved Temporarily",
        305 => "Use Proxy",
        380 => "Alternative Service",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        410 => "Gone",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Unsupported URI Scheme",
        420 => "Bad Extension",
        421 => "Extension Required",
        423 => "Interval Too Brief",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        482 => "Loop Detected",
        483 => "Too Many Hops",
        484 => "Address Incomplete",
        485 => "Ambiguous",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        491 => "Request Pending",
        493 => "Undecipherable",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Server Time-out",
        505 => "Version Not Supported",
        513 => "Message Too Large",
        600 => "Busy Everywhere",
        603 => "Decline",
        604 => "Does Not Exist Anywhere",
        606 => "Not Acceptable",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_concatenates_call_id_and_tag() {
        let id = SessionId::new("abc123@host", "tag-1");
        assert_eq!(id.0, "abc123@hosttag-1");
    }

    #[test]
    fn failure_codes_map_to_causes() {
        assert_eq!(cause_for_status(486), Cause::Busy);
        assert_eq!(cause_for_status(600), Cause::Busy);
        assert_eq!(cause_for_status(603), Cause::Rejected);
        assert_eq!(cause_for_status(480), Cause::Unavailable);
        assert_eq!(cause_for_status(301), Cause::Redirected);
        assert_eq!(cause_for_status(488), Cause::IncompatibleSdp);
        assert_eq!(cause_for_status(401), Cause::AuthenticationError);
        assert_eq!(cause_for_status(599), Cause::SipFailureCode);
    }

    #[test]
    fn reason_phrases_cover_emitted_codes() {
        for code in [180, 200, 408, 415, 480, 487, 488, 500] {
            assert_ne!(reason_phrase(code), "Unknown", "missing phrase for {code}");
        }
    }
}
