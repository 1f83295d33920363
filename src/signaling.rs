//! Signaling collaborator surface
//!
//! The transaction and transport layers live outside this crate. Inbound
//! traffic arrives as already-parsed [`SipRequest`]/[`SipResponse`] values;
//! outbound traffic leaves through the [`SipDriver`] trait, which a real
//! stack implements on top of its client/server transactions.

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::dialog::Dialog;
use crate::errors::SessionError;
use crate::types::reason_phrase;

/// From URI used for anonymous calls.
pub const ANONYMOUS_URI: &str = "sip:anonymous@anonymous.invalid";

/// Methods emitted in the Allow header of outgoing INVITEs.
pub const ALLOWED_METHODS: &str = "INVITE, ACK, CANCEL, BYE, INFO, OPTIONS";

/// Minimal SIP URI wrapper. Parsing is delegated to the full stack; this type
/// only enforces the scheme and a non-empty host part.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct SipUri(String);

impl SipUri {
    pub fn parse(raw: &str) -> Result<Self, SessionError> {
        let trimmed = raw.trim();
        let rest = trimmed
            .strip_prefix("sip:")
            .or_else(|| trimmed.strip_prefix("sips:"))
            .ok_or_else(|| SessionError::InvalidTarget(raw.to_string()))?;
        let hostport = rest.rsplit('@').next().unwrap_or(rest);
        if hostport.is_empty() {
            return Err(SessionError::InvalidTarget(raw.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SipUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SIP request methods this core sends or dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Info,
    Options,
    Update,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Info => "INFO",
            Method::Options => "OPTIONS",
            Method::Update => "UPDATE",
        };
        write!(f, "{name}")
    }
}

/// A single SIP header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, header: Header) {
        self.0.push(header);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
            .collect()
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }
}

impl From<Vec<Header>> for Headers {
    fn from(headers: Vec<Header>) -> Self {
        Self(headers)
    }
}

/// `Reason` header value: `SIP ;cause=<code> ;text="<phrase>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reason {
    pub cause: u16,
    pub text: String,
}

impl Reason {
    pub fn new(cause: u16, text: impl Into<String>) -> Self {
        Self { cause, text: text.into() }
    }

    pub fn from_code(cause: u16) -> Self {
        Self::new(cause, reason_phrase(cause))
    }

    pub fn into_header(self) -> Header {
        Header::new("Reason", self.to_string())
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SIP ;cause={} ;text=\"{}\"", self.cause, self.text)
    }
}

/// INVITE server transaction states (RFC 3261 §17.2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Proceeding,
    Completed,
    Accepted,
    Confirmed,
    Terminated,
}

/// Read-only view of an INVITE server transaction's state, provided by the
/// transaction layer alongside an incoming INVITE. The `Terminated` edge is
/// one of the two triggers of the deferred-BYE path.
#[derive(Debug, Clone)]
pub struct ServerTransaction {
    state: watch::Receiver<TransactionState>,
}

impl ServerTransaction {
    /// Create a transaction view plus the sender the owning transaction uses
    /// to publish state changes.
    pub fn channel() -> (Self, watch::Sender<TransactionState>) {
        let (tx, rx) = watch::channel(TransactionState::Proceeding);
        (Self { state: rx }, tx)
    }

    pub fn state(&self) -> TransactionState {
        *self.state.borrow()
    }

    /// Resolve when the transaction reaches `Terminated`.
    pub async fn terminated(&self) {
        let mut rx = self.state.clone();
        // Closed sender counts as terminated: the transaction is gone.
        let _ = rx.wait_for(|s| *s == TransactionState::Terminated).await;
    }
}

/// A parsed incoming (or locally built outgoing) SIP request.
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: Method,
    pub target: SipUri,
    pub call_id: String,
    pub cseq: u32,
    pub from_uri: SipUri,
    pub from_display: Option<String>,
    pub from_tag: String,
    pub to_uri: SipUri,
    pub to_tag: Option<String>,
    pub headers: Headers,
    pub body: Option<String>,
    /// Present on incoming INVITEs when the transaction layer exposes its
    /// server transaction.
    pub server_tx: Option<ServerTransaction>,
}

impl SipRequest {
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("Content-Type")
    }

    pub fn contact(&self) -> Option<&str> {
        self.headers.get("Contact")
    }

    /// Value of the `Expires` header, in seconds.
    pub fn expires(&self) -> Option<std::time::Duration> {
        self.headers
            .get("Expires")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(std::time::Duration::from_secs)
    }
}

/// A parsed response to the initial INVITE.
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub status_code: u16,
    pub reason_phrase: String,
    pub call_id: String,
    pub cseq: u32,
    pub from_tag: Option<String>,
    pub to_tag: Option<String>,
    pub headers: Headers,
    pub body: Option<String>,
}

impl SipResponse {
    pub fn contact(&self) -> Option<&str> {
        self.headers.get("Contact")
    }
}

/// Extract the URI from a Contact header value, stripping display name,
/// angle brackets and parameters.
pub fn contact_uri(value: &str) -> Result<SipUri, SessionError> {
    let inner = match (value.find('<'), value.find('>')) {
        (Some(start), Some(end)) if end > start => &value[start + 1..end],
        _ => value,
    };
    let uri = inner.split(';').next().unwrap_or(inner);
    SipUri::parse(uri)
}

/// Generate a SIP tag.
pub fn new_tag() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect()
}

/// Generate a Call-ID.
pub fn new_call_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Failures reported by the signaling driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,
}

/// Outbound half of the signaling layer.
///
/// A production implementation maps these onto client/server transactions;
/// the session only cares that the message was accepted for delivery.
#[async_trait]
pub trait SipDriver: Send + Sync {
    /// Send the initial INVITE on a new client transaction.
    async fn send_invite(&self, invite: &SipRequest) -> Result<(), DriverError>;

    /// Send CANCEL against the pending INVITE client transaction.
    async fn cancel(&self, invite: &SipRequest, reason: Option<Reason>) -> Result<(), DriverError>;

    /// Reply on the server transaction of an incoming request.
    async fn reply(
        &self,
        request: &SipRequest,
        status_code: u16,
        reason_phrase: Option<&str>,
        headers: Vec<Header>,
        body: Option<String>,
    ) -> Result<(), DriverError>;

    /// Send an in-dialog request (ACK, BYE, INFO) routed through `dialog`.
    async fn send_in_dialog(
        &self,
        dialog: &Dialog,
        method: Method,
        headers: Vec<Header>,
        body: Option<String>,
    ) -> Result<(), DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sip_and_sips_uris() {
        assert!(SipUri::parse("sip:bob@example.com").is_ok());
        assert!(SipUri::parse("sips:bob@example.com:5061").is_ok());
        assert!(SipUri::parse("bob@example.com").is_err());
        assert!(SipUri::parse("sip:").is_err());
    }

    #[test]
    fn contact_uri_strips_decoration() {
        let uri = contact_uri("\"Bob\" <sip:bob@192.0.2.4:5060;transport=udp>;expires=60").unwrap();
        assert_eq!(uri.as_str(), "sip:bob@192.0.2.4:5060");
        let bare = contact_uri("sip:bob@192.0.2.4").unwrap();
        assert_eq!(bare.as_str(), "sip:bob@192.0.2.4");
    }

    #[test]
    fn reason_header_formats_per_rfc3326() {
        let reason = Reason::from_code(486);
        assert_eq!(reason.to_string(), "SIP ;cause=486 ;text=\"Busy Here\"");
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.push(Header::new("Content-Type", "application/sdp"));
        assert_eq!(headers.get("content-type"), Some("application/sdp"));
        assert!(headers.has("CONTENT-TYPE"));
    }
}
