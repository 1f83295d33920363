//! Shared test harness: scripted signaling driver and media handler, message
//! builders and event helpers.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;

use invite_core::dialog::{Dialog, DialogId};
use invite_core::{
    event_channel, DriverError, EventReceiver, Header, Headers, MediaConstraints, MediaError,
    MediaHandler, MediaStream, Method, Reason, SdpKind, Session, SessionConfig, SessionEvent,
    SessionRegistry, SipDriver, SipRequest, SipResponse, SipUri,
};

pub const SDP_OFFER: &str = "v=0\r\no=- 13 13 IN IP4 192.0.2.10\r\ns=-\r\nc=IN IP4 192.0.2.10\r\nt=0 0\r\nm=audio 49170 RTP/AVP 0\r\n";
pub const SDP_ANSWER: &str = "v=0\r\no=- 31 31 IN IP4 192.0.2.20\r\ns=-\r\nc=IN IP4 192.0.2.20\r\nt=0 0\r\nm=audio 49180 RTP/AVP 0\r\n";

/// One outbound signaling operation, as recorded by [`MockDriver`].
#[derive(Debug, Clone)]
pub enum WireOp {
    Invite { call_id: String, from_tag: String, body: Option<String>, headers: Vec<Header> },
    Cancel { reason: Option<Reason> },
    Reply { code: u16, body: Option<String>, headers: Vec<Header> },
    InDialog {
        method: Method,
        dialog: DialogId,
        cseq: u32,
        headers: Vec<Header>,
        body: Option<String>,
    },
}

/// Records everything the session puts on the wire; individual operations can
/// be scripted to fail.
#[derive(Default)]
pub struct MockDriver {
    ops: StdMutex<Vec<WireOp>>,
    pub fail_invite: AtomicBool,
    pub fail_reply: AtomicBool,
    pub fail_in_dialog: AtomicBool,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn ops(&self) -> Vec<WireOp> {
        self.ops.lock().unwrap().clone()
    }

    /// Call-ID and from-tag of the INVITE the session sent.
    pub fn sent_invite(&self) -> Option<(String, String)> {
        self.ops().into_iter().find_map(|op| match op {
            WireOp::Invite { call_id, from_tag, .. } => Some((call_id, from_tag)),
            _ => None,
        })
    }

    pub fn invite_count(&self) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, WireOp::Invite { .. }))
            .count()
    }

    pub fn cancel_count(&self) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, WireOp::Cancel { .. }))
            .count()
    }

    pub fn reply_count(&self, code: u16) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, WireOp::Reply { code: c, .. } if *c == code))
            .count()
    }

    pub fn in_dialog(&self, method: Method) -> Vec<WireOp> {
        self.ops()
            .into_iter()
            .filter(|op| matches!(op, WireOp::InDialog { method: m, .. } if *m == method))
            .collect()
    }

    pub fn in_dialog_count(&self, method: Method) -> usize {
        self.in_dialog(method).len()
    }

    fn record(&self, op: WireOp) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl SipDriver for MockDriver {
    async fn send_invite(&self, invite: &SipRequest) -> Result<(), DriverError> {
        if self.fail_invite.load(Ordering::SeqCst) {
            return Err(DriverError::Transport("invite refused".into()));
        }
        self.record(WireOp::Invite {
            call_id: invite.call_id.clone(),
            from_tag: invite.from_tag.clone(),
            body: invite.body.clone(),
            headers: invite.headers.iter().cloned().collect(),
        });
        Ok(())
    }

    async fn cancel(&self, _invite: &SipRequest, reason: Option<Reason>) -> Result<(), DriverError> {
        self.record(WireOp::Cancel { reason });
        Ok(())
    }

    async fn reply(
        &self,
        _request: &SipRequest,
        status_code: u16,
        _reason_phrase: Option<&str>,
        headers: Vec<Header>,
        body: Option<String>,
    ) -> Result<(), DriverError> {
        if self.fail_reply.load(Ordering::SeqCst) {
            return Err(DriverError::Transport("reply refused".into()));
        }
        self.record(WireOp::Reply { code: status_code, body, headers });
        Ok(())
    }

    async fn send_in_dialog(
        &self,
        dialog: &Dialog,
        method: Method,
        headers: Vec<Header>,
        body: Option<String>,
    ) -> Result<(), DriverError> {
        if self.fail_in_dialog.load(Ordering::SeqCst) {
            return Err(DriverError::Transport("in-dialog refused".into()));
        }
        self.record(WireOp::InDialog {
            method,
            dialog: dialog.id.clone(),
            cseq: dialog.local_seq,
            headers,
            body,
        });
        Ok(())
    }
}

/// Scripted media handler: every operation succeeds unless its failure flag
/// is set.
#[derive(Default)]
pub struct MockMedia {
    pub unsupported: AtomicBool,
    pub deny_user_media: AtomicBool,
    pub fail_add_stream: AtomicBool,
    pub fail_offer: AtomicBool,
    pub fail_answer: AtomicBool,
    pub reject_remote: AtomicBool,
    pub closed: AtomicBool,
    local: StdMutex<Vec<MediaStream>>,
    remote: StdMutex<Vec<MediaStream>>,
}

impl MockMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl MediaHandler for MockMedia {
    fn supported(&self) -> bool {
        !self.unsupported.load(Ordering::SeqCst)
    }

    async fn acquire_user_media(
        &self,
        _constraints: MediaConstraints,
    ) -> Result<MediaStream, MediaError> {
        if self.deny_user_media.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied);
        }
        Ok(MediaStream::new("local-capture"))
    }

    async fn add_stream(&self, stream: &MediaStream) -> Result<(), MediaError> {
        if self.fail_add_stream.load(Ordering::SeqCst) {
            return Err(MediaError::Internal("stream refused".into()));
        }
        self.local.lock().unwrap().push(stream.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, MediaError> {
        if self.fail_offer.load(Ordering::SeqCst) {
            return Err(MediaError::Internal("no offer".into()));
        }
        Ok(SDP_OFFER.to_string())
    }

    async fn create_answer(&self) -> Result<String, MediaError> {
        if self.fail_answer.load(Ordering::SeqCst) {
            return Err(MediaError::Internal("no answer".into()));
        }
        Ok(SDP_ANSWER.to_string())
    }

    async fn set_remote_description(&self, _kind: SdpKind, sdp: &str) -> Result<(), MediaError> {
        if self.reject_remote.load(Ordering::SeqCst) {
            return Err(MediaError::Sdp("unacceptable".into()));
        }
        if sdp.is_empty() {
            return Err(MediaError::Sdp("empty".into()));
        }
        self.remote.lock().unwrap().push(MediaStream::new("remote-stream"));
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.local.lock().unwrap().clear();
        self.remote.lock().unwrap().clear();
    }

    fn local_streams(&self) -> Vec<MediaStream> {
        self.local.lock().unwrap().clone()
    }

    fn remote_streams(&self) -> Vec<MediaStream> {
        self.remote.lock().unwrap().clone()
    }
}

pub fn test_config() -> SessionConfig {
    SessionConfig::new(
        SipUri::parse("sip:alice@example.com").unwrap(),
        SipUri::parse("sip:alice@192.0.2.1:5060").unwrap(),
    )
}

/// Everything a test needs to drive one session.
pub struct Peer {
    pub session: Session,
    pub events: EventReceiver,
    pub driver: Arc<MockDriver>,
    pub media: Arc<MockMedia>,
    pub registry: Arc<SessionRegistry>,
}

pub fn outgoing_peer() -> Peer {
    outgoing_peer_with(test_config())
}

pub fn outgoing_peer_with(config: SessionConfig) -> Peer {
    let driver = MockDriver::new();
    let media = MockMedia::new();
    let registry = SessionRegistry::new();
    let (events_tx, events) = event_channel();
    let session = Session::new_outgoing(
        config,
        driver.clone(),
        media.clone(),
        registry.clone(),
        events_tx,
    );
    Peer { session, events, driver, media, registry }
}

pub fn incoming_peer(request: SipRequest) -> Peer {
    incoming_peer_with(request, test_config())
}

pub fn incoming_peer_with(request: SipRequest, config: SessionConfig) -> Peer {
    let driver = MockDriver::new();
    let media = MockMedia::new();
    let registry = SessionRegistry::new();
    let (events_tx, events) = event_channel();
    let session = Session::new_incoming(
        request,
        config,
        driver.clone(),
        media.clone(),
        registry.clone(),
        events_tx,
    );
    Peer { session, events, driver, media, registry }
}

/// A well-formed incoming INVITE carrying an SDP offer.
pub fn incoming_invite(call_id: &str, from_tag: &str) -> SipRequest {
    let mut headers = Headers::new();
    headers.push(Header::new("Content-Type", "application/sdp"));
    headers.push(Header::new("Contact", "<sip:bob@192.0.2.9:5060>"));
    SipRequest {
        method: Method::Invite,
        target: SipUri::parse("sip:alice@example.com").unwrap(),
        call_id: call_id.to_string(),
        cseq: 1,
        from_uri: SipUri::parse("sip:bob@example.com").unwrap(),
        from_display: Some("Bob".into()),
        from_tag: from_tag.to_string(),
        to_uri: SipUri::parse("sip:alice@example.com").unwrap(),
        to_tag: None,
        headers,
        body: Some(SDP_OFFER.to_string()),
        server_tx: None,
    }
}

/// An in-dialog request from the peer (ACK, BYE, INFO, CANCEL ...).
pub fn in_dialog_request(method: Method, call_id: &str, from_tag: &str, cseq: u32) -> SipRequest {
    SipRequest {
        method,
        target: SipUri::parse("sip:alice@192.0.2.1:5060").unwrap(),
        call_id: call_id.to_string(),
        cseq,
        from_uri: SipUri::parse("sip:bob@example.com").unwrap(),
        from_display: None,
        from_tag: from_tag.to_string(),
        to_uri: SipUri::parse("sip:alice@example.com").unwrap(),
        to_tag: None,
        headers: Headers::new(),
        body: None,
        server_tx: None,
    }
}

/// A response to the initial INVITE.
pub fn response(
    call_id: &str,
    code: u16,
    to_tag: Option<&str>,
    with_contact: bool,
    body: Option<&str>,
) -> SipResponse {
    let mut headers = Headers::new();
    if with_contact {
        headers.push(Header::new("Contact", "<sip:bob@192.0.2.9:5060>"));
    }
    if body.is_some() {
        headers.push(Header::new("Content-Type", "application/sdp"));
    }
    SipResponse {
        status_code: code,
        reason_phrase: String::new(),
        call_id: call_id.to_string(),
        cseq: 1,
        from_tag: Some("uac-from-tag".into()),
        to_tag: to_tag.map(str::to_string),
        headers,
        body: body.map(str::to_string),
    }
}

/// Let the session task (and any continuation tasks) drain their queues.
/// Yields without advancing the paused clock, so no timer can fire here.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/// Collect everything currently in the event channel.
pub fn drain(events: &mut EventReceiver) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
