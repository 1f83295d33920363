//! Per-call session state machine
//!
//! One spawned task owns all mutable session state; the [`Session`] handle
//! sends commands into that task and observes progress through a watch
//! channel and the event stream. Inbound SIP traffic, media-pipeline results
//! and timer fires all arrive as commands on the same queue, which serializes
//! every transition without locks — the single-threaded cooperative model
//! the protocol rules assume.

mod dtmf;
mod timer;
mod uac;
mod uas;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::{AnswerOptions, ConnectOptions, DtmfOptions, SessionConfig, TerminateOptions};
use crate::dialog::{Dialog, DialogId};
use crate::errors::{Result, SessionError};
use crate::events::{EventSender, SessionEvent};
use crate::media::{MediaError, MediaHandler, MediaStream};
use crate::registry::SessionRegistry;
use crate::signaling::{
    new_call_id, new_tag, Header, Headers, Method, Reason, SipDriver, SipRequest, SipResponse,
    SipUri, ALLOWED_METHODS, ANONYMOUS_URI,
};
use crate::types::{reason_phrase, Cause, Direction, Originator, SessionId, SessionStatus};

use dtmf::DtmfQueue;
use timer::{TimerKind, TimerSet};

/// Snapshot of the externally observable session state.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub status: SessionStatus,
    pub direction: Direction,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Commands processed by the session task.
pub(crate) enum SessionCommand {
    Connect {
        target: SipUri,
        options: ConnectOptions,
        done: oneshot::Sender<Result<()>>,
    },
    Answer {
        options: AnswerOptions,
        done: oneshot::Sender<Result<()>>,
    },
    Terminate {
        options: TerminateOptions,
        done: oneshot::Sender<Result<()>>,
    },
    SendDtmf {
        tones: Vec<char>,
        duration: u64,
        gap: u64,
        done: oneshot::Sender<Result<()>>,
    },
    /// Response to the initial INVITE (UAC role).
    Response(SipResponse),
    /// In-dialog request or CANCEL (UAS role).
    Request(SipRequest),
    /// The fresh INVITE an incoming session was built from.
    IncomingInvite(SipRequest),
    /// Result of the asynchronous local-offer pipeline.
    LocalOffer(std::result::Result<String, MediaError>),
    TimerFired {
        kind: TimerKind,
        generation: u64,
    },
    DtmfTick {
        generation: u64,
    },
    /// The INVITE server transaction reached its terminal state.
    ServerTxTerminated,
    /// The request sender reported a transport failure or timeout.
    TransportFailure {
        timeout: bool,
    },
}

/// Deferred in-dialog BYE, installed when an unacknowledged incoming call is
/// terminated locally. Fired by the first of: inbound ACK, server transaction
/// termination.
struct PendingBye {
    dialog: Dialog,
    headers: Vec<Header>,
    body: Option<String>,
}

/// Cached 200 OK for application-level retransmission while waiting for ACK.
struct AnswerReply {
    headers: Vec<Header>,
    body: String,
}

/// Handle to a call session.
///
/// Cheap to clone; all clones drive the same underlying session task.
#[derive(Clone)]
pub struct Session {
    id: SessionId,
    direction: Direction,
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    state_rx: watch::Receiver<SessionState>,
    media: Arc<dyn MediaHandler>,
    data: Arc<StdMutex<HashMap<String, serde_json::Value>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("status", &self.status())
            .finish()
    }
}

impl Session {
    /// Create an outgoing (UAC) session. Nothing touches the wire until
    /// [`connect`](Self::connect) is called.
    pub fn new_outgoing(
        config: SessionConfig,
        driver: Arc<dyn SipDriver>,
        media: Arc<dyn MediaHandler>,
        registry: Arc<SessionRegistry>,
        events: EventSender,
    ) -> Self {
        let call_id = new_call_id();
        let local_tag = new_tag();
        let id = SessionId::new(&call_id, &local_tag);
        Self::spawn(
            id, Direction::Outgoing, call_id, local_tag, None, config, driver, media, registry,
            events,
        )
    }

    /// Create an incoming (UAS) session from a fresh INVITE. The offer is
    /// validated asynchronously; observers learn the outcome through the
    /// event stream.
    pub fn new_incoming(
        request: SipRequest,
        config: SessionConfig,
        driver: Arc<dyn SipDriver>,
        media: Arc<dyn MediaHandler>,
        registry: Arc<SessionRegistry>,
        events: EventSender,
    ) -> Self {
        let call_id = request.call_id.clone();
        let local_tag = new_tag();
        let id = SessionId::new(&call_id, &request.from_tag);
        Self::spawn(
            id, Direction::Incoming, call_id, local_tag, Some(request), config, driver, media,
            registry, events,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn(
        id: SessionId,
        direction: Direction,
        call_id: String,
        local_tag: String,
        incoming: Option<SipRequest>,
        config: SessionConfig,
        driver: Arc<dyn SipDriver>,
        media: Arc<dyn MediaHandler>,
        registry: Arc<SessionRegistry>,
        events: EventSender,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState {
            status: SessionStatus::Null,
            direction,
            start_time: None,
            end_time: None,
        });
        let data = Arc::new(StdMutex::new(HashMap::new()));

        let inner = SessionInner {
            id: id.clone(),
            direction,
            config,
            driver,
            media: media.clone(),
            registry,
            events,
            cmd_tx: cmd_tx.clone(),
            state_tx,
            data: data.clone(),
            status: SessionStatus::Null,
            call_id,
            local_tag,
            invite: None,
            dialog: None,
            early_dialogs: HashMap::new(),
            timers: TimerSet::new(cmd_tx.clone()),
            dtmf: DtmfQueue::new(cmd_tx.clone()),
            is_canceled: false,
            cancel_reason: None,
            received_100: false,
            pending_bye: None,
            answer_reply: None,
            retrans_interval: Duration::ZERO,
            terminal_emitted: false,
            registered: false,
        };
        tokio::spawn(run_session_loop(inner, cmd_rx));

        if let Some(request) = incoming {
            let _ = cmd_tx.send(SessionCommand::IncomingInvite(request));
        }

        Self { id, direction, cmd_tx, state_rx, media, data }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn status(&self) -> SessionStatus {
        self.state_rx.borrow().status
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.state_rx.borrow().start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.state_rx.borrow().end_time
    }

    /// Ringing or being answered, not yet established.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self.status(),
            SessionStatus::InviteSent
                | SessionStatus::Provisional
                | SessionStatus::InviteReceived
                | SessionStatus::WaitingForAnswer
        )
    }

    pub fn is_established(&self) -> bool {
        matches!(
            self.status(),
            SessionStatus::Answered | SessionStatus::WaitingForAck | SessionStatus::Confirmed
        )
    }

    pub fn is_ended(&self) -> bool {
        self.status() == SessionStatus::Terminated
    }

    /// Local media endpoints, once media is up.
    pub fn local_streams(&self) -> Vec<MediaStream> {
        self.media.local_streams()
    }

    /// Remote media endpoints, once media is up.
    pub fn remote_streams(&self) -> Vec<MediaStream> {
        self.media.remote_streams()
    }

    /// Attach an opaque value to this session.
    pub fn set_data(&self, key: impl Into<String>, value: serde_json::Value) {
        self.data.lock().expect("session data lock").insert(key.into(), value);
    }

    pub fn get_data(&self, key: &str) -> Option<serde_json::Value> {
        self.data.lock().expect("session data lock").get(key).cloned()
    }

    /// Start an outgoing call (UAC). Fails synchronously when the target is
    /// not a SIP URI, the session already left `Null`, or media is
    /// unsupported; everything later is reported through events.
    pub async fn connect(&self, target: &str, options: ConnectOptions) -> Result<()> {
        let target = SipUri::parse(target)?;
        self.roundtrip(|done| SessionCommand::Connect { target, options, done }).await
    }

    /// Accept an incoming call (UAS). Legal only in `WaitingForAnswer`.
    pub async fn answer(&self, options: AnswerOptions) -> Result<()> {
        self.roundtrip(|done| SessionCommand::Answer { options, done }).await
    }

    /// Terminate the session. Role- and state-dependent: cancels an
    /// unanswered outgoing INVITE, rejects an unanswered incoming one, sends
    /// BYE on an established dialog, defers the BYE when the 2xx is still
    /// unacknowledged.
    pub async fn terminate(&self, options: TerminateOptions) -> Result<()> {
        self.roundtrip(|done| SessionCommand::Terminate { options, done }).await
    }

    /// Queue DTMF tones for paced out-of-band transmission.
    pub async fn send_dtmf(&self, tones: &str, options: DtmfOptions) -> Result<()> {
        let tones = dtmf::parse_tones(tones)?;
        let duration = dtmf::clamp_duration(options.duration)?;
        let gap = dtmf::clamp_gap(options.inter_tone_gap)?;
        self.roundtrip(|done| SessionCommand::SendDtmf { tones, duration, gap, done }).await
    }

    /// Deliver a response to the initial INVITE (called by the request
    /// sender of the signaling layer).
    pub fn deliver_response(&self, response: SipResponse) {
        let _ = self.cmd_tx.send(SessionCommand::Response(response));
    }

    /// Deliver an in-dialog request or CANCEL routed to this session.
    pub fn deliver_request(&self, request: SipRequest) {
        let _ = self.cmd_tx.send(SessionCommand::Request(request));
    }

    /// Signal that the initial INVITE timed out without a final response.
    pub fn deliver_request_timeout(&self) {
        let _ = self.cmd_tx.send(SessionCommand::TransportFailure { timeout: true });
    }

    /// Signal a transport failure on the initial INVITE.
    pub fn deliver_transport_error(&self) {
        let _ = self.cmd_tx.send(SessionCommand::TransportFailure { timeout: false });
    }

    async fn roundtrip(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<()>>) -> SessionCommand,
    ) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(done_tx))
            .map_err(|_| SessionError::InvalidState(self.status()))?;
        done_rx.await.map_err(|_| SessionError::InvalidState(self.status()))?
    }
}

async fn run_session_loop(
    mut inner: SessionInner,
    mut cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
) {
    debug!("session {} task started", inner.id);
    while let Some(command) = cmd_rx.recv().await {
        inner.dispatch(command).await;
        if inner.status == SessionStatus::Terminated && inner.pending_bye.is_none() {
            break;
        }
    }
    debug!("session {} task ended", inner.id);
}

/// All mutable session state, owned exclusively by the session task.
pub(crate) struct SessionInner {
    pub(crate) id: SessionId,
    pub(crate) direction: Direction,
    pub(crate) config: SessionConfig,
    pub(crate) driver: Arc<dyn SipDriver>,
    pub(crate) media: Arc<dyn MediaHandler>,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) events: EventSender,
    pub(crate) cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    pub(crate) state_tx: watch::Sender<SessionState>,
    pub(crate) data: Arc<StdMutex<HashMap<String, serde_json::Value>>>,

    pub(crate) status: SessionStatus,
    pub(crate) call_id: String,
    pub(crate) local_tag: String,
    /// Initial INVITE: outgoing as UAC, incoming as UAS.
    pub(crate) invite: Option<SipRequest>,
    /// The confirmed dialog, at most one.
    pub(crate) dialog: Option<Dialog>,
    /// Early dialogs keyed by the full triple (forking).
    pub(crate) early_dialogs: HashMap<DialogId, Dialog>,
    pub(crate) timers: TimerSet,
    pub(crate) dtmf: DtmfQueue,
    pub(crate) is_canceled: bool,
    pub(crate) cancel_reason: Option<Reason>,
    pub(crate) received_100: bool,
    pub(crate) pending_bye: Option<PendingBye>,
    pub(crate) answer_reply: Option<AnswerReply>,
    pub(crate) retrans_interval: Duration,
    pub(crate) terminal_emitted: bool,
    pub(crate) registered: bool,
}

impl SessionInner {
    async fn dispatch(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Connect { target, options, done } => {
                self.handle_connect(target, options, done).await;
            }
            SessionCommand::Answer { options, done } => {
                self.handle_answer(options, done).await;
            }
            SessionCommand::Terminate { options, done } => {
                self.handle_terminate(options, done).await;
            }
            SessionCommand::SendDtmf { tones, duration, gap, done } => {
                self.handle_send_dtmf(tones, duration, gap, done);
            }
            SessionCommand::Response(response) => self.receive_response(response).await,
            SessionCommand::Request(request) => self.receive_request(request).await,
            SessionCommand::IncomingInvite(request) => self.init_incoming(request).await,
            SessionCommand::LocalOffer(result) => self.on_local_offer(result).await,
            SessionCommand::TimerFired { kind, generation } => {
                self.on_timer(kind, generation).await;
            }
            SessionCommand::DtmfTick { generation } => self.on_dtmf_tick(generation).await,
            SessionCommand::ServerTxTerminated => self.fire_pending_bye().await,
            SessionCommand::TransportFailure { timeout } => {
                self.on_transport_failure(timeout).await;
            }
        }
    }

    pub(crate) fn terminated(&self) -> bool {
        self.status == SessionStatus::Terminated
    }

    pub(crate) fn set_status(&mut self, status: SessionStatus) {
        debug!("session {} status: {:?} -> {:?}", self.id, self.status, status);
        self.status = status;
        self.state_tx.send_modify(|s| s.status = status);
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        debug!("session {} event: {:?}", self.id, event);
        let _ = self.events.send(event);
    }

    pub(crate) fn handle(&self) -> Session {
        Session {
            id: self.id.clone(),
            direction: self.direction,
            cmd_tx: self.cmd_tx.clone(),
            state_rx: self.state_tx.subscribe(),
            media: self.media.clone(),
            data: self.data.clone(),
        }
    }

    // --- UAC initiation -------------------------------------------------

    async fn handle_connect(
        &mut self,
        target: SipUri,
        options: ConnectOptions,
        done: oneshot::Sender<Result<()>>,
    ) {
        if self.status != SessionStatus::Null {
            let _ = done.send(Err(SessionError::InvalidState(self.status)));
            return;
        }
        if self.direction != Direction::Outgoing {
            let _ = done.send(Err(SessionError::NotSupported(
                "connect() requires an outgoing session".into(),
            )));
            return;
        }
        if !self.media.supported() {
            let _ = done.send(Err(SessionError::NotSupported(
                "media subsystem unavailable".into(),
            )));
            return;
        }

        let (from_uri, from_display) = if options.anonymous {
            (
                SipUri::parse(ANONYMOUS_URI).expect("anonymous URI is valid"),
                Some("Anonymous".to_string()),
            )
        } else {
            (self.config.local_uri.clone(), self.config.display_name.clone())
        };

        let mut headers = Headers::new();
        headers.push(Header::new("Contact", format!("<{}>", self.config.contact_uri)));
        headers.push(Header::new("Allow", ALLOWED_METHODS));
        headers.push(Header::new("Content-Type", "application/sdp"));
        if options.anonymous {
            headers.push(Header::new(
                "P-Preferred-Identity",
                format!("<{}>", self.config.local_uri),
            ));
            headers.push(Header::new("Privacy", "id"));
        }
        for header in &options.extra_headers {
            headers.push(header.clone());
        }

        self.invite = Some(SipRequest {
            method: Method::Invite,
            target: target.clone(),
            call_id: self.call_id.clone(),
            cseq: 1,
            from_uri,
            from_display,
            from_tag: self.local_tag.clone(),
            to_uri: target,
            to_tag: None,
            headers,
            body: None,
            server_tx: None,
        });

        self.registry.insert(self.handle());
        self.registered = true;
        info!(
            "session {} connecting to {}",
            self.id,
            self.invite.as_ref().map(|r| r.target.as_str()).unwrap_or_default()
        );
        self.emit(SessionEvent::NewSession { originator: Originator::Local });
        self.emit(SessionEvent::Connecting);
        let _ = done.send(Ok(()));

        // Local offer pipeline: acquire media, attach the stream, create the
        // offer, then feed the result back into the loop. `terminate()` can
        // interleave while this runs; the continuation checks the latch.
        let media = self.media.clone();
        let cmd_tx = self.cmd_tx.clone();
        let provided = options.media_stream;
        let constraints = options.media_constraints;
        tokio::spawn(async move {
            let result = async {
                let stream = match provided {
                    Some(stream) => stream,
                    None => media.acquire_user_media(constraints).await?,
                };
                media.add_stream(&stream).await?;
                media.create_offer().await
            }
            .await;
            let _ = cmd_tx.send(SessionCommand::LocalOffer(result));
        });
    }

    async fn on_local_offer(&mut self, result: std::result::Result<String, MediaError>) {
        if self.terminated() {
            return;
        }
        let sdp = match result {
            Err(MediaError::PermissionDenied) => {
                self.failed(Originator::Local, Cause::UserDeniedMediaAccess).await;
                return;
            }
            Err(error) => {
                warn!("session {} local offer failed: {error}", self.id);
                self.failed(Originator::System, error.cause()).await;
                return;
            }
            Ok(sdp) => sdp,
        };
        if self.is_canceled {
            // terminate() arrived while the offer was being prepared; the
            // INVITE never goes on the wire.
            debug!("session {} canceled before INVITE was sent", self.id);
            self.failed(Originator::Local, Cause::Canceled).await;
            return;
        }

        let invite = {
            let request = self.invite.as_mut().expect("outgoing INVITE present");
            request.body = Some(sdp);
            request.clone()
        };
        self.set_status(SessionStatus::InviteSent);
        if let Err(error) = self.driver.send_invite(&invite).await {
            warn!("session {} INVITE send failed: {error}", self.id);
            self.failed(Originator::System, Cause::ConnectionError).await;
        }
    }

    // --- termination ----------------------------------------------------

    async fn handle_terminate(
        &mut self,
        options: TerminateOptions,
        done: oneshot::Sender<Result<()>>,
    ) {
        match (self.status, self.direction) {
            (SessionStatus::Terminated, _) => {
                let _ = done.send(Err(SessionError::InvalidState(self.status)));
            }

            // Outgoing INVITE not yet answered: cancel.
            (
                SessionStatus::Null | SessionStatus::InviteSent | SessionStatus::Provisional,
                Direction::Outgoing,
            ) => {
                let reason = match self.termination_reason(&options, 200) {
                    Ok(reason) => reason,
                    Err(error) => {
                        let _ = done.send(Err(error));
                        return;
                    }
                };
                let _ = done.send(Ok(()));
                match self.status {
                    SessionStatus::Null => {
                        self.is_canceled = true;
                        self.cancel_reason = reason;
                    }
                    SessionStatus::InviteSent if !self.received_100 => {
                        // CANCEL may only chase an INVITE that got a
                        // provisional response; latch until one arrives.
                        self.is_canceled = true;
                        self.cancel_reason = reason;
                    }
                    _ => {
                        self.is_canceled = true;
                        if let Some(invite) = self.invite.clone() {
                            if let Err(error) = self.driver.cancel(&invite, reason).await {
                                warn!("session {} CANCEL send failed: {error}", self.id);
                            }
                        }
                    }
                }
            }

            // Incoming call not yet accepted: reject.
            (
                SessionStatus::WaitingForAnswer | SessionStatus::Answered,
                Direction::Incoming,
            ) => {
                let code = options.status_code.unwrap_or(480);
                if !(300..700).contains(&code) {
                    let _ = done.send(Err(SessionError::InvalidStatusCode(code)));
                    return;
                }
                let _ = done.send(Ok(()));
                let Some(invite) = self.invite.clone() else {
                    self.failed(Originator::Local, options.cause.unwrap_or(Cause::Rejected)).await;
                    return;
                };
                let phrase = options
                    .reason_phrase
                    .clone()
                    .unwrap_or_else(|| reason_phrase(code).to_string());
                if let Err(error) = self
                    .driver
                    .reply(&invite, code, Some(&phrase), options.extra_headers.clone(), options.body.clone())
                    .await
                {
                    warn!("session {} reject reply failed: {error}", self.id);
                }
                self.failed(Originator::Local, options.cause.unwrap_or(Cause::Rejected)).await;
            }

            // 2xx sent but not yet acknowledged: BYE must wait for the ACK
            // (or for the INVITE server transaction to die).
            (SessionStatus::WaitingForAck, Direction::Incoming) => {
                let reason = match self.termination_reason(&options, 200) {
                    Ok(reason) => reason,
                    Err(error) => {
                        let _ = done.send(Err(error));
                        return;
                    }
                };
                let _ = done.send(Ok(()));
                let Some(dialog) = self.dialog.clone() else {
                    // Should not happen: the dialog was confirmed at answer.
                    self.ended(Originator::Local, options.cause.unwrap_or(Cause::Bye)).await;
                    return;
                };
                let mut headers = options.extra_headers.clone();
                if let Some(reason) = reason {
                    headers.push(reason.into_header());
                }
                self.pending_bye =
                    Some(PendingBye { dialog, headers, body: options.body.clone() });
                if let Some(server_tx) =
                    self.invite.as_ref().and_then(|request| request.server_tx.clone())
                {
                    let cmd_tx = self.cmd_tx.clone();
                    tokio::spawn(async move {
                        server_tx.terminated().await;
                        let _ = cmd_tx.send(SessionCommand::ServerTxTerminated);
                    });
                }
                info!("session {} terminate deferred until ACK", self.id);
                self.ended(Originator::Local, options.cause.unwrap_or(Cause::Bye)).await;
            }

            // Established: plain in-dialog BYE.
            (SessionStatus::WaitingForAck | SessionStatus::Confirmed, _) => {
                let reason = match self.termination_reason(&options, 200) {
                    Ok(reason) => reason,
                    Err(error) => {
                        let _ = done.send(Err(error));
                        return;
                    }
                };
                let _ = done.send(Ok(()));
                let mut headers = options.extra_headers.clone();
                if let Some(reason) = reason {
                    headers.push(reason.into_header());
                }
                self.send_bye(headers, options.body.clone()).await;
                self.ended(Originator::Local, options.cause.unwrap_or(Cause::Bye)).await;
            }

            _ => {
                let _ = done.send(Err(SessionError::InvalidState(self.status)));
            }
        }
    }

    /// Validate a terminate status code against `[min, 700)` and turn it into
    /// a Reason header value. Codes in the 2xx range terminate without one.
    fn termination_reason(
        &self,
        options: &TerminateOptions,
        min: u16,
    ) -> Result<Option<Reason>> {
        let Some(code) = options.status_code else { return Ok(None) };
        if !(min..700).contains(&code) {
            return Err(SessionError::InvalidStatusCode(code));
        }
        if (200..300).contains(&code) {
            return Ok(None);
        }
        let phrase = options
            .reason_phrase
            .clone()
            .unwrap_or_else(|| reason_phrase(code).to_string());
        Ok(Some(Reason::new(code, phrase)))
    }

    /// Send BYE on the confirmed dialog, logging (not escalating) wire
    /// failures: the session is ending either way.
    pub(crate) async fn send_bye(&mut self, headers: Vec<Header>, body: Option<String>) {
        let driver = self.driver.clone();
        let Some(dialog) = self.dialog.as_mut() else {
            warn!("session {} BYE requested without a dialog", self.id);
            return;
        };
        dialog.next_local_cseq();
        if let Err(error) = driver.send_in_dialog(dialog, Method::Bye, headers, body).await {
            warn!("session {} BYE send failed: {error}", self.id);
        }
    }

    /// Fire the deferred BYE exactly once; the second trigger finds the slot
    /// empty and does nothing.
    pub(crate) async fn fire_pending_bye(&mut self) {
        let Some(pending) = self.pending_bye.take() else { return };
        let mut dialog = pending.dialog;
        dialog.next_local_cseq();
        if let Err(error) = self
            .driver
            .send_in_dialog(&dialog, Method::Bye, pending.headers, pending.body)
            .await
        {
            warn!("session {} deferred BYE send failed: {error}", self.id);
        }
        dialog.terminate();
        self.registry.unbind_dialog(&dialog.id);
        self.registry.remove(&self.id);
        self.registered = false;
        info!("session {} deferred BYE sent, dialog torn down", self.id);
    }

    // --- DTMF -----------------------------------------------------------

    fn handle_send_dtmf(
        &mut self,
        tones: Vec<char>,
        duration: u64,
        gap: u64,
        done: oneshot::Sender<Result<()>>,
    ) {
        if !matches!(self.status, SessionStatus::Confirmed | SessionStatus::WaitingForAck) {
            let _ = done.send(Err(SessionError::InvalidState(self.status)));
            return;
        }
        let was_idle = !self.dtmf.in_flight;
        for tone in tones {
            self.dtmf.queue.push_back(dtmf::QueuedTone { tone, duration, gap });
        }
        if was_idle {
            self.dtmf.in_flight = true;
            self.dtmf.schedule(Duration::ZERO);
        }
        let _ = done.send(Ok(()));
    }

    async fn on_dtmf_tick(&mut self, generation: u64) {
        if !self.dtmf.is_current(generation) {
            return;
        }
        if !matches!(self.status, SessionStatus::Confirmed | SessionStatus::WaitingForAck) {
            self.dtmf.clear();
            return;
        }
        let Some(tone) = self.dtmf.queue.pop_front() else {
            // Trailing gap of the previous burst elapsed with nothing queued.
            self.dtmf.in_flight = false;
            return;
        };
        if tone.tone == ',' {
            self.dtmf.schedule(Duration::from_millis(dtmf::COMMA_PAUSE));
            return;
        }

        let driver = self.driver.clone();
        let body = dtmf::info_body(tone.tone, tone.duration);
        let Some(dialog) = self.dialog.as_mut() else {
            self.dtmf.clear();
            return;
        };
        dialog.next_local_cseq();
        let headers = vec![Header::new("Content-Type", "application/dtmf-relay")];
        if let Err(error) = driver.send_in_dialog(dialog, Method::Info, headers, Some(body)).await
        {
            warn!("session {} DTMF INFO failed, dropping queue: {error}", self.id);
            self.dtmf.clear();
            return;
        }
        self.emit(SessionEvent::NewDtmf {
            originator: Originator::Local,
            tone: tone.tone,
            duration: tone.duration,
        });
        self.dtmf.schedule(Duration::from_millis(tone.duration + tone.gap));
    }

    // --- timers ---------------------------------------------------------

    async fn on_timer(&mut self, kind: TimerKind, generation: u64) {
        if !self.timers.is_current(kind, generation) {
            return;
        }
        match kind {
            TimerKind::Invite2xx => self.on_invite_2xx_timer().await,
            TimerKind::Ack => self.on_ack_timer().await,
            TimerKind::NoAnswer => self.on_no_answer_timer().await,
            TimerKind::Expires => self.on_expires_timer().await,
        }
    }

    /// Application-level 200 retransmission: the INVITE server transaction is
    /// destroyed on the first 2xx, so reliability is on us until the ACK.
    async fn on_invite_2xx_timer(&mut self) {
        if self.status != SessionStatus::WaitingForAck {
            return;
        }
        let Some(reply) = self.answer_reply.as_ref() else { return };
        let Some(invite) = self.invite.clone() else { return };
        debug!("session {} retransmitting 200 OK", self.id);
        if let Err(error) = self
            .driver
            .reply(&invite, 200, None, reply.headers.clone(), Some(reply.body.clone()))
            .await
        {
            warn!("session {} 200 retransmission failed: {error}", self.id);
        }
        self.retrans_interval = (self.retrans_interval * 2).min(self.config.timers.t2);
        let next = self.retrans_interval;
        self.timers.arm(TimerKind::Invite2xx, next);
    }

    async fn on_ack_timer(&mut self) {
        if self.status != SessionStatus::WaitingForAck {
            return;
        }
        warn!("session {} never received ACK", self.id);
        self.timers.cancel(TimerKind::Invite2xx);
        self.send_bye(Vec::new(), None).await;
        self.ended(Originator::Remote, Cause::NoAck).await;
    }

    async fn on_no_answer_timer(&mut self) {
        if self.status != SessionStatus::WaitingForAnswer {
            return;
        }
        info!("session {} not answered in time", self.id);
        let Some(invite) = self.invite.clone() else { return };
        if let Err(error) = self.driver.reply(&invite, 408, None, Vec::new(), None).await {
            warn!("session {} 408 reply failed: {error}", self.id);
        }
        self.failed(Originator::Local, Cause::NoAnswer).await;
    }

    async fn on_expires_timer(&mut self) {
        if self.status != SessionStatus::WaitingForAnswer {
            return;
        }
        info!("session {} INVITE expired", self.id);
        let Some(invite) = self.invite.clone() else { return };
        if let Err(error) = self.driver.reply(&invite, 487, None, Vec::new(), None).await {
            warn!("session {} 487 reply failed: {error}", self.id);
        }
        self.failed(Originator::System, Cause::Expires).await;
    }

    // --- transport failures ---------------------------------------------

    async fn on_transport_failure(&mut self, timeout: bool) {
        if self.terminated() {
            return;
        }
        let cause = if timeout { Cause::RequestTimeout } else { Cause::ConnectionError };
        if matches!(self.status, SessionStatus::Confirmed | SessionStatus::WaitingForAck) {
            self.ended(Originator::System, cause).await;
        } else {
            self.failed(Originator::System, cause).await;
        }
    }

    // --- terminal transitions -------------------------------------------

    /// Post-establishment termination: stamp `end_time`, release everything,
    /// then notify.
    pub(crate) async fn ended(&mut self, originator: Originator, cause: Cause) {
        if self.terminal_emitted {
            return;
        }
        self.terminal_emitted = true;
        let now = Utc::now();
        self.state_tx.send_modify(|s| s.end_time = Some(now));
        self.close().await;
        self.emit(SessionEvent::Ended { originator, cause });
    }

    /// Pre-establishment termination.
    pub(crate) async fn failed(&mut self, originator: Originator, cause: Cause) {
        if self.terminal_emitted {
            return;
        }
        self.terminal_emitted = true;
        self.close().await;
        self.emit(SessionEvent::Failed { originator, cause });
    }

    /// Idempotent shutdown: media, timers, dialogs, status, registry — in
    /// that order. When a deferred BYE is pending, its dialog and the
    /// session's table entry survive so the ACK can still be routed here.
    pub(crate) async fn close(&mut self) {
        if self.status == SessionStatus::Terminated {
            return;
        }
        debug!("session {} closing", self.id);
        self.media.close().await;
        self.timers.cancel_all();
        self.dtmf.clear();

        if let Some(mut dialog) = self.dialog.take() {
            let keep = self
                .pending_bye
                .as_ref()
                .map(|pending| pending.dialog.id == dialog.id)
                .unwrap_or(false);
            if !keep {
                dialog.terminate();
                self.registry.unbind_dialog(&dialog.id);
            }
        }
        for (dialog_id, mut dialog) in self.early_dialogs.drain() {
            dialog.terminate();
            self.registry.unbind_dialog(&dialog_id);
        }

        self.set_status(SessionStatus::Terminated);

        if self.registered && self.pending_bye.is_none() {
            self.registry.remove(&self.id);
            self.registered = false;
        }
    }

    pub(crate) fn mark_started_clock(&mut self) {
        let now = Utc::now();
        self.state_tx.send_modify(|s| s.start_time = Some(now));
    }
}
