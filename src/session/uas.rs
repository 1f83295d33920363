//! Incoming INVITE handling and in-dialog dispatch (UAS role)

use tracing::{debug, info, warn};

use super::dtmf;
use super::timer::TimerKind;
use super::{AnswerReply, SessionInner};
use crate::config::AnswerOptions;
use crate::dialog::{Dialog, DialogId, DialogState};
use crate::errors::{Result, SessionError};
use crate::events::SessionEvent;
use crate::media::{MediaError, SdpKind};
use crate::signaling::{Header, Method, SipRequest};
use crate::types::{Cause, Direction, Originator, SessionStatus};
use tokio::sync::oneshot;

fn content_type_is(request: &SipRequest, mime: &str) -> bool {
    request
        .content_type()
        .map(|value| {
            value
                .split(';')
                .next()
                .unwrap_or("")
                .trim()
                .eq_ignore_ascii_case(mime)
        })
        .unwrap_or(false)
}

impl SessionInner {
    /// Entry point for a fresh INVITE. Validates the offer, sends the 180 and
    /// surfaces the session to the application; rejections happen before the
    /// session becomes observable, so they close quietly.
    pub(crate) async fn init_incoming(&mut self, request: SipRequest) {
        let has_sdp = request.body.as_deref().map(|b| !b.is_empty()).unwrap_or(false)
            && content_type_is(&request, "application/sdp");
        if !has_sdp {
            debug!("session {} INVITE without SDP offer, replying 415", self.id);
            if let Err(error) = self.driver.reply(&request, 415, None, Vec::new(), None).await {
                warn!("session {} 415 reply failed: {error}", self.id);
            }
            self.close().await;
            return;
        }

        self.set_status(SessionStatus::InviteReceived);

        // Early dialog backing the 180 (and later the 200 on answer).
        let dialog = match Dialog::uas_from_request(&request, &self.local_tag, DialogState::Early)
        {
            Ok(dialog) => dialog,
            Err(error) => {
                warn!("session {} cannot create dialog: {error}", self.id);
                if let Err(error) = self
                    .driver
                    .reply(&request, 500, Some("Missing Contact header field"), Vec::new(), None)
                    .await
                {
                    warn!("session {} 500 reply failed: {error}", self.id);
                }
                self.close().await;
                return;
            }
        };

        self.registry.insert(self.handle());
        self.registered = true;
        self.registry.bind_dialog(dialog.id.clone(), self.id.clone());
        self.early_dialogs.insert(dialog.id.clone(), dialog);

        let offer = request.body.clone().unwrap_or_default();
        self.invite = Some(request.clone());

        match self.media.set_remote_description(SdpKind::Offer, &offer).await {
            Err(error) => {
                info!("session {} SDP offer rejected: {error}", self.id);
                if let Err(error) = self.driver.reply(&request, 488, None, Vec::new(), None).await
                {
                    warn!("session {} 488 reply failed: {error}", self.id);
                }
                self.close().await;
            }
            Ok(()) => {
                if self.terminated() {
                    return;
                }
                let contact =
                    Header::new("Contact", format!("<{}>", self.config.contact_uri));
                if let Err(error) =
                    self.driver.reply(&request, 180, None, vec![contact], None).await
                {
                    warn!("session {} 180 reply failed: {error}", self.id);
                }
                self.set_status(SessionStatus::WaitingForAnswer);
                self.timers.arm(TimerKind::NoAnswer, self.config.no_answer_timeout);
                if let Some(expires) = request.expires() {
                    self.timers.arm(TimerKind::Expires, expires);
                }
                info!("session {} ringing", self.id);
                self.emit(SessionEvent::NewSession { originator: Originator::Remote });
                self.emit(SessionEvent::Progress {
                    originator: Originator::Local,
                    status_code: Some(180),
                });
            }
        }
    }

    /// Accept the call: confirm the dialog, attach local media, answer the
    /// offer and send the 200, then wait for the ACK.
    pub(crate) async fn handle_answer(
        &mut self,
        options: AnswerOptions,
        done: oneshot::Sender<Result<()>>,
    ) {
        if self.direction != Direction::Incoming {
            let _ = done.send(Err(SessionError::NotSupported(
                "answer() requires an incoming session".into(),
            )));
            return;
        }
        if self.status != SessionStatus::WaitingForAnswer {
            let _ = done.send(Err(SessionError::InvalidState(self.status)));
            return;
        }
        let Some(invite) = self.invite.clone() else {
            let _ = done.send(Err(SessionError::InvalidState(self.status)));
            return;
        };
        let _ = done.send(Ok(()));

        self.set_status(SessionStatus::Answered);

        let dialog_id = DialogId::new(&self.call_id, &self.local_tag, &invite.from_tag);
        let dialog = if let Some(mut early) = self.early_dialogs.remove(&dialog_id) {
            early.confirm();
            early
        } else {
            match Dialog::uas_from_request(&invite, &self.local_tag, DialogState::Confirmed) {
                Ok(dialog) => {
                    self.registry.bind_dialog(dialog.id.clone(), self.id.clone());
                    dialog
                }
                Err(error) => {
                    warn!("session {} cannot confirm dialog: {error}", self.id);
                    if let Err(error) = self
                        .driver
                        .reply(&invite, 500, Some("Error creating dialog"), Vec::new(), None)
                        .await
                    {
                        warn!("session {} 500 reply failed: {error}", self.id);
                    }
                    self.failed(Originator::System, Cause::DialogError).await;
                    return;
                }
            }
        };
        self.dialog = Some(dialog);

        self.timers.cancel(TimerKind::NoAnswer);

        let stream = match options.media_stream.clone() {
            Some(stream) => stream,
            None => match self.media.acquire_user_media(options.media_constraints).await {
                Ok(stream) => stream,
                Err(MediaError::PermissionDenied) => {
                    self.refuse_media(&invite, Originator::Local, Cause::UserDeniedMediaAccess)
                        .await;
                    return;
                }
                Err(error) => {
                    warn!("session {} user media failed: {error}", self.id);
                    self.refuse_media(&invite, Originator::System, Cause::WebrtcError).await;
                    return;
                }
            },
        };

        if let Err(error) = self.media.add_stream(&stream).await {
            warn!("session {} stream attachment failed: {error}", self.id);
            self.refuse_media(&invite, Originator::System, Cause::WebrtcError).await;
            return;
        }

        self.emit(SessionEvent::Connecting);

        let sdp = match self.media.create_answer().await {
            Ok(sdp) => sdp,
            Err(error) => {
                warn!("session {} answer creation failed: {error}", self.id);
                self.refuse_media(&invite, Originator::System, Cause::WebrtcError).await;
                return;
            }
        };

        let mut headers = vec![Header::new("Contact", format!("<{}>", self.config.contact_uri))];
        headers.extend(options.extra_headers.iter().cloned());

        match self
            .driver
            .reply(&invite, 200, None, headers.clone(), Some(sdp.clone()))
            .await
        {
            Err(error) => {
                warn!("session {} 200 reply failed: {error}", self.id);
                self.failed(Originator::System, Cause::ConnectionError).await;
            }
            Ok(()) => {
                self.set_status(SessionStatus::WaitingForAck);
                self.answer_reply = Some(AnswerReply { headers, body: sdp });
                // The INVITE server transaction dies with the first 2xx;
                // retransmission is ours until the ACK arrives.
                self.retrans_interval = self.config.timers.t1;
                self.timers.arm(TimerKind::Invite2xx, self.config.timers.t1);
                self.timers.arm(TimerKind::Ack, self.config.timers.timer_h);
                self.mark_started_clock();
                info!("session {} answered, waiting for ACK", self.id);
                self.emit(SessionEvent::Started { originator: Originator::Local });
            }
        }
    }

    /// Media-path failure while answering: 480 out, session failed.
    async fn refuse_media(&mut self, invite: &SipRequest, originator: Originator, cause: Cause) {
        if let Err(error) = self.driver.reply(invite, 480, None, Vec::new(), None).await {
            warn!("session {} 480 reply failed: {error}", self.id);
        }
        self.failed(originator, cause).await;
    }

    /// In-dialog requests and CANCEL.
    pub(crate) async fn receive_request(&mut self, request: SipRequest) {
        // The deferred BYE rides on the next ACK even though the session is
        // already terminated for observers.
        if self.pending_bye.is_some() && request.method == Method::Ack {
            self.fire_pending_bye().await;
            return;
        }
        if self.terminated() {
            debug!("session {} dropping {} after termination", self.id, request.method);
            return;
        }

        match request.method {
            Method::Cancel => {
                if self.status == SessionStatus::WaitingForAnswer {
                    info!("session {} canceled by peer", self.id);
                    self.set_status(SessionStatus::Canceled);
                    if let Some(invite) = self.invite.clone() {
                        if let Err(error) =
                            self.driver.reply(&invite, 487, None, Vec::new(), None).await
                        {
                            warn!("session {} 487 reply failed: {error}", self.id);
                        }
                    }
                    self.failed(Originator::Remote, Cause::Canceled).await;
                } else {
                    // Too late: the INVITE already has a final answer.
                    debug!("session {} ignoring late CANCEL", self.id);
                }
            }

            Method::Ack => {
                if self.status == SessionStatus::WaitingForAck {
                    self.timers.cancel(TimerKind::Ack);
                    self.timers.cancel(TimerKind::Invite2xx);
                    self.set_status(SessionStatus::Confirmed);
                    info!("session {} confirmed", self.id);
                }
            }

            Method::Bye => {
                if self.status == SessionStatus::Confirmed {
                    if let Err(error) =
                        self.driver.reply(&request, 200, None, Vec::new(), None).await
                    {
                        warn!("session {} BYE reply failed: {error}", self.id);
                    }
                    if let Some(dialog) = self.dialog.as_mut() {
                        dialog.remote_seq = request.cseq;
                    }
                    info!("session {} ended by peer", self.id);
                    self.ended(Originator::Remote, Cause::Bye).await;
                } else {
                    debug!("session {} ignoring BYE in {:?}", self.id, self.status);
                }
            }

            Method::Invite => {
                if self.status == SessionStatus::Confirmed {
                    // Renegotiation is out of scope for this core.
                    info!("session {} received re-INVITE, ignoring", self.id);
                }
            }

            Method::Info => {
                if matches!(self.status, SessionStatus::Confirmed | SessionStatus::WaitingForAck)
                {
                    if let Err(error) =
                        self.driver.reply(&request, 200, None, Vec::new(), None).await
                    {
                        warn!("session {} INFO reply failed: {error}", self.id);
                    }
                    if content_type_is(&request, "application/dtmf-relay") {
                        let body = request.body.as_deref().unwrap_or("");
                        if let Some((tone, duration)) = dtmf::parse_info_body(body) {
                            self.emit(SessionEvent::NewDtmf {
                                originator: Originator::Remote,
                                tone,
                                duration,
                            });
                        }
                    }
                }
            }

            other => {
                debug!("session {} unhandled in-dialog {other}", self.id);
            }
        }
    }
}
