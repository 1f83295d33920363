//! Response handling for the initial INVITE (UAC role)
//!
//! The request sender delivers every response to the session; dispatch order
//! is significant: 2xx retransmissions and forked branches are recognized
//! against the confirmed dialog first, then the status gate, then the
//! local-cancellation race, then response class.

use tracing::{debug, info, warn};

use super::SessionInner;
use crate::dialog::{Dialog, DialogId, DialogState};
use crate::events::SessionEvent;
use crate::signaling::{Header, Method, Reason, SipResponse};
use crate::types::{cause_for_status, reason_phrase, Cause, Originator, SessionStatus};

impl SessionInner {
    pub(crate) async fn receive_response(&mut self, response: SipResponse) {
        let code = response.status_code;

        // A 2xx on an already-confirmed session is either a retransmission
        // (our ACK got lost) or a late answer from a forked branch.
        if self.dialog.is_some() && (200..300).contains(&code) {
            self.receive_established_2xx(response).await;
            return;
        }

        if !matches!(self.status, SessionStatus::InviteSent | SessionStatus::Provisional) {
            debug!("session {} dropping {code} response in {:?}", self.id, self.status);
            return;
        }

        // Local cancellation raced the response. A provisional response
        // finally gives the transaction something to CANCEL; an answer is
        // accepted and immediately released.
        if self.is_canceled {
            if (100..200).contains(&code) {
                if let Some(invite) = self.invite.clone() {
                    let reason = self.cancel_reason.clone();
                    if let Err(error) = self.driver.cancel(&invite, reason).await {
                        warn!("session {} CANCEL send failed: {error}", self.id);
                    }
                }
                return;
            }
            if (200..300).contains(&code) {
                self.accept_and_terminate(&response, 487, reason_phrase(487)).await;
                self.failed(Originator::Local, Cause::Canceled).await;
                return;
            }
            // Failure classes fall through: the final response below carries
            // the terminal transition for the canceled INVITE.
        }

        match code {
            100 => {
                self.received_100 = true;
            }
            101..=199 => self.receive_provisional(response).await,
            200..=299 => self.receive_2xx(response).await,
            _ => {
                let (originator, cause) = if self.is_canceled {
                    (Originator::Local, Cause::Canceled)
                } else {
                    (Originator::Remote, cause_for_status(code))
                };
                info!("session {} INVITE failed with {code}", self.id);
                self.failed(originator, cause).await;
            }
        }
    }

    /// Retransmitted or forked 2xx after the dialog is confirmed.
    async fn receive_established_2xx(&mut self, response: SipResponse) {
        let confirmed = self.dialog.clone().expect("checked by caller");
        let matches_confirmed = response
            .to_tag
            .as_deref()
            .map(|tag| {
                DialogId::new(&response.call_id, &self.local_tag, tag) == confirmed.id
            })
            .unwrap_or(false);

        if matches_confirmed {
            // Our ACK was lost; answer the retransmission with exactly one
            // more ACK and change nothing else.
            debug!("session {} acknowledging 2xx retransmission", self.id);
            if let Err(error) =
                self.driver.send_in_dialog(&confirmed, Method::Ack, Vec::new(), None).await
            {
                warn!("session {} retransmission ACK failed: {error}", self.id);
            }
            return;
        }

        // Forked branch answered after we already picked a winner: accept it
        // on a throwaway dialog and politely end it. Wire errors must not
        // disturb the primary session.
        info!("session {} releasing forked 2xx branch", self.id);
        let Some(invite) = self.invite.clone() else { return };
        match Dialog::uac_from_response(&invite, &response, DialogState::Confirmed) {
            Ok(mut transient) => {
                let _ = self
                    .driver
                    .send_in_dialog(&transient, Method::Ack, Vec::new(), None)
                    .await;
                transient.next_local_cseq();
                let _ = self
                    .driver
                    .send_in_dialog(&transient, Method::Bye, Vec::new(), None)
                    .await;
            }
            Err(error) => {
                debug!("session {} cannot build forked dialog: {error}", self.id);
            }
        }
    }

    async fn receive_provisional(&mut self, response: SipResponse) {
        let Some(to_tag) = response.to_tag.clone() else {
            debug!("session {} ignoring 1xx without To tag", self.id);
            return;
        };

        if response.contact().is_some() {
            let dialog_id = DialogId::new(&response.call_id, &self.local_tag, &to_tag);
            if let Some(existing) = self.early_dialogs.get_mut(&dialog_id) {
                existing.update_from_response(&response);
            } else {
                let invite = self.invite.clone();
                let Some(invite) = invite else { return };
                match Dialog::uac_from_response(&invite, &response, DialogState::Early) {
                    Ok(dialog) => {
                        self.registry.bind_dialog(dialog.id.clone(), self.id.clone());
                        self.early_dialogs.insert(dialog.id.clone(), dialog);
                    }
                    Err(error) => {
                        debug!("session {} early dialog creation failed: {error}", self.id);
                        return;
                    }
                }
            }
        }

        self.set_status(SessionStatus::Provisional);
        self.emit(SessionEvent::Progress {
            originator: Originator::Remote,
            status_code: Some(response.status_code),
        });
    }

    async fn receive_2xx(&mut self, response: SipResponse) {
        let Some(body) = response.body.clone().filter(|b| !b.is_empty()) else {
            // An answer with no session description cannot establish media;
            // accept the dialog and immediately release it.
            warn!("session {} 2xx without session description", self.id);
            self.accept_and_terminate(&response, 400, "Missing session description").await;
            self.failed(Originator::Remote, Cause::BadMediaDescription).await;
            return;
        };

        let Some(to_tag) = response.to_tag.clone() else {
            warn!("session {} 2xx without To tag", self.id);
            self.failed(Originator::Remote, Cause::DialogError).await;
            return;
        };
        let dialog_id = DialogId::new(&response.call_id, &self.local_tag, &to_tag);

        // Promote the matching early dialog; build a confirmed one otherwise.
        let dialog = if let Some(mut early) = self.early_dialogs.remove(&dialog_id) {
            early.confirm();
            early.update_from_response(&response);
            early
        } else {
            let Some(invite) = self.invite.clone() else { return };
            match Dialog::uac_from_response(&invite, &response, DialogState::Confirmed) {
                Ok(dialog) => {
                    self.registry.bind_dialog(dialog.id.clone(), self.id.clone());
                    dialog
                }
                Err(error) => {
                    warn!("session {} dialog creation failed: {error}", self.id);
                    self.failed(Originator::Remote, Cause::DialogError).await;
                    return;
                }
            }
        };

        // The remaining early dialogs lost the race.
        for (dialog_id, mut dialog) in self.early_dialogs.drain() {
            dialog.terminate();
            self.registry.unbind_dialog(&dialog_id);
        }
        self.dialog = Some(dialog);

        match self.media.set_remote_description(crate::media::SdpKind::Answer, &body).await {
            Ok(()) => {
                if self.terminated() {
                    return;
                }
                self.set_status(SessionStatus::Confirmed);
                self.mark_started_clock();
                let dialog = self.dialog.clone().expect("just confirmed");
                if let Err(error) =
                    self.driver.send_in_dialog(&dialog, Method::Ack, Vec::new(), None).await
                {
                    warn!("session {} ACK send failed: {error}", self.id);
                    self.failed(Originator::System, Cause::ConnectionError).await;
                    return;
                }
                info!("session {} established", self.id);
                self.emit(SessionEvent::Started { originator: Originator::Remote });
            }
            Err(error) => {
                warn!("session {} answer rejected by media: {error}", self.id);
                self.accept_and_terminate(&response, 488, reason_phrase(488)).await;
                self.failed(Originator::Remote, Cause::BadMediaDescription).await;
            }
        }
    }

    /// ACK the 2xx, then release the dialog with a coded BYE. The only way to
    /// reject media once a dialog exists.
    pub(crate) async fn accept_and_terminate(
        &mut self,
        response: &SipResponse,
        code: u16,
        phrase: &str,
    ) {
        let reason_header = Header::new("Reason", Reason::new(code, phrase).to_string());

        if self.dialog.is_some() {
            let driver = self.driver.clone();
            let dialog = self.dialog.as_mut().expect("checked above");
            let _ = driver.send_in_dialog(dialog, Method::Ack, Vec::new(), None).await;
            dialog.next_local_cseq();
            let _ = driver
                .send_in_dialog(dialog, Method::Bye, vec![reason_header], None)
                .await;
            return;
        }

        let Some(invite) = self.invite.clone() else { return };
        match Dialog::uac_from_response(&invite, response, DialogState::Confirmed) {
            Ok(mut transient) => {
                let _ = self
                    .driver
                    .send_in_dialog(&transient, Method::Ack, Vec::new(), None)
                    .await;
                transient.next_local_cseq();
                let _ = self
                    .driver
                    .send_in_dialog(&transient, Method::Bye, vec![reason_header], None)
                    .await;
            }
            Err(error) => {
                debug!("session {} cannot build dialog for release: {error}", self.id);
            }
        }
    }
}
