//! SIP dialogs (RFC 3261 §12)
//!
//! A dialog is identified by the `(call_id, local_tag, remote_tag)` triple.
//! Early dialogs share call-id and local tag but differ in remote tag when an
//! INVITE forks; the session promotes the one matching the first acceptable
//! 2xx and discards the rest.

use thiserror::Error;
use tracing::debug;

use crate::signaling::{contact_uri, SipRequest, SipResponse, SipUri};

/// Dialog identifier triple.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogId {
    pub fn new(
        call_id: impl Into<String>,
        local_tag: impl Into<String>,
        remote_tag: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        }
    }
}

impl std::fmt::Display for DialogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.call_id, self.local_tag, self.remote_tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DialogError {
    #[error("missing To tag")]
    MissingToTag,

    #[error("missing Contact header field")]
    MissingContact,
}

/// A single peer-to-peer SIP relationship.
#[derive(Debug, Clone)]
pub struct Dialog {
    pub id: DialogId,
    pub state: DialogState,
    pub local_uri: SipUri,
    pub remote_uri: SipUri,
    /// Where in-dialog requests are sent (the peer's Contact).
    pub remote_target: SipUri,
    pub local_seq: u32,
    pub remote_seq: u32,
    pub route_set: Vec<String>,
}

impl Dialog {
    /// Build a UAC-side dialog from a provisional or final response to the
    /// initial INVITE. Local identity comes from the request's From side.
    pub fn uac_from_response(
        invite: &SipRequest,
        response: &SipResponse,
        state: DialogState,
    ) -> Result<Self, DialogError> {
        let remote_tag = response.to_tag.clone().ok_or(DialogError::MissingToTag)?;
        let contact = response.contact().ok_or(DialogError::MissingContact)?;
        let remote_target = contact_uri(contact).map_err(|_| DialogError::MissingContact)?;

        // Record-Route set is applied in reverse on the initiating side.
        let route_set = response
            .headers
            .get_all("Record-Route")
            .into_iter()
            .rev()
            .map(str::to_string)
            .collect();

        let id = DialogId::new(&response.call_id, &invite.from_tag, remote_tag);
        debug!("UAC dialog {} created ({:?})", id, state);
        Ok(Self {
            id,
            state,
            local_uri: invite.from_uri.clone(),
            remote_uri: invite.to_uri.clone(),
            remote_target,
            local_seq: invite.cseq,
            remote_seq: 0,
            route_set,
        })
    }

    /// Build a UAS-side dialog from an incoming INVITE and the locally minted
    /// To tag. Local identity comes from the request's To side.
    pub fn uas_from_request(
        request: &SipRequest,
        local_tag: &str,
        state: DialogState,
    ) -> Result<Self, DialogError> {
        let contact = request.contact().ok_or(DialogError::MissingContact)?;
        let remote_target = contact_uri(contact).map_err(|_| DialogError::MissingContact)?;

        let route_set = request
            .headers
            .get_all("Record-Route")
            .into_iter()
            .map(str::to_string)
            .collect();

        let id = DialogId::new(&request.call_id, local_tag, &request.from_tag);
        debug!("UAS dialog {} created ({:?})", id, state);
        Ok(Self {
            id,
            state,
            local_uri: request.to_uri.clone(),
            remote_uri: request.from_uri.clone(),
            remote_target,
            local_seq: 0,
            remote_seq: request.cseq,
            route_set,
        })
    }

    /// Promote an early dialog on the matching 2xx.
    pub fn confirm(&mut self) {
        debug!("dialog {} confirmed", self.id);
        self.state = DialogState::Confirmed;
    }

    /// Refresh the remote target from a later response on the same dialog.
    pub fn update_from_response(&mut self, response: &SipResponse) {
        if let Some(contact) = response.contact() {
            if let Ok(target) = contact_uri(contact) {
                self.remote_target = target;
            }
        }
    }

    pub fn terminate(&mut self) {
        debug!("dialog {} terminated", self.id);
        self.state = DialogState::Terminated;
    }

    pub fn is_terminated(&self) -> bool {
        self.state == DialogState::Terminated
    }

    /// Allocate the CSeq for the next in-dialog request (not used for ACK,
    /// which reuses the INVITE's sequence number).
    pub fn next_local_cseq(&mut self) -> u32 {
        self.local_seq += 1;
        self.local_seq
    }
}
