//! Observable session events
//!
//! Every session publishes its lifecycle over a channel supplied at
//! construction. Events are emitted in a fixed order: `NewSession`, then
//! `Connecting?`, `Progress*`, optionally `Started` followed by `NewDtmf*`,
//! and at most one terminal `Ended` or `Failed`.

use tokio::sync::mpsc;

use crate::types::{Cause, Originator};

/// Structured event payloads, one variant per observable event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session became visible to the application (outgoing: at `connect`,
    /// incoming: once the offer was accepted and 180 sent).
    NewSession { originator: Originator },
    /// The session is about to transmit its offer or answer.
    Connecting,
    /// A provisional response was received (UAC) or sent (UAS).
    Progress { originator: Originator, status_code: Option<u16> },
    /// The call is established end to end.
    Started { originator: Originator },
    /// A DTMF tone was sent or received out of band.
    NewDtmf { originator: Originator, tone: char, duration: u64 },
    /// Post-establishment termination.
    Ended { originator: Originator, cause: Cause },
    /// Pre-establishment termination.
    Failed { originator: Originator, cause: Cause },
}

pub type EventSender = mpsc::UnboundedSender<SessionEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Convenience constructor for the event channel a session publishes on.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
