//! Session-owned timers
//!
//! Four single-shot timers drive retransmission and guard behavior. A timer
//! is a spawned sleep that feeds a `TimerFired` command back into the session
//! loop; cancellation aborts the task and bumps a generation counter so a
//! fire message that already left the task is discarded on arrival.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use super::SessionCommand;

/// The four timers a session owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// UAS 2xx retransmission: starts at T1, doubles each fire, capped at T2.
    Invite2xx,
    /// ACK wait (Timer H): BYE and report no-ACK when it fires.
    Ack,
    /// UAS inactivity guard: 408 when the user never answers.
    NoAnswer,
    /// UAS honoring of the inbound Expires header: 487 on expiry.
    Expires,
}

impl std::fmt::Display for TimerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TimerKind::Invite2xx => "invite-2xx",
            TimerKind::Ack => "ack",
            TimerKind::NoAnswer => "no-answer",
            TimerKind::Expires => "expires",
        };
        write!(f, "{name}")
    }
}

#[derive(Default)]
struct Slot {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

/// Holder for the session's timer tasks. Dropping the set aborts everything
/// still pending.
pub(crate) struct TimerSet {
    tx: mpsc::UnboundedSender<SessionCommand>,
    invite_2xx: Slot,
    ack: Slot,
    no_answer: Slot,
    expires: Slot,
}

impl TimerSet {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SessionCommand>) -> Self {
        Self {
            tx,
            invite_2xx: Slot::default(),
            ack: Slot::default(),
            no_answer: Slot::default(),
            expires: Slot::default(),
        }
    }

    fn slot_mut(&mut self, kind: TimerKind) -> &mut Slot {
        match kind {
            TimerKind::Invite2xx => &mut self.invite_2xx,
            TimerKind::Ack => &mut self.ack,
            TimerKind::NoAnswer => &mut self.no_answer,
            TimerKind::Expires => &mut self.expires,
        }
    }

    fn slot(&self, kind: TimerKind) -> &Slot {
        match kind {
            TimerKind::Invite2xx => &self.invite_2xx,
            TimerKind::Ack => &self.ack,
            TimerKind::NoAnswer => &self.no_answer,
            TimerKind::Expires => &self.expires,
        }
    }

    /// Arm (or re-arm) a timer. Any previous instance of the same kind is
    /// canceled first.
    pub(crate) fn arm(&mut self, kind: TimerKind, delay: Duration) {
        let tx = self.tx.clone();
        let slot = self.slot_mut(kind);
        if let Some(handle) = slot.handle.take() {
            handle.abort();
        }
        slot.generation += 1;
        let generation = slot.generation;
        trace!("arming {kind} timer for {delay:?} (gen {generation})");
        slot.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(SessionCommand::TimerFired { kind, generation });
        }));
    }

    pub(crate) fn cancel(&mut self, kind: TimerKind) {
        let slot = self.slot_mut(kind);
        if let Some(handle) = slot.handle.take() {
            trace!("canceling {kind} timer");
            handle.abort();
        }
        slot.generation += 1;
    }

    pub(crate) fn cancel_all(&mut self) {
        for kind in [TimerKind::Invite2xx, TimerKind::Ack, TimerKind::NoAnswer, TimerKind::Expires] {
            self.cancel(kind);
        }
    }

    /// Whether a fire message belongs to the currently armed instance.
    pub(crate) fn is_current(&self, kind: TimerKind, generation: u64) -> bool {
        self.slot(kind).generation == generation
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
