//! Session and dialog routing tables
//!
//! The user agent owns one registry. Sessions insert themselves when they go
//! live on the wire and remove themselves on close; dialog bindings let the
//! transaction layer route in-dialog requests (most importantly the ACK that
//! releases a deferred BYE) back to the owning session.

use std::sync::Arc;

use dashmap::DashMap;

use crate::dialog::DialogId;
use crate::session::Session;
use crate::types::SessionId;

/// Weak back-reference table: lookup, not ownership. The handles stored here
/// are clones; the session task keeps itself alive.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Session>,
    dialogs: DashMap<DialogId, SessionId>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, session: Session) {
        self.sessions.insert(session.id().clone(), session);
    }

    pub fn remove(&self, id: &SessionId) {
        self.sessions.remove(id);
    }

    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Route an in-dialog request to its session.
    pub fn session_for_dialog(&self, dialog_id: &DialogId) -> Option<Session> {
        let id = self.dialogs.get(dialog_id)?.clone();
        self.get(&id)
    }

    pub fn bind_dialog(&self, dialog_id: DialogId, session_id: SessionId) {
        self.dialogs.insert(dialog_id, session_id);
    }

    pub fn unbind_dialog(&self, dialog_id: &DialogId) {
        self.dialogs.remove(dialog_id);
    }

    pub fn dialog_count(&self) -> usize {
        self.dialogs.len()
    }
}
