//! Per-chat registration dialog state (spec §4.6).
//!
//! Mirrors the `SessionStore` shape used for per-principal session memory
//! elsewhere in this codebase: a plain `HashMap` keyed by chat, guarded by
//! a mutex, with a single writer (the update handler) per chat.

use std::collections::HashMap;
use std::sync::Mutex;

/// How the user chose to link their Telegram account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkingMethod {
    /// Via the "share contact" button (phone number).
    Contact,
    /// Via free-text email.
    Email,
}

/// Registration dialog step for one chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStep {
    /// `/start` has been sent, no method chosen yet.
    Start,
    /// Waiting on a contact share or a free-text email reply.
    AwaitingContact,
}

/// Per-chat registration state (spec §4.6 "per-chat state machine").
#[derive(Debug, Clone, Copy)]
pub struct RegistrationSession {
    /// Current dialog step.
    pub step: RegistrationStep,
    /// `true` while the bot expects a contact share or email reply.
    pub awaiting_contact: bool,
    /// Which path the user is on, once chosen.
    pub linking_method: Option<LinkingMethod>,
}

impl Default for RegistrationSession {
    fn default() -> Self {
        Self {
            step: RegistrationStep::Start,
            awaiting_contact: false,
            linking_method: None,
        }
    }
}

/// Per-chat session store for one bot worker.
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<i64, RegistrationSession>>,
}

impl SessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin (or restart) the registration dialog for `chat_id`, choosing
    /// `method` as the active path.
    pub fn begin_registration(&self, chat_id: i64, method: LinkingMethod) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.insert(
            chat_id,
            RegistrationSession {
                step: RegistrationStep::AwaitingContact,
                awaiting_contact: true,
                linking_method: Some(method),
            },
        );
    }

    /// `true` when `chat_id` is currently awaiting a contact/email reply.
    pub fn is_awaiting_contact(&self, chat_id: i64) -> bool {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.get(&chat_id).map(|s| s.awaiting_contact).unwrap_or(false)
    }

    /// Clear the dialog for `chat_id` on successful registration (spec
    /// §4.6: "on success `awaitingContact` is cleared").
    pub fn clear(&self, chat_id: i64) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.remove(&chat_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_registration_sets_awaiting_contact() {
        let store = SessionStore::new();
        store.begin_registration(42, LinkingMethod::Email);
        assert!(store.is_awaiting_contact(42));
    }

    #[test]
    fn clear_removes_the_session() {
        let store = SessionStore::new();
        store.begin_registration(42, LinkingMethod::Contact);
        store.clear(42);
        assert!(!store.is_awaiting_contact(42));
    }

    #[test]
    fn unknown_chat_is_not_awaiting() {
        let store = SessionStore::new();
        assert!(!store.is_awaiting_contact(999));
    }
}
