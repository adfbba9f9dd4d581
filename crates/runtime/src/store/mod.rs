//! Session & Trace Store
//!
//! In-memory stores keyed by `(owner, session)` for chats and by trace
//! sequence for training records. Every operation requires a caller
//! identity; mutation is serialized per store, reads see a consistent
//! snapshot.

pub mod traces;

pub use traces::{TraceDraft, TraceStore};

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::{
    ChatMessage, OwnerId, Session, SessionId, SessionSummary, StoreError,
};

/// In-memory chat session store.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<(OwnerId, SessionId), Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn require_owner(owner: &OwnerId) -> Result<(), StoreError> {
        if owner.is_valid() {
            Ok(())
        } else {
            Err(StoreError::Forbidden)
        }
    }

    /// List an owner's sessions, newest first, id ascending on ties.
    pub fn list(
        &self,
        owner: &OwnerId,
        limit: usize,
        offset: usize,
        include_messages: bool,
    ) -> Result<Vec<SessionSummary>, StoreError> {
        Self::require_owner(owner)?;

        let sessions = self.sessions.read();
        let mut rows: Vec<&Session> = sessions
            .iter()
            .filter(|((owner_id, _), _)| owner_id == owner)
            .map(|(_, session)| session)
            .collect();
        rows.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.session_id.0.cmp(&b.session_id.0))
        });

        Ok(rows
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|session| SessionSummary {
                session_id: session.session_id.clone(),
                context_id: session.context_id.clone(),
                persona_id: session.persona_id.clone(),
                message_count: session.messages.len(),
                created_at: session.created_at,
                updated_at: session.updated_at,
                messages: include_messages.then(|| session.messages.clone()),
            })
            .collect())
    }

    /// Fetch one session, re-verifying the content hash on the way out.
    pub fn get(&self, owner: &OwnerId, session_id: &SessionId) -> Result<Session, StoreError> {
        Self::require_owner(owner)?;

        let sessions = self.sessions.read();
        let session = sessions
            .get(&(owner.clone(), session_id.clone()))
            .ok_or_else(|| StoreError::SessionNotFound {
                session_id: session_id.clone(),
            })?;

        let expected = session.compute_hash();
        if expected != session.content_hash {
            return Err(StoreError::HashMismatch { expected });
        }
        Ok(session.clone())
    }

    /// Insert or replace a session record wholesale.
    pub fn upsert(&self, session: Session) -> Result<(), StoreError> {
        Self::require_owner(&session.owner_id)?;
        let key = (session.owner_id.clone(), session.session_id.clone());
        self.sessions.write().insert(key, session);
        Ok(())
    }

    /// Append a message, creating the session on first use.
    pub fn append_message(
        &self,
        owner: &OwnerId,
        session_id: &SessionId,
        message: ChatMessage,
    ) -> Result<Session, StoreError> {
        Self::require_owner(owner)?;

        let mut sessions = self.sessions.write();
        let key = (owner.clone(), session_id.clone());
        let session = sessions
            .entry(key)
            .or_insert_with(|| Session::new(owner.clone(), session_id.clone()));
        session.append(message);
        Ok(session.clone())
    }

    pub fn delete(&self, owner: &OwnerId, session_id: &SessionId) -> Result<(), StoreError> {
        Self::require_owner(owner)?;

        let mut sessions = self.sessions.write();
        sessions
            .remove(&(owner.clone(), session_id.clone()))
            .map(|_| ())
            .ok_or_else(|| StoreError::SessionNotFound {
                session_id: session_id.clone(),
            })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> OwnerId {
        OwnerId("alice".into())
    }

    #[test]
    fn append_creates_session_on_first_use() {
        let store = SessionStore::new();
        let id = SessionId("s1".into());

        let session = store
            .append_message(&owner(), &id, ChatMessage::user("hello"))
            .unwrap();
        assert_eq!(session.messages.len(), 1);
        assert_eq!(store.session_count(), 1);
    }

    #[test]
    fn get_verifies_content_hash() {
        let store = SessionStore::new();
        let id = SessionId("s1".into());
        store
            .append_message(&owner(), &id, ChatMessage::user("hello"))
            .unwrap();

        // Untouched session reads back fine.
        assert!(store.get(&owner(), &id).is_ok());

        // Corrupt the stored hash and the read reports the expected value.
        {
            let mut sessions = store.sessions.write();
            let session = sessions.get_mut(&(owner(), id.clone())).unwrap();
            session.content_hash = "deadbeef".into();
        }
        match store.get(&owner(), &id) {
            Err(StoreError::HashMismatch { expected }) => {
                assert_ne!(expected, "deadbeef");
            }
            other => panic!("expected hash mismatch, got {other:?}"),
        }
    }

    #[test]
    fn empty_identity_is_forbidden() {
        let store = SessionStore::new();
        let result = store.list(&OwnerId("  ".into()), 10, 0, false);
        assert!(matches!(result, Err(StoreError::Forbidden)));
    }

    #[test]
    fn owners_cannot_see_each_other() {
        let store = SessionStore::new();
        let id = SessionId("shared-name".into());
        store
            .append_message(&owner(), &id, ChatMessage::user("mine"))
            .unwrap();

        let other = OwnerId("mallory".into());
        assert!(matches!(
            store.get(&other, &id),
            Err(StoreError::SessionNotFound { .. })
        ));
        assert!(store.list(&other, 10, 0, false).unwrap().is_empty());
    }

    #[test]
    fn list_orders_newest_first() {
        let store = SessionStore::new();
        store
            .append_message(&owner(), &SessionId("a".into()), ChatMessage::user("1"))
            .unwrap();
        store
            .append_message(&owner(), &SessionId("b".into()), ChatMessage::user("2"))
            .unwrap();
        store
            .append_message(&owner(), &SessionId("a".into()), ChatMessage::user("3"))
            .unwrap();

        let rows = store.list(&owner(), 10, 0, false).unwrap();
        assert_eq!(rows[0].session_id.0, "a");
        assert_eq!(rows[0].message_count, 2);
    }

    #[test]
    fn delete_removes_and_reports_missing() {
        let store = SessionStore::new();
        let id = SessionId("s1".into());
        store
            .append_message(&owner(), &id, ChatMessage::user("hello"))
            .unwrap();

        store.delete(&owner(), &id).unwrap();
        assert!(matches!(
            store.delete(&owner(), &id),
            Err(StoreError::SessionNotFound { .. })
        ));
    }
}
