use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

use crate::types::ChatMessage;

use super::context::Context;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid session ID")]
    NotFound,
    #[error("A request is already running for this session")]
    Busy,
}

/// One browser chat.
#[derive(Debug)]
pub struct ChatSession {
    pub id: String,
    pub context: Context,
    pub transcript: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    active: Option<CancellationToken>,
    // Bumped by every clear.
    generation: u64,
}

impl ChatSession {
    fn new(id: String, context: Context) -> Self {
        let now = Utc::now();
        ChatSession {
            id,
            context,
            transcript: Vec::new(),
            created_at: now,
            updated_at: now,
            active: None,
            generation: 0,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
    pub busy: bool,
}

type SharedSession = Arc<Mutex<ChatSession>>;

fn lock(session: &SharedSession) -> MutexGuard<'_, ChatSession> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory sessions keyed by id. Locks are never held across an `.await`.
#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, SharedSession>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session and return its id.
    pub fn create(&self, context: Context) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(Mutex::new(ChatSession::new(id.clone(), context)));
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), session);
        tracing::debug!(session_id = %id, "session created");
        id
    }

    pub fn get(&self, id: &str) -> Option<SharedSession> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn with<T>(&self, id: &str, f: impl FnOnce(&mut ChatSession) -> T) -> Result<T, SessionError> {
        let session = self.get(id).ok_or(SessionError::NotFound)?;
        let mut guard = lock(&session);
        Ok(f(&mut guard))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Remove a session, cancelling its running request.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        match removed {
            Some(session) => {
                if let Some(token) = lock(&session).active.take() {
                    token.cancel();
                }
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let sessions: Vec<SharedSession> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut summaries: Vec<SessionSummary> = sessions
            .iter()
            .map(|s| {
                let s = lock(s);
                SessionSummary {
                    id: s.id.clone(),
                    created_at: s.created_at,
                    updated_at: s.updated_at,
                    message_count: s.transcript.len(),
                    busy: s.is_busy(),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    /// Claim the session for a new request.
    pub fn begin_request(&self, id: &str) -> Result<CancellationToken, SessionError> {
        self.with(id, |session| {
            if session.active.is_some() {
                return Err(SessionError::Busy);
            }
            let token = CancellationToken::new();
            session.active = Some(token.clone());
            Ok(token)
        })?
    }

    /// Cancel the running request; false when nothing was running.
    pub fn cancel(&self, id: &str) -> bool {
        self.with(id, |session| match &session.active {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        })
        .unwrap_or(false)
    }

    pub fn finish_request(&self, id: &str) {
        let _ = self.with(id, |session| session.active = None);
    }

    pub fn append(&self, id: &str, message: ChatMessage) -> Result<(), SessionError> {
        self.with(id, |session| {
            session.transcript.push(message);
            session.touch();
        })
    }

    pub fn transcript(&self, id: &str) -> Option<Vec<ChatMessage>> {
        self.with(id, |session| session.transcript.clone()).ok()
    }

    pub fn context(&self, id: &str) -> Option<Context> {
        self.with(id, |session| session.context.clone()).ok()
    }

    /// The context together with the generation it belongs to.
    pub fn checkout(&self, id: &str) -> Option<(Context, u64)> {
        self.with(id, |session| (session.context.clone(), session.generation))
            .ok()
    }

    /// Store a context taken with [`checkout`](Self::checkout). Returns false and
    /// keeps the stored context when the session was cleared in between.
    pub fn commit_context(
        &self,
        id: &str,
        context: Context,
        generation: u64,
    ) -> Result<bool, SessionError> {
        self.with(id, |session| {
            if session.generation != generation {
                return false;
            }
            session.context = context;
            session.touch();
            true
        })
    }

    /// Empty the transcript and the conversation history.
    pub fn clear(&self, id: &str) -> Result<(), SessionError> {
        self.with(id, |session| {
            session.transcript.clear();
            session.context.clear();
            session.generation += 1;
            session.touch();
        })
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let store = SessionStore::new();
        let a = store.create(Context::default());
        let b = store.create(Context::default());
        assert_ne!(a, b);
        assert!(store.contains(&a) && store.contains(&b));
        assert_eq!(store.list().len(), 2);
    }

    #[test]
    fn one_request_at_a_time() {
        let store = SessionStore::new();
        let id = store.create(Context::default());

        let token = store.begin_request(&id).unwrap();
        assert_eq!(store.begin_request(&id).unwrap_err(), SessionError::Busy);

        assert!(store.cancel(&id));
        assert!(token.is_cancelled());

        store.finish_request(&id);
        assert!(!store.cancel(&id));
        assert!(store.begin_request(&id).is_ok());
    }

    #[test]
    fn transcript_keeps_append_order() {
        let store = SessionStore::new();
        let id = store.create(Context::default());
        store.append(&id, ChatMessage::user("m1", "first")).unwrap();
        store
            .append(&id, ChatMessage::assistant("m1", "second", false))
            .unwrap();

        let ids: Vec<_> = store
            .transcript(&id)
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["user-m1", "assistant-m1"]);

        let (mut context, generation) = store.checkout(&id).unwrap();
        context.add_user("first");
        assert!(store.commit_context(&id, context, generation).unwrap());
        assert_eq!(store.context(&id).unwrap().len(), 1);

        store.clear(&id).unwrap();
        assert!(store.transcript(&id).unwrap().is_empty());
        assert!(store.context(&id).unwrap().is_empty());
    }

    #[test]
    fn clear_wins_over_an_older_checkout() {
        let store = SessionStore::new();
        let id = store.create(Context::default());

        let (mut context, generation) = store.checkout(&id).unwrap();
        context.add_user("before clear");
        store.clear(&id).unwrap();

        assert!(!store.commit_context(&id, context, generation).unwrap());
        assert!(store.context(&id).unwrap().is_empty());

        let (mut context, generation) = store.checkout(&id).unwrap();
        context.add_user("after clear");
        assert!(store.commit_context(&id, context, generation).unwrap());
        assert_eq!(store.context(&id).unwrap().len(), 1);
    }

    #[test]
    fn unknown_sessions() {
        let store = SessionStore::new();
        assert_eq!(store.begin_request("nope").unwrap_err(), SessionError::NotFound);
        assert!(store.append("nope", ChatMessage::error("x")).is_err());
        assert!(store.transcript("nope").is_none());
        assert!(!store.cancel("nope"));
        assert!(!store.remove("nope"));
    }

    #[test]
    fn removing_cancels_running_request() {
        let store = SessionStore::new();
        let id = store.create(Context::default());
        let token = store.begin_request(&id).unwrap();
        assert!(store.remove(&id));
        assert!(token.is_cancelled());
        assert!(store.is_empty());
    }
}
