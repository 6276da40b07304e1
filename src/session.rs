//! Conversation sessions and the store that owns them.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::approval::ToolInvocationRequest;
use crate::llm::{ModelMessage, ModelToolCall};
use crate::tools::ToolExecution;

/// A turn parked on approval decisions.
#[derive(Debug)]
pub(crate) struct PendingTurn {
    pub(crate) run_id: Uuid,
    /// History length before the turn started.
    pub(crate) turn_start: usize,
    /// Every call of the parked batch, in the order the backend sent them.
    pub(crate) batch: Vec<ModelToolCall>,
    /// Outputs of the batch's calls that already ran, keyed by call id.
    pub(crate) completed: HashMap<String, ToolExecution>,
    pub(crate) requests: Vec<ToolInvocationRequest>,
}

/// Ordered, append-only history of one conversation.
///
/// Sessions are driven through `&mut` borrows, so a single session can never
/// have two turns in flight. Cloning copies the history but never a parked
/// turn: a run handle stays redeemable in exactly one session.
#[derive(Debug)]
pub struct Session {
    id: String,
    messages: Vec<ModelMessage>,
    continuation: Option<String>,
    pending: Option<PendingTurn>,
    created_at: DateTime<Utc>,
    last_active: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            messages: Vec::new(),
            continuation: None,
            pending: None,
            created_at: now,
            last_active: now,
        }
    }

    pub fn with_generated_id() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn messages(&self) -> &[ModelMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last_message(&self) -> Option<&ModelMessage> {
        self.messages.last()
    }

    /// Backend continuation token from the latest round-trip, if any.
    pub fn continuation(&self) -> Option<&str> {
        self.continuation.as_deref()
    }

    pub fn has_pending_approvals(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending_run_id(&self) -> Option<Uuid> {
        self.pending.as_ref().map(|pending| pending.run_id)
    }

    pub fn pending_requests(&self) -> &[ToolInvocationRequest] {
        self.pending
            .as_ref()
            .map(|pending| pending.requests.as_slice())
            .unwrap_or_default()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        self.last_active
    }

    pub(crate) fn push(&mut self, message: ModelMessage) {
        self.messages.push(message);
        self.last_active = Utc::now();
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        if len < self.messages.len() {
            debug!(
                session_id = %self.id,
                dropped = self.messages.len() - len,
                "rolling back session history"
            );
            self.messages.truncate(len);
        }
    }

    pub(crate) fn set_continuation(&mut self, continuation: Option<String>) {
        self.continuation = continuation;
    }

    pub(crate) fn take_continuation(&mut self) -> Option<String> {
        self.continuation.take()
    }

    pub(crate) fn pending(&self) -> Option<&PendingTurn> {
        self.pending.as_ref()
    }

    pub(crate) fn set_pending(&mut self, pending: PendingTurn) {
        self.pending = Some(pending);
        self.last_active = Utc::now();
    }

    pub(crate) fn take_pending(&mut self) -> Option<PendingTurn> {
        self.pending.take()
    }
}

impl Clone for Session {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            messages: self.messages.clone(),
            continuation: self.continuation.clone(),
            pending: None,
            created_at: self.created_at,
            last_active: self.last_active,
        }
    }
}

pub type SharedSession = Arc<Mutex<Session>>;

/// Explicit id → session map owned by the hosting application.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SharedSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<SharedSession> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Returns the session for `id`, creating an empty one on first use.
    /// The flag is `true` when the session was just created.
    pub fn get_or_create(&self, id: &str) -> (SharedSession, bool) {
        if let Some(session) = self.get(id) {
            return (session, false);
        }

        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = sessions.get(id) {
            return (session.clone(), false);
        }
        let session = Arc::new(Mutex::new(Session::new(id)));
        sessions.insert(id.to_string(), session.clone());
        info!(session_id = id, "created session");
        (session, true)
    }

    /// Stores `session` under its own id, replacing any previous entry.
    pub fn insert(&self, session: Session) -> SharedSession {
        let id = session.id().to_string();
        let shared = Arc::new(Mutex::new(session));
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, shared.clone());
        shared
    }

    pub fn evict(&self, id: &str) -> Option<SharedSession> {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if removed.is_some() {
            info!(session_id = id, "evicted session");
        }
        removed
    }

    /// Evicts sessions idle for longer than `max_idle`. Sessions that are in
    /// use or still waiting on approvals are kept.
    pub fn evict_idle(&self, max_idle: Duration) -> Vec<String> {
        let cutoff = Utc::now() - max_idle;
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        let stale = sessions
            .iter()
            .filter(|(_, session)| {
                session.try_lock().is_ok_and(|session| {
                    !session.has_pending_approvals() && session.last_active() < cutoff
                })
            })
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();

        for id in &stale {
            sessions.remove(id);
        }
        if !stale.is_empty() {
            info!(evicted = stale.len(), "evicted idle sessions");
        }
        stale
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        ids.sort();
        ids
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
