//! In-process conversation service.
//!
//! Mirrors the remote service closely enough to drive the sync core in tests and in
//! the QA runner: sessions come back most recently updated first, a send persists the
//! user message and an assistant reply, and every call can be failed or held open.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Semaphore;

use super::error::{TransportError, TransportResult};
use super::ids::{MessageId, SessionId};
use super::types::{Message, MessageRole, Session, current_unix_timestamp_millis};
use super::{BoxFuture, ConversationTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportOp {
    ListSessions,
    CreateSession,
    DeleteSession,
    RenameSession,
    ListMessages,
    SendMessage,
}

impl TransportOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ListSessions => "list-sessions",
            Self::CreateSession => "create-session",
            Self::DeleteSession => "delete-session",
            Self::RenameSession => "rename-session",
            Self::ListMessages => "list-messages",
            Self::SendMessage => "send-message",
        }
    }
}

type Responder = Arc<dyn Fn(&str) -> String + Send + Sync>;

struct StoredSession {
    session: Session,
    messages: Vec<Message>,
}

#[derive(Default)]
struct MemoryState {
    sessions: Vec<StoredSession>,
    next_session_id: u64,
    next_message_id: u64,
    last_timestamp_millis: u64,
    calls: HashMap<TransportOp, usize>,
    failures: HashMap<TransportOp, VecDeque<TransportError>>,
    holds: HashMap<TransportOp, Arc<Semaphore>>,
}

impl MemoryState {
    // Strictly increasing so recency ordering never ties inside one test.
    fn tick(&mut self) -> u64 {
        let now = current_unix_timestamp_millis().max(self.last_timestamp_millis + 1);
        self.last_timestamp_millis = now;
        now
    }

    fn alloc_session_id(&mut self) -> SessionId {
        self.next_session_id += 1;
        SessionId::new(self.next_session_id.to_string())
    }

    fn alloc_message_id(&mut self) -> MessageId {
        self.next_message_id += 1;
        MessageId::new(format!("m-{}", self.next_message_id))
    }

    fn find_mut(
        &mut self,
        session_id: &SessionId,
        stage: &'static str,
    ) -> TransportResult<&mut StoredSession> {
        self.sessions
            .iter_mut()
            .find(|stored| stored.session.id == *session_id)
            .ok_or_else(|| session_not_found(stage))
    }

    fn append(
        &mut self,
        session_id: &SessionId,
        role: MessageRole,
        content: &str,
    ) -> TransportResult<Message> {
        let message_id = self.alloc_message_id();
        let created_at = self.tick();
        let stored = self.find_mut(session_id, "memory-append-message")?;
        let message = Message::new(message_id, role, content, created_at);
        stored.messages.push(message.clone());
        stored.session.updated_at_unix_millis = created_at;
        stored.session.message_count = stored.messages.len() as u64;
        Ok(message)
    }
}

pub struct MemoryTransport {
    state: Mutex<MemoryState>,
    responder: Responder,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_responder(|content| format!("You asked: {content}"))
    }

    /// Uses `responder` to produce the assistant reply for each sent message.
    pub fn with_responder(responder: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            responder: Arc::new(responder),
        }
    }

    pub fn seed_session(&self, title: impl Into<String>) -> SessionId {
        let mut state = self.lock_state();
        let session_id = state.alloc_session_id();
        let created_at = state.tick();
        state.sessions.push(StoredSession {
            session: Session::new(session_id.clone(), title, created_at),
            messages: Vec::new(),
        });
        session_id
    }

    pub fn seed_message(
        &self,
        session_id: &SessionId,
        role: MessageRole,
        content: &str,
    ) -> TransportResult<Message> {
        self.lock_state().append(session_id, role, content)
    }

    /// Makes the next call of `op` fail with `error`; queued failures fire in order.
    pub fn fail_next(&self, op: TransportOp, error: TransportError) {
        self.lock_state()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Keeps every call of `op` pending until the returned hold is released or dropped.
    pub fn hold(&self, op: TransportOp) -> TransportHold {
        let gate = Arc::new(Semaphore::new(0));
        self.lock_state().holds.insert(op, Arc::clone(&gate));
        TransportHold { op, gate }
    }

    pub fn calls(&self, op: TransportOp) -> usize {
        self.lock_state().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn sessions(&self) -> Vec<Session> {
        sorted_sessions(&self.lock_state())
    }

    pub fn messages(&self, session_id: &SessionId) -> Vec<Message> {
        self.lock_state()
            .sessions
            .iter()
            .find(|stored| stored.session.id == *session_id)
            .map(|stored| stored.messages.clone())
            .unwrap_or_default()
    }

    async fn enter(&self, op: TransportOp) -> TransportResult<()> {
        let gate = {
            let mut state = self.lock_state();
            *state.calls.entry(op).or_default() += 1;
            state.holds.get(&op).cloned()
        };

        if let Some(gate) = gate {
            // A released hold closes the semaphore, which wakes every waiter at once.
            let _ = gate.acquire().await;
        }

        match self
            .lock_state()
            .failures
            .get_mut(&op)
            .and_then(VecDeque::pop_front)
        {
            Some(error) => {
                tracing::debug!(op = op.name(), %error, "memory transport injected failure");
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        formatter
            .debug_struct("MemoryTransport")
            .field("sessions", &state.sessions.len())
            .field("calls", &state.calls)
            .finish()
    }
}

impl ConversationTransport for MemoryTransport {
    fn list_sessions(&self) -> BoxFuture<'_, TransportResult<Vec<Session>>> {
        Box::pin(async move {
            self.enter(TransportOp::ListSessions).await?;
            Ok(sorted_sessions(&self.lock_state()))
        })
    }

    fn create_session<'a>(&'a self, title: &'a str) -> BoxFuture<'a, TransportResult<Session>> {
        Box::pin(async move {
            self.enter(TransportOp::CreateSession).await?;
            let mut state = self.lock_state();
            let session_id = state.alloc_session_id();
            let created_at = state.tick();
            let session = Session::new(session_id, title, created_at);
            state.sessions.push(StoredSession {
                session: session.clone(),
                messages: Vec::new(),
            });
            Ok(session)
        })
    }

    fn delete_session<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move {
            self.enter(TransportOp::DeleteSession).await?;
            let mut state = self.lock_state();
            let before = state.sessions.len();
            state
                .sessions
                .retain(|stored| stored.session.id != *session_id);
            if state.sessions.len() == before {
                return Err(session_not_found("memory-delete-session"));
            }
            Ok(())
        })
    }

    fn rename_session<'a>(
        &'a self,
        session_id: &'a SessionId,
        title: &'a str,
    ) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move {
            self.enter(TransportOp::RenameSession).await?;
            let mut state = self.lock_state();
            let stored = state.find_mut(session_id, "memory-rename-session")?;
            stored.session.title = title.to_string();
            Ok(())
        })
    }

    fn list_messages<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> BoxFuture<'a, TransportResult<Vec<Message>>> {
        Box::pin(async move {
            self.enter(TransportOp::ListMessages).await?;
            let mut state = self.lock_state();
            let stored = state.find_mut(session_id, "memory-list-messages")?;
            Ok(stored.messages.clone())
        })
    }

    fn send_message<'a>(
        &'a self,
        session_id: &'a SessionId,
        content: &'a str,
    ) -> BoxFuture<'a, TransportResult<Message>> {
        Box::pin(async move {
            self.enter(TransportOp::SendMessage).await?;
            let reply = (self.responder)(content);
            let mut state = self.lock_state();
            state.append(session_id, MessageRole::User, content)?;
            state.append(session_id, MessageRole::Assistant, &reply)
        })
    }
}

/// Pending gate created by [`MemoryTransport::hold`].
#[derive(Debug)]
pub struct TransportHold {
    op: TransportOp,
    gate: Arc<Semaphore>,
}

impl TransportHold {
    pub fn op(&self) -> TransportOp {
        self.op
    }

    pub fn release(self) {}
}

impl Drop for TransportHold {
    fn drop(&mut self) {
        self.gate.close();
    }
}

fn sorted_sessions(state: &MemoryState) -> Vec<Session> {
    let mut sessions = state
        .sessions
        .iter()
        .map(|stored| stored.session.clone())
        .collect::<Vec<_>>();
    sessions.sort_by(|left, right| {
        right
            .updated_at_unix_millis
            .cmp(&left.updated_at_unix_millis)
    });
    sessions
}

fn session_not_found(stage: &'static str) -> TransportError {
    TransportError::Rejected {
        stage,
        status: Some(404),
        detail: Some("Session not found".to_string()),
    }
}
