//! Message sequence for the active session and the optimistic send protocol.
//!
//! A send appends a local user entry right away, then reconciles by reloading the
//! authoritative sequence. If the send fails or is abandoned, the pre-insert sequence
//! is restored verbatim.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use snafu::ResultExt;

use super::ConversationTransport;
use super::error::{LoadMessagesSnafu, ReconcileSnafu, SendSnafu, SyncError, SyncResult};
use super::ids::{MessageId, SessionId};
use super::observe::{Observable, Subscription};
use super::types::Message;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageSnapshot {
    /// Session the sequence belongs to; `None` when nothing is loaded.
    pub session_id: Option<SessionId>,
    pub messages: Vec<Message>,
    pub loading: bool,
    /// A send is in flight for `session_id`.
    pub sending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Applied,
    /// A newer load or a scope change superseded this response.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendIgnored {
    EmptyContent,
    AlreadyInFlight,
    InactiveSession,
    /// The session's messages have not been loaded yet, so its history is unknown.
    NotLoaded,
}

#[derive(Debug)]
pub enum SendOutcome {
    Ignored(SendIgnored),
    /// The send persisted and the sequence now mirrors the server.
    Delivered { reply: Message, was_first: bool },
    /// The send persisted but the follow-up reload failed.
    Unreconciled {
        reply: Message,
        was_first: bool,
        error: SyncError,
    },
    /// The send resolved after its session stopped being active; nothing was applied.
    /// `reply` is `None` when the server rejected it, typically because the session was deleted.
    Dropped { reply: Option<Message> },
}

#[derive(Default)]
struct MessageState {
    scope: Option<SessionId>,
    messages: Vec<Message>,
    loading: bool,
    // An authoritative sequence has been applied for the current scope.
    loaded: bool,
    generation: u64,
    in_flight: HashSet<SessionId>,
}

impl MessageState {
    fn in_scope(&self, session_id: &SessionId) -> bool {
        self.scope.as_ref() == Some(session_id)
    }

    fn snapshot(&self) -> MessageSnapshot {
        MessageSnapshot {
            session_id: self.scope.clone(),
            messages: self.messages.clone(),
            loading: self.loading,
            sending: self
                .scope
                .as_ref()
                .is_some_and(|scope| self.in_flight.contains(scope)),
        }
    }
}

pub struct MessageStore {
    transport: Arc<dyn ConversationTransport>,
    state: Mutex<MessageState>,
    published: Observable<MessageSnapshot>,
}

impl MessageStore {
    pub fn new(transport: Arc<dyn ConversationTransport>) -> Self {
        Self {
            transport,
            state: Mutex::new(MessageState::default()),
            published: Observable::default(),
        }
    }

    pub fn snapshot(&self) -> Arc<MessageSnapshot> {
        self.published.load()
    }

    pub fn subscribe(&self) -> Subscription<MessageSnapshot> {
        self.published.subscribe()
    }

    pub fn scope(&self) -> Option<SessionId> {
        self.lock_state().scope.clone()
    }

    /// Replaces the sequence with the server's authoritative one for `session_id`.
    ///
    /// Switching to a different session discards the previous sequence immediately.
    pub async fn load_messages(&self, session_id: &SessionId) -> SyncResult<LoadOutcome> {
        let generation = self.mutate(|state| {
            if !state.in_scope(session_id) {
                state.scope = Some(session_id.clone());
                state.messages.clear();
                state.loaded = false;
            }
            state.generation += 1;
            state.loading = true;
            state.generation
        });

        let response = self.transport.list_messages(session_id).await;

        self.mutate(|state| {
            if state.generation != generation || !state.in_scope(session_id) {
                tracing::debug!(%session_id, generation, "dropping stale message load");
                return Ok(LoadOutcome::Stale);
            }

            state.loading = false;
            match response {
                Ok(messages) => {
                    tracing::debug!(%session_id, count = messages.len(), "loaded messages");
                    state.messages = messages;
                    state.loaded = true;
                    Ok(LoadOutcome::Applied)
                }
                Err(source) => {
                    tracing::warn!(%session_id, %source, "message load failed");
                    Err(source).context(LoadMessagesSnafu {
                        stage: "load-messages",
                        session_id: session_id.clone(),
                    })
                }
            }
        })
    }

    /// Sends `content` to the active session with an optimistic local entry.
    ///
    /// At most one send per session is in flight. Blank content, sends to a session
    /// other than the loaded one, and sends before its history arrived are ignored.
    /// `content` is sent as typed.
    pub async fn send_message(
        &self,
        session_id: &SessionId,
        content: &str,
    ) -> SyncResult<SendOutcome> {
        if content.trim().is_empty() {
            tracing::debug!(%session_id, "ignoring blank message");
            return Ok(SendOutcome::Ignored(SendIgnored::EmptyContent));
        }

        let admitted = self.mutate(|state| {
            if !state.in_scope(session_id) {
                return Err(SendIgnored::InactiveSession);
            }
            if !state.loaded {
                return Err(SendIgnored::NotLoaded);
            }
            if !state.in_flight.insert(session_id.clone()) {
                return Err(SendIgnored::AlreadyInFlight);
            }

            // Taken before the insert: the post-insert count is never zero.
            let was_first = state.messages.is_empty();
            let rollback = state.messages.clone();
            let optimistic = Message::optimistic_user(content);
            let optimistic_id = optimistic.id.clone();
            state.messages.push(optimistic);
            Ok((was_first, rollback, optimistic_id))
        });

        let (was_first, rollback, optimistic_id) = match admitted {
            Ok(admitted) => admitted,
            Err(reason) => {
                tracing::debug!(%session_id, ?reason, "send ignored");
                return Ok(SendOutcome::Ignored(reason));
            }
        };

        let mut pending = PendingSend {
            store: self,
            session_id: session_id.clone(),
            optimistic_id,
            rollback,
            settled: false,
        };

        let reply = match self.transport.send_message(session_id, content).await {
            Ok(reply) => reply,
            Err(source) => {
                drop(pending);
                if !self.lock_state().in_scope(session_id) {
                    tracing::debug!(%session_id, %source, "send to inactive session failed");
                    return Ok(SendOutcome::Dropped { reply: None });
                }
                tracing::warn!(%session_id, %source, "send failed, restored previous sequence");
                return Err(source).context(SendSnafu {
                    stage: "send-message",
                    session_id: session_id.clone(),
                });
            }
        };
        pending.settle();

        if !self.lock_state().in_scope(session_id) {
            tracing::debug!(%session_id, "send resolved for an inactive session, dropping result");
            return Ok(SendOutcome::Dropped { reply: Some(reply) });
        }

        let outcome = match self.reload_after_send(session_id).await {
            Ok(LoadOutcome::Applied) => SendOutcome::Delivered { reply, was_first },
            Ok(LoadOutcome::Stale) if self.lock_state().in_scope(session_id) => {
                SendOutcome::Delivered { reply, was_first }
            }
            Ok(LoadOutcome::Stale) => SendOutcome::Dropped { reply: Some(reply) },
            Err(error) => SendOutcome::Unreconciled {
                reply,
                was_first,
                error,
            },
        };
        drop(pending);
        Ok(outcome)
    }

    /// Forgets the loaded sequence; pending loads for it become stale.
    pub fn clear(&self) {
        self.mutate(|state| {
            state.scope = None;
            state.messages.clear();
            state.loading = false;
            state.loaded = false;
            state.generation += 1;
        });
    }

    async fn reload_after_send(&self, session_id: &SessionId) -> SyncResult<LoadOutcome> {
        match self.load_messages(session_id).await {
            Err(SyncError::LoadMessages {
                session_id, source, ..
            }) => Err(source).context(ReconcileSnafu {
                stage: "reconcile-after-send",
                session_id,
            }),
            other => other,
        }
    }

    fn mutate<R>(&self, edit: impl FnOnce(&mut MessageState) -> R) -> R {
        let mut state = self.lock_state();
        let result = edit(&mut state);
        self.published.publish(state.snapshot());
        result
    }

    fn lock_state(&self) -> MutexGuard<'_, MessageState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-flight send; rolls the sequence back on drop unless settled.
struct PendingSend<'a> {
    store: &'a MessageStore,
    session_id: SessionId,
    optimistic_id: MessageId,
    rollback: Vec<Message>,
    settled: bool,
}

impl PendingSend<'_> {
    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for PendingSend<'_> {
    fn drop(&mut self) {
        let settled = self.settled;
        let rollback = std::mem::take(&mut self.rollback);
        self.store.mutate(|state| {
            state.in_flight.remove(&self.session_id);
            if settled || !state.in_scope(&self.session_id) {
                return;
            }
            // A load that already replaced the sequence has removed the entry.
            if state
                .messages
                .iter()
                .any(|message| message.id == self.optimistic_id)
            {
                state.messages = rollback;
            }
        });
    }
}
