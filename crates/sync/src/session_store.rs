//! Ordered session collection, current selection, and the bootstrap and fallback policy.
//!
//! Creation, deletion and renames are never optimistic: local state changes only after
//! the transport call resolves successfully.

use std::sync::Arc;

use snafu::{ResultExt, ensure};

use super::ConversationTransport;
use super::error::{BootstrapSnafu, MutationSnafu, SyncResult, UnknownSessionSnafu};
use super::ids::SessionId;
use super::observe::{Observable, Subscription};
use super::types::Session;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Most recently active first.
    pub sessions: Vec<Session>,
    pub current_session_id: Option<SessionId>,
    pub loading: bool,
    pub bootstrapped: bool,
}

impl SessionSnapshot {
    pub fn current(&self) -> Option<&Session> {
        let current_session_id = self.current_session_id.as_ref()?;
        self.find(current_session_id)
    }

    pub fn find(&self, session_id: &SessionId) -> Option<&Session> {
        self.sessions
            .iter()
            .find(|session| session.id == *session_id)
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.find(session_id).is_some()
    }
}

/// What a successful delete did to the current selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteEffect {
    pub current_changed: bool,
    pub created_fallback: bool,
}

pub struct SessionStore {
    transport: Arc<dyn ConversationTransport>,
    default_title: String,
    state: Observable<SessionSnapshot>,
}

impl SessionStore {
    pub fn new(
        transport: Arc<dyn ConversationTransport>,
        default_title: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            default_title: default_title.into(),
            state: Observable::default(),
        }
    }

    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.state.load()
    }

    pub fn subscribe(&self) -> Subscription<SessionSnapshot> {
        self.state.subscribe()
    }

    pub fn current_session_id(&self) -> Option<SessionId> {
        self.state.load().current_session_id.clone()
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.state.load().contains(session_id)
    }

    /// Loads the session list and selects its head, creating a first session when empty.
    ///
    /// On failure the store is left empty and not loading, and may be bootstrapped again.
    pub async fn bootstrap(&self) -> SyncResult<SessionId> {
        self.state.update(|state| state.loading = true);

        let listed = match self.transport.list_sessions().await {
            Ok(listed) => listed,
            Err(source) => {
                tracing::warn!(%source, "session list request failed during bootstrap");
                self.reset_after_failed_bootstrap();
                return Err(source).context(BootstrapSnafu {
                    stage: "bootstrap-list-sessions",
                });
            }
        };

        let sessions = if listed.is_empty() {
            let created = match self.transport.create_session(&self.default_title).await {
                Ok(created) => created,
                Err(source) => {
                    tracing::warn!(%source, "initial session creation failed during bootstrap");
                    self.reset_after_failed_bootstrap();
                    return Err(source).context(BootstrapSnafu {
                        stage: "bootstrap-create-session",
                    });
                }
            };
            tracing::info!(session_id = %created.id, "created first session on empty bootstrap");
            vec![created]
        } else {
            listed
        };

        let session_count = sessions.len();
        let current_session_id = self.state.update(|state| {
            let head = sessions[0].id.clone();
            state.sessions = sessions;
            state.current_session_id = Some(head.clone());
            state.loading = false;
            state.bootstrapped = true;
            head
        });

        tracing::info!(
            session_id = %current_session_id,
            session_count,
            "bootstrapped session list"
        );
        Ok(current_session_id)
    }

    pub async fn create_session(&self) -> SyncResult<Session> {
        let created = self
            .transport
            .create_session(&self.default_title)
            .await
            .context(MutationSnafu {
                stage: "create-session",
                operation: "create",
            })?;

        self.state.update(|state| {
            state.sessions.retain(|session| session.id != created.id);
            state.sessions.insert(0, created.clone());
            state.current_session_id = Some(created.id.clone());
        });

        tracing::info!(session_id = %created.id, "created session");
        Ok(created)
    }

    /// Points the current selection at `session_id`; returns whether it changed.
    pub fn select_session(&self, session_id: &SessionId) -> SyncResult<bool> {
        let snapshot = self.state.load();
        ensure!(
            snapshot.contains(session_id),
            UnknownSessionSnafu {
                stage: "select-session",
                session_id: session_id.clone(),
            }
        );

        if snapshot.current_session_id.as_ref() == Some(session_id) {
            return Ok(false);
        }

        self.state
            .update(|state| state.current_session_id = Some(session_id.clone()));
        tracing::debug!(%session_id, "selected session");
        Ok(true)
    }

    /// Deletes `session_id` on the server, then drops it locally.
    ///
    /// When the deleted session was current, the new head becomes current; if nothing
    /// remains a fresh session is created so a current session always exists.
    pub async fn delete_session(&self, session_id: &SessionId) -> SyncResult<DeleteEffect> {
        self.ensure_known(session_id, "delete-session")?;

        self.transport
            .delete_session(session_id)
            .await
            .context(MutationSnafu {
                stage: "delete-session",
                operation: "delete",
            })?;

        // Re-read state after the await: the selection may have moved while the call was pending.
        let (was_current, next_current) = self.state.update(|state| {
            state.sessions.retain(|session| session.id != *session_id);
            let was_current = state.current_session_id.as_ref() == Some(session_id);
            if was_current {
                state.current_session_id =
                    state.sessions.first().map(|session| session.id.clone());
            }
            (was_current, state.current_session_id.clone())
        });

        tracing::info!(%session_id, was_current, "deleted session");

        if !was_current {
            return Ok(DeleteEffect {
                current_changed: false,
                created_fallback: false,
            });
        }

        if next_current.is_some() {
            return Ok(DeleteEffect {
                current_changed: true,
                created_fallback: false,
            });
        }

        tracing::info!("deleted the last session, creating a replacement");
        self.create_session().await?;
        Ok(DeleteEffect {
            current_changed: true,
            created_fallback: true,
        })
    }

    /// Renames `session_id` once the server has accepted the new title.
    pub async fn update_title(&self, session_id: &SessionId, title: &str) -> SyncResult<()> {
        self.ensure_known(session_id, "update-title")?;

        self.transport
            .rename_session(session_id, title)
            .await
            .context(MutationSnafu {
                stage: "update-title",
                operation: "rename",
            })?;

        self.state.update(|state| {
            if let Some(session) = state
                .sessions
                .iter_mut()
                .find(|session| session.id == *session_id)
            {
                session.title = title.to_string();
            }
        });
        Ok(())
    }

    /// Records new activity on `session_id` and moves it to the head of the list.
    pub fn touch_session(&self, session_id: &SessionId, message_count: u64, updated_at: u64) {
        self.state.update(|state| {
            let Some(position) = state
                .sessions
                .iter()
                .position(|session| session.id == *session_id)
            else {
                return;
            };

            let mut session = state.sessions.remove(position);
            session.message_count = message_count;
            session.updated_at_unix_millis = session.updated_at_unix_millis.max(updated_at);
            state.sessions.insert(0, session);
        });
    }

    fn ensure_known(&self, session_id: &SessionId, stage: &'static str) -> SyncResult<()> {
        ensure!(
            self.contains(session_id),
            UnknownSessionSnafu {
                stage,
                session_id: session_id.clone(),
            }
        );
        Ok(())
    }

    fn reset_after_failed_bootstrap(&self) {
        self.state.update(|state| {
            state.sessions.clear();
            state.current_session_id = None;
            state.loading = false;
        });
    }
}
