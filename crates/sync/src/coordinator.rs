//! Public façade over the session and message stores.
//!
//! Intents arrive here, are routed to the owning store, and their failures are
//! recorded in [`CoordinatorStatus`] so the presentation layer can render them without
//! holding on to the returned error.

use std::sync::Arc;

use snafu::{OptionExt, ensure};

use super::ConversationTransport;
use super::confirm::{ArmOutcome, ConfirmGate};
use super::error::{NoActiveSessionSnafu, SyncError, SyncResult, UnknownSessionSnafu};
use super::ids::SessionId;
use super::message_store::{MessageSnapshot, MessageStore, SendOutcome};
use super::observe::{Observable, Subscription};
use super::session_store::{DeleteEffect, SessionSnapshot, SessionStore};
use super::settings::SyncSettings;
use super::title::derive_title;
use super::types::{Message, Session, current_unix_timestamp_millis};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorStatus {
    /// User-facing message of the most recent failed intent.
    pub last_error: Option<String>,
    /// Set when the transport reported expired credentials; cleared by a successful `init`.
    pub auth_expired: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadingFlags {
    pub sessions: bool,
    pub messages: bool,
    pub sending: bool,
}

/// Everything the presentation layer renders, composed from the individual snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSnapshot {
    pub sessions: Vec<Session>,
    pub current_session_id: Option<SessionId>,
    pub messages: Vec<Message>,
    pub loading: LoadingFlags,
    pub last_error: Option<String>,
    pub auth_expired: bool,
    /// Session armed for deletion, waiting for a confirming second request.
    pub pending_delete: Option<SessionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// First request: the session is armed and a second request confirms.
    Armed,
    Deleted(DeleteEffect),
}

pub struct SyncCoordinator {
    sessions: SessionStore,
    messages: MessageStore,
    delete_gate: ConfirmGate<SessionId>,
    status: Arc<Observable<CoordinatorStatus>>,
    title_max_chars: usize,
}

impl SyncCoordinator {
    /// Settings are normalized first; zero or blank values fall back to defaults.
    pub fn new(transport: Arc<dyn ConversationTransport>, settings: &SyncSettings) -> Self {
        let settings = settings.clone().normalized();
        let status = Arc::new(Observable::<CoordinatorStatus>::default());

        let expired_status = Arc::clone(&status);
        let delete_gate =
            ConfirmGate::new(settings.confirm_expiry()).with_expiry_hook(move |session_id| {
                tracing::debug!(%session_id, "delete confirmation expired");
                expired_status.update(|_| ());
            });

        Self {
            sessions: SessionStore::new(transport.clone(), settings.default_session_title),
            messages: MessageStore::new(transport),
            delete_gate,
            status,
            title_max_chars: settings.title_max_chars,
        }
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        let sessions = self.sessions.snapshot();
        let messages = self.messages.snapshot();
        let status = self.status.load();

        SyncSnapshot {
            sessions: sessions.sessions.clone(),
            current_session_id: sessions.current_session_id.clone(),
            messages: messages.messages.clone(),
            loading: LoadingFlags {
                sessions: sessions.loading,
                messages: messages.loading,
                sending: messages.sending,
            },
            last_error: status.last_error.clone(),
            auth_expired: status.auth_expired,
            pending_delete: self.pending_delete(),
        }
    }

    /// Session armed for deletion; read from the gate so it never lags an expiry or re-arm.
    pub fn pending_delete(&self) -> Option<SessionId> {
        self.delete_gate.armed_target()
    }

    pub fn session_updates(&self) -> Subscription<SessionSnapshot> {
        self.sessions.subscribe()
    }

    pub fn message_updates(&self) -> Subscription<MessageSnapshot> {
        self.messages.subscribe()
    }

    /// Also fires when the pending delete is armed, confirmed, cancelled or lapses.
    pub fn status_updates(&self) -> Subscription<CoordinatorStatus> {
        self.status.subscribe()
    }

    /// Bootstraps the session list and loads the selected session's messages.
    pub async fn init(&self) -> SyncResult<SessionId> {
        self.begin_intent();
        let result: SyncResult<SessionId> = async {
            let current = self.sessions.bootstrap().await?;
            self.follow_current_session().await?;
            Ok(current)
        }
        .await;

        if result.is_ok() {
            self.status.update(|status| status.auth_expired = false);
        }
        self.record(result)
    }

    pub async fn select_session(&self, session_id: &SessionId) -> SyncResult<()> {
        self.begin_intent();
        let result: SyncResult<()> = async {
            let changed = self.sessions.select_session(session_id)?;
            if changed || self.messages.scope().as_ref() != Some(session_id) {
                self.follow_current_session().await?;
            }
            Ok(())
        }
        .await;
        self.record(result)
    }

    pub async fn new_chat(&self) -> SyncResult<Session> {
        self.begin_intent();
        let result: SyncResult<Session> = async {
            let created = self.sessions.create_session().await?;
            self.follow_current_session().await?;
            Ok(created)
        }
        .await;
        self.record(result)
    }

    /// Reloads the current session's messages, e.g. after a failed reconcile.
    pub async fn reload_messages(&self) -> SyncResult<()> {
        self.begin_intent();
        let result = self.follow_current_session().await;
        self.record(result)
    }

    /// Deletes `session_id` on the second request inside the confirmation window.
    pub async fn delete_session(&self, session_id: &SessionId) -> SyncResult<DeleteOutcome> {
        self.begin_intent();
        let result: SyncResult<DeleteOutcome> = async {
            ensure!(
                self.sessions.contains(session_id),
                UnknownSessionSnafu {
                    stage: "confirm-delete-session",
                    session_id: session_id.clone(),
                }
            );

            match self.delete_gate.arm(session_id.clone()) {
                ArmOutcome::Armed(armed) => {
                    tracing::debug!(session_id = %armed, "delete armed, awaiting confirmation");
                    self.notify_status();
                    Ok(DeleteOutcome::Armed)
                }
                ArmOutcome::Confirmed(confirmed) => {
                    self.notify_status();
                    self.delete_confirmed(&confirmed).await
                }
            }
        }
        .await;
        self.record(result)
    }

    /// Abandons an armed delete.
    pub fn cancel_delete(&self) {
        self.delete_gate.disarm();
        self.notify_status();
    }

    /// Sends `content` to the current session.
    ///
    /// After a successful send the session moves to the head of the list, and the first
    /// message of a conversation names the session.
    pub async fn send_message(&self, content: &str) -> SyncResult<SendOutcome> {
        self.begin_intent();
        let result = self.send_to_current(content).await;
        self.record(result)
    }

    /// Renames `session_id` from `content` when it was the session's first message.
    ///
    /// Returns the applied title, or `None` when no rename was due.
    pub async fn rename_session_if_first_message(
        &self,
        session_id: &SessionId,
        content: &str,
        was_first: bool,
    ) -> SyncResult<Option<String>> {
        if !was_first {
            return Ok(None);
        }

        if content.trim().is_empty() {
            return Ok(None);
        }
        let title = derive_title(content, self.title_max_chars);

        self.sessions.update_title(session_id, &title).await?;
        tracing::info!(%session_id, %title, "named session from first message");
        Ok(Some(title))
    }

    /// Applies a user-chosen title; blank titles are ignored and return `false`.
    pub async fn rename_session(&self, session_id: &SessionId, title: &str) -> SyncResult<bool> {
        self.begin_intent();
        let title = title.trim();
        if title.is_empty() {
            tracing::debug!(%session_id, "ignoring blank session title");
            return Ok(false);
        }

        let result = self.sessions.update_title(session_id, title).await;
        self.record(result.map(|()| true))
    }

    async fn send_to_current(&self, content: &str) -> SyncResult<SendOutcome> {
        let session_id = self
            .sessions
            .current_session_id()
            .context(NoActiveSessionSnafu {
                stage: "send-message",
            })?;

        match self.messages.send_message(&session_id, content).await? {
            SendOutcome::Delivered { reply, was_first } => {
                if self.sessions.contains(&session_id) {
                    self.bump_activity(&session_id);
                    self.rename_after_send(&session_id, content, was_first).await;
                }
                Ok(SendOutcome::Delivered { reply, was_first })
            }
            SendOutcome::Unreconciled {
                was_first, error, ..
            } => {
                // The message is persisted; naming the session does not depend on the reload.
                if self.sessions.contains(&session_id) {
                    self.rename_after_send(&session_id, content, was_first).await;
                }
                Err(error)
            }
            other => Ok(other),
        }
    }

    async fn rename_after_send(&self, session_id: &SessionId, content: &str, was_first: bool) {
        if let Err(error) = self
            .rename_session_if_first_message(session_id, content, was_first)
            .await
        {
            tracing::warn!(%session_id, %error, "failed to name session from first message");
            self.note_error(&error);
        }
    }

    fn bump_activity(&self, session_id: &SessionId) {
        let messages = self.messages.snapshot();
        if messages.session_id.as_ref() != Some(session_id) {
            return;
        }

        let updated_at = messages
            .messages
            .last()
            .map(|message| message.created_at_unix_millis)
            .unwrap_or_else(current_unix_timestamp_millis);
        self.sessions
            .touch_session(session_id, messages.messages.len() as u64, updated_at);
    }

    async fn delete_confirmed(&self, session_id: &SessionId) -> SyncResult<DeleteOutcome> {
        match self.sessions.delete_session(session_id).await {
            Ok(effect) => {
                if effect.current_changed {
                    self.follow_current_session().await?;
                }
                Ok(DeleteOutcome::Deleted(effect))
            }
            Err(error) => {
                // A failed fallback create leaves the deletion applied and nothing selected.
                if self.sessions.current_session_id().is_none() {
                    self.messages.clear();
                }
                Err(error)
            }
        }
    }

    /// Points the message scope at the current session, or clears it when none is selected.
    async fn follow_current_session(&self) -> SyncResult<()> {
        match self.sessions.current_session_id() {
            Some(session_id) => {
                self.messages.load_messages(&session_id).await?;
            }
            None => self.messages.clear(),
        }
        Ok(())
    }

    // Republishes the status so subscribers re-read state derived outside it.
    fn notify_status(&self) {
        self.status.update(|_| ());
    }

    fn begin_intent(&self) {
        if self.status.load().last_error.is_some() {
            self.status.update(|status| status.last_error = None);
        }
    }

    fn record<T>(&self, result: SyncResult<T>) -> SyncResult<T> {
        if let Err(error) = &result {
            tracing::warn!(%error, "sync intent failed");
            self.note_error(error);
        }
        result
    }

    fn note_error(&self, error: &SyncError) {
        let message = error
            .detail()
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        let auth_expired = error.is_auth_expired();

        self.status.update(|status| {
            status.last_error = Some(message);
            status.auth_expired |= auth_expired;
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::TransportError;
    use crate::memory::{MemoryTransport, TransportOp};
    use crate::message_store::SendIgnored;
    use crate::types::{DEFAULT_SESSION_TITLE, MessageRole};

    fn coordinator_with(transport: &Arc<MemoryTransport>) -> SyncCoordinator {
        SyncCoordinator::new(transport.clone(), &SyncSettings::default())
    }

    fn titles(snapshot: &SyncSnapshot) -> Vec<String> {
        snapshot
            .sessions
            .iter()
            .map(|session| session.title.clone())
            .collect()
    }

    #[tokio::test]
    async fn init_on_empty_account_creates_one_session() {
        let transport = Arc::new(MemoryTransport::new());
        let coordinator = coordinator_with(&transport);

        let current = coordinator.init().await.expect("init should succeed");

        let snapshot = coordinator.snapshot();
        assert_eq!(transport.calls(TransportOp::CreateSession), 1);
        assert_eq!(snapshot.sessions.len(), 1);
        assert_eq!(snapshot.current_session_id, Some(current));
        assert!(snapshot.messages.is_empty());
        assert_eq!(snapshot.loading, LoadingFlags::default());
        assert_eq!(snapshot.last_error, None);
    }

    #[tokio::test]
    async fn init_loads_messages_of_the_newest_session() {
        let transport = Arc::new(MemoryTransport::new());
        transport.seed_session("older");
        let newest = transport.seed_session("newest");
        transport
            .seed_message(&newest, MessageRole::User, "hi")
            .expect("seed message");
        let coordinator = coordinator_with(&transport);

        coordinator.init().await.expect("init should succeed");

        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.current_session_id, Some(newest.clone()));
        assert_eq!(snapshot.messages, transport.messages(&newest));
    }

    #[tokio::test]
    async fn first_message_is_optimistic_then_reconciled_and_names_the_session() {
        let transport = Arc::new(MemoryTransport::new());
        let coordinator = coordinator_with(&transport);
        let session_id = coordinator.init().await.expect("init should succeed");
        let hold = transport.hold(TransportOp::SendMessage);

        let observe = async {
            tokio::task::yield_now().await;
            let snapshot = coordinator.snapshot();
            assert_eq!(snapshot.messages.len(), 1);
            assert!(snapshot.loading.sending);
            hold.release();
        };
        let (outcome, ()) = futures::join!(coordinator.send_message("What is flu?"), observe);

        assert!(matches!(
            outcome.expect("send should succeed"),
            SendOutcome::Delivered { was_first: true, .. }
        ));
        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(snapshot.messages, transport.messages(&session_id));
        assert_eq!(transport.calls(TransportOp::RenameSession), 1);
        assert_eq!(titles(&snapshot), vec!["What is flu?".to_string()]);
        assert_eq!(snapshot.sessions[0].message_count, 2);
    }

    #[tokio::test]
    async fn later_messages_do_not_rename() {
        let transport = Arc::new(MemoryTransport::new());
        let coordinator = coordinator_with(&transport);
        coordinator.init().await.expect("init should succeed");

        coordinator.send_message("first").await.expect("first send");
        coordinator.send_message("second").await.expect("second send");

        assert_eq!(transport.calls(TransportOp::RenameSession), 1);
        assert_eq!(titles(&coordinator.snapshot()), vec!["first".to_string()]);
    }

    #[tokio::test]
    async fn long_first_message_is_truncated_into_the_title() {
        let transport = Arc::new(MemoryTransport::new());
        let coordinator = coordinator_with(&transport);
        coordinator.init().await.expect("init should succeed");

        coordinator
            .send_message(&"a".repeat(60))
            .await
            .expect("send should succeed");

        let expected = format!("{}…", "a".repeat(50));
        assert_eq!(titles(&coordinator.snapshot()), vec![expected]);
    }

    #[tokio::test]
    async fn send_moves_the_session_to_the_head() {
        let transport = Arc::new(MemoryTransport::new());
        let older = transport.seed_session("older");
        transport.seed_session("newer");
        let coordinator = coordinator_with(&transport);
        coordinator.init().await.expect("init should succeed");
        coordinator
            .select_session(&older)
            .await
            .expect("select should succeed");

        coordinator.send_message("bump").await.expect("send should succeed");

        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.sessions[0].id, older);
        assert_eq!(snapshot.current_session_id, Some(older));
    }

    #[tokio::test]
    async fn failed_send_is_reported_and_rolled_back() {
        let transport = Arc::new(MemoryTransport::new());
        let coordinator = coordinator_with(&transport);
        coordinator.init().await.expect("init should succeed");
        transport.fail_next(
            TransportOp::SendMessage,
            TransportError::Rejected {
                stage: "test",
                status: Some(503),
                detail: Some("agent is overloaded".to_string()),
            },
        );

        let error = coordinator
            .send_message("What is flu?")
            .await
            .expect_err("send should fail");

        assert!(matches!(error, SyncError::Send { .. }));
        let snapshot = coordinator.snapshot();
        assert!(snapshot.messages.is_empty());
        assert_eq!(snapshot.last_error.as_deref(), Some("agent is overloaded"));
        assert_eq!(titles(&snapshot), vec![DEFAULT_SESSION_TITLE.to_string()]);

        coordinator.send_message("What is flu?").await.expect("retry");
        assert_eq!(coordinator.snapshot().last_error, None);
    }

    #[tokio::test]
    async fn blank_message_is_ignored() {
        let transport = Arc::new(MemoryTransport::new());
        let coordinator = coordinator_with(&transport);
        coordinator.init().await.expect("init should succeed");

        let outcome = coordinator.send_message("   ").await.expect("no-op");

        assert!(matches!(outcome, SendOutcome::Ignored(SendIgnored::EmptyContent)));
        assert_eq!(transport.calls(TransportOp::SendMessage), 0);
    }

    #[tokio::test]
    async fn send_without_a_session_is_rejected() {
        let transport = Arc::new(MemoryTransport::new());
        let coordinator = coordinator_with(&transport);

        let error = coordinator
            .send_message("hello")
            .await
            .expect_err("nothing is selected");

        assert!(matches!(error, SyncError::NoActiveSession { .. }));
        assert!(coordinator.snapshot().last_error.is_some());
    }

    #[tokio::test]
    async fn delete_requires_confirmation() {
        let transport = Arc::new(MemoryTransport::new());
        let older = transport.seed_session("older");
        let newer = transport.seed_session("newer");
        let coordinator = coordinator_with(&transport);
        coordinator.init().await.expect("init should succeed");

        let first = coordinator.delete_session(&newer).await.expect("arm");
        assert_eq!(first, DeleteOutcome::Armed);
        assert_eq!(coordinator.snapshot().pending_delete, Some(newer.clone()));
        assert_eq!(transport.calls(TransportOp::DeleteSession), 0);

        let second = coordinator.delete_session(&newer).await.expect("confirm");

        assert!(matches!(
            second,
            DeleteOutcome::Deleted(DeleteEffect {
                current_changed: true,
                created_fallback: false,
            })
        ));
        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.pending_delete, None);
        assert_eq!(snapshot.current_session_id, Some(older));
        assert_eq!(snapshot.sessions.len(), 1);
    }

    #[tokio::test]
    async fn arming_another_session_moves_the_pending_delete() {
        let transport = Arc::new(MemoryTransport::new());
        let older = transport.seed_session("older");
        let newer = transport.seed_session("newer");
        let coordinator = coordinator_with(&transport);
        coordinator.init().await.expect("init should succeed");

        coordinator.delete_session(&older).await.expect("arm older");
        let outcome = coordinator.delete_session(&newer).await.expect("arm newer");

        assert_eq!(outcome, DeleteOutcome::Armed);
        assert_eq!(coordinator.snapshot().pending_delete, Some(newer));
        assert_eq!(transport.calls(TransportOp::DeleteSession), 0);

        coordinator.cancel_delete();
        assert_eq!(coordinator.snapshot().pending_delete, None);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_confirmation_expires() {
        let transport = Arc::new(MemoryTransport::new());
        let only = transport.seed_session("only");
        let coordinator = coordinator_with(&transport);
        coordinator.init().await.expect("init should succeed");

        coordinator.delete_session(&only).await.expect("arm");
        let mut status = coordinator.status_updates();
        tokio::time::sleep(Duration::from_millis(3_001)).await;

        assert!(status.latest().is_some(), "expiry should republish status");
        assert_eq!(coordinator.snapshot().pending_delete, None);
        let outcome = coordinator.delete_session(&only).await.expect("re-arm");
        assert_eq!(outcome, DeleteOutcome::Armed);
        assert_eq!(coordinator.snapshot().pending_delete, Some(only.clone()));
        assert_eq!(coordinator.pending_delete(), Some(only));
        assert_eq!(transport.calls(TransportOp::DeleteSession), 0);
    }

    #[tokio::test]
    async fn deleting_the_last_session_leaves_exactly_one() {
        let transport = Arc::new(MemoryTransport::new());
        let only = transport.seed_session("only");
        transport
            .seed_message(&only, MessageRole::User, "old conversation")
            .expect("seed message");
        let coordinator = coordinator_with(&transport);
        coordinator.init().await.expect("init should succeed");

        coordinator.delete_session(&only).await.expect("arm");
        let outcome = coordinator.delete_session(&only).await.expect("confirm");

        assert!(matches!(
            outcome,
            DeleteOutcome::Deleted(DeleteEffect {
                created_fallback: true,
                ..
            })
        ));
        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.sessions.len(), 1);
        assert_ne!(snapshot.sessions[0].id, only);
        assert_eq!(snapshot.current_session_id, Some(snapshot.sessions[0].id.clone()));
        assert!(snapshot.messages.is_empty());
    }

    #[tokio::test]
    async fn failed_fallback_create_can_be_recovered_with_new_chat() {
        let transport = Arc::new(MemoryTransport::new());
        let only = transport.seed_session("only");
        let coordinator = coordinator_with(&transport);
        coordinator.init().await.expect("init should succeed");
        transport.fail_next(
            TransportOp::CreateSession,
            TransportError::Unavailable {
                stage: "test",
                detail: "connection reset".to_string(),
            },
        );

        coordinator.delete_session(&only).await.expect("arm");
        let error = coordinator
            .delete_session(&only)
            .await
            .expect_err("fallback create should fail");

        assert!(matches!(
            error,
            SyncError::Mutation {
                operation: "create",
                ..
            }
        ));
        let snapshot = coordinator.snapshot();
        assert!(snapshot.sessions.is_empty());
        assert_eq!(snapshot.current_session_id, None);

        let created = coordinator.new_chat().await.expect("new chat recovers");
        assert_eq!(coordinator.snapshot().current_session_id, Some(created.id));
    }

    #[tokio::test]
    async fn switching_sessions_drops_the_pending_send_result() {
        let transport = Arc::new(MemoryTransport::new());
        let older = transport.seed_session("older");
        let newer = transport.seed_session("newer");
        let coordinator = coordinator_with(&transport);
        coordinator.init().await.expect("init should succeed");
        let hold = transport.hold(TransportOp::SendMessage);

        let switch = async {
            tokio::task::yield_now().await;
            coordinator
                .select_session(&older)
                .await
                .expect("select should succeed");
            hold.release();
        };
        let (outcome, ()) = futures::join!(coordinator.send_message("hello"), switch);

        assert!(matches!(
            outcome.expect("send should resolve"),
            SendOutcome::Dropped { reply: Some(_) }
        ));
        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.current_session_id, Some(older));
        assert!(snapshot.messages.is_empty());
        assert_eq!(transport.messages(&newer).len(), 2);
        assert_eq!(transport.calls(TransportOp::RenameSession), 0);
    }

    #[tokio::test]
    async fn deleting_a_session_mid_send_does_not_resurrect_it() {
        let transport = Arc::new(MemoryTransport::new());
        let older = transport.seed_session("older");
        let newer = transport.seed_session("newer");
        let coordinator = coordinator_with(&transport);
        coordinator.init().await.expect("init should succeed");
        let hold = transport.hold(TransportOp::SendMessage);

        let delete = async {
            tokio::task::yield_now().await;
            coordinator.delete_session(&newer).await.expect("arm");
            coordinator.delete_session(&newer).await.expect("confirm");
            hold.release();
        };
        let (outcome, ()) = futures::join!(coordinator.send_message("hello"), delete);

        assert!(matches!(
            outcome.expect("send result is dropped, not failed"),
            SendOutcome::Dropped { reply: None }
        ));
        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.sessions.len(), 1);
        assert_eq!(snapshot.current_session_id, Some(older));
        assert!(snapshot.messages.is_empty());
    }

    #[tokio::test]
    async fn auth_expiry_is_flagged_until_init_succeeds() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_next(
            TransportOp::ListSessions,
            TransportError::AuthExpired {
                stage: "list-sessions",
            },
        );
        let coordinator = coordinator_with(&transport);

        let error = coordinator.init().await.expect_err("init should fail");

        assert!(error.is_auth_expired());
        let snapshot = coordinator.snapshot();
        assert!(snapshot.auth_expired);
        assert!(snapshot.sessions.is_empty());
        assert!(!snapshot.loading.sessions);

        coordinator.init().await.expect("retry should succeed");
        let snapshot = coordinator.snapshot();
        assert!(!snapshot.auth_expired);
        assert_eq!(snapshot.last_error, None);
    }

    #[tokio::test]
    async fn explicit_rename_ignores_blank_titles() {
        let transport = Arc::new(MemoryTransport::new());
        let coordinator = coordinator_with(&transport);
        let session_id = coordinator.init().await.expect("init should succeed");

        assert!(!coordinator.rename_session(&session_id, "  ").await.expect("no-op"));
        assert!(
            coordinator
                .rename_session(&session_id, " Flu notes ")
                .await
                .expect("rename")
        );

        assert_eq!(transport.calls(TransportOp::RenameSession), 1);
        assert_eq!(titles(&coordinator.snapshot()), vec!["Flu notes".to_string()]);
    }

    #[tokio::test]
    async fn selecting_an_unknown_session_is_reported() {
        let transport = Arc::new(MemoryTransport::new());
        let coordinator = coordinator_with(&transport);
        coordinator.init().await.expect("init should succeed");

        let error = coordinator
            .select_session(&SessionId::new("missing"))
            .await
            .expect_err("unknown session");

        assert!(matches!(error, SyncError::UnknownSession { .. }));
        assert!(coordinator.snapshot().last_error.is_some());
    }

    #[tokio::test]
    async fn subscribers_observe_status_changes() {
        let transport = Arc::new(MemoryTransport::new());
        let only = transport.seed_session("only");
        let coordinator = coordinator_with(&transport);
        coordinator.init().await.expect("init should succeed");
        let mut status = coordinator.status_updates();

        coordinator.delete_session(&only).await.expect("arm");

        let published = status.recv().await.expect("status published on arm");
        assert_eq!(published.last_error, None);
        assert_eq!(coordinator.snapshot().pending_delete, Some(only.clone()));

        coordinator.cancel_delete();
        assert!(status.recv().await.is_some());
        assert_eq!(coordinator.snapshot().pending_delete, None);
    }

    #[tokio::test]
    async fn send_during_history_load_does_not_rename_the_session() {
        let transport = Arc::new(MemoryTransport::new());
        let older = transport.seed_session("Flu history");
        transport
            .seed_message(&older, MessageRole::User, "What is flu?")
            .expect("seed user message");
        transport
            .seed_message(&older, MessageRole::Assistant, "A viral infection.")
            .expect("seed assistant message");
        transport.seed_session("newer");
        let coordinator = coordinator_with(&transport);
        coordinator.init().await.expect("init should succeed");
        let hold = transport.hold(TransportOp::ListMessages);

        let send_while_loading = async {
            tokio::task::yield_now().await;
            let outcome = coordinator.send_message("And symptoms?").await;
            hold.release();
            outcome
        };
        let (selected, outcome) =
            futures::join!(coordinator.select_session(&older), send_while_loading);

        selected.expect("select should succeed");
        assert!(matches!(
            outcome.expect("send is ignored, not failed"),
            SendOutcome::Ignored(SendIgnored::NotLoaded)
        ));
        let snapshot = coordinator.snapshot();
        let title = snapshot
            .sessions
            .iter()
            .find(|session| session.id == older)
            .map(|session| session.title.clone());
        assert_eq!(title.as_deref(), Some("Flu history"));
        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(transport.calls(TransportOp::SendMessage), 0);
        assert_eq!(transport.calls(TransportOp::RenameSession), 0);
    }

    #[tokio::test]
    async fn title_is_derived_from_the_message_as_typed() {
        let transport = Arc::new(MemoryTransport::new());
        let coordinator = coordinator_with(&transport);
        let session_id = coordinator.init().await.expect("init should succeed");

        coordinator
            .send_message("What is flu? ")
            .await
            .expect("send should succeed");

        assert_eq!(titles(&coordinator.snapshot()), vec!["What is flu? ".to_string()]);
        assert_eq!(transport.messages(&session_id)[0].content, "What is flu? ");
    }
}
