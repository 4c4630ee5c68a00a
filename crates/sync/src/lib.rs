#![deny(unsafe_code)]

//! Client-side synchronization of chat sessions and messages against a remote
//! conversation service.
//!
//! The server stays the source of truth. [`SessionStore`] and [`MessageStore`] keep a
//! locally responsive copy, apply optimistic edits where that is safe, and reconcile
//! by reloading authoritative state. [`SyncCoordinator`] is the only type that talks to
//! both stores.

pub mod confirm;
pub mod coordinator;
pub mod error;
pub mod ids;
pub mod memory;
pub mod message_store;
pub mod observe;
pub mod session_store;
pub mod settings;
pub mod title;
pub mod types;

use std::future::Future;
use std::pin::Pin;

pub use confirm::{ArmOutcome, ConfirmGate, ConfirmState, DEFAULT_CONFIRM_EXPIRY};
pub use coordinator::{
    CoordinatorStatus, DeleteOutcome, LoadingFlags, SyncCoordinator, SyncSnapshot,
};
pub use error::{SyncError, SyncResult, TransportError, TransportResult};
pub use ids::{MessageId, SessionId};
pub use memory::{MemoryTransport, TransportHold, TransportOp};
pub use message_store::{LoadOutcome, MessageSnapshot, MessageStore, SendIgnored, SendOutcome};
pub use observe::{Observable, Subscription};
pub use session_store::{DeleteEffect, SessionSnapshot, SessionStore};
pub use settings::{SettingsError, SettingsStore, SyncSettings};
pub use title::{DEFAULT_TITLE_MAX_CHARS, derive_title};
pub use types::{DEFAULT_SESSION_TITLE, Message, MessageRole, Session};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Remote conversation service as seen by the sync core.
///
/// Implementations own request encoding, credentials and timeouts. Calls are never
/// retried by the core; an expired login must surface as [`TransportError::AuthExpired`].
pub trait ConversationTransport: Send + Sync {
    /// Lists sessions, most recently updated first.
    fn list_sessions(&self) -> BoxFuture<'_, TransportResult<Vec<Session>>>;
    fn create_session<'a>(&'a self, title: &'a str) -> BoxFuture<'a, TransportResult<Session>>;
    fn delete_session<'a>(&'a self, session_id: &'a SessionId)
    -> BoxFuture<'a, TransportResult<()>>;
    fn rename_session<'a>(
        &'a self,
        session_id: &'a SessionId,
        title: &'a str,
    ) -> BoxFuture<'a, TransportResult<()>>;
    /// Returns the authoritative sequence in creation order.
    fn list_messages<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> BoxFuture<'a, TransportResult<Vec<Message>>>;
    /// Persists a user message and resolves with the assistant's reply.
    fn send_message<'a>(
        &'a self,
        session_id: &'a SessionId,
        content: &'a str,
    ) -> BoxFuture<'a, TransportResult<Message>>;
}
