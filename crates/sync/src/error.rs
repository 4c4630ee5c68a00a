use snafu::Snafu;

use super::ids::SessionId;

/// Failure reported by the transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
    #[snafu(display("transport credentials expired on `{stage}`"))]
    AuthExpired { stage: &'static str },
    #[snafu(display("transport rejected request on `{stage}`{}", render_detail(detail)))]
    Rejected {
        stage: &'static str,
        status: Option<u16>,
        detail: Option<String>,
    },
    #[snafu(display("transport unavailable on `{stage}`: {detail}"))]
    Unavailable { stage: &'static str, detail: String },
}

impl TransportError {
    /// Human-readable message supplied by the server, if any.
    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::AuthExpired { .. } => None,
            Self::Rejected { detail, .. } => detail.as_deref(),
            Self::Unavailable { detail, .. } => Some(detail.as_str()),
        }
    }

    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::AuthExpired { .. })
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SyncError {
    #[snafu(display("failed to bootstrap sessions on `{stage}`: {source}"))]
    Bootstrap {
        stage: &'static str,
        source: TransportError,
    },
    #[snafu(display("failed to send message to session '{session_id}' on `{stage}`: {source}"))]
    Send {
        stage: &'static str,
        session_id: SessionId,
        source: TransportError,
    },
    #[snafu(display("failed to {operation} session on `{stage}`: {source}"))]
    Mutation {
        stage: &'static str,
        operation: &'static str,
        source: TransportError,
    },
    #[snafu(display("failed to load messages for session '{session_id}' on `{stage}`: {source}"))]
    LoadMessages {
        stage: &'static str,
        session_id: SessionId,
        source: TransportError,
    },
    #[snafu(display(
        "message was sent to session '{session_id}' but reloading the conversation failed on `{stage}`: {source}"
    ))]
    Reconcile {
        stage: &'static str,
        session_id: SessionId,
        source: TransportError,
    },
    #[snafu(display("session '{session_id}' is not in the session list"))]
    UnknownSession {
        stage: &'static str,
        session_id: SessionId,
    },
    #[snafu(display("no session is currently selected"))]
    NoActiveSession { stage: &'static str },
    #[snafu(display("sync id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
    },
}

impl SyncError {
    fn transport_source(&self) -> Option<&TransportError> {
        match self {
            Self::Bootstrap { source, .. }
            | Self::Send { source, .. }
            | Self::Mutation { source, .. }
            | Self::LoadMessages { source, .. }
            | Self::Reconcile { source, .. } => Some(source),
            Self::UnknownSession { .. } | Self::NoActiveSession { .. } | Self::InvalidId { .. } => {
                None
            }
        }
    }

    /// Server detail carried by the underlying transport failure.
    pub fn detail(&self) -> Option<&str> {
        self.transport_source().and_then(TransportError::detail)
    }

    pub fn is_auth_expired(&self) -> bool {
        self.transport_source()
            .is_some_and(TransportError::is_auth_expired)
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

fn render_detail(detail: &Option<String>) -> String {
    match detail {
        Some(detail) => format!(": {detail}"),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_error_exposes_server_detail() {
        let error = SyncError::Send {
            stage: "test",
            session_id: SessionId::new("7"),
            source: TransportError::Rejected {
                stage: "send-message",
                status: Some(503),
                detail: Some("agent is overloaded".to_string()),
            },
        };

        assert_eq!(error.detail(), Some("agent is overloaded"));
        assert!(!error.is_auth_expired());
        assert!(error.to_string().contains("agent is overloaded"));
    }

    #[test]
    fn auth_expiry_is_visible_through_sync_errors() {
        let error = SyncError::Mutation {
            stage: "test",
            operation: "delete",
            source: TransportError::AuthExpired {
                stage: "delete-session",
            },
        };

        assert!(error.is_auth_expired());
        assert_eq!(error.detail(), None);
    }

    #[test]
    fn local_errors_carry_no_transport_detail() {
        let error = SyncError::NoActiveSession { stage: "test" };
        assert_eq!(error.detail(), None);
        assert!(!error.is_auth_expired());
    }
}
