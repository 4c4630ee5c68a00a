use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::ensure;
use uuid::Uuid;

use super::error::{InvalidIdSnafu, SyncError, SyncResult};

/// Prefix marking message ids minted locally for optimistic entries.
pub const LOCAL_MESSAGE_ID_PREFIX: &str = "local-";

// Ids are opaque strings owned by the server; wrappers only keep them from being mixed up.
macro_rules! define_sync_id {
    ($name:ident, $id_type:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn parse(raw: &str) -> SyncResult<Self> {
                let trimmed = raw.trim();
                ensure!(
                    !trimmed.is_empty(),
                    InvalidIdSnafu {
                        stage: "parse-sync-id",
                        id_type: $id_type,
                        raw: raw.to_string(),
                    }
                );
                Ok(Self(trimmed.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = SyncError;

            fn from_str(raw: &str) -> SyncResult<Self> {
                Self::parse(raw)
            }
        }
    };
}

define_sync_id!(SessionId, "session-id");
define_sync_id!(MessageId, "message-id");

impl MessageId {
    /// Mints a process-unique id for a message the server has not seen yet.
    pub fn local() -> Self {
        Self(format!("{LOCAL_MESSAGE_ID_PREFIX}{}", Uuid::now_v7()))
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_MESSAGE_ID_PREFIX)
    }
}
