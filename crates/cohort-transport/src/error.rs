use crate::Address;

/// Errors returned by a transport adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("group {group} temporarily unreachable")]
    Unreachable { group: String },

    #[error("transport busy: {0}")]
    Busy(String),

    #[error("group {group} not found")]
    NotFound { group: String },

    #[error("group {group} already advertised")]
    AlreadyExists { group: String },

    #[error("recipient {address} is not in the session")]
    UnknownRecipient { address: Address },

    #[error("session {session} is closed")]
    SessionClosed { session: u64 },

    #[error("transport is shut down")]
    Shutdown,
}

impl TransportError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Unreachable { .. } | TransportError::Busy(_)
        )
    }
}
