/// Coordination-level errors.
///
/// Wraps transport errors and adds the failures that leave a node unable
/// to participate in a group (join exhaustion, missing callbacks).
#[derive(Debug, thiserror::Error)]
pub enum CohortError {
    #[error("transport error: {0}")]
    Transport(#[from] cohort_transport::TransportError),

    #[error("fitness callback not implemented: {callback}")]
    NotImplemented { callback: &'static str },

    #[error("could not join or create {group} after {attempts} attempts: {source}")]
    JoinFailed {
        group: String,
        attempts: u32,
        #[source]
        source: cohort_transport::TransportError,
    },

    #[error("no supervisor known for {group}")]
    NoSupervisor { group: String },

    #[error("channel for {group} is closed")]
    ChannelClosed { group: String },

    #[error("not connected to {group}")]
    NotConnected { group: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl From<rmp_serde::encode::Error> for CohortError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        CohortError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CohortError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        CohortError::Deserialization(e.to_string())
    }
}
