use tokio::sync::mpsc;

use crate::{Address, TransportError};

/// Opaque handle for one joined or created group session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub group: String,
    pub id: u64,
}

/// Inbound traffic and membership changes for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Unicast { from: Address, data: Vec<u8> },
    Multicast { from: Address, data: Vec<u8> },
    Broadcast { from: Address, data: Vec<u8> },
    Control { from: Address, data: Vec<u8> },
    MemberJoined(Address),
    MemberLeft(Address),
    /// The session is gone; no further events follow.
    SessionLost,
}

/// A live group session returned by create/join.
#[derive(Debug)]
pub struct Session {
    pub handle: SessionHandle,
    /// Our own address in this session.
    pub local: Address,
    /// Members already present when we joined (excluding ourselves).
    pub members: Vec<Address>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Discovery-and-messaging transport driven by the coordination engine.
///
/// Implementations must be cheap to share behind an `Arc`. Every send
/// reports failure through [`TransportError`]; callers decide whether to
/// retry using [`TransportError::is_transient`].
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// This endpoint's address.
    fn local_address(&self) -> Address;

    /// Whether a group with this name is currently advertised.
    async fn discover(&self, group: &str) -> Result<bool, TransportError>;

    /// Advertise and create a new group session with us as the only member.
    async fn create_group(&self, group: &str) -> Result<Session, TransportError>;

    /// Join an advertised group session.
    async fn join_group(&self, group: &str) -> Result<Session, TransportError>;

    /// Leave a session. Leaving an already-closed session is not an error.
    async fn leave_group(&self, handle: &SessionHandle) -> Result<(), TransportError>;

    async fn send_unicast(
        &self,
        handle: &SessionHandle,
        data: &[u8],
        to: &Address,
    ) -> Result<(), TransportError>;

    async fn send_multicast(
        &self,
        handle: &SessionHandle,
        data: &[u8],
        to: &[Address],
    ) -> Result<(), TransportError>;

    async fn send_broadcast(&self, handle: &SessionHandle, data: &[u8])
        -> Result<(), TransportError>;

    async fn send_control(&self, handle: &SessionHandle, data: &[u8])
        -> Result<(), TransportError>;
}
