//! Cohort transport boundary.
//!
//! The coordination engine in `cohort-protocol` never talks to a network
//! directly. It drives an implementation of [`Transport`]: name discovery,
//! group session create/join/leave, and unicast/multicast/broadcast/control
//! delivery keyed by [`Address`] strings. Inbound traffic and membership
//! changes arrive as [`TransportEvent`]s on the [`Session`] receiver.
//!
//! [`MemoryNetwork`] is an in-process implementation with fault injection,
//! used by the integration tests and the `cohort-sim` harness.
//!
//! # Quick start
//!
//! ```rust
//! use cohort_transport::{MemoryNetwork, Transport};
//!
//! # async fn example() -> Result<(), cohort_transport::TransportError> {
//! let network = MemoryNetwork::new();
//! let alice = network.endpoint("alice");
//! let bob = network.endpoint("bob");
//!
//! let session_a = alice.create_group("G").await?;
//! assert!(bob.discover("G").await?);
//! let session_b = bob.join_group("G").await?;
//! assert_eq!(session_b.members, vec![alice.local_address()]);
//!
//! bob.send_unicast(&session_b.handle, b"hi", &alice.local_address()).await?;
//! # drop(session_a);
//! # Ok(())
//! # }
//! ```

mod error;
mod memory;
mod session;

pub use error::TransportError;
pub use memory::{FaultOp, MemoryNetwork, MemoryTransport};
pub use session::{Session, SessionHandle, Transport, TransportEvent};

use serde::{Deserialize, Serialize};
use std::fmt;

/// A node's address inside a group session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Address {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for Address {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
