use serde::{Deserialize, Serialize};
use std::fmt;

pub use cohort_transport::Address;

/// Name of a group, as advertised on the transport.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupName(pub String);

impl GroupName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the subgroup produced by split number `counter`: `<name>_<counter>`.
    pub fn subgroup(&self, counter: u32) -> GroupName {
        GroupName(format!("{}_{}", self.0, counter))
    }

    /// Whether `other` is one of this group's `<name>_<n>` subgroups.
    pub fn is_subgroup(&self, other: &GroupName) -> bool {
        other
            .0
            .strip_prefix(self.0.as_str())
            .and_then(|rest| rest.strip_prefix('_'))
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
    }
}

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for GroupName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for GroupName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for GroupName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Correlates a topology request with its reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-channel state machine.
///
/// `Idle → Election → Active → {Stack | ReverseStack | Merge | Split} → Active`.
/// The topology states are bookkeeping markers and always return to `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupState {
    Idle,
    Election,
    Active,
    Stack,
    ReverseStack,
    Merge,
    Split,
}

impl GroupState {
    /// Whether this is one of the transient topology states.
    pub fn is_topology(&self) -> bool {
        matches!(
            self,
            GroupState::Stack | GroupState::ReverseStack | GroupState::Merge | GroupState::Split
        )
    }
}

/// Which application role is currently running on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActiveRole {
    None,
    Supervisor,
    Follower,
}
