/// Message: the unit of control and application traffic in a group.
///
/// Wire format: MessagePack via `rmp-serde`. The `reason` travels as a
/// `u16` code so that codes this build does not know still decode (as
/// [`Reason::Unrecognized`]) and can be ignored.
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CohortError;
use crate::group::split::SplitCriterion;
use crate::group::LedgerSnapshot;
use crate::types::{Address, GroupName, RequestId};

/// First wire code reserved for application reasons.
pub const APPLICATION_BASE: u16 = 1000;

/// Control or application code carried by every [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", from = "u16")]
pub enum Reason {
    // Election
    QuerySupervisor,
    SupervisorAnnounce,
    /// Sent by link channels so members never pick them for a split.
    LinkNotice,
    // Hierarchy
    HierarchyQuery,
    HierarchySnapshot,
    HierarchyAddParent,
    HierarchyRemoveParent,
    SplitCounter,
    // Topology
    StackRequest,
    StackReply,
    ReverseStackRequest,
    ReverseStackReply,
    MergeRequest,
    MergeNotify,
    MergeReply,
    SplitRequest,
    SplitMigrate,
    SplitByFitness,
    SplitReply,
    /// Application-defined code, relative to [`APPLICATION_BASE`].
    Application(u16),
    /// A control code this build does not know.
    Unrecognized(u16),
}

impl Reason {
    pub fn is_control(&self) -> bool {
        !matches!(self, Reason::Application(_))
    }

    pub fn code(&self) -> u16 {
        match self {
            Reason::QuerySupervisor => 1,
            Reason::SupervisorAnnounce => 2,
            Reason::LinkNotice => 3,
            Reason::HierarchyQuery => 10,
            Reason::HierarchySnapshot => 11,
            Reason::HierarchyAddParent => 12,
            Reason::HierarchyRemoveParent => 13,
            Reason::SplitCounter => 14,
            Reason::StackRequest => 20,
            Reason::StackReply => 21,
            Reason::ReverseStackRequest => 22,
            Reason::ReverseStackReply => 23,
            Reason::MergeRequest => 30,
            Reason::MergeNotify => 31,
            Reason::MergeReply => 32,
            Reason::SplitRequest => 40,
            Reason::SplitMigrate => 41,
            Reason::SplitByFitness => 42,
            Reason::SplitReply => 43,
            Reason::Application(code) => APPLICATION_BASE.saturating_add(*code),
            Reason::Unrecognized(code) => *code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            1 => Reason::QuerySupervisor,
            2 => Reason::SupervisorAnnounce,
            3 => Reason::LinkNotice,
            10 => Reason::HierarchyQuery,
            11 => Reason::HierarchySnapshot,
            12 => Reason::HierarchyAddParent,
            13 => Reason::HierarchyRemoveParent,
            14 => Reason::SplitCounter,
            20 => Reason::StackRequest,
            21 => Reason::StackReply,
            22 => Reason::ReverseStackRequest,
            23 => Reason::ReverseStackReply,
            30 => Reason::MergeRequest,
            31 => Reason::MergeNotify,
            32 => Reason::MergeReply,
            40 => Reason::SplitRequest,
            41 => Reason::SplitMigrate,
            42 => Reason::SplitByFitness,
            43 => Reason::SplitReply,
            c if c >= APPLICATION_BASE => Reason::Application(c - APPLICATION_BASE),
            c => Reason::Unrecognized(c),
        }
    }
}

impl From<Reason> for u16 {
    fn from(reason: Reason) -> u16 {
        reason.code()
    }
}

impl From<u16> for Reason {
    fn from(code: u16) -> Reason {
        Reason::from_code(code)
    }
}

/// A control or application message.
///
/// Immutable once queued, except `sender` which the sending channel stamps
/// just before transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// `None` until sent.
    #[serde(default)]
    pub sender: Option<Address>,
    pub reason: Reason,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub extra: Vec<u8>,
    /// Destination addresses; empty means broadcast/default routing.
    #[serde(default)]
    pub addresses: Vec<Address>,
}

impl Message {
    pub fn new(reason: Reason, payload: impl Into<String>) -> Self {
        Self {
            sender: None,
            reason,
            payload: payload.into(),
            extra: Vec::new(),
            addresses: Vec::new(),
        }
    }

    /// An application message with an application-relative code.
    pub fn application(code: u16, payload: impl Into<String>) -> Self {
        Self::new(Reason::Application(code), payload)
    }

    /// A control message whose structured body is encoded into `extra`.
    pub fn control<T: Serialize>(reason: Reason, body: &T) -> Result<Self, CohortError> {
        Ok(Self {
            extra: rmp_serde::to_vec_named(body)?,
            ..Self::new(reason, String::new())
        })
    }

    pub fn with_extra(mut self, extra: Vec<u8>) -> Self {
        self.extra = extra;
        self
    }

    /// Decode the structured body of a control message.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T, CohortError> {
        Ok(rmp_serde::from_slice(&self.extra)?)
    }

    pub fn is_control(&self) -> bool {
        self.reason.is_control()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CohortError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CohortError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

// ── Control bodies ───────────────────────────────────────────────────────

/// "Current supervisor is X with fitness f."
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorAnnounce {
    pub supervisor: Address,
    pub fitness: f64,
}

/// Topology operation requested of a group's supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TopologyOp {
    Stack { parent: GroupName },
    ReverseStack { parent: GroupName },
    Merge { destination: GroupName },
    Split { count: usize },
    SplitByFitness { criterion: SplitCriterion },
}

impl TopologyOp {
    pub fn request_reason(&self) -> Reason {
        match self {
            TopologyOp::Stack { .. } => Reason::StackRequest,
            TopologyOp::ReverseStack { .. } => Reason::ReverseStackRequest,
            TopologyOp::Merge { .. } => Reason::MergeRequest,
            TopologyOp::Split { .. } | TopologyOp::SplitByFitness { .. } => Reason::SplitRequest,
        }
    }

    pub fn reply_reason(&self) -> Reason {
        match self {
            TopologyOp::Stack { .. } => Reason::StackReply,
            TopologyOp::ReverseStack { .. } => Reason::ReverseStackReply,
            TopologyOp::Merge { .. } => Reason::MergeReply,
            TopologyOp::Split { .. } | TopologyOp::SplitByFitness { .. } => Reason::SplitReply,
        }
    }
}

/// Request forwarded to the supervisor (requester → supervisor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyRequest {
    pub request_id: RequestId,
    pub op: TopologyOp,
}

/// Outcome of a request or a migration (→ requester).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyReply {
    pub request_id: RequestId,
    pub ok: bool,
}

/// Instruction to leave this group for `destination` (supervisor → members).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrateOrder {
    pub request_id: RequestId,
    pub destination: GroupName,
}

/// Split by member-evaluated fitness (supervisor → members).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitnessSplitOrder {
    pub subgroup: GroupName,
    pub criterion: SplitCriterion,
}

/// Hierarchy snapshot reply body (supervisor → joiner).
pub type HierarchySnapshot = LedgerSnapshot;

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_CONTROL: [Reason; 19] = [
        Reason::QuerySupervisor,
        Reason::SupervisorAnnounce,
        Reason::LinkNotice,
        Reason::HierarchyQuery,
        Reason::HierarchySnapshot,
        Reason::HierarchyAddParent,
        Reason::HierarchyRemoveParent,
        Reason::SplitCounter,
        Reason::StackRequest,
        Reason::StackReply,
        Reason::ReverseStackRequest,
        Reason::ReverseStackReply,
        Reason::MergeRequest,
        Reason::MergeNotify,
        Reason::MergeReply,
        Reason::SplitRequest,
        Reason::SplitMigrate,
        Reason::SplitByFitness,
        Reason::SplitReply,
    ];

    #[test]
    fn control_codes_are_stable_and_distinct() {
        let mut codes: Vec<u16> = ALL_CONTROL.iter().map(Reason::code).collect();
        for reason in ALL_CONTROL {
            assert_eq!(Reason::from_code(reason.code()), reason);
            assert!(reason.is_control());
        }
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), ALL_CONTROL.len());
    }

    #[test]
    fn application_codes_offset() {
        let reason = Reason::Application(7);
        assert_eq!(reason.code(), 1007);
        assert_eq!(Reason::from_code(1007), reason);
        assert!(!reason.is_control());
    }

    #[test]
    fn unknown_control_code_is_unrecognized() {
        assert_eq!(Reason::from_code(999), Reason::Unrecognized(999));
        assert!(Reason::Unrecognized(999).is_control());
    }

    #[test]
    fn message_bytes_roundtrip() {
        let msg = Message::application(3, "hello").with_extra(vec![1, 2, 3]);
        let decoded = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.sender, None);
    }

    #[test]
    fn control_body_roundtrip() {
        let announce = SupervisorAnnounce {
            supervisor: Address::from("node-a"),
            fitness: 5.0,
        };
        let msg = Message::control(Reason::SupervisorAnnounce, &announce).unwrap();
        let wire = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(wire.reason, Reason::SupervisorAnnounce);
        assert_eq!(wire.body::<SupervisorAnnounce>().unwrap(), announce);
    }

    #[test]
    fn unknown_reason_survives_decode() {
        let mut msg = Message::new(Reason::QuerySupervisor, "");
        msg.reason = Reason::Unrecognized(500);
        let decoded = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.reason, Reason::Unrecognized(500));
    }

    #[test]
    fn request_and_reply_reasons_pair_up() {
        let op = TopologyOp::Merge {
            destination: GroupName::from("H"),
        };
        assert_eq!(op.request_reason(), Reason::MergeRequest);
        assert_eq!(op.reply_reason(), Reason::MergeReply);
        let split = TopologyOp::Split { count: 2 };
        assert_eq!(split.reply_reason(), Reason::SplitReply);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(matches!(
            Message::from_bytes(&[0xc1, 0x00]),
            Err(CohortError::Deserialization(_))
        ));
    }
}
