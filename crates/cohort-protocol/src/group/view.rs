/// GroupView: the member addresses of one group.
///
/// Owned by the channel's dispatcher (single writer). Adding an existing
/// member or removing an absent one leaves the view unchanged.
use crate::types::Address;

/// Outcome of [`GroupView::remove_member`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The address was not a member.
    Absent,
    Removed,
    /// The removed address was the current supervisor.
    SupervisorLeft,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupView {
    /// Insertion order; each address at most once.
    members: Vec<Address>,
}

impl GroupView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member. Returns `false` if it was already present.
    pub fn add_member(&mut self, addr: Address) -> bool {
        if self.is_member(&addr) {
            return false;
        }
        self.members.push(addr);
        true
    }

    /// Remove a member, signalling when it was `supervisor`.
    pub fn remove_member(&mut self, addr: &Address, supervisor: Option<&Address>) -> Removal {
        let before = self.members.len();
        self.members.retain(|m| m != addr);
        if self.members.len() == before {
            Removal::Absent
        } else if supervisor == Some(addr) {
            Removal::SupervisorLeft
        } else {
            Removal::Removed
        }
    }

    pub fn is_member(&self, addr: &Address) -> bool {
        self.members.iter().any(|m| m == addr)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether `addr` is the one and only member.
    pub fn is_only_member(&self, addr: &Address) -> bool {
        self.members.len() == 1 && self.members[0] == *addr
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> &[Address] {
        &self.members
    }

    pub fn clear(&mut self) {
        self.members.clear();
    }
}
