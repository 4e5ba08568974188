/// Supervisor election rules.
///
/// Pure decisions, no I/O: the dispatcher feeds in what it knows (view,
/// own fitness, the announcement it received) and executes the outcome.
/// Every member applies the same rules to the same announcements, so the
/// group converges on the candidate with the highest supervisor fitness.
use crate::group::view::GroupView;
use crate::message::SupervisorAnnounce;
use crate::types::Address;

/// What to do when an election round starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryDecision {
    /// No peer to contend with: take the supervisor role directly.
    BecomeSupervisor,
    /// Ask the group who its supervisor is and arm the election timeout.
    QuerySupervisor,
}

/// What to do with a received "current supervisor = X, fitness = f".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceOutcome {
    /// Our fitness wins: become (or stay) supervisor and re-announce.
    TakeOver,
    /// Accept X as supervisor and run the follower role.
    Follow,
    /// X wins and we cannot follow: leave the group.
    Leave,
}

/// What to do when the election timeout fires without an announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutDecision {
    BecomeSupervisor,
    /// We cannot supervise; ask again.
    Requery,
}

/// Our side of a comparison.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub address: &'a Address,
    /// `None` when we do not hold the supervisor role.
    pub fitness: Option<f64>,
    /// Whether we currently act as supervisor.
    pub is_supervisor: bool,
    /// Whether we hold the follower role.
    pub can_follow: bool,
}

/// Decide how to start an election round.
pub fn on_entry(view: &GroupView, local: &Address, can_supervise: bool) -> EntryDecision {
    let alone = view.is_empty() || view.is_only_member(local);
    if alone && can_supervise {
        EntryDecision::BecomeSupervisor
    } else {
        EntryDecision::QuerySupervisor
    }
}

/// Compare ourselves against an announced supervisor.
///
/// Only strictly greater fitness switches, so at equal fitness the
/// announced supervisor keeps the role. The one exception is two sitting
/// supervisors with equal fitness (simultaneous self-promotion): the
/// smaller address keeps the role so both sides agree.
pub fn on_announcement(local: Candidate<'_>, announced: &SupervisorAnnounce) -> AnnounceOutcome {
    if let Some(own) = local.fitness {
        let higher = own > announced.fitness;
        let tie_won = own == announced.fitness
            && local.is_supervisor
            && local.address < &announced.supervisor;
        if higher || tie_won {
            return AnnounceOutcome::TakeOver;
        }
    }
    if local.can_follow {
        AnnounceOutcome::Follow
    } else {
        AnnounceOutcome::Leave
    }
}

/// Decide what to do when nobody answered the supervisor query.
pub fn on_timeout(can_supervise: bool) -> TimeoutDecision {
    if can_supervise {
        TimeoutDecision::BecomeSupervisor
    } else {
        TimeoutDecision::Requery
    }
}
