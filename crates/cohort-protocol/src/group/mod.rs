/// Per-group bookkeeping for the coordination engine.
///
/// Pure state and decision rules: no I/O. The runtime dispatcher owns one
/// view and one ledger per channel and applies these rules to them.
pub mod election;
pub mod hierarchy;
pub mod split;
pub mod view;

pub use election::{AnnounceOutcome, Candidate, EntryDecision, TimeoutDecision};
pub use hierarchy::{HierarchyLedger, LedgerSnapshot};
pub use split::SplitCriterion;
pub use view::{GroupView, Removal};
