//! Cohort group coordination.
//!
//! Supervisor election, membership views, group hierarchies and runtime
//! reshaping (stack, reverse-stack, merge, split) on top of any
//! `cohort-transport` implementation.
//!
//! Wire format: MessagePack (compact binary).
//!
//! # Quick start
//!
//! ```rust,no_run
//! use cohort_protocol::{CohortConfig, ConstantFitness, GroupChannel, GroupDescriptor, Message, Node, Role, RoleSpec};
//! use cohort_transport::MemoryNetwork;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl Role for Echo {
//!     async fn on_application_message(&mut self, channel: &GroupChannel, message: Message) {
//!         let _ = channel.send_broadcast(message).await;
//!     }
//! }
//!
//! # async fn example() -> Result<(), cohort_protocol::CohortError> {
//! let network = MemoryNetwork::new();
//! let node = Node::new(network.endpoint("alice"), CohortConfig::default());
//! let descriptor = GroupDescriptor::new("G")
//!     .with_supervisor_role(RoleSpec::new("echo", || Echo))
//!     .with_fitness(ConstantFitness(5.0));
//! let channel = node.connect(descriptor).await?;
//! channel.wait_for(|s| s.is_supervisor).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod descriptor;
pub mod error;
pub mod group;
pub mod message;
pub mod node;
pub mod retry;
pub mod roles;
pub mod runtime;
pub mod types;

pub use config::CohortConfig;
pub use descriptor::{ConstantFitness, FitnessFunctions, GroupDescriptor, RoleSpec};
pub use error::CohortError;
pub use group::{GroupView, HierarchyLedger, LedgerSnapshot, Removal, SplitCriterion};
pub use message::{Message, Reason, TopologyOp, APPLICATION_BASE};
pub use node::Node;
pub use retry::{RetryExhausted, RetryPolicy};
pub use roles::Role;
pub use runtime::{ChannelKind, ChannelSnapshot, GroupChannel, ProtocolEvent};
pub use types::{ActiveRole, Address, GroupName, GroupState, RequestId};
