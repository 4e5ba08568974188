/// Application roles: supervisor and follower behavior plugged into a group.
///
/// A channel runs at most one role at a time. Roles see only application
/// messages and the [`GroupChannel`] handle; control traffic never reaches
/// them. Activation and deactivation are driven by election outcomes.
mod runner;

pub(crate) use runner::RoleRunner;

use crate::message::Message;
use crate::runtime::GroupChannel;

#[async_trait::async_trait]
pub trait Role: Send {
    /// Called once when the role becomes the channel's active role.
    async fn on_activate(&mut self, _channel: &GroupChannel) {}

    /// An application message addressed to this group.
    async fn on_application_message(&mut self, channel: &GroupChannel, message: Message);

    /// Called once when the role is replaced or the channel closes.
    async fn on_deactivate(&mut self, _channel: &GroupChannel) {}
}
