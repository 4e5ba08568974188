/// Drives one role instance on its own task.
///
/// The dispatcher never awaits role callbacks: messages go through a
/// bounded mailbox, and stopping a runner lets the task drain into
/// `on_deactivate` on its own. A runner started while its predecessor is
/// still deactivating waits for it, so two roles of one channel are never
/// live at once.
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::message::Message;
use crate::roles::Role;
use crate::runtime::GroupChannel;
use crate::types::ActiveRole;

pub(crate) struct RoleRunner {
    kind: ActiveRole,
    mailbox: mpsc::Sender<Message>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RoleRunner {
    pub(crate) fn start(
        kind: ActiveRole,
        mut role: Box<dyn Role>,
        channel: GroupChannel,
        capacity: usize,
        previous: Option<JoinHandle<()>>,
    ) -> Self {
        let (mailbox, mut rx) = mpsc::channel::<Message>(capacity.max(1));
        let (stop, mut stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            // stopped before it ever ran
            if !matches!(stop_rx.try_recv(), Err(TryRecvError::Empty)) {
                return;
            }
            tracing::debug!(group = %channel.group(), ?kind, "role activated");
            role.on_activate(&channel).await;
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    message = rx.recv() => match message {
                        Some(message) => role.on_application_message(&channel, message).await,
                        None => break,
                    },
                }
            }
            role.on_deactivate(&channel).await;
            tracing::debug!(group = %channel.group(), ?kind, "role deactivated");
        });

        Self {
            kind,
            mailbox,
            stop: Some(stop),
            task,
        }
    }

    pub(crate) fn kind(&self) -> ActiveRole {
        self.kind
    }

    /// Hand a message to the role. Drops it if the mailbox is full.
    pub(crate) fn deliver(&self, message: Message) -> bool {
        match self.mailbox.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(message)) => {
                tracing::warn!(reason = ?message.reason, "role mailbox full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the role to deactivate. Returns the task so callers may wait.
    pub(crate) fn stop(mut self) -> JoinHandle<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task
    }
}
