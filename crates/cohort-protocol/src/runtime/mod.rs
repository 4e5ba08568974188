/// Group runtime: one live event loop per group channel.
///
/// Each channel owns a dispatcher task (all view, ledger and election
/// state lives there), a sender task (outbound queue, retries) and at most
/// one role task. The application and the roles talk to it through the
/// cloneable [`GroupChannel`] handle and never touch raw bytes or control
/// traffic.
mod r#loop;
mod sender;
mod timers;

use std::sync::Arc;

use cohort_transport::{Session, SessionHandle, TransportError};
use tokio::sync::{mpsc, oneshot, watch};

use crate::descriptor::GroupDescriptor;
use crate::error::CohortError;
use crate::message::{Message, MigrateOrder, Reason, TopologyOp};
use crate::node::Node;
use crate::types::{ActiveRole, Address, GroupName, GroupState, RequestId};

use self::r#loop::Dispatcher;
use self::sender::SenderLoop;
use self::timers::Timers;

// ── Events (runtime → app) ───────────────────────────────────────────

/// Protocol-level events the application may want to observe.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// A channel moved to a new state.
    StateChanged { group: GroupName, state: GroupState },
    /// A channel learned (or became) its supervisor.
    SupervisorElected {
        group: GroupName,
        supervisor: Address,
        is_local: bool,
    },
    MemberJoined { group: GroupName, member: Address },
    MemberLeft { group: GroupName, member: Address },
    ParentAdded { group: GroupName, parent: GroupName },
    ParentRemoved { group: GroupName, parent: GroupName },
    SplitCounterAdvanced { group: GroupName, counter: u32 },
    /// The channel is gone: explicit disconnect, migration, lost election
    /// without a follower role, or reconnect exhaustion.
    Disconnected { group: GroupName, reason: String },
    /// Non-fatal error worth surfacing.
    Error { group: GroupName, description: String },
}

// ── Snapshot ──────────────────────────────────────────────────────────

/// Point-in-time view of a channel, published by its dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSnapshot {
    pub state: GroupState,
    pub supervisor: Option<Address>,
    pub is_supervisor: bool,
    pub active_role: ActiveRole,
    pub members: Vec<Address>,
    /// Members known to be link channels, sorted.
    pub links: Vec<Address>,
    pub parents: Vec<GroupName>,
    pub split_counter: u32,
    /// Set once the dispatcher has torn the channel down.
    pub closed: bool,
}

impl Default for ChannelSnapshot {
    fn default() -> Self {
        Self {
            state: GroupState::Idle,
            supervisor: None,
            is_supervisor: false,
            active_role: ActiveRole::None,
            members: Vec::new(),
            links: Vec::new(),
            parents: Vec::new(),
            split_counter: 0,
            closed: false,
        }
    }
}

/// How a node takes part in a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Full member: runs election and a role.
    Participant,
    /// Non-participating presence used to reach a group's supervisor
    /// (forwarded topology requests, parent links). Never elected, never
    /// runs a role, never migrates.
    Link,
}

// ── Internal plumbing ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub(crate) enum Route {
    Unicast(Address),
    Multicast(Vec<Address>),
    Broadcast,
    Control,
}

#[derive(Debug)]
pub(crate) struct Outbound {
    pub route: Route,
    pub message: Message,
}

/// Dispatcher → sender loop.
pub(crate) enum SenderInput {
    Send(Outbound),
    /// Transmit everything queued so far, then acknowledge.
    Flush(oneshot::Sender<()>),
}

/// Handle → dispatcher.
pub(crate) enum Command {
    Topology {
        op: TopologyOp,
        reply: oneshot::Sender<Result<bool, CohortError>>,
    },
    Close {
        reason: String,
        done: oneshot::Sender<()>,
    },
}

/// Results of work the dispatcher handed off to other tasks.
pub(crate) enum Internal {
    StaleRecipient(Address),
    SendFailed {
        session: SessionHandle,
        error: TransportError,
    },
    Reconnected(Result<Session, CohortError>),
    ParentAttached {
        request_id: RequestId,
        parent: GroupName,
        ok: bool,
    },
    MigrationDone {
        order: MigrateOrder,
        requester: Option<Address>,
        reply: Reason,
        ok: bool,
    },
}

// ── Handle ────────────────────────────────────────────────────────────

/// Cloneable handle to one group channel.
#[derive(Clone)]
pub struct GroupChannel {
    group: GroupName,
    local: Address,
    kind: ChannelKind,
    instance: u64,
    commands: mpsc::Sender<Command>,
    outbound: mpsc::Sender<Outbound>,
    snapshot: watch::Receiver<ChannelSnapshot>,
}

impl GroupChannel {
    pub fn group(&self) -> &GroupName {
        &self.group
    }

    /// This node's address in the group.
    pub fn channel_id(&self) -> &Address {
        &self.local
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub(crate) fn instance(&self) -> u64 {
        self.instance
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ChannelSnapshot> {
        self.snapshot.clone()
    }

    pub fn supervisor_id(&self) -> Option<Address> {
        self.snapshot.borrow().supervisor.clone()
    }

    pub fn is_supervisor(&self) -> bool {
        self.snapshot.borrow().is_supervisor
    }

    pub fn state(&self) -> GroupState {
        self.snapshot.borrow().state
    }

    pub fn members(&self) -> Vec<Address> {
        self.snapshot.borrow().members.clone()
    }

    /// Wait until the published snapshot satisfies `pred`.
    pub async fn wait_for(
        &self,
        mut pred: impl FnMut(&ChannelSnapshot) -> bool,
    ) -> Result<ChannelSnapshot, CohortError> {
        let mut rx = self.snapshot.clone();
        let result = rx.wait_for(|snapshot| pred(snapshot)).await;
        match result {
            Ok(snapshot) => Ok(snapshot.clone()),
            Err(_) => Err(self.closed()),
        }
    }

    pub async fn send_unicast(&self, to: Address, message: Message) -> Result<(), CohortError> {
        self.enqueue(Route::Unicast(to), message).await
    }

    pub async fn send_multicast(
        &self,
        to: Vec<Address>,
        message: Message,
    ) -> Result<(), CohortError> {
        self.enqueue(Route::Multicast(to), message).await
    }

    pub async fn send_broadcast(&self, message: Message) -> Result<(), CohortError> {
        self.enqueue(Route::Broadcast, message).await
    }

    pub async fn send_to_supervisor(&self, message: Message) -> Result<(), CohortError> {
        let Some(supervisor) = self.supervisor_id() else {
            return Err(CohortError::NoSupervisor {
                group: self.group.to_string(),
            });
        };
        self.enqueue(Route::Unicast(supervisor), message).await
    }

    async fn enqueue(&self, route: Route, message: Message) -> Result<(), CohortError> {
        if self.snapshot.borrow().closed {
            return Err(self.closed());
        }
        self.outbound
            .send(Outbound { route, message })
            .await
            .map_err(|_| self.closed())
    }

    /// Run a topology operation through this channel: performed here if we
    /// supervise, otherwise forwarded to the supervisor.
    pub(crate) async fn request(&self, op: TopologyOp) -> Result<bool, CohortError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Topology { op, reply })
            .await
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Leave the group and wait for the dispatcher to finish tearing down.
    pub(crate) async fn close(&self, reason: impl Into<String>) {
        let (done, rx) = oneshot::channel();
        let command = Command::Close {
            reason: reason.into(),
            done,
        };
        if self.commands.send(command).await.is_ok() {
            let _ = rx.await;
        }
    }

    fn closed(&self) -> CohortError {
        CohortError::ChannelClosed {
            group: self.group.to_string(),
        }
    }
}

impl std::fmt::Debug for GroupChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupChannel")
            .field("group", &self.group)
            .field("local", &self.local)
            .field("kind", &self.kind)
            .finish()
    }
}

// ── Spawning ──────────────────────────────────────────────────────────

/// Start the dispatcher and sender tasks for a freshly opened session.
pub(crate) fn spawn_channel(
    node: &Node,
    descriptor: GroupDescriptor,
    kind: ChannelKind,
    session: Session,
) -> GroupChannel {
    let config = node.config().clone();
    let transport = node.transport();

    let (commands_tx, commands_rx) = mpsc::channel(32);
    let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(ChannelSnapshot::default());
    let (session_tx, session_rx) = watch::channel(Some(session.handle.clone()));
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();
    let (timers, timer_rx) = Timers::new();

    let handle = GroupChannel {
        group: descriptor.name.clone(),
        local: session.local.clone(),
        kind,
        instance: node.next_instance(),
        commands: commands_tx,
        outbound: outbound_tx,
        snapshot: snapshot_rx,
    };

    let sender = SenderLoop {
        transport: Arc::clone(&transport),
        local: session.local.clone(),
        group: descriptor.name.clone(),
        session: session_rx,
        retry: config.retry.clone(),
        internal: internal_tx.clone(),
    };
    tokio::spawn(sender.run(control_rx, outbound_rx));

    let Session {
        handle: session_handle,
        members,
        events,
        ..
    } = session;

    let dispatcher = Dispatcher::new(r#loop::Parts {
        descriptor,
        kind,
        config,
        transport,
        node: node.downgrade(),
        events: node.event_sender(),
        handle: handle.clone(),
        session: session_handle,
        session_events: events,
        session_tx,
        commands: commands_rx,
        control_tx,
        internal_tx,
        internal_rx,
        timers,
        timer_rx,
        snapshot_tx,
    });
    tokio::spawn(dispatcher.run(members));

    handle
}
