/// The per-channel dispatcher.
///
/// A single task that owns all mutable state of one group channel (view,
/// ledger, election, pending topology operations) and multiplexes over
/// transport events, timer firings, results of offloaded work and handle
/// commands. Handlers never await: anything that needs a network round
/// trip runs on its own task and reports back as an [`Internal`] input.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use cohort_transport::{SessionHandle, Transport, TransportEvent};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::timers::{TimerId, TimerKind, Timers};
use super::{
    ChannelKind, ChannelSnapshot, Command, GroupChannel, Internal, Outbound, ProtocolEvent, Route,
    SenderInput,
};
use crate::config::CohortConfig;
use crate::descriptor::GroupDescriptor;
use crate::error::CohortError;
use crate::group::election::{self, AnnounceOutcome, Candidate, EntryDecision, TimeoutDecision};
use crate::group::split::{self, SplitCriterion};
use crate::group::{GroupView, HierarchyLedger, Removal};
use crate::message::{
    FitnessSplitOrder, HierarchySnapshot, Message, MigrateOrder, Reason, SupervisorAnnounce,
    TopologyOp, TopologyReply, TopologyRequest,
};
use crate::node::{self, Node, NodeInner};
use crate::roles::RoleRunner;
use crate::types::{ActiveRole, Address, GroupName, GroupState, RequestId};

/// Who is waiting for a topology operation's outcome.
enum Completion {
    /// A caller on this node.
    Local(oneshot::Sender<Result<bool, CohortError>>),
    /// A requester elsewhere in the group, answered with a reply message.
    Remote(Address),
}

enum Progress {
    /// Forward as soon as a supervisor is known.
    AwaitingSupervisor,
    /// Sent to the supervisor, waiting for its reply.
    Forwarded,
    /// Supervisor side of a stack: joining the parent group.
    JoiningParent,
    /// Supervisor side of merge/split: waiting for member replies.
    Collecting { expected: HashSet<Address>, ok: bool },
    /// Supervisor side of a merge: all replies in, migrating ourselves.
    Migrating { ok: bool },
}

struct PendingOp {
    op: TopologyOp,
    completion: Completion,
    progress: Progress,
    timer: Option<TimerId>,
}

/// Everything a dispatcher is built from.
pub(super) struct Parts {
    pub descriptor: GroupDescriptor,
    pub kind: ChannelKind,
    pub config: CohortConfig,
    pub transport: Arc<dyn Transport>,
    pub node: Weak<NodeInner>,
    pub events: broadcast::Sender<ProtocolEvent>,
    pub handle: GroupChannel,
    pub session: SessionHandle,
    pub session_events: mpsc::UnboundedReceiver<TransportEvent>,
    pub session_tx: watch::Sender<Option<SessionHandle>>,
    pub commands: mpsc::Receiver<Command>,
    pub control_tx: mpsc::UnboundedSender<SenderInput>,
    pub internal_tx: mpsc::UnboundedSender<Internal>,
    pub internal_rx: mpsc::UnboundedReceiver<Internal>,
    pub timers: Timers,
    pub timer_rx: mpsc::UnboundedReceiver<TimerId>,
    pub snapshot_tx: watch::Sender<ChannelSnapshot>,
}

pub(super) struct Dispatcher {
    group: GroupName,
    local: Address,
    kind: ChannelKind,
    descriptor: GroupDescriptor,
    config: CohortConfig,
    transport: Arc<dyn Transport>,
    node: Weak<NodeInner>,
    events: broadcast::Sender<ProtocolEvent>,
    handle: GroupChannel,

    // ── Session ─────────────────────────────────────────────────────
    session: Option<SessionHandle>,
    session_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    session_tx: watch::Sender<Option<SessionHandle>>,
    reconnect_task: Option<JoinHandle<()>>,

    // ── Queues ──────────────────────────────────────────────────────
    commands: mpsc::Receiver<Command>,
    control_tx: mpsc::UnboundedSender<SenderInput>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    timers: Timers,
    timer_rx: mpsc::UnboundedReceiver<TimerId>,
    snapshot_tx: watch::Sender<ChannelSnapshot>,

    // ── Group state ─────────────────────────────────────────────────
    state: GroupState,
    supervisor: Option<Address>,
    is_supervisor: bool,
    view: GroupView,
    /// Members that announced themselves as link channels.
    links: HashSet<Address>,
    ledger: HierarchyLedger,
    role: Option<RoleRunner>,
    /// Task of the last stopped role, still running `on_deactivate`.
    retiring_role: Option<JoinHandle<()>>,
    pending: HashMap<RequestId, PendingOp>,
    migrating: bool,
    migrated_to: Option<GroupName>,

    exit: Option<String>,
    close_waiters: Vec<oneshot::Sender<()>>,
}

async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>) -> TransportEvent {
    match events {
        // a dropped sender means the session is gone
        Some(rx) => rx.recv().await.unwrap_or(TransportEvent::SessionLost),
        None => std::future::pending().await,
    }
}

impl Dispatcher {
    pub(super) fn new(parts: Parts) -> Self {
        Self {
            group: parts.descriptor.name.clone(),
            local: parts.handle.channel_id().clone(),
            kind: parts.kind,
            descriptor: parts.descriptor,
            config: parts.config,
            transport: parts.transport,
            node: parts.node,
            events: parts.events,
            handle: parts.handle,
            session: Some(parts.session),
            session_events: Some(parts.session_events),
            session_tx: parts.session_tx,
            reconnect_task: None,
            commands: parts.commands,
            control_tx: parts.control_tx,
            internal_tx: parts.internal_tx,
            internal_rx: parts.internal_rx,
            timers: parts.timers,
            timer_rx: parts.timer_rx,
            snapshot_tx: parts.snapshot_tx,
            state: GroupState::Idle,
            supervisor: None,
            is_supervisor: false,
            view: GroupView::new(),
            links: HashSet::new(),
            ledger: HierarchyLedger::new(),
            role: None,
            retiring_role: None,
            pending: HashMap::new(),
            migrating: false,
            migrated_to: None,
            exit: None,
            close_waiters: Vec::new(),
        }
    }

    pub(super) async fn run(mut self, members: Vec<Address>) {
        tracing::info!(group = %self.group, addr = %self.local, kind = ?self.kind, "channel opened");
        self.enter_session(members);
        self.publish();

        while self.exit.is_none() {
            tokio::select! {
                biased;
                event = next_event(&mut self.session_events) => self.on_transport_event(event),
                Some(id) = self.timer_rx.recv() => self.on_timer(id),
                Some(input) = self.internal_rx.recv() => self.on_internal(input),
                Some(command) = self.commands.recv() => self.on_command(command),
            }
            self.publish();
        }

        self.teardown().await;
    }

    // ── Inputs ──────────────────────────────────────────────────────

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Unicast { from, data }
            | TransportEvent::Multicast { from, data }
            | TransportEvent::Broadcast { from, data }
            | TransportEvent::Control { from, data } => self.on_data(from, &data),
            TransportEvent::MemberJoined(member) => {
                if self.view.add_member(member.clone()) {
                    tracing::debug!(group = %self.group, %member, "member joined");
                    if self.kind == ChannelKind::Link {
                        self.send(
                            Route::Unicast(member.clone()),
                            Message::new(Reason::LinkNotice, ""),
                        );
                    }
                    self.emit(ProtocolEvent::MemberJoined {
                        group: self.group.clone(),
                        member,
                    });
                }
            }
            TransportEvent::MemberLeft(member) => self.on_member_left(member),
            TransportEvent::SessionLost => {
                self.session_events = None;
                self.reconnect("session lost", None);
            }
        }
    }

    fn on_data(&mut self, from: Address, data: &[u8]) {
        let mut message = match Message::from_bytes(data) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(group = %self.group, %from, "undecodable message: {e}");
                return;
            }
        };
        let sender = message.sender.get_or_insert(from).clone();

        if message.is_control() {
            self.on_control(sender, message);
        } else if let Some(role) = &self.role {
            role.deliver(message);
        } else {
            tracing::debug!(group = %self.group, reason = ?message.reason, "no active role, dropping application message");
        }
    }

    fn on_control(&mut self, from: Address, message: Message) {
        match message.reason {
            Reason::QuerySupervisor => {
                if self.is_supervisor {
                    self.announce();
                }
            }
            Reason::SupervisorAnnounce => {
                if let Some(announce) = self.decode::<SupervisorAnnounce>(&message) {
                    self.on_announce(announce);
                }
            }
            Reason::LinkNotice => {
                if self.links.insert(from.clone()) {
                    tracing::debug!(group = %self.group, link = %from, "member is a link");
                }
            }
            Reason::HierarchyQuery => {
                if self.is_supervisor {
                    let snapshot = self.ledger.snapshot();
                    self.send_control(Route::Unicast(from), Reason::HierarchySnapshot, &snapshot);
                }
            }
            Reason::HierarchySnapshot => {
                if let Some(snapshot) = self.decode::<HierarchySnapshot>(&message) {
                    self.apply_hierarchy_snapshot(snapshot);
                }
            }
            Reason::HierarchyAddParent => {
                let parent = GroupName::from(message.payload);
                if self.ledger.add_parent(parent.clone()) {
                    self.emit(ProtocolEvent::ParentAdded {
                        group: self.group.clone(),
                        parent,
                    });
                }
            }
            Reason::HierarchyRemoveParent => {
                let parent = GroupName::from(message.payload);
                if self.ledger.remove_parent(&parent) {
                    self.emit(ProtocolEvent::ParentRemoved {
                        group: self.group.clone(),
                        parent,
                    });
                }
            }
            Reason::SplitCounter => {
                if let Some(counter) = self.decode::<u32>(&message) {
                    if self.ledger.observe_split_counter(counter) {
                        self.emit(ProtocolEvent::SplitCounterAdvanced {
                            group: self.group.clone(),
                            counter,
                        });
                    }
                }
            }
            Reason::StackRequest
            | Reason::ReverseStackRequest
            | Reason::MergeRequest
            | Reason::SplitRequest => {
                if let Some(request) = self.decode::<TopologyRequest>(&message) {
                    self.on_topology_request(from, request);
                }
            }
            Reason::StackReply | Reason::ReverseStackReply | Reason::MergeReply | Reason::SplitReply => {
                if let Some(reply) = self.decode::<TopologyReply>(&message) {
                    self.on_topology_reply(from, reply);
                }
            }
            Reason::MergeNotify => {
                if let Some(order) = self.decode::<MigrateOrder>(&message) {
                    self.on_migrate_order(from, order, Reason::MergeReply);
                }
            }
            Reason::SplitMigrate => {
                if let Some(order) = self.decode::<MigrateOrder>(&message) {
                    self.on_migrate_order(from, order, Reason::SplitReply);
                }
            }
            Reason::SplitByFitness => {
                if let Some(order) = self.decode::<FitnessSplitOrder>(&message) {
                    self.on_fitness_split(order);
                }
            }
            Reason::Unrecognized(code) => {
                tracing::debug!(group = %self.group, code, "ignoring unrecognized control message");
            }
            Reason::Application(_) => {}
        }
    }

    fn on_timer(&mut self, id: TimerId) {
        let Some(kind) = self.timers.take(id) else {
            return;
        };
        match kind {
            TimerKind::ElectionStart => self.start_election_round(),
            TimerKind::ElectionTimeout => self.on_election_timeout(),
            TimerKind::Operation(request_id) => self.on_operation_timeout(request_id),
            TimerKind::Migrate {
                order,
                requester,
                reply,
            } => self.begin_migration(order, requester, reply),
        }
    }

    fn on_internal(&mut self, input: Internal) {
        match input {
            Internal::StaleRecipient(address) => self.on_stale_recipient(address),
            Internal::SendFailed { session, error } => {
                if self.session.as_ref() == Some(&session) {
                    self.reconnect(&format!("send failed: {error}"), Some(session));
                }
            }
            Internal::Reconnected(result) => self.on_reconnected(result),
            Internal::ParentAttached {
                request_id,
                parent,
                ok,
            } => self.on_parent_attached(request_id, parent, ok),
            Internal::MigrationDone {
                order,
                requester,
                reply,
                ok,
            } => self.on_migration_done(order, requester, reply, ok),
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Topology { op, reply } => {
                let request_id = RequestId::new();
                let completion = Completion::Local(reply);
                if self.kind == ChannelKind::Participant && self.is_supervisor {
                    self.perform(request_id, op, completion);
                } else {
                    self.forward(request_id, op, completion);
                }
            }
            Command::Close { reason, done } => {
                self.close_waiters.push(done);
                if self.exit.is_none() {
                    self.exit = Some(reason);
                }
            }
        }
    }

    // ── Membership & session ────────────────────────────────────────

    /// Start over on a fresh session: rebuild the view and schedule election.
    fn enter_session(&mut self, members: Vec<Address>) {
        self.view.clear();
        self.links.clear();
        self.view.add_member(self.local.clone());
        for member in members {
            self.view.add_member(member);
        }
        self.supervisor = None;
        self.is_supervisor = false;
        self.set_state(GroupState::Election);

        self.timers.cancel_where(TimerKind::is_election);
        let delay = self.config.jittered(self.config.join_settle_delay);
        self.timers.arm(TimerKind::ElectionStart, delay);

        if self.view.size() > 1 {
            self.send(Route::Control, Message::new(Reason::HierarchyQuery, ""));
            if self.kind == ChannelKind::Link {
                self.send(Route::Control, Message::new(Reason::LinkNotice, ""));
            }
        }
    }

    fn on_member_left(&mut self, member: Address) {
        let removal = self.view.remove_member(&member, self.supervisor.as_ref());
        if removal == Removal::Absent {
            return;
        }
        tracing::debug!(group = %self.group, %member, "member left");
        self.links.remove(&member);
        self.emit(ProtocolEvent::MemberLeft {
            group: self.group.clone(),
            member: member.clone(),
        });
        self.drop_expected_reply(&member);
        if removal == Removal::SupervisorLeft {
            self.on_supervisor_left();
        }
    }

    fn on_supervisor_left(&mut self) {
        tracing::info!(group = %self.group, addr = %self.local, "supervisor left");
        self.supervisor = None;
        self.resolve_forwarded(false);
        if self.state == GroupState::Merge {
            // the group is dissolving; no point electing a new supervisor
            return;
        }
        self.set_state(GroupState::Election);
        self.timers.cancel_where(TimerKind::is_election);
        let delay = self.config.jittered(self.config.supervisor_left_delay);
        self.timers.arm(TimerKind::ElectionStart, delay);
    }

    fn on_stale_recipient(&mut self, address: Address) {
        let removal = self.view.remove_member(&address, self.supervisor.as_ref());
        if removal == Removal::Absent {
            // membership event already applied
            return;
        }
        tracing::warn!(group = %self.group, %address, "stale recipient in view, resynchronizing");
        self.links.remove(&address);
        self.emit(ProtocolEvent::MemberLeft {
            group: self.group.clone(),
            member: address.clone(),
        });
        self.drop_expected_reply(&address);
        if removal == Removal::SupervisorLeft {
            self.supervisor = None;
            self.resolve_forwarded(false);
        }
        let session = self.session.clone();
        self.reconnect("stale recipient", session);
    }

    /// Drop the session and rejoin under the retry policy.
    ///
    /// `leave` is the session to leave first, when it may still be alive.
    fn reconnect(&mut self, reason: &str, leave: Option<SessionHandle>) {
        if self.reconnect_task.is_some() || self.exit.is_some() {
            return;
        }
        tracing::warn!(group = %self.group, addr = %self.local, "reconnecting: {reason}");

        let migrating = self.migrating || self.state == GroupState::Merge;
        if self.is_supervisor {
            self.release_parents();
        }
        self.session = None;
        self.session_events = None;
        self.session_tx.send_replace(None);
        self.timers.cancel_all();
        self.deactivate_role();
        self.supervisor = None;
        self.is_supervisor = false;
        self.view.clear();
        self.links.clear();
        self.resolve_all_pending();
        self.set_state(GroupState::Idle);

        if migrating {
            self.exit = Some(format!("{reason} while leaving the group"));
            return;
        }

        let transport = Arc::clone(&self.transport);
        let group = self.group.clone();
        let retry = self.config.retry.clone();
        let create = self.kind == ChannelKind::Participant;
        let tx = self.internal_tx.clone();
        self.reconnect_task = Some(tokio::spawn(async move {
            if let Some(handle) = leave {
                let _ = transport.leave_group(&handle).await;
            }
            let result = node::open_session(&*transport, &group, &retry, create).await;
            let _ = tx.send(Internal::Reconnected(result));
        }));
    }

    fn on_reconnected(&mut self, result: Result<cohort_transport::Session, CohortError>) {
        self.reconnect_task = None;
        match result {
            Ok(session) => {
                tracing::info!(group = %self.group, addr = %self.local, "rejoined group");
                self.session_tx.send_replace(Some(session.handle.clone()));
                self.session = Some(session.handle);
                self.session_events = Some(session.events);
                self.enter_session(session.members);
            }
            Err(e) => {
                tracing::error!(group = %self.group, addr = %self.local, "reconnect failed: {e}");
                self.exit = Some(format!("reconnect failed: {e}"));
            }
        }
    }

    // ── Election ────────────────────────────────────────────────────

    fn can_supervise(&self) -> bool {
        self.kind == ChannelKind::Participant && self.descriptor.can_supervise()
    }

    fn can_follow(&self) -> bool {
        self.kind == ChannelKind::Participant && self.descriptor.can_follow()
    }

    fn start_election_round(&mut self) {
        if self.supervisor.is_some() {
            return;
        }
        if self.kind == ChannelKind::Participant {
            let decision = election::on_entry(&self.view, &self.local, self.can_supervise());
            if decision == EntryDecision::BecomeSupervisor {
                self.become_supervisor();
                return;
            }
        }
        self.query_supervisor();
    }

    fn query_supervisor(&mut self) {
        tracing::debug!(group = %self.group, addr = %self.local, "querying supervisor");
        self.send(Route::Control, Message::new(Reason::QuerySupervisor, ""));
        self.timers
            .cancel_where(|kind| *kind == TimerKind::ElectionTimeout);
        self.timers
            .arm(TimerKind::ElectionTimeout, self.config.election_timeout);
    }

    fn on_election_timeout(&mut self) {
        if self.supervisor.is_some() {
            return;
        }
        match election::on_timeout(self.can_supervise()) {
            TimeoutDecision::BecomeSupervisor => self.become_supervisor(),
            TimeoutDecision::Requery => self.query_supervisor(),
        }
    }

    fn announce(&self) {
        let announce = SupervisorAnnounce {
            supervisor: self.local.clone(),
            fitness: self.descriptor.fitness.supervisor_fitness(),
        };
        self.send_control(Route::Control, Reason::SupervisorAnnounce, &announce);
    }

    fn on_announce(&mut self, announce: SupervisorAnnounce) {
        if announce.supervisor == self.local {
            return;
        }
        if self.kind == ChannelKind::Link {
            self.adopt_supervisor(announce.supervisor);
            return;
        }

        let candidate = Candidate {
            address: &self.local,
            fitness: self
                .can_supervise()
                .then(|| self.descriptor.fitness.supervisor_fitness()),
            is_supervisor: self.is_supervisor,
            can_follow: self.can_follow(),
        };
        match election::on_announcement(candidate, &announce) {
            AnnounceOutcome::TakeOver => {
                if self.is_supervisor {
                    self.announce();
                } else {
                    self.become_supervisor();
                }
            }
            AnnounceOutcome::Follow => {
                if self.is_supervisor || self.supervisor.as_ref() != Some(&announce.supervisor) {
                    self.become_follower(announce.supervisor);
                }
            }
            AnnounceOutcome::Leave => {
                tracing::info!(
                    group = %self.group,
                    addr = %self.local,
                    winner = %announce.supervisor,
                    "lost election without a follower role, leaving"
                );
                self.exit = Some(format!(
                    "{} supervises and no follower role is available",
                    announce.supervisor
                ));
            }
        }
    }

    fn become_supervisor(&mut self) {
        self.timers.cancel_where(TimerKind::is_election);
        let changed = !self.is_supervisor;
        self.is_supervisor = true;
        self.supervisor = Some(self.local.clone());
        self.activate_role(ActiveRole::Supervisor);
        self.settle_election();
        self.announce();
        if changed {
            tracing::info!(group = %self.group, addr = %self.local, "became supervisor");
            self.attach_parents(self.ledger.list_parents().to_vec());
            self.emit(ProtocolEvent::SupervisorElected {
                group: self.group.clone(),
                supervisor: self.local.clone(),
                is_local: true,
            });
        }
        self.flush_awaiting();
    }

    fn become_follower(&mut self, supervisor: Address) {
        self.timers.cancel_where(TimerKind::is_election);
        if self.is_supervisor {
            self.release_parents();
        }
        self.is_supervisor = false;
        self.supervisor = Some(supervisor.clone());
        self.activate_role(ActiveRole::Follower);
        self.settle_election();
        tracing::info!(group = %self.group, addr = %self.local, %supervisor, "following");
        self.emit(ProtocolEvent::SupervisorElected {
            group: self.group.clone(),
            supervisor,
            is_local: false,
        });
        self.flush_awaiting();
    }

    /// Links only need to know who the supervisor is.
    fn adopt_supervisor(&mut self, supervisor: Address) {
        self.timers.cancel_where(TimerKind::is_election);
        if self.supervisor.as_ref() != Some(&supervisor) {
            tracing::debug!(group = %self.group, %supervisor, "link learned supervisor");
            self.supervisor = Some(supervisor);
        }
        self.settle_election();
        self.flush_awaiting();
    }

    fn settle_election(&mut self) {
        if matches!(self.state, GroupState::Idle | GroupState::Election) {
            self.set_state(GroupState::Active);
        }
    }

    // ── Roles ───────────────────────────────────────────────────────

    fn activate_role(&mut self, kind: ActiveRole) {
        if self.role.as_ref().map(RoleRunner::kind) == Some(kind) {
            return;
        }
        self.deactivate_role();
        let spec = match kind {
            ActiveRole::Supervisor => self.descriptor.supervisor_role.as_ref(),
            ActiveRole::Follower => self.descriptor.follower_role.as_ref(),
            ActiveRole::None => None,
        };
        if let Some(spec) = spec {
            self.role = Some(RoleRunner::start(
                kind,
                spec.instantiate(),
                self.handle.clone(),
                self.config.role_mailbox_capacity,
                self.retiring_role.take(),
            ));
        }
    }

    /// Stop the active role. Its task runs `on_deactivate` by itself; the
    /// next role waits for it before activating.
    fn deactivate_role(&mut self) {
        if let Some(role) = self.role.take() {
            self.retiring_role = Some(role.stop());
        }
    }

    // ── Hierarchy ───────────────────────────────────────────────────

    fn apply_hierarchy_snapshot(&mut self, snapshot: HierarchySnapshot) {
        let before = self.ledger.clone();
        self.ledger.apply_snapshot(snapshot);
        let added: Vec<GroupName> = self
            .ledger
            .list_parents()
            .iter()
            .filter(|parent| !before.has_parent(parent))
            .cloned()
            .collect();
        for parent in &added {
            self.emit(ProtocolEvent::ParentAdded {
                group: self.group.clone(),
                parent: parent.clone(),
            });
        }
        if self.is_supervisor {
            // took over before the old supervisor's snapshot arrived
            self.attach_parents(added);
        }
        if self.ledger.split_counter() > before.split_counter() {
            self.emit(ProtocolEvent::SplitCounterAdvanced {
                group: self.group.clone(),
                counter: self.ledger.split_counter(),
            });
        }
    }

    /// Remove `parent` from the ledger, tell the group, and drop our link
    /// to it if nothing else needs it.
    fn detach_parent(&mut self, parent: &GroupName) {
        if self.ledger.remove_parent(parent) {
            self.send(
                Route::Control,
                Message::new(Reason::HierarchyRemoveParent, parent.as_str()),
            );
            self.emit(ProtocolEvent::ParentRemoved {
                group: self.group.clone(),
                parent: parent.clone(),
            });
        }
        if let Some(node) = self.node() {
            let parent = parent.clone();
            let child = self.group.clone();
            tokio::spawn(async move { node.release_parent(&parent, &child).await });
        }
    }

    /// A supervisor keeps a presence in every group its group is stacked on.
    fn attach_parents(&self, parents: Vec<GroupName>) {
        if parents.is_empty() || self.kind != ChannelKind::Participant {
            return;
        }
        let Some(node) = self.node() else {
            return;
        };
        let group = self.group.clone();
        tokio::spawn(async move {
            for parent in parents {
                if let Err(e) = node.attach_parent(&parent).await {
                    tracing::warn!(%group, %parent, "could not rejoin parent group: {e}");
                }
            }
        });
    }

    /// Give up the parent links held on behalf of this group, once it no
    /// longer supervises it.
    fn release_parents(&self) {
        let parents = self.ledger.list_parents().to_vec();
        if parents.is_empty() {
            return;
        }
        let Some(node) = self.node() else {
            return;
        };
        let child = self.group.clone();
        tokio::spawn(async move {
            for parent in parents {
                node.release_parent(&parent, &child).await;
            }
        });
    }

    fn advance_split_counter(&mut self) -> u32 {
        let counter = self.ledger.increment_split_counter();
        self.send_control(Route::Control, Reason::SplitCounter, &counter);
        self.emit(ProtocolEvent::SplitCounterAdvanced {
            group: self.group.clone(),
            counter,
        });
        counter
    }

    // ── Topology: requester side ────────────────────────────────────

    fn forward(&mut self, request_id: RequestId, op: TopologyOp, completion: Completion) {
        let timer = self.timers.arm(
            TimerKind::Operation(request_id.clone()),
            self.config.operation_timeout,
        );
        let progress = match self.supervisor.clone() {
            Some(supervisor) if supervisor != self.local => {
                self.send_request(&supervisor, &request_id, &op);
                Progress::Forwarded
            }
            _ => {
                tracing::debug!(group = %self.group, %request_id, "no supervisor yet, holding request");
                Progress::AwaitingSupervisor
            }
        };
        self.pending.insert(
            request_id,
            PendingOp {
                op,
                completion,
                progress,
                timer: Some(timer),
            },
        );
    }

    fn send_request(&self, supervisor: &Address, request_id: &RequestId, op: &TopologyOp) {
        tracing::debug!(group = %self.group, %request_id, %supervisor, "forwarding topology request");
        let request = TopologyRequest {
            request_id: request_id.clone(),
            op: op.clone(),
        };
        self.send_control(Route::Unicast(supervisor.clone()), op.request_reason(), &request);
    }

    /// A supervisor became known: run or send every held request.
    fn flush_awaiting(&mut self) {
        let waiting: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, p)| matches!(p.progress, Progress::AwaitingSupervisor))
            .map(|(id, _)| id.clone())
            .collect();

        for request_id in waiting {
            if self.kind == ChannelKind::Participant && self.is_supervisor {
                if let Some(pending) = self.pending.remove(&request_id) {
                    if let Some(timer) = pending.timer {
                        self.timers.cancel(timer);
                    }
                    self.perform(request_id, pending.op, pending.completion);
                }
            } else if let Some(supervisor) = self.supervisor.clone() {
                let op = match self.pending.get_mut(&request_id) {
                    Some(pending) => {
                        pending.progress = Progress::Forwarded;
                        pending.op.clone()
                    }
                    None => continue,
                };
                self.send_request(&supervisor, &request_id, &op);
            }
        }
    }

    /// The supervisor we forwarded to is gone; its answers will not come.
    fn resolve_forwarded(&mut self, ok: bool) {
        let forwarded: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, p)| matches!(p.progress, Progress::Forwarded))
            .map(|(id, _)| id.clone())
            .collect();
        for request_id in forwarded {
            self.finish(&request_id, Ok(ok));
        }
    }

    fn on_topology_reply(&mut self, from: Address, reply: TopologyReply) {
        let request_id = reply.request_id;
        let Some(pending) = self.pending.get_mut(&request_id) else {
            tracing::debug!(group = %self.group, %request_id, "reply for unknown request");
            return;
        };
        match &mut pending.progress {
            Progress::Forwarded => self.finish(&request_id, Ok(reply.ok)),
            Progress::Collecting { expected, ok } => {
                if expected.remove(&from) {
                    *ok &= reply.ok;
                }
                if expected.is_empty() {
                    self.finish_collection(&request_id);
                }
            }
            _ => {
                tracing::debug!(group = %self.group, %request_id, "unexpected reply");
            }
        }
    }

    fn on_operation_timeout(&mut self, request_id: RequestId) {
        let Some(pending) = self.pending.get_mut(&request_id) else {
            return;
        };
        pending.timer = None;
        tracing::warn!(group = %self.group, %request_id, op = ?pending.op, "topology operation timed out");
        if let Progress::Collecting { ok, .. } = &mut pending.progress {
            *ok = false;
            self.finish_collection(&request_id);
        } else {
            self.finish(&request_id, Ok(false));
        }
    }

    // ── Topology: supervisor side ───────────────────────────────────

    fn on_topology_request(&mut self, from: Address, request: TopologyRequest) {
        if self.kind != ChannelKind::Participant || !self.is_supervisor {
            tracing::debug!(group = %self.group, request_id = %request.request_id, "not supervisor, refusing request");
            self.send_reply(&from, request.op.reply_reason(), request.request_id, false);
            return;
        }
        self.perform(request.request_id, request.op, Completion::Remote(from));
    }

    fn perform(&mut self, request_id: RequestId, op: TopologyOp, completion: Completion) {
        tracing::info!(group = %self.group, %request_id, ?op, "performing topology operation");
        match op.clone() {
            TopologyOp::Stack { parent } => self.perform_stack(request_id, op, completion, parent),
            TopologyOp::ReverseStack { parent } => {
                self.set_state(GroupState::ReverseStack);
                self.detach_parent(&parent);
                self.complete(&request_id, &op, completion, Ok(true));
                self.settle();
            }
            TopologyOp::Merge { destination } => {
                self.perform_merge(request_id, op, completion, destination)
            }
            TopologyOp::Split { count } => self.perform_split(request_id, op, completion, count),
            TopologyOp::SplitByFitness { criterion } => {
                self.perform_fitness_split(request_id, op, completion, criterion)
            }
        }
    }

    fn perform_stack(
        &mut self,
        request_id: RequestId,
        op: TopologyOp,
        completion: Completion,
        parent: GroupName,
    ) {
        if parent == self.group {
            self.complete(&request_id, &op, completion, Ok(false));
            return;
        }
        if self.ledger.has_parent(&parent) {
            self.complete(&request_id, &op, completion, Ok(true));
            return;
        }
        let Some(node) = self.node() else {
            self.complete(&request_id, &op, completion, Ok(false));
            return;
        };

        self.set_state(GroupState::Stack);
        let timer = self.timers.arm(
            TimerKind::Operation(request_id.clone()),
            self.config.operation_timeout,
        );
        self.pending.insert(
            request_id.clone(),
            PendingOp {
                op,
                completion,
                progress: Progress::JoiningParent,
                timer: Some(timer),
            },
        );

        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let ok = match node.attach_parent(&parent).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(%parent, "could not join parent group: {e}");
                    false
                }
            };
            let _ = tx.send(Internal::ParentAttached {
                request_id,
                parent,
                ok,
            });
        });
    }

    fn on_parent_attached(&mut self, request_id: RequestId, parent: GroupName, ok: bool) {
        if !self.pending.contains_key(&request_id) {
            // timed out meanwhile; do not keep a link nobody recorded
            if ok {
                if let Some(node) = self.node() {
                    let child = self.group.clone();
                    tokio::spawn(async move { node.release_parent(&parent, &child).await });
                }
            }
            return;
        }
        if ok && self.ledger.add_parent(parent.clone()) {
            self.send(
                Route::Control,
                Message::new(Reason::HierarchyAddParent, parent.as_str()),
            );
            self.emit(ProtocolEvent::ParentAdded {
                group: self.group.clone(),
                parent,
            });
        }
        self.finish(&request_id, Ok(ok));
    }

    fn perform_merge(
        &mut self,
        request_id: RequestId,
        op: TopologyOp,
        completion: Completion,
        destination: GroupName,
    ) {
        if destination == self.group {
            self.complete(&request_id, &op, completion, Ok(false));
            return;
        }
        self.set_state(GroupState::Merge);
        for parent in self.ledger.list_parents().to_vec() {
            self.detach_parent(&parent);
        }

        let order = MigrateOrder {
            request_id: request_id.clone(),
            destination,
        };
        self.send_control(Route::Control, Reason::MergeNotify, &order);

        let expected: HashSet<Address> = self
            .view
            .members()
            .iter()
            .filter(|member| **member != self.local)
            .cloned()
            .collect();
        self.collect(request_id, op, completion, expected);
    }

    fn perform_split(
        &mut self,
        request_id: RequestId,
        op: TopologyOp,
        completion: Completion,
        count: usize,
    ) {
        let selected = split::select_members(&self.view, &self.local, &self.links, count);
        let Some(selected) = selected else {
            tracing::info!(group = %self.group, count, size = self.view.size(), "split is a no-op");
            self.complete(&request_id, &op, completion, Ok(false));
            return;
        };
        self.set_state(GroupState::Split);
        let counter = self.advance_split_counter();
        let order = MigrateOrder {
            request_id: request_id.clone(),
            destination: self.group.subgroup(counter),
        };
        for member in &selected {
            self.send_control(Route::Unicast(member.clone()), Reason::SplitMigrate, &order);
        }
        self.collect(request_id, op, completion, selected.into_iter().collect());
    }

    fn perform_fitness_split(
        &mut self,
        request_id: RequestId,
        op: TopologyOp,
        completion: Completion,
        criterion: SplitCriterion,
    ) {
        // the supervisor must be able to evaluate what it asks members to evaluate
        if let Err(e) = criterion.selects(self.descriptor.fitness.as_ref()) {
            tracing::error!(group = %self.group, "fitness split refused: {e}");
            self.emit(ProtocolEvent::Error {
                group: self.group.clone(),
                description: e.to_string(),
            });
            self.complete(&request_id, &op, completion, Err(e));
            return;
        }
        self.set_state(GroupState::Split);
        let counter = self.advance_split_counter();
        let order = FitnessSplitOrder {
            subgroup: self.group.subgroup(counter),
            criterion,
        };
        self.send_control(Route::Control, Reason::SplitByFitness, &order);
        self.complete(&request_id, &op, completion, Ok(true));
        self.settle();
    }

    /// Wait for one reply from each of `expected`.
    fn collect(
        &mut self,
        request_id: RequestId,
        op: TopologyOp,
        completion: Completion,
        expected: HashSet<Address>,
    ) {
        let done = expected.is_empty();
        let timer = (!done).then(|| {
            self.timers.arm(
                TimerKind::Operation(request_id.clone()),
                self.config.operation_timeout,
            )
        });
        self.pending.insert(
            request_id.clone(),
            PendingOp {
                op,
                completion,
                progress: Progress::Collecting { expected, ok: true },
                timer,
            },
        );
        if done {
            self.finish_collection(&request_id);
        }
    }

    /// A member we were waiting on left without replying.
    fn drop_expected_reply(&mut self, member: &Address) {
        let mut finished = Vec::new();
        for (request_id, pending) in &mut self.pending {
            if let Progress::Collecting { expected, ok } = &mut pending.progress {
                if expected.remove(member) {
                    *ok = false;
                    if expected.is_empty() {
                        finished.push(request_id.clone());
                    }
                }
            }
        }
        for request_id in finished {
            self.finish_collection(&request_id);
        }
    }

    fn finish_collection(&mut self, request_id: &RequestId) {
        let Some(pending) = self.pending.get_mut(request_id) else {
            return;
        };
        let ok = match &pending.progress {
            Progress::Collecting { expected, ok } => *ok && expected.is_empty(),
            _ => false,
        };
        if let TopologyOp::Merge { destination } = &pending.op {
            // every member has moved (or given up); the supervisor goes last
            let order = MigrateOrder {
                request_id: request_id.clone(),
                destination: destination.clone(),
            };
            pending.progress = Progress::Migrating { ok };
            if let Some(timer) = pending.timer.take() {
                self.timers.cancel(timer);
            }
            self.begin_migration(order, None, Reason::MergeReply);
        } else {
            self.finish(request_id, Ok(ok));
        }
    }

    /// Remove a pending operation and deliver its outcome.
    fn finish(&mut self, request_id: &RequestId, result: Result<bool, CohortError>) {
        let Some(pending) = self.pending.remove(request_id) else {
            return;
        };
        if let Some(timer) = pending.timer {
            self.timers.cancel(timer);
        }
        self.complete(request_id, &pending.op, pending.completion, result);
        self.settle();
    }

    fn complete(
        &self,
        request_id: &RequestId,
        op: &TopologyOp,
        completion: Completion,
        result: Result<bool, CohortError>,
    ) {
        tracing::debug!(group = %self.group, %request_id, ?result, "topology operation resolved");
        match completion {
            Completion::Local(reply) => {
                let _ = reply.send(result);
            }
            Completion::Remote(requester) => {
                let ok = matches!(result, Ok(true));
                self.send_reply(&requester, op.reply_reason(), request_id.clone(), ok);
            }
        }
    }

    fn send_reply(&self, to: &Address, reason: Reason, request_id: RequestId, ok: bool) {
        let reply = TopologyReply { request_id, ok };
        self.send_control(Route::Unicast(to.clone()), reason, &reply);
    }

    fn resolve_all_pending(&mut self) {
        let all: Vec<RequestId> = self.pending.keys().cloned().collect();
        for request_id in all {
            self.finish(&request_id, Ok(false));
        }
    }

    /// Return from a topology state once nothing is in flight.
    fn settle(&mut self) {
        if !self.state.is_topology() {
            return;
        }
        let busy = self.migrating
            || self.pending.values().any(|p| {
                matches!(
                    p.progress,
                    Progress::JoiningParent | Progress::Collecting { .. } | Progress::Migrating { .. }
                )
            });
        if !busy {
            let next = if self.supervisor.is_some() {
                GroupState::Active
            } else {
                GroupState::Election
            };
            self.set_state(next);
        }
    }

    // ── Topology: member side ───────────────────────────────────────

    fn on_migrate_order(&mut self, from: Address, order: MigrateOrder, reply: Reason) {
        if self.kind == ChannelKind::Link {
            // links never migrate; do not hold up a merge, decline a split
            self.send_reply(&from, reply, order.request_id, reply == Reason::MergeReply);
            return;
        }
        if self.is_supervisor {
            tracing::debug!(group = %self.group, "supervisor ignores migrate order");
            return;
        }
        self.schedule_migration(order, Some(from), reply);
    }

    fn on_fitness_split(&mut self, order: FitnessSplitOrder) {
        if self.kind == ChannelKind::Link || self.is_supervisor {
            return;
        }
        match order.criterion.selects(self.descriptor.fitness.as_ref()) {
            Ok(true) => {
                let migrate = MigrateOrder {
                    request_id: RequestId::new(),
                    destination: order.subgroup,
                };
                self.schedule_migration(migrate, None, Reason::SplitReply);
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(group = %self.group, addr = %self.local, "cannot evaluate split fitness: {e}");
                self.emit(ProtocolEvent::Error {
                    group: self.group.clone(),
                    description: e.to_string(),
                });
            }
        }
    }

    fn schedule_migration(&mut self, order: MigrateOrder, requester: Option<Address>, reply: Reason) {
        if self.migrating {
            tracing::debug!(group = %self.group, "already migrating, declining order");
            if let Some(requester) = &requester {
                self.send_reply(requester, reply, order.request_id, false);
            }
            return;
        }
        let state = if reply == Reason::MergeReply {
            GroupState::Merge
        } else {
            GroupState::Split
        };
        self.set_state(state);
        self.migrating = true;
        let delay = self.config.jittered(self.config.migration_delay);
        self.timers.arm(
            TimerKind::Migrate {
                order,
                requester,
                reply,
            },
            delay,
        );
    }

    fn begin_migration(&mut self, order: MigrateOrder, requester: Option<Address>, reply: Reason) {
        self.migrating = true;
        let Some(node) = self.node() else {
            self.on_migration_done(order, requester, reply, false);
            return;
        };
        tracing::info!(group = %self.group, addr = %self.local, destination = %order.destination, "migrating");
        let template = self.descriptor.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let ok = match node.migrate_into(&order.destination, &template).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(destination = %order.destination, "migration failed: {e}");
                    false
                }
            };
            let _ = tx.send(Internal::MigrationDone {
                order,
                requester,
                reply,
                ok,
            });
        });
    }

    fn on_migration_done(
        &mut self,
        order: MigrateOrder,
        requester: Option<Address>,
        reply: Reason,
        ok: bool,
    ) {
        if let Some(requester) = &requester {
            self.send_reply(requester, reply, order.request_id.clone(), ok);
        }
        let merged = match self.pending.get(&order.request_id) {
            Some(PendingOp {
                progress: Progress::Migrating { ok: members_ok },
                ..
            }) => Some(*members_ok),
            _ => None,
        };
        if let Some(members_ok) = merged {
            self.finish(&order.request_id, Ok(members_ok && ok));
        }

        if ok {
            self.migrated_to = Some(order.destination.clone());
            self.exit = Some(format!("migrated to {}", order.destination));
        } else {
            self.migrating = false;
            self.settle();
        }
    }

    // ── Output ──────────────────────────────────────────────────────

    fn send(&self, route: Route, message: Message) {
        let _ = self
            .control_tx
            .send(SenderInput::Send(Outbound { route, message }));
    }

    fn send_control<T: Serialize>(&self, route: Route, reason: Reason, body: &T) {
        match Message::control(reason, body) {
            Ok(message) => self.send(route, message),
            Err(e) => tracing::warn!(group = %self.group, ?reason, "failed to encode control body: {e}"),
        }
    }

    fn decode<T: DeserializeOwned>(&self, message: &Message) -> Option<T> {
        match message.body() {
            Ok(body) => Some(body),
            Err(e) => {
                tracing::debug!(group = %self.group, reason = ?message.reason, "bad control body: {e}");
                None
            }
        }
    }

    fn emit(&self, event: ProtocolEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, state: GroupState) {
        if self.state == state {
            return;
        }
        tracing::debug!(group = %self.group, addr = %self.local, from = ?self.state, to = ?state, "state change");
        self.state = state;
        self.emit(ProtocolEvent::StateChanged {
            group: self.group.clone(),
            state,
        });
    }

    fn node(&self) -> Option<Node> {
        Node::upgrade(&self.node)
    }

    fn publish(&self) {
        let snapshot = ChannelSnapshot {
            state: self.state,
            supervisor: self.supervisor.clone(),
            is_supervisor: self.is_supervisor,
            active_role: self
                .role
                .as_ref()
                .map(RoleRunner::kind)
                .unwrap_or(ActiveRole::None),
            members: self.view.members().to_vec(),
            links: {
                let mut links: Vec<Address> = self.links.iter().cloned().collect();
                links.sort();
                links
            },
            parents: self.ledger.list_parents().to_vec(),
            split_counter: self.ledger.split_counter(),
            closed: false,
        };
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    // ── Teardown ────────────────────────────────────────────────────

    async fn teardown(mut self) {
        let reason = self.exit.take().unwrap_or_default();
        self.timers.cancel_all();
        self.deactivate_role();
        if self.is_supervisor {
            self.release_parents();
        }

        let pending: Vec<RequestId> = self.pending.keys().cloned().collect();
        for request_id in pending {
            // a requester that moved as part of its own operation saw it succeed
            let result = match (&self.pending[&request_id].op, &self.migrated_to) {
                (TopologyOp::Merge { destination }, Some(to)) if destination == to => Ok(true),
                (TopologyOp::Split { .. } | TopologyOp::SplitByFitness { .. }, Some(to))
                    if self.group.is_subgroup(to) =>
                {
                    Ok(true)
                }
                _ => Err(CohortError::ChannelClosed {
                    group: self.group.to_string(),
                }),
            };
            self.finish(&request_id, result);
        }

        // let queued replies and role traffic out before leaving
        let (ack, flushed) = oneshot::channel();
        if self.control_tx.send(SenderInput::Flush(ack)).is_ok() {
            let _ = tokio::time::timeout(self.config.operation_timeout, flushed).await;
        }

        if let Some(task) = self.reconnect_task.take() {
            task.abort();
            let _ = task.await;
        }
        while let Ok(input) = self.internal_rx.try_recv() {
            if let Internal::Reconnected(Ok(session)) = input {
                let _ = self.transport.leave_group(&session.handle).await;
            }
        }
        if let Some(session) = self.session.take() {
            if let Err(e) = self.transport.leave_group(&session).await {
                tracing::warn!(group = %self.group, "leave failed: {e}");
            }
        }
        self.session_tx.send_replace(None);

        if let Some(node) = self.node() {
            node.remove_channel(&self.group, self.handle.instance());
        }

        self.state = GroupState::Idle;
        self.supervisor = None;
        self.is_supervisor = false;
        self.view.clear();
        self.snapshot_tx.send_modify(|snapshot| {
            *snapshot = ChannelSnapshot {
                closed: true,
                parents: snapshot.parents.clone(),
                split_counter: snapshot.split_counter,
                ..ChannelSnapshot::default()
            };
        });

        tracing::info!(group = %self.group, addr = %self.local, %reason, "channel closed");
        self.emit(ProtocolEvent::StateChanged {
            group: self.group.clone(),
            state: GroupState::Idle,
        });
        self.emit(ProtocolEvent::Disconnected {
            group: self.group.clone(),
            reason,
        });
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}
