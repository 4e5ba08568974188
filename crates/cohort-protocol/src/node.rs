/// Node: the registry of every group channel this process takes part in.
///
/// One `Node` per simulated device. It owns the transport, resolves group
/// names to channels, and is the only place where two groups meet: stack,
/// merge and split reach across groups by asking the node to open or close
/// channels, never by touching another dispatcher's state.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use cohort_transport::{Session, Transport, TransportError};
use tokio::sync::broadcast;

use crate::config::CohortConfig;
use crate::descriptor::GroupDescriptor;
use crate::error::CohortError;
use crate::group::SplitCriterion;
use crate::message::TopologyOp;
use crate::retry::RetryPolicy;
use crate::runtime::{self, ChannelKind, GroupChannel, ProtocolEvent};
use crate::types::{Address, GroupName};

/// Cheap-to-clone handle to the registry.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

pub(crate) struct NodeInner {
    transport: Arc<dyn Transport>,
    config: CohortConfig,
    channels: Mutex<HashMap<GroupName, GroupChannel>>,
    descriptors: Mutex<HashMap<GroupName, GroupDescriptor>>,
    events: broadcast::Sender<ProtocolEvent>,
    next_instance: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Join `group` if it is advertised, otherwise create it (when `create`).
///
/// A create that loses the race to another creator falls back to joining.
pub(crate) async fn open_session(
    transport: &dyn Transport,
    group: &GroupName,
    retry: &RetryPolicy,
    create: bool,
) -> Result<Session, CohortError> {
    let name = group.as_str();
    retry
        .run("connect", move || async move {
            if transport.discover(name).await? {
                match transport.join_group(name).await {
                    Err(TransportError::NotFound { .. }) if create => {
                        transport.create_group(name).await
                    }
                    other => other,
                }
            } else if create {
                match transport.create_group(name).await {
                    Err(TransportError::AlreadyExists { .. }) => {
                        tracing::debug!(group = name, "group appeared concurrently, joining");
                        transport.join_group(name).await
                    }
                    other => other,
                }
            } else {
                Err(TransportError::NotFound {
                    group: name.to_string(),
                })
            }
        })
        .await
        .map_err(|exhausted| CohortError::JoinFailed {
            group: group.to_string(),
            attempts: exhausted.attempts,
            source: exhausted.source,
        })
}

impl Node {
    pub fn new(transport: impl Transport + 'static, config: CohortConfig) -> Self {
        Self::with_transport(Arc::new(transport), config)
    }

    pub fn with_transport(transport: Arc<dyn Transport>, config: CohortConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(NodeInner {
                transport,
                config,
                channels: Mutex::new(HashMap::new()),
                descriptors: Mutex::new(HashMap::new()),
                events,
                next_instance: AtomicU64::new(1),
            }),
        }
    }

    pub fn address(&self) -> Address {
        self.inner.transport.local_address()
    }

    pub fn config(&self) -> &CohortConfig {
        &self.inner.config
    }

    /// Observe protocol events from every channel of this node.
    pub fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.inner.events.subscribe()
    }

    /// Remember a descriptor for a group this node may be asked to enter
    /// later (stack parent, merge or split destination).
    pub fn register(&self, descriptor: GroupDescriptor) {
        lock(&self.inner.descriptors).insert(descriptor.name.clone(), descriptor);
    }

    pub fn channel(&self, group: &GroupName) -> Option<GroupChannel> {
        lock(&self.inner.channels).get(group).cloned()
    }

    /// Names of all groups with an open channel, sorted.
    pub fn groups(&self) -> Vec<GroupName> {
        let mut names: Vec<GroupName> = lock(&self.inner.channels).keys().cloned().collect();
        names.sort();
        names
    }

    /// Join (or create) the descriptor's group as a full participant.
    ///
    /// Returns the existing channel if already participating. An existing
    /// link channel is replaced.
    pub async fn connect(&self, descriptor: GroupDescriptor) -> Result<GroupChannel, CohortError> {
        if let Some(existing) = self.channel(&descriptor.name) {
            if existing.kind() == ChannelKind::Participant {
                return Ok(existing);
            }
            self.disconnect(&descriptor.name).await;
        }
        self.register(descriptor.clone());
        self.open(descriptor, ChannelKind::Participant).await
    }

    /// Join (or create) a group without taking part in election or roles.
    pub async fn connect_link(
        &self,
        group: impl Into<GroupName>,
    ) -> Result<GroupChannel, CohortError> {
        let group = group.into();
        if let Some(existing) = self.channel(&group) {
            return Ok(existing);
        }
        self.open(GroupDescriptor::new(group), ChannelKind::Link).await
    }

    async fn open(
        &self,
        descriptor: GroupDescriptor,
        kind: ChannelKind,
    ) -> Result<GroupChannel, CohortError> {
        let name = descriptor.name.clone();
        let session = match open_session(
            self.inner.transport.as_ref(),
            &name,
            &self.inner.config.retry,
            true,
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                // a concurrent connect of ours got there first
                if let Some(existing) = self.channel(&name) {
                    return Ok(existing);
                }
                tracing::error!(group = %name, addr = %self.address(), "connect failed: {e}");
                return Err(e);
            }
        };

        let channel = runtime::spawn_channel(self, descriptor, kind, session);
        lock(&self.inner.channels).insert(name.clone(), channel.clone());
        tracing::info!(group = %name, addr = %self.address(), ?kind, "connected");
        Ok(channel)
    }

    /// Leave a group. Returns `false` if there was no channel for it.
    pub async fn disconnect(&self, group: &GroupName) -> bool {
        let channel = lock(&self.inner.channels).remove(group);
        match channel {
            Some(channel) => {
                channel.close("disconnect requested").await;
                true
            }
            None => false,
        }
    }

    /// Close every channel.
    pub async fn shutdown(&self) {
        let channels: Vec<GroupChannel> = lock(&self.inner.channels)
            .drain()
            .map(|(_, channel)| channel)
            .collect();
        for channel in channels {
            channel.close("node shutdown").await;
        }
    }

    // ── Topology ────────────────────────────────────────────────────

    /// Stack `parent` on top of `child`.
    pub async fn stack(
        &self,
        parent: impl Into<GroupName>,
        child: impl Into<GroupName>,
    ) -> Result<bool, CohortError> {
        let op = TopologyOp::Stack {
            parent: parent.into(),
        };
        self.request_topology(child.into(), op).await
    }

    /// Remove `parent` from `child`'s hierarchy.
    pub async fn reverse_stack(
        &self,
        parent: impl Into<GroupName>,
        child: impl Into<GroupName>,
    ) -> Result<bool, CohortError> {
        let op = TopologyOp::ReverseStack {
            parent: parent.into(),
        };
        self.request_topology(child.into(), op).await
    }

    /// Move every member of `source` into `destination`, dissolving `source`.
    pub async fn merge(
        &self,
        destination: impl Into<GroupName>,
        source: impl Into<GroupName>,
    ) -> Result<bool, CohortError> {
        let op = TopologyOp::Merge {
            destination: destination.into(),
        };
        self.request_topology(source.into(), op).await
    }

    /// Move `count` random non-supervisor members of `group` into the
    /// next `<group>_<counter>` subgroup.
    pub async fn split(
        &self,
        group: impl Into<GroupName>,
        count: usize,
    ) -> Result<bool, CohortError> {
        self.request_topology(group.into(), TopologyOp::Split { count })
            .await
    }

    /// Move the members whose own split fitness satisfies `criterion`.
    pub async fn split_by_fitness(
        &self,
        group: impl Into<GroupName>,
        criterion: SplitCriterion,
    ) -> Result<bool, CohortError> {
        self.request_topology(group.into(), TopologyOp::SplitByFitness { criterion })
            .await
    }

    /// Run `op` through our channel for `group`, opening a temporary link
    /// if we have none.
    async fn request_topology(
        &self,
        group: GroupName,
        op: TopologyOp,
    ) -> Result<bool, CohortError> {
        let (channel, opened) = match self.channel(&group) {
            Some(channel) => (channel, false),
            None => (self.connect_link(group.clone()).await?, true),
        };
        let result = channel.request(op).await;
        if opened {
            self.close_instance(&group, channel.instance()).await;
        }
        result
    }

    // ── Cross-group helpers (called from dispatchers) ───────────────

    /// Make sure this node is present in `parent`.
    pub(crate) async fn attach_parent(&self, parent: &GroupName) -> Result<(), CohortError> {
        if self.channel(parent).is_some() {
            return Ok(());
        }
        let registered = lock(&self.inner.descriptors).get(parent).cloned();
        let channel = match registered {
            Some(descriptor) => self.open(descriptor, ChannelKind::Participant).await?,
            None => self.open(GroupDescriptor::new(parent.clone()), ChannelKind::Link).await?,
        };
        tracing::debug!(%parent, kind = ?channel.kind(), "attached to parent group");
        Ok(())
    }

    /// Drop our link to `parent` unless another group still stacks on it.
    pub(crate) async fn release_parent(&self, parent: &GroupName, child: &GroupName) {
        let still_needed = {
            let channels = lock(&self.inner.channels);
            match channels.get(parent) {
                Some(channel) if channel.kind() == ChannelKind::Link => channels
                    .values()
                    .filter(|c| c.group() != child)
                    .any(|c| c.snapshot().parents.contains(parent)),
                _ => true,
            }
        };
        if !still_needed {
            tracing::debug!(%parent, "releasing parent link");
            self.disconnect(parent).await;
        }
    }

    /// Enter `destination` on behalf of a merge or split.
    ///
    /// Already participating (including supervising it) counts as done.
    pub(crate) async fn migrate_into(
        &self,
        destination: &GroupName,
        template: &GroupDescriptor,
    ) -> Result<(), CohortError> {
        if let Some(existing) = self.channel(destination) {
            if existing.kind() == ChannelKind::Participant {
                tracing::debug!(%destination, "already a member, not migrating");
                return Ok(());
            }
        }
        let registered = lock(&self.inner.descriptors).get(destination).cloned();
        let descriptor = registered.unwrap_or_else(|| template.renamed(destination.clone()));
        self.connect(descriptor).await.map(|_| ())
    }

    /// Forget a channel that closed itself, unless it was already replaced.
    pub(crate) fn remove_channel(&self, group: &GroupName, instance: u64) {
        let mut channels = lock(&self.inner.channels);
        if channels.get(group).map(GroupChannel::instance) == Some(instance) {
            channels.remove(group);
        }
    }

    async fn close_instance(&self, group: &GroupName, instance: u64) {
        let channel = {
            let mut channels = lock(&self.inner.channels);
            match channels.get(group) {
                Some(c) if c.instance() == instance => channels.remove(group),
                _ => None,
            }
        };
        if let Some(channel) = channel {
            channel.close("request completed").await;
        }
    }

    // ── Runtime plumbing ────────────────────────────────────────────

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.inner.transport)
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<ProtocolEvent> {
        self.inner.events.clone()
    }

    pub(crate) fn next_instance(&self) -> u64 {
        self.inner.next_instance.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn downgrade(&self) -> Weak<NodeInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<NodeInner>) -> Option<Node> {
        weak.upgrade().map(|inner| Node { inner })
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.address())
            .field("groups", &self.groups())
            .finish()
    }
}
