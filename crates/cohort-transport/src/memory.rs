/// In-process transport: every endpoint shares one `MemoryNetwork`.
///
/// A group exists (and is discoverable) while it has at least one member.
/// Delivery is immediate and ordered per sender. Broadcast and control
/// traffic is not echoed back to the sender.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::{Address, Session, SessionHandle, Transport, TransportError, TransportEvent};

/// Operations that can be made to fail with [`MemoryNetwork::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    Discover,
    Create,
    Join,
    Send,
}

struct Member {
    session_id: u64,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Default)]
struct NetworkState {
    /// group name → members (address → session).
    groups: HashMap<String, BTreeMap<Address, Member>>,
    next_session: u64,
    /// Injected failures, consumed one per matching operation.
    faults: HashMap<FaultOp, VecDeque<TransportError>>,
}

impl NetworkState {
    fn take_fault(&mut self, op: FaultOp) -> Result<(), TransportError> {
        match self.faults.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn open_session(&mut self, group: &str, local: &Address) -> Session {
        self.next_session += 1;
        let session_id = self.next_session;
        let (tx, rx) = mpsc::unbounded_channel();

        let members = self.groups.entry(group.to_string()).or_default();
        let existing: Vec<Address> = members.keys().cloned().collect();

        for member in members.values() {
            let _ = member.tx.send(TransportEvent::MemberJoined(local.clone()));
        }
        members.insert(local.clone(), Member { session_id, tx });

        Session {
            handle: SessionHandle {
                group: group.to_string(),
                id: session_id,
            },
            local: local.clone(),
            members: existing,
            events: rx,
        }
    }

    /// Remove `addr` from `group`, notifying the remaining members.
    fn remove_member(&mut self, group: &str, addr: &Address) -> Option<Member> {
        let members = self.groups.get_mut(group)?;
        let removed = members.remove(addr)?;
        for member in members.values() {
            let _ = member.tx.send(TransportEvent::MemberLeft(addr.clone()));
        }
        if members.is_empty() {
            tracing::debug!(group, "last member left, group dissolved");
            self.groups.remove(group);
        }
        Some(removed)
    }

    fn check_sender(&self, handle: &SessionHandle, from: &Address) -> Result<(), TransportError> {
        let current = self
            .groups
            .get(&handle.group)
            .and_then(|m| m.get(from))
            .map(|m| m.session_id);
        if current == Some(handle.id) {
            Ok(())
        } else {
            Err(TransportError::SessionClosed { session: handle.id })
        }
    }
}

/// Shared in-process network. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create an endpoint bound to `address`.
    pub fn endpoint(&self, address: impl Into<Address>) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            local: address.into(),
        }
    }

    /// Make the next `count` operations of kind `op` fail with `error`.
    pub fn fail_next(&self, op: FaultOp, count: usize, error: TransportError) {
        let mut state = self.state();
        let queue = state.faults.entry(op).or_default();
        for _ in 0..count {
            queue.push_back(error.clone());
        }
    }

    /// Drop `addr` from `group` as if its session had been lost.
    ///
    /// The victim receives `SessionLost`; the others see `MemberLeft`.
    /// Returns `false` if `addr` was not a member.
    pub fn lose_session(&self, addr: &Address, group: &str) -> bool {
        let mut state = self.state();
        match state.remove_member(group, addr) {
            Some(member) => {
                let _ = member.tx.send(TransportEvent::SessionLost);
                true
            }
            None => false,
        }
    }

    /// Drop `addr` from `group` with no notification to anyone, as if it
    /// vanished before the network noticed. Peers still list it until a
    /// send to it fails. Returns `false` if `addr` was not a member.
    pub fn drop_silently(&self, addr: &Address, group: &str) -> bool {
        let mut state = self.state();
        let Some(members) = state.groups.get_mut(group) else {
            return false;
        };
        let removed = members.remove(addr).is_some();
        if members.is_empty() {
            state.groups.remove(group);
        }
        removed
    }

    /// Current members of `group`, in address order.
    pub fn members(&self, group: &str) -> Vec<Address> {
        self.state()
            .groups
            .get(group)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of all advertised groups.
    pub fn groups(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().groups.keys().cloned().collect();
        names.sort();
        names
    }
}

/// One endpoint on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: Address,
}

impl MemoryTransport {
    fn deliver(
        &self,
        handle: &SessionHandle,
        targets: Option<&[Address]>,
        make: impl Fn(Address, Vec<u8>) -> TransportEvent,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let mut state = self.network.state();
        state.take_fault(FaultOp::Send)?;
        state.check_sender(handle, &self.local)?;

        let Some(members) = state.groups.get(&handle.group) else {
            return Err(TransportError::SessionClosed { session: handle.id });
        };

        let mut missing = None;
        match targets {
            Some(targets) => {
                for addr in targets {
                    match members.get(addr) {
                        Some(member) => {
                            let _ = member.tx.send(make(self.local.clone(), data.to_vec()));
                        }
                        None => {
                            missing.get_or_insert_with(|| addr.clone());
                        }
                    }
                }
            }
            None => {
                for (addr, member) in members {
                    if *addr != self.local {
                        let _ = member.tx.send(make(self.local.clone(), data.to_vec()));
                    }
                }
            }
        }

        tracing::trace!(group = %handle.group, from = %self.local, bytes = data.len(), "delivered");
        match missing {
            Some(address) => Err(TransportError::UnknownRecipient { address }),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    fn local_address(&self) -> Address {
        self.local.clone()
    }

    async fn discover(&self, group: &str) -> Result<bool, TransportError> {
        let mut state = self.network.state();
        state.take_fault(FaultOp::Discover)?;
        Ok(state.groups.contains_key(group))
    }

    async fn create_group(&self, group: &str) -> Result<Session, TransportError> {
        let mut state = self.network.state();
        state.take_fault(FaultOp::Create)?;
        if state.groups.contains_key(group) {
            return Err(TransportError::AlreadyExists {
                group: group.to_string(),
            });
        }
        tracing::debug!(group, addr = %self.local, "group created");
        Ok(state.open_session(group, &self.local))
    }

    async fn join_group(&self, group: &str) -> Result<Session, TransportError> {
        let mut state = self.network.state();
        state.take_fault(FaultOp::Join)?;
        match state.groups.get(group) {
            None => {
                return Err(TransportError::NotFound {
                    group: group.to_string(),
                })
            }
            Some(members) if members.contains_key(&self.local) => {
                return Err(TransportError::AlreadyExists {
                    group: group.to_string(),
                })
            }
            Some(_) => {}
        }
        tracing::debug!(group, addr = %self.local, "group joined");
        Ok(state.open_session(group, &self.local))
    }

    async fn leave_group(&self, handle: &SessionHandle) -> Result<(), TransportError> {
        let mut state = self.network.state();
        if state.check_sender(handle, &self.local).is_ok() {
            state.remove_member(&handle.group, &self.local);
            tracing::debug!(group = %handle.group, addr = %self.local, "group left");
        }
        Ok(())
    }

    async fn send_unicast(
        &self,
        handle: &SessionHandle,
        data: &[u8],
        to: &Address,
    ) -> Result<(), TransportError> {
        self.deliver(
            handle,
            Some(std::slice::from_ref(to)),
            |from, data| TransportEvent::Unicast { from, data },
            data,
        )
    }

    async fn send_multicast(
        &self,
        handle: &SessionHandle,
        data: &[u8],
        to: &[Address],
    ) -> Result<(), TransportError> {
        self.deliver(
            handle,
            Some(to),
            |from, data| TransportEvent::Multicast { from, data },
            data,
        )
    }

    async fn send_broadcast(
        &self,
        handle: &SessionHandle,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.deliver(
            handle,
            None,
            |from, data| TransportEvent::Broadcast { from, data },
            data,
        )
    }

    async fn send_control(
        &self,
        handle: &SessionHandle,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.deliver(
            handle,
            None,
            |from, data| TransportEvent::Control { from, data },
            data,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_discover() {
        let net = MemoryNetwork::new();
        let a = net.endpoint("a");
        assert!(!a.discover("G").await.unwrap());
        let _session = a.create_group("G").await.unwrap();
        assert!(a.discover("G").await.unwrap());
        assert_eq!(net.groups(), vec!["G".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_create_rejected() {
        let net = MemoryNetwork::new();
        let _s = net.endpoint("a").create_group("G").await.unwrap();
        let err = net.endpoint("b").create_group("G").await.unwrap_err();
        assert_eq!(err, TransportError::AlreadyExists { group: "G".into() });
    }

    #[tokio::test]
    async fn join_missing_group_fails() {
        let net = MemoryNetwork::new();
        let err = net.endpoint("a").join_group("nope").await.unwrap_err();
        assert!(matches!(err, TransportError::NotFound { .. }));
    }

    #[tokio::test]
    async fn join_notifies_existing_members() {
        let net = MemoryNetwork::new();
        let a = net.endpoint("a");
        let mut sa = a.create_group("G").await.unwrap();
        let sb = net.endpoint("b").join_group("G").await.unwrap();

        assert_eq!(sb.members, vec![Address::from("a")]);
        assert_eq!(
            sa.events.recv().await,
            Some(TransportEvent::MemberJoined(Address::from("b")))
        );
    }

    #[tokio::test]
    async fn second_join_by_same_address_rejected() {
        let net = MemoryNetwork::new();
        let _s = net.endpoint("a").create_group("G").await.unwrap();
        let b = net.endpoint("b");
        let _sb = b.join_group("G").await.unwrap();
        assert!(matches!(
            b.join_group("G").await,
            Err(TransportError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn last_leaver_dissolves_group() {
        let net = MemoryNetwork::new();
        let a = net.endpoint("a");
        let s = a.create_group("G").await.unwrap();
        a.leave_group(&s.handle).await.unwrap();
        assert!(net.groups().is_empty());
        // second leave is a no-op
        a.leave_group(&s.handle).await.unwrap();
    }

    #[tokio::test]
    async fn broadcast_not_echoed() {
        let net = MemoryNetwork::new();
        let a = net.endpoint("a");
        let b = net.endpoint("b");
        let mut sa = a.create_group("G").await.unwrap();
        let mut sb = b.join_group("G").await.unwrap();
        let _ = sa.events.recv().await; // MemberJoined(b)

        b.send_broadcast(&sb.handle, b"hello").await.unwrap();
        assert_eq!(
            sa.events.recv().await,
            Some(TransportEvent::Broadcast {
                from: Address::from("b"),
                data: b"hello".to_vec()
            })
        );
        assert!(sb.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn unicast_to_stranger_is_unknown_recipient() {
        let net = MemoryNetwork::new();
        let a = net.endpoint("a");
        let s = a.create_group("G").await.unwrap();
        let err = a
            .send_unicast(&s.handle, b"x", &Address::from("ghost"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TransportError::UnknownRecipient {
                address: Address::from("ghost")
            }
        );
    }

    #[tokio::test]
    async fn injected_faults_consumed_in_order() {
        let net = MemoryNetwork::new();
        net.fail_next(FaultOp::Create, 2, TransportError::Busy("bind".into()));
        let a = net.endpoint("a");
        assert!(a.create_group("G").await.is_err());
        assert!(a.create_group("G").await.is_err());
        assert!(a.create_group("G").await.is_ok());
    }

    #[tokio::test]
    async fn silent_drop_leaves_peers_unaware() {
        let net = MemoryNetwork::new();
        let a = net.endpoint("a");
        let mut sa = a.create_group("G").await.unwrap();
        let _sb = net.endpoint("b").join_group("G").await.unwrap();
        let _ = sa.events.recv().await;

        assert!(net.drop_silently(&Address::from("b"), "G"));
        assert!(sa.events.try_recv().is_err());
        assert_eq!(
            a.send_unicast(&sa.handle, b"x", &Address::from("b")).await,
            Err(TransportError::UnknownRecipient {
                address: Address::from("b")
            })
        );
        assert!(!net.drop_silently(&Address::from("b"), "G"));
    }

    #[tokio::test]
    async fn lose_session_notifies_both_sides() {
        let net = MemoryNetwork::new();
        let a = net.endpoint("a");
        let mut sa = a.create_group("G").await.unwrap();
        let mut sb = net.endpoint("b").join_group("G").await.unwrap();
        let _ = sa.events.recv().await;

        assert!(net.lose_session(&Address::from("a"), "G"));
        assert_eq!(sa.events.recv().await, Some(TransportEvent::SessionLost));
        assert_eq!(
            sb.events.recv().await,
            Some(TransportEvent::MemberLeft(Address::from("a")))
        );
        // the lost handle can no longer send
        assert!(matches!(
            a.send_broadcast(&sa.handle, b"x").await,
            Err(TransportError::SessionClosed { .. })
        ));
    }
}
