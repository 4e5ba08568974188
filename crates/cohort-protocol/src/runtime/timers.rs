/// Cancellable one-shot timers for the dispatcher.
///
/// Each armed timer is a sleeping task that posts its id back to the
/// dispatcher. Cancelling aborts the task and forgets the id, so a firing
/// that races with cancellation is recognized as stale and ignored.
use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::message::{MigrateOrder, Reason};
use crate::types::{Address, RequestId};

pub(crate) type TimerId = u64;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TimerKind {
    /// Start an election round (after join or supervisor loss).
    ElectionStart,
    /// No supervisor announcement arrived in time.
    ElectionTimeout,
    /// A pending topology operation ran out of time.
    Operation(RequestId),
    /// Act on a merge or split order.
    Migrate {
        order: MigrateOrder,
        /// Who to reply to; `None` for fitness splits and our own merge.
        requester: Option<Address>,
        reply: Reason,
    },
}

impl TimerKind {
    pub(crate) fn is_election(&self) -> bool {
        matches!(self, TimerKind::ElectionStart | TimerKind::ElectionTimeout)
    }
}

pub(crate) struct Timers {
    next_id: TimerId,
    armed: HashMap<TimerId, (TimerKind, JoinHandle<()>)>,
    fire_tx: mpsc::UnboundedSender<TimerId>,
}

impl Timers {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<TimerId>) {
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        let timers = Self {
            next_id: 0,
            armed: HashMap::new(),
            fire_tx,
        };
        (timers, fire_rx)
    }

    pub(crate) fn arm(&mut self, kind: TimerKind, delay: Duration) -> TimerId {
        self.next_id += 1;
        let id = self.next_id;
        let tx = self.fire_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(id);
        });
        self.armed.insert(id, (kind, task));
        id
    }

    pub(crate) fn cancel(&mut self, id: TimerId) {
        if let Some((_, task)) = self.armed.remove(&id) {
            task.abort();
        }
    }

    /// Cancel every timer matching `pred`.
    pub(crate) fn cancel_where(&mut self, pred: impl Fn(&TimerKind) -> bool) {
        self.armed.retain(|_, (kind, task)| {
            if pred(kind) {
                task.abort();
                false
            } else {
                true
            }
        });
    }

    pub(crate) fn cancel_all(&mut self) {
        for (_, (_, task)) in self.armed.drain() {
            task.abort();
        }
    }

    /// Claim a fired timer. `None` means it was cancelled meanwhile.
    pub(crate) fn take(&mut self, id: TimerId) -> Option<TimerKind> {
        self.armed.remove(&id).map(|(kind, _)| kind)
    }

    #[cfg(test)]
    pub(crate) fn any(&self, pred: impl Fn(&TimerKind) -> bool) -> bool {
        self.armed.values().any(|(kind, _)| pred(kind))
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
