/// Node-wide configuration: timing, queue capacities and retry policy.
use std::time::Duration;

use rand::Rng;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct CohortConfig {
    /// Wait after joining before the first election round.
    pub join_settle_delay: Duration,
    /// Wait after the supervisor leaves before re-electing.
    pub supervisor_left_delay: Duration,
    /// Upper bound of the random jitter added to the two delays above and
    /// to `migration_delay`.
    pub random_delay_bound: Duration,
    /// How long to wait for a supervisor announcement.
    pub election_timeout: Duration,
    /// Wait before a member acts on a merge or split order.
    pub migration_delay: Duration,
    /// Deadline for a pending topology operation.
    pub operation_timeout: Duration,
    /// Per-channel outbound message queue.
    pub outbound_capacity: usize,
    /// Per-role application mailbox.
    pub role_mailbox_capacity: usize,
    /// Node-level event broadcast buffer.
    pub event_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for CohortConfig {
    fn default() -> Self {
        Self {
            join_settle_delay: Duration::from_millis(200),
            supervisor_left_delay: Duration::from_millis(300),
            random_delay_bound: Duration::from_millis(200),
            election_timeout: Duration::from_secs(1),
            migration_delay: Duration::from_millis(100),
            operation_timeout: Duration::from_secs(5),
            outbound_capacity: 256,
            role_mailbox_capacity: 64,
            event_capacity: 256,
            retry: RetryPolicy::default(),
        }
    }
}

impl CohortConfig {
    pub fn with_join_settle_delay(mut self, delay: Duration) -> Self {
        self.join_settle_delay = delay;
        self
    }

    pub fn with_supervisor_left_delay(mut self, delay: Duration) -> Self {
        self.supervisor_left_delay = delay;
        self
    }

    pub fn with_random_delay_bound(mut self, bound: Duration) -> Self {
        self.random_delay_bound = bound;
        self
    }

    pub fn with_election_timeout(mut self, timeout: Duration) -> Self {
        self.election_timeout = timeout;
        self
    }

    pub fn with_migration_delay(mut self, delay: Duration) -> Self {
        self.migration_delay = delay;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    pub fn with_role_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.role_mailbox_capacity = capacity;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// `base` plus a uniformly random extra in `[0, random_delay_bound]`.
    pub(crate) fn jittered(&self, base: Duration) -> Duration {
        let bound = self.random_delay_bound.as_millis() as u64;
        if bound == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=bound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_bound() {
        let config = CohortConfig::default().with_random_delay_bound(Duration::from_millis(50));
        let base = Duration::from_millis(100);
        for _ in 0..100 {
            let d = config.jittered(base);
            assert!(d >= base && d <= base + Duration::from_millis(50));
        }
    }

    #[test]
    fn setters_cover_every_knob() {
        let config = CohortConfig::default()
            .with_migration_delay(Duration::from_millis(3))
            .with_outbound_capacity(8)
            .with_role_mailbox_capacity(4)
            .with_event_capacity(16);
        assert_eq!(config.migration_delay, Duration::from_millis(3));
        assert_eq!(config.outbound_capacity, 8);
        assert_eq!(config.role_mailbox_capacity, 4);
        assert_eq!(config.event_capacity, 16);
    }

    #[test]
    fn zero_bound_is_exact() {
        let config = CohortConfig::default().with_random_delay_bound(Duration::ZERO);
        assert_eq!(config.jittered(Duration::from_millis(7)), Duration::from_millis(7));
    }
}
