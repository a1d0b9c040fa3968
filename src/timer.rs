//! Cancellable, re-armable timers for a single connection.

use std::time::Duration;
use tokio_util::time::{delay_queue::Key, DelayQueue};

/// Which per-connection timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Outstanding data has gone unacknowledged for a full timeout.
    Retransmit,
    /// The peer's window has stayed closed and should be probed.
    Persist,
    /// The 2*MSL wait after entering TIME-WAIT ran out.
    TimeWait,
}

/// The timers belonging to one connection, multiplexed onto a single delay
/// queue.
///
/// Each timer is independently cancellable and re-armable. Arming an
/// already-armed timer reschedules it in place; cancelling removes the
/// underlying queue entry instead of leaving it to fire into the void, so no
/// scheduling resource outlives its timer.
#[derive(Debug, Default)]
pub struct ConnectionTimers {
    queue: DelayQueue<TimerKind>,
    retransmit: Option<Key>,
    persist: Option<Key>,
    time_wait: Option<Key>,
}

impl ConnectionTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms `kind` to fire after the given duration, rescheduling it if it
    /// was already armed.
    pub fn arm(&mut self, kind: TimerKind, after: Duration) {
        let queue = &mut self.queue;
        let slot = match kind {
            TimerKind::Retransmit => &mut self.retransmit,
            TimerKind::Persist => &mut self.persist,
            TimerKind::TimeWait => &mut self.time_wait,
        };
        match slot {
            Some(key) => queue.reset(key, after),
            None => *slot = Some(queue.insert(kind, after)),
        }
    }

    /// Cancels `kind` if it is armed.
    pub fn cancel(&mut self, kind: TimerKind) {
        let queue = &mut self.queue;
        let slot = match kind {
            TimerKind::Retransmit => &mut self.retransmit,
            TimerKind::Persist => &mut self.persist,
            TimerKind::TimeWait => &mut self.time_wait,
        };
        if let Some(key) = slot.take() {
            let _ = queue.try_remove(&key);
        }
    }

    /// Whether `kind` is currently scheduled.
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        match kind {
            TimerKind::Retransmit => self.retransmit.is_some(),
            TimerKind::Persist => self.persist.is_some(),
            TimerKind::TimeWait => self.time_wait.is_some(),
        }
    }

    /// Cancels everything.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.retransmit = None;
        self.persist = None;
        self.time_wait = None;
    }

    /// Waits until the next armed timer fires. Pends forever while nothing
    /// is armed, which makes it safe to `select!` against the connection
    /// mailbox.
    pub async fn expired(&mut self) -> TimerKind {
        let expired = futures::future::poll_fn(|cx| self.queue.poll_expired(cx)).await;
        match expired {
            Some(expired) => {
                let kind = expired.into_inner();
                match kind {
                    TimerKind::Retransmit => self.retransmit = None,
                    TimerKind::Persist => self.persist = None,
                    TimerKind::TimeWait => self.time_wait = None,
                }
                kind
            }
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, Instant};

    #[tokio::test(start_paused = true)]
    async fn fires_after_the_delay() {
        let mut timers = ConnectionTimers::new();
        let start = Instant::now();
        timers.arm(TimerKind::Retransmit, Duration::from_millis(100));
        assert!(timers.is_armed(TimerKind::Retransmit));

        let kind = timers.expired().await;
        assert_eq!(kind, TimerKind::Retransmit);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(!timers.is_armed(TimerKind::Retransmit));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let mut timers = ConnectionTimers::new();
        timers.arm(TimerKind::Persist, Duration::from_millis(50));
        timers.cancel(TimerKind::Persist);
        assert!(!timers.is_armed(TimerKind::Persist));

        tokio::select! {
            kind = timers.expired() => panic!("cancelled timer fired: {:?}", kind),
            _ = sleep(Duration::from_millis(500)) => {}
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_reschedules_in_place() {
        let mut timers = ConnectionTimers::new();
        let start = Instant::now();
        timers.arm(TimerKind::Retransmit, Duration::from_millis(100));
        timers.arm(TimerKind::Retransmit, Duration::from_millis(400));

        let kind = timers.expired().await;
        assert_eq!(kind, TimerKind::Retransmit);
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn timers_fire_independently() {
        let mut timers = ConnectionTimers::new();
        timers.arm(TimerKind::Persist, Duration::from_millis(100));
        timers.arm(TimerKind::TimeWait, Duration::from_millis(200));

        assert_eq!(timers.expired().await, TimerKind::Persist);
        assert!(timers.is_armed(TimerKind::TimeWait));
        assert_eq!(timers.expired().await, TimerKind::TimeWait);
    }
}
