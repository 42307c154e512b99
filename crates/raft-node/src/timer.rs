//! # timer
//!
//! why: drive elections and heartbeats from one clock per replica
//! relations: owned by the replica actor in replica.rs
//! what: Timer (cancellable, epoch-tagged one-shot), randomized election timeouts
//!
//! A fired timer posts a [`TimerFired`] into the replica's timer channel.
//! Rearming or cancelling bumps the epoch, so an event that was already in
//! flight is recognised as stale by [`Timer::is_current`] and dropped.

use std::time::Duration;

use rand::Rng;
use raft_core::RaftConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Election,
    Heartbeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub epoch: u64,
}

#[derive(Debug)]
pub struct Timer {
    kind: TimerKind,
    epoch: u64,
    armed: bool,
    task: Option<JoinHandle<()>>,
    tx: mpsc::UnboundedSender<TimerFired>,
}

impl Timer {
    pub fn new(kind: TimerKind, tx: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            kind,
            epoch: 0,
            armed: false,
            task: None,
            tx,
        }
    }

    /// Cancel any pending firing and fire once after `after`. Returns the
    /// epoch the firing will carry.
    pub fn arm(&mut self, after: Duration) -> u64 {
        self.cancel();
        self.armed = true;
        let fired = TimerFired {
            kind: self.kind,
            epoch: self.epoch,
        };
        let tx = self.tx.clone();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(fired);
        }));
        fired.epoch
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.epoch += 1;
        self.armed = false;
    }

    /// Whether a firing with `epoch` belongs to the current arming.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.armed && epoch == self.epoch
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Uniformly random duration in `[election_timeout_min, election_timeout_max]`.
pub fn election_timeout(config: &RaftConfig) -> Duration {
    let min = config.election_timeout_min;
    let max = config.election_timeout_max.max(min);
    Duration::from_millis(rand::thread_rng().gen_range(min..=max))
}

pub fn heartbeat_interval(config: &RaftConfig) -> Duration {
    Duration::from_millis(config.heartbeat_interval)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_with_current_epoch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = Timer::new(TimerKind::Election, tx);

        let epoch = timer.arm(Duration::from_millis(5));
        let fired = rx.recv().await.unwrap();

        assert_eq!(fired, TimerFired { kind: TimerKind::Election, epoch });
        assert!(timer.is_current(fired.epoch));
    }

    #[tokio::test]
    async fn rearm_makes_earlier_firing_stale() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = Timer::new(TimerKind::Heartbeat, tx);

        let first = timer.arm(Duration::from_millis(1));
        let second = timer.arm(Duration::from_millis(5));
        assert_ne!(first, second);
        assert!(!timer.is_current(first));

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.epoch, second);
    }

    #[tokio::test]
    async fn cancelled_timer_is_not_current() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut timer = Timer::new(TimerKind::Election, tx);

        let epoch = timer.arm(Duration::from_secs(60));
        timer.cancel();

        assert!(!timer.is_armed());
        assert!(!timer.is_current(epoch));
    }

    #[test]
    fn election_timeout_stays_in_range() {
        let config = RaftConfig::default();
        for _ in 0..100 {
            let timeout = election_timeout(&config);
            assert!(timeout >= Duration::from_millis(config.election_timeout_min));
            assert!(timeout <= Duration::from_millis(config.election_timeout_max));
        }
    }
}
