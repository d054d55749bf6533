//! Cancellable one-shot timers.
//!
//! The session never sleeps itself. It asks a [`Scheduler`] to deliver a
//! [`TimerId`] back after a delay and matches the id against the timers it
//! still owns when it arrives.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub(crate) u64);

/// "Schedule after delay / cancel" capability.
pub trait Scheduler {
    /// Arms a one-shot timer that fires once after `delay`.
    fn schedule(&mut self, delay: Duration) -> TimerId;

    /// Disarms a timer. Cancelling a fired or unknown timer is a no-op.
    fn cancel(&mut self, timer: TimerId);
}

/// Scheduler that spawns one `tokio` sleep task per timer and posts the id to
/// a channel when it elapses.
#[derive(Debug)]
pub struct TokioScheduler {
    fired: mpsc::UnboundedSender<TimerId>,
    tasks: HashMap<TimerId, JoinHandle<()>>,
    next_id: u64,
}

impl TokioScheduler {
    pub fn new(fired: mpsc::UnboundedSender<TimerId>) -> Self {
        Self {
            fired,
            tasks: HashMap::new(),
            next_id: 0,
        }
    }

    /// Number of timers whose task has not finished yet.
    pub fn armed(&self) -> usize {
        self.tasks
            .values()
            .filter(|task| !task.is_finished())
            .count()
    }

    fn cancel_all(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&mut self, delay: Duration) -> TimerId {
        self.tasks.retain(|_, task| !task.is_finished());

        self.next_id += 1;
        let timer = TimerId(self.next_id);
        let fired = self.fired.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = fired.send(timer);
        });
        self.tasks.insert(timer, task);
        timer
    }

    fn cancel(&mut self, timer: TimerId) {
        if let Some(task) = self.tasks.remove(&timer) {
            task.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::{Scheduler, TokioScheduler};

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let (fired_tx, mut fired_rx) = mpsc::unbounded_channel();
        let mut scheduler = TokioScheduler::new(fired_tx);

        let timer = scheduler.schedule(Duration::from_millis(3000));
        tokio::time::sleep(Duration::from_millis(2999)).await;
        assert!(fired_rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fired_rx.recv().await, Some(timer));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (fired_tx, mut fired_rx) = mpsc::unbounded_channel();
        let mut scheduler = TokioScheduler::new(fired_tx);

        let cancelled = scheduler.schedule(Duration::from_millis(100));
        let kept = scheduler.schedule(Duration::from_millis(200));
        scheduler.cancel(cancelled);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired_rx.recv().await, Some(kept));
        assert!(fired_rx.try_recv().is_err());
        assert_eq!(scheduler.armed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_scheduler_aborts_pending_timers() {
        let (fired_tx, mut fired_rx) = mpsc::unbounded_channel();
        let mut scheduler = TokioScheduler::new(fired_tx);
        scheduler.schedule(Duration::from_millis(100));
        drop(scheduler);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired_rx.recv().await, None);
    }
}
