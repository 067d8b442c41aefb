//! Cancelable timers backed by tokio tasks.
//!
//! A timer fires by sending a [`TimerFired`] into a channel owned by the
//! node worker, so firings are handled on the same loop as every other
//! input. Each timer has a unique id; the worker compares it against the
//! handle it currently holds and drops firings from timers it has replaced.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::RequestId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerKind {
    Election,
    Heartbeat,
    RequestExpiry(RequestId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub id: u64,
    pub kind: TimerKind,
}

/// Owns a scheduled timer. Dropping the handle cancels it.
#[derive(Debug)]
pub struct TimerHandle {
    id: u64,
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug, Clone)]
pub struct TimerService {
    tx: UnboundedSender<TimerFired>,
    next_id: Arc<AtomicU64>,
}

impl TimerService {
    pub fn new() -> (Self, UnboundedReceiver<TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                next_id: Arc::new(AtomicU64::new(1)),
            },
            rx,
        )
    }

    /// Fires `kind` once after `delay`.
    pub fn schedule_once(&self, delay: Duration, kind: TimerKind) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = tx.send(TimerFired { id, kind });
        });
        TimerHandle { id, task }
    }

    /// Fires `kind` every `period`, first after one full period.
    pub fn schedule_repeating(&self, period: Duration, kind: TimerKind) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx
                    .send(TimerFired {
                        id,
                        kind: kind.clone(),
                    })
                    .is_err()
                {
                    break;
                }
            }
        });
        TimerHandle { id, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn once_fires_after_delay() {
        let (timers, mut rx) = TimerService::new();
        let handle = timers.schedule_once(Duration::from_millis(200), TimerKind::Election);

        time::advance(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());

        let fired = rx.recv().await.expect("timer fired");
        assert_eq!(fired.id, handle.id());
        assert_eq!(fired.kind, TimerKind::Election);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_handle_never_fires() {
        let (timers, mut rx) = TimerService::new();
        let handle = timers.schedule_once(Duration::from_millis(50), TimerKind::Election);
        handle.cancel();
        let keep = timers.schedule_once(Duration::from_millis(100), TimerKind::Heartbeat);

        let fired = rx.recv().await.expect("second timer fired");
        assert_eq!(fired.id, keep.id());
        assert_eq!(fired.kind, TimerKind::Heartbeat);
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_fires_until_cancelled() {
        let (timers, mut rx) = TimerService::new();
        let handle = timers.schedule_repeating(Duration::from_millis(100), TimerKind::Heartbeat);
        for _ in 0..3 {
            let fired = rx.recv().await.expect("tick");
            assert_eq!(fired.id, handle.id());
        }
        drop(handle);
        time::advance(Duration::from_millis(500)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ids_are_unique() {
        let (timers, _rx) = TimerService::new();
        let a = timers.schedule_once(Duration::from_secs(1), TimerKind::Election);
        let b = timers.schedule_once(
            Duration::from_secs(1),
            TimerKind::RequestExpiry("r1".into()),
        );
        assert_ne!(a.id(), b.id());
    }
}
