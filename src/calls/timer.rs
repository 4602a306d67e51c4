//! Single-slot deferred finalization timer.
//!
//! Each call owns one of these. Arming it replaces whatever was armed before.
//! When it fires it does not touch the call: it queues a
//! [`CallEvent::HangupTimeout`] carrying the generation it was armed with, and
//! the call ignores stale generations.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::call::CallEvent;

pub(crate) struct HangupTimer {
    events: mpsc::UnboundedSender<CallEvent>,
    pending: Option<JoinHandle<()>>,
    generation: u64,
}

impl HangupTimer {
    pub(crate) fn new(events: mpsc::UnboundedSender<CallEvent>) -> Self {
        Self {
            events,
            pending: None,
            generation: 0,
        }
    }

    pub(crate) fn arm(&mut self, delay: Duration) {
        self.cancel();
        self.generation += 1;
        let generation = self.generation;
        let events = self.events.clone();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(CallEvent::HangupTimeout { generation });
        }));
    }

    pub(crate) fn cancel(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }

    /// Consume a fired timer. Returns false for a stale generation.
    pub(crate) fn expire(&mut self, generation: u64) -> bool {
        if self.pending.is_some() && generation == self.generation {
            self.pending = None;
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self) -> bool {
        self.pending.is_some()
    }
}

impl Drop for HangupTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = HangupTimer::new(tx);
        timer.arm(Duration::from_secs(5));

        let event = rx.recv().await.unwrap();
        let CallEvent::HangupTimeout { generation } = event else {
            panic!("unexpected event {event:?}");
        };
        assert!(timer.expire(generation));
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearming_replaces_previous_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = HangupTimer::new(tx);
        timer.arm(Duration::from_secs(1));
        timer.arm(Duration::from_secs(5));

        let start = tokio::time::Instant::now();
        let event = rx.recv().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
        let CallEvent::HangupTimeout { generation } = event else {
            panic!("unexpected event {event:?}");
        };
        assert_eq!(generation, 2);
        assert!(!timer.expire(1));
        assert!(timer.expire(generation));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_suppresses_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = HangupTimer::new(tx);
        timer.arm(Duration::from_secs(1));
        timer.cancel();
        assert!(!timer.is_armed());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }
}
