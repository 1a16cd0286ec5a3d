//! Global pause switch checked by every stage pool before it dequeues.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Notify;

#[derive(Default)]
pub struct PauseControl {
    paused: AtomicBool,
    reason: RwLock<Option<String>>,
    /// When the last pause ended.
    resumed_at: RwLock<Option<DateTime<Utc>>>,
    resumed: Notify,
}

impl PauseControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause dequeuing. Returns `false` if already paused; the reason is
    /// replaced either way.
    pub fn pause(&self, reason: Option<String>) -> bool {
        *self.reason.write() = reason;
        !self.paused.swap(true, Ordering::SeqCst)
    }

    /// Returns `false` if not paused.
    pub fn resume(&self) -> bool {
        let was_paused = self.paused.swap(false, Ordering::SeqCst);
        *self.reason.write() = None;
        if was_paused {
            *self.resumed_at.write() = Some(Utc::now());
        }
        self.resumed.notify_waiters();
        was_paused
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    pub fn resumed_at(&self) -> Option<DateTime<Utc>> {
        *self.resumed_at.read()
    }

    /// Wait until not paused. Returns immediately when running.
    pub async fn wait_until_resumed(&self) {
        loop {
            let notified = self.resumed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_paused() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_pause_and_resume() {
        let control = PauseControl::new();
        assert!(!control.is_paused());

        assert!(control.pause(Some("maintenance".into())));
        assert!(!control.pause(Some("still maintenance".into())));
        assert!(control.is_paused());
        assert_eq!(control.reason().as_deref(), Some("still maintenance"));
        assert_eq!(control.resumed_at(), None);

        let before = chrono::Utc::now();
        assert!(control.resume());
        let resumed_at = control.resumed_at().unwrap();
        assert!(resumed_at >= before);

        assert!(!control.resume());
        assert_eq!(control.resumed_at(), Some(resumed_at));
        assert_eq!(control.reason(), None);
    }

    #[tokio::test]
    async fn test_waiters_wake_on_resume() {
        let control = Arc::new(PauseControl::new());
        control.pause(None);

        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.wait_until_resumed().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        control.resume();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
