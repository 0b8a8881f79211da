//! Idle-completion hook.
//!
//! The process goes "idle" when no tracked work is pending. A single slot holds the action to run
//! at that point. Completion paths always overwrite or clear the slot, never assume it is empty.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::Notify;

pub type IdleAction = BoxFuture<'static, ()>;

#[derive(Default)]
pub struct IdleMonitor {
    pending: AtomicUsize,
    slot: Mutex<Option<IdleAction>>,
    notify: Notify,
}

impl IdleMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the hook, replacing whatever was there.
    pub fn set(&self, action: IdleAction) {
        *self.lock_slot() = Some(action);
        self.notify.notify_waiters();
    }

    /// Disarms the hook without running it.
    pub fn reset(&self) {
        self.lock_slot().take();
    }

    pub fn is_armed(&self) -> bool {
        self.lock_slot().is_some()
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Marks one unit of work as outstanding until the guard drops.
    pub fn begin_work(self: &Arc<Self>) -> WorkGuard {
        self.pending.fetch_add(1, Ordering::AcqRel);
        WorkGuard {
            monitor: Arc::clone(self),
        }
    }

    /// Resolves with the armed action once no work is pending.
    ///
    /// Cancel safe: the action is only taken out of the slot on the returning poll.
    pub async fn idle(&self) -> IdleAction {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending() == 0 {
                let armed = self.lock_slot().take();
                if let Some(action) = armed {
                    return action;
                }
            }

            notified.await;
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<IdleAction>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct WorkGuard {
    monitor: Arc<IdleMonitor>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        if self.monitor.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.monitor.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use futures::FutureExt as _;

    use super::*;

    fn flag_action(flag: &Arc<AtomicBool>) -> IdleAction {
        let flag = flag.clone();
        async move { flag.store(true, Ordering::SeqCst) }.boxed()
    }

    #[tokio::test]
    async fn idle_waits_for_pending_work() {
        let monitor = Arc::new(IdleMonitor::new());
        let fired = Arc::new(AtomicBool::new(false));
        let guard = monitor.begin_work();
        monitor.set(flag_action(&fired));

        let waiter = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.idle().await.await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(fired.load(Ordering::SeqCst));
        assert!(!monitor.is_armed());
    }

    #[tokio::test]
    async fn reset_disarms_without_running() {
        let monitor = Arc::new(IdleMonitor::new());
        let fired = Arc::new(AtomicBool::new(false));
        monitor.set(flag_action(&fired));
        monitor.reset();

        let idle = tokio::time::timeout(Duration::from_millis(20), monitor.idle()).await;
        assert!(idle.is_err());
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn set_replaces_previous_action() {
        let monitor = Arc::new(IdleMonitor::new());
        let first = Arc::new(AtomicBool::new(false));
        let second = Arc::new(AtomicBool::new(false));
        monitor.set(flag_action(&first));
        monitor.set(flag_action(&second));

        monitor.idle().await.await;
        assert!(!first.load(Ordering::SeqCst));
        assert!(second.load(Ordering::SeqCst));
    }

    #[test]
    fn guards_count_pending_work() {
        let monitor = Arc::new(IdleMonitor::new());
        let a = monitor.begin_work();
        let b = monitor.begin_work();
        assert_eq!(monitor.pending(), 2);
        drop(a);
        drop(b);
        assert_eq!(monitor.pending(), 0);
    }
}
