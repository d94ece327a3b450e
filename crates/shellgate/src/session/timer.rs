use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

const PENDING: u8 = 0;
const CANCELLED: u8 = 1;
const FIRED: u8 = 2;

/// Observable state of a [`ScheduledTimer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Pending,
    Cancelled,
    Fired,
}

/// A cancellable scheduled operation with typed state.
///
/// The auth timeout and orphan timeout both must be cancelled exactly
/// on their success path (successful auth, successful resume) or they
/// will later fire and destroy a now-valid session. Keeping the
/// pending/cancelled/fired state explicit makes "was this already
/// cancelled" a checkable fact, and the fire callback runs only after
/// winning a state transition, so cancel-vs-fire races resolve to
/// exactly one outcome.
///
/// Dropping the handle cancels the timer.
#[derive(Debug)]
pub struct ScheduledTimer {
    state: Arc<AtomicU8>,
    token: CancellationToken,
}

impl ScheduledTimer {
    /// Schedule `on_fire` to run after `delay` unless cancelled first.
    pub fn schedule<F>(delay: Duration, on_fire: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(PENDING));
        let token = CancellationToken::new();

        let task_state = state.clone();
        let task_token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if task_state
                        .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        on_fire.await;
                    }
                }
            }
        });

        Self { state, token }
    }

    /// Cancel the timer. Returns true if it was still pending (the
    /// callback will not run); false if it already fired or was
    /// cancelled before.
    pub fn cancel(&self) -> bool {
        let was_pending = self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        self.token.cancel();
        was_pending
    }

    pub fn state(&self) -> TimerState {
        match self.state.load(Ordering::Acquire) {
            CANCELLED => TimerState::Cancelled,
            FIRED => TimerState::Fired,
            _ => TimerState::Pending,
        }
    }
}

impl Drop for ScheduledTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let timer = ScheduledTimer::schedule(Duration::from_secs(5), async move {
            flag.store(true, Ordering::SeqCst);
        });

        assert_eq!(timer.state(), TimerState::Pending);
        // The timer task must register its sleep before the clock
        // moves, or the deadline lands relative to the advanced time.
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;

        assert_eq!(timer.state(), TimerState::Fired);
        assert!(fired.load(Ordering::SeqCst));
        // Cancelling after the fact is a no-op and reports it.
        assert!(!timer.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_fire() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let timer = ScheduledTimer::schedule(Duration::from_secs(5), async move {
            flag.store(true, Ordering::SeqCst);
        });
        tokio::task::yield_now().await;

        assert!(timer.cancel());
        assert_eq!(timer.state(), TimerState::Cancelled);

        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn drop_cancels() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let timer = ScheduledTimer::schedule(Duration::from_secs(5), async move {
            flag.store(true, Ordering::SeqCst);
        });
        tokio::task::yield_now().await;
        drop(timer);

        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
