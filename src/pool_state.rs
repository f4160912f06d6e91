use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::task_types::{Phase, TaskName};

#[derive(Debug, Clone)]
pub(crate) struct SlotView {
    pub(crate) id: usize,
    pub(crate) phase: Phase,
    pub(crate) task: Option<TaskName>,
    pub(crate) last_activity: Instant,
}

#[derive(Debug)]
struct PoolInner {
    last_activity: Instant,
    empty_polls: u64,
    claims: u64,
    slots: Vec<SlotView>,
}

/// Pool-wide activity shared by every worker and read by the Supervisor.
#[derive(Debug)]
pub(crate) struct PoolState {
    inner: Mutex<PoolInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PoolState {
    pub(crate) fn new(workers: usize) -> Self {
        let now = Instant::now();
        let slots = (0..workers)
            .map(|id| SlotView {
                id,
                phase: Phase::Idle,
                task: None,
                last_activity: now,
            })
            .collect();
        Self {
            inner: Mutex::new(PoolInner {
                last_activity: now,
                empty_polls: 0,
                claims: 0,
                slots,
            }),
        }
    }

    /// A claim or terminal transition happened on `slot`.
    pub(crate) fn record_activity(&self, slot: usize) {
        let now = Instant::now();
        let mut inner = lock(&self.inner);
        inner.last_activity = now;
        inner.empty_polls = 0;
        if let Some(view) = inner.slots.get_mut(slot) {
            view.last_activity = now;
        }
    }

    pub(crate) fn record_claim(&self, slot: usize, task: &TaskName) {
        self.record_activity(slot);
        let mut inner = lock(&self.inner);
        inner.claims += 1;
        if let Some(view) = inner.slots.get_mut(slot) {
            view.phase = Phase::Executing;
            view.task = Some(task.clone());
        }
    }

    pub(crate) fn record_release(&self, slot: usize) {
        self.record_activity(slot);
        self.set_phase(slot, Phase::Idle);
    }

    pub(crate) fn record_empty_poll(&self) -> u64 {
        let mut inner = lock(&self.inner);
        inner.empty_polls += 1;
        inner.empty_polls
    }

    pub(crate) fn set_phase(&self, slot: usize, phase: Phase) {
        let mut inner = lock(&self.inner);
        if let Some(view) = inner.slots.get_mut(slot) {
            view.phase = phase;
            if phase != Phase::Executing {
                view.task = None;
            }
        }
    }

    /// Time since the last claim or terminal transition. Zero while any slot
    /// is executing, so a long job never counts as idleness.
    pub(crate) fn idle_duration(&self) -> Duration {
        let inner = lock(&self.inner);
        if inner.slots.iter().any(|view| view.phase == Phase::Executing) {
            return Duration::ZERO;
        }
        inner.last_activity.elapsed()
    }

    pub(crate) fn claims(&self) -> u64 {
        lock(&self.inner).claims
    }

    pub(crate) fn empty_polls(&self) -> u64 {
        lock(&self.inner).empty_polls
    }

    pub(crate) fn executing(&self) -> Vec<SlotView> {
        lock(&self.inner)
            .slots
            .iter()
            .filter(|view| view.phase == Phase::Executing)
            .cloned()
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum ShutdownLevel {
    Running,
    /// Stop claiming; finish in-flight tasks.
    Drain,
    /// Kill in-flight jobs and leave their tasks in running.
    Terminate,
}

#[derive(Debug)]
struct TokenInner {
    level: ShutdownLevel,
    reason: Option<String>,
}

/// Cooperative cancellation shared by the Supervisor, the signal handler and
/// every worker loop. Workers look at it only between loop iterations, except
/// for `Terminate`, which the job supervisor in `shell` also watches.
#[derive(Debug)]
pub(crate) struct ShutdownToken {
    inner: Mutex<TokenInner>,
    changed: Condvar,
}

impl ShutdownToken {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(TokenInner {
                level: ShutdownLevel::Running,
                reason: None,
            }),
            changed: Condvar::new(),
        }
    }

    /// Request a drain. The first reason wins. Returns true if this call
    /// changed the level.
    pub(crate) fn cancel(&self, reason: &str) -> bool {
        self.raise(ShutdownLevel::Drain, reason)
    }

    pub(crate) fn terminate(&self, reason: &str) -> bool {
        self.raise(ShutdownLevel::Terminate, reason)
    }

    fn raise(&self, level: ShutdownLevel, reason: &str) -> bool {
        let mut inner = lock(&self.inner);
        if inner.level >= level {
            return false;
        }
        inner.level = level;
        if inner.reason.is_none() {
            inner.reason = Some(reason.to_string());
        }
        self.changed.notify_all();
        true
    }

    pub(crate) fn level(&self) -> ShutdownLevel {
        lock(&self.inner).level
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.level() >= ShutdownLevel::Drain
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.level() >= ShutdownLevel::Terminate
    }

    pub(crate) fn reason(&self) -> Option<String> {
        lock(&self.inner).reason.clone()
    }

    /// Sleep for up to `timeout`, waking early once the level reaches `at_least`.
    /// Returns true if woken by shutdown.
    pub(crate) fn wait_for(&self, at_least: ShutdownLevel, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = lock(&self.inner);
        loop {
            if inner.level >= at_least {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            inner = match self.changed.wait_timeout(inner, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    pub(crate) fn sleep(&self, timeout: Duration) -> bool {
        self.wait_for(ShutdownLevel::Drain, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn name(value: &str) -> TaskName {
        TaskName::try_from(value).expect("task name")
    }

    #[test]
    fn idle_duration_is_zero_while_executing() {
        let state = PoolState::new(2);
        state.record_claim(1, &name("t1"));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(state.idle_duration(), Duration::ZERO);
        assert_eq!(state.executing().len(), 1);

        state.record_release(1);
        thread::sleep(Duration::from_millis(30));
        assert!(state.idle_duration() >= Duration::from_millis(30));
        assert!(state.executing().is_empty());
        assert_eq!(state.claims(), 1);
    }

    #[test]
    fn activity_resets_empty_poll_streak() {
        let state = PoolState::new(1);
        assert_eq!(state.record_empty_poll(), 1);
        assert_eq!(state.record_empty_poll(), 2);
        state.record_activity(0);
        assert_eq!(state.empty_polls(), 0);
    }

    #[test]
    fn concurrent_empty_polls_are_not_lost() {
        let state = Arc::new(PoolState::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let state = Arc::clone(&state);
                thread::spawn(move || {
                    for _ in 0..250 {
                        state.record_empty_poll();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(state.empty_polls(), 1000);
    }

    #[test]
    fn first_reason_wins_and_levels_only_rise() {
        let token = ShutdownToken::new();
        assert!(token.cancel("idle_timeout"));
        assert!(!token.cancel("signal"));
        assert!(token.terminate("signal"));
        assert!(!token.cancel("signal"));
        assert_eq!(token.level(), ShutdownLevel::Terminate);
        assert_eq!(token.reason().as_deref(), Some("idle_timeout"));
    }

    #[test]
    fn sleep_wakes_on_cancel() {
        let token = Arc::new(ShutdownToken::new());
        let waker = {
            let token = Arc::clone(&token);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                token.cancel("test");
            })
        };
        let started = Instant::now();
        assert!(token.sleep(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        waker.join().expect("join");
    }

    #[test]
    fn drain_does_not_wake_terminate_waiters() {
        let token = ShutdownToken::new();
        token.cancel("idle_timeout");
        assert!(!token.wait_for(ShutdownLevel::Terminate, Duration::from_millis(20)));
    }
}
