//! Two-step confirmation for destructive actions.
//!
//! The first [`ConfirmGate::arm`] on a target arms it; a second call on the same target
//! inside the expiry window confirms it. Arming another target, or letting the window
//! lapse, silently drops the previous arm.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

pub const DEFAULT_CONFIRM_EXPIRY: Duration = Duration::from_millis(3_000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmState<T> {
    Idle,
    Armed(T),
}

/// Result of one [`ConfirmGate::arm`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArmOutcome<T> {
    Armed(T),
    Confirmed(T),
}

type ExpiryHook<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct GateSlot<T> {
    armed: Option<T>,
    // Bumped on every transition so a timer that lost the race never clears a newer arm.
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

/// Requires a tokio runtime: each arm spawns the expiry timer as a task.
pub struct ConfirmGate<T> {
    expiry: Duration,
    slot: Arc<Mutex<GateSlot<T>>>,
    on_expire: Option<ExpiryHook<T>>,
}

impl<T> ConfirmGate<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            slot: Arc::new(Mutex::new(GateSlot {
                armed: None,
                generation: 0,
                timer: None,
            })),
            on_expire: None,
        }
    }

    /// Invoked with the lapsed target whenever an arm expires unconfirmed.
    pub fn with_expiry_hook(mut self, hook: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_expire = Some(Arc::new(hook));
        self
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    pub fn arm(&self, target: T) -> ArmOutcome<T> {
        let mut slot = self.lock_slot();

        if slot.armed.as_ref() == Some(&target) {
            Self::reset(&mut slot);
            return ArmOutcome::Confirmed(target);
        }

        Self::reset(&mut slot);
        slot.armed = Some(target.clone());
        slot.timer = Some(self.spawn_expiry_timer(slot.generation));
        ArmOutcome::Armed(target)
    }

    pub fn is_armed(&self, target: &T) -> bool {
        self.lock_slot().armed.as_ref() == Some(target)
    }

    pub fn armed_target(&self) -> Option<T> {
        self.lock_slot().armed.clone()
    }

    pub fn state(&self) -> ConfirmState<T> {
        match self.armed_target() {
            Some(target) => ConfirmState::Armed(target),
            None => ConfirmState::Idle,
        }
    }

    pub fn disarm(&self) {
        Self::reset(&mut self.lock_slot());
    }

    fn spawn_expiry_timer(&self, generation: u64) -> JoinHandle<()> {
        let slot = Arc::clone(&self.slot);
        let expiry = self.expiry;
        let on_expire = self.on_expire.clone();

        tokio::spawn(async move {
            tokio::time::sleep(expiry).await;

            let lapsed = {
                let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
                if slot.generation != generation {
                    return;
                }
                slot.generation = slot.generation.wrapping_add(1);
                slot.timer = None;
                slot.armed.take()
            };

            if let (Some(target), Some(on_expire)) = (lapsed, on_expire) {
                on_expire(&target);
            }
        })
    }

    fn reset(slot: &mut GateSlot<T>) {
        slot.armed = None;
        slot.generation = slot.generation.wrapping_add(1);
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, GateSlot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Drop for ConfirmGate<T> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ConfirmGate<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        formatter
            .debug_struct("ConfirmGate")
            .field("expiry", &self.expiry)
            .field("armed", &slot.armed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const EXPIRY: Duration = Duration::from_millis(3_000);

    #[tokio::test(start_paused = true)]
    async fn second_arm_on_same_target_confirms_once() {
        let gate = ConfirmGate::new(EXPIRY);

        assert_eq!(gate.arm("X"), ArmOutcome::Armed("X"));
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(gate.arm("X"), ArmOutcome::Confirmed("X"));

        // Confirmation is one-shot; the next arm starts over.
        assert_eq!(gate.state(), ConfirmState::Idle);
        assert_eq!(gate.arm("X"), ArmOutcome::Armed("X"));
    }

    #[tokio::test(start_paused = true)]
    async fn arming_a_different_target_replaces_the_previous_one() {
        let gate = ConfirmGate::new(EXPIRY);

        gate.arm("X");
        assert_eq!(gate.arm("Y"), ArmOutcome::Armed("Y"));

        assert!(!gate.is_armed(&"X"));
        assert!(gate.is_armed(&"Y"));
        assert_eq!(gate.arm("X"), ArmOutcome::Armed("X"));
    }

    #[tokio::test(start_paused = true)]
    async fn arm_lapses_silently_after_expiry() {
        let lapsed = Arc::new(AtomicUsize::new(0));
        let lapsed_hook = Arc::clone(&lapsed);
        let gate = ConfirmGate::new(EXPIRY).with_expiry_hook(move |_: &u64| {
            lapsed_hook.fetch_add(1, Ordering::SeqCst);
        });

        gate.arm(7_u64);
        tokio::time::sleep(EXPIRY + Duration::from_millis(1)).await;

        assert_eq!(gate.state(), ConfirmState::Idle);
        assert_eq!(lapsed.load(Ordering::SeqCst), 1);
        assert_eq!(gate.arm(7), ArmOutcome::Armed(7));
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_restarts_the_window_with_a_single_timer() {
        let lapsed = Arc::new(AtomicUsize::new(0));
        let lapsed_hook = Arc::clone(&lapsed);
        let gate = ConfirmGate::new(EXPIRY).with_expiry_hook(move |_: &&str| {
            lapsed_hook.fetch_add(1, Ordering::SeqCst);
        });

        gate.arm("X");
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        gate.arm("Y");
        tokio::time::sleep(Duration::from_millis(2_000)).await;

        // The timer armed for X was cancelled, so Y is still live past X's deadline.
        assert!(gate.is_armed(&"Y"));
        assert_eq!(lapsed.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(1_001)).await;
        assert_eq!(gate.state(), ConfirmState::Idle);
        assert_eq!(lapsed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_cancels_pending_confirmation() {
        let gate = ConfirmGate::new(EXPIRY);

        gate.arm("doc-3");
        gate.disarm();

        assert_eq!(gate.armed_target(), None);
        assert_eq!(gate.arm("doc-3"), ArmOutcome::Armed("doc-3"));
    }
}
