//! Component lifecycle: a single state machine type composed with ordered
//! startup/shutdown step lists, instead of an inheritance chain of virtual
//! hooks. Steps are data — a named slice of functions — so the driver can
//! log each one and abort a half-finished startup cleanly.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tracing::debug;

/// Where a component is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Down = 0,
    GoingUp = 1,
    Up = 2,
    GoingDown = 3,
}

impl RunState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => RunState::GoingUp,
            2 => RunState::Up,
            3 => RunState::GoingDown,
            _ => RunState::Down,
        }
    }
}

/// Shared, lock-free view of a component's run state. Completion callbacks
/// of in-flight operations check `is_running` before acting so stale
/// completions after shutdown are discarded, not applied.
#[derive(Debug, Clone, Default)]
pub struct StateCell {
    state: Arc<AtomicU8>,
}

impl StateCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set(&self, state: RunState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// True only in the `Up` state.
    pub fn is_running(&self) -> bool {
        self.get() == RunState::Up
    }

    /// True while the component is not shutting down or stopped.
    pub fn is_alive(&self) -> bool {
        matches!(self.get(), RunState::GoingUp | RunState::Up)
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One named startup or shutdown step.
pub type Step<C, E> = (&'static str, for<'a> fn(&'a mut C) -> BoxFuture<'a, Result<(), E>>);

/// Run ordered steps against a component, logging each. Stops at the first
/// failure and returns it; completed steps are not rolled back here — the
/// caller drives the matching down-steps.
pub async fn run_steps<C, E: std::fmt::Display>(
    component: &'static str,
    target: &mut C,
    steps: &[Step<C, E>],
) -> Result<(), E> {
    for (name, step) in steps {
        debug!(component, step = name, "running lifecycle step");
        step(target).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        ran: Vec<&'static str>,
    }

    impl Counter {
        fn one(&mut self) -> BoxFuture<'_, Result<(), String>> {
            Box::pin(async move {
                self.ran.push("one");
                Ok(())
            })
        }

        fn two(&mut self) -> BoxFuture<'_, Result<(), String>> {
            Box::pin(async move {
                self.ran.push("two");
                Err("boom".to_string())
            })
        }

        fn three(&mut self) -> BoxFuture<'_, Result<(), String>> {
            Box::pin(async move {
                self.ran.push("three");
                Ok(())
            })
        }
    }

    const STEPS: &[Step<Counter, String>] = &[
        ("one", Counter::one),
        ("two", Counter::two),
        ("three", Counter::three),
    ];

    #[tokio::test]
    async fn steps_run_in_order_and_stop_on_failure() {
        let mut counter = Counter { ran: Vec::new() };
        let err = run_steps("test", &mut counter, STEPS).await.unwrap_err();
        assert_eq!(err, "boom");
        assert_eq!(counter.ran, vec!["one", "two"]);
    }

    #[test]
    fn state_cell_transitions() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), RunState::Down);
        assert!(!cell.is_running());
        cell.set(RunState::GoingUp);
        assert!(cell.is_alive());
        assert!(!cell.is_running());
        cell.set(RunState::Up);
        assert!(cell.is_running());
        cell.set(RunState::GoingDown);
        assert!(!cell.is_alive());
    }
}
