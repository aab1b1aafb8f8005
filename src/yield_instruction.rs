use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::errors::CoroutineError;
use crate::registry::HandleId;

/// The state of one [`crate::handle::CoroutineHandle`].
///
/// `Running` is only ever observable transiently within a single
/// `Scheduler::tick` call: a handle always leaves `process()` in `Waiting`,
/// `Completed`, or `Paused`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoroutineState {
    Initializing,
    Running,
    Waiting,
    Paused,
    Completed,
}

/// A suspension primitive consumed by the scheduler between
/// [`crate::step_source::StepSource`] advances.
///
/// The set of variants is closed and fixed: dispatch by pattern match, not
/// a capability trait.
pub enum YieldInstruction {
    WaitForSeconds {
        elapsed: f64,
        duration: f64,
        done: bool,
        disposed: bool,
    },
    WaitUntil {
        predicate: Box<dyn FnMut() -> bool>,
        disposed: bool,
    },
    WaitForChild {
        child: HandleId,
        disposed: bool,
    },
}

impl YieldInstruction {
    /// Builds a `WaitForSeconds`. Rejects negative durations eagerly, at
    /// construction rather than on first tick.
    pub fn wait_for_seconds(duration: f64) -> Result<Self, CoroutineError> {
        if duration < 0.0 {
            return Err(CoroutineError::InvalidArgument(format!(
                "WaitForSeconds duration must be non-negative, got {duration}"
            )));
        }
        Ok(Self::WaitForSeconds {
            elapsed: 0.0,
            duration,
            done: false,
            disposed: false,
        })
    }

    /// Builds a `WaitUntil` around a predicate. The predicate is the sole
    /// source of truth; no result is cached across ticks.
    pub fn wait_until(predicate: impl FnMut() -> bool + 'static) -> Self {
        Self::WaitUntil {
            predicate: Box::new(predicate),
            disposed: false,
        }
    }

    pub(crate) fn wait_for_child(child: HandleId) -> Self {
        Self::WaitForChild {
            child,
            disposed: false,
        }
    }

    fn is_disposed(&self) -> bool {
        match self {
            Self::WaitForSeconds { disposed, .. }
            | Self::WaitUntil { disposed, .. }
            | Self::WaitForChild { disposed, .. } => *disposed,
        }
    }

    /// Advances the instruction and reports whether the suspension has
    /// resolved. `WaitForSeconds` accumulates `dt` monotonically and stays
    /// `done` once resolved; `WaitUntil` polls its predicate at most once
    /// per call; `WaitForChild` is only ever ticked once its child has
    /// already completed (the scheduler gates on the children list before
    /// reaching the yield-instruction phase), so it always resolves.
    ///
    /// A panicking `WaitUntil` predicate is caught and reported as
    /// [`CoroutineError::StepSourceFailure`] rather than unwinding into the
    /// scheduler.
    pub fn tick(&mut self, dt: f64) -> Result<bool, CoroutineError> {
        if self.is_disposed() {
            return Err(CoroutineError::UseAfterDispose);
        }

        match self {
            Self::WaitForSeconds {
                elapsed,
                duration,
                done,
                ..
            } => {
                if !*done {
                    *elapsed += dt;
                    *done = *elapsed >= *duration;
                }
                Ok(*done)
            }
            Self::WaitUntil { predicate, .. } => {
                catch_unwind(AssertUnwindSafe(|| predicate())).map_err(|payload| {
                    CoroutineError::StepSourceFailure(panic_message(&payload))
                })
            }
            Self::WaitForChild { .. } => Ok(true),
        }
    }

    /// Idempotent disposal hook. Safe to call more than once.
    pub fn dispose(&mut self) {
        match self {
            Self::WaitForSeconds { disposed, .. }
            | Self::WaitUntil { disposed, .. }
            | Self::WaitForChild { disposed, .. } => *disposed = true,
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_for_seconds_rejects_negative_duration() {
        assert!(matches!(
            YieldInstruction::wait_for_seconds(-1.0),
            Err(CoroutineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn wait_for_seconds_zero_resolves_on_first_tick_regardless_of_dt() {
        let mut yi = YieldInstruction::wait_for_seconds(0.0).unwrap();
        assert_eq!(yi.tick(0.0).unwrap(), true);

        let mut yi2 = YieldInstruction::wait_for_seconds(0.0).unwrap();
        assert_eq!(yi2.tick(5.0).unwrap(), true);
    }

    #[test]
    fn wait_for_seconds_accumulates_and_stays_done() {
        let mut yi = YieldInstruction::wait_for_seconds(1.0).unwrap();
        assert_eq!(yi.tick(0.5).unwrap(), false);
        assert_eq!(yi.tick(0.6).unwrap(), true);
        // idempotent: further ticks keep returning true until disposal.
        assert_eq!(yi.tick(0.0).unwrap(), true);
    }

    #[test]
    fn wait_until_reflects_predicate_each_call() {
        let shared = std::rc::Rc::new(std::cell::RefCell::new(false));
        let shared_clone = shared.clone();
        let mut yi = YieldInstruction::wait_until(move || *shared_clone.borrow());
        assert_eq!(yi.tick(0.0).unwrap(), false);
        *shared.borrow_mut() = true;
        assert_eq!(yi.tick(0.0).unwrap(), true);
    }

    #[test]
    fn tick_after_dispose_is_use_after_dispose() {
        let mut yi = YieldInstruction::wait_for_seconds(1.0).unwrap();
        yi.dispose();
        assert!(matches!(yi.tick(0.1), Err(CoroutineError::UseAfterDispose)));
        // disposal itself is idempotent
        yi.dispose();
    }

    #[test]
    fn wait_until_panic_becomes_step_source_failure() {
        let mut yi = YieldInstruction::wait_until(|| panic!("boom"));
        match yi.tick(0.0) {
            Err(CoroutineError::StepSourceFailure(msg)) => assert_eq!(msg, "boom"),
            other => panic!("expected StepSourceFailure, got {other:?}"),
        }
    }
}
