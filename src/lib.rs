//! Tick-driven cooperative coroutine scheduler.
//!
//! Game logic authors long-running, time-sliced behavior as a
//! [`StepSource`] — a sequence that, polled once per advance, yields a
//! suspension point (wait a duration, wait for a predicate, or wait for a
//! nested coroutine) or terminates. A [`Scheduler`] drives every registered
//! coroutine forward once per call to [`Scheduler::tick`], honoring
//! parent/child composition and full-subtree pause/resume/stop.

mod errors;
mod handle;
mod registry;
mod scheduler;
mod step_source;
mod yield_instruction;

pub use errors::CoroutineError;
pub use registry::HandleId;
pub use scheduler::Scheduler;
pub use step_source::{FromFn, StepSource, Steps, Yield};
pub use yield_instruction::{CoroutineState, YieldInstruction};
