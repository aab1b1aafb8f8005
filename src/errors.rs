use crate::registry::HandleId;

/// Errors surfaced by the coroutine scheduler.
///
/// `NotFound` is never returned from [`crate::Scheduler::stop`],
/// [`crate::Scheduler::pause`] or [`crate::Scheduler::resume`] — those
/// operations treat an unknown handle as a logged no-op per the scheduler's
/// error policy (spec: "treated as no-op, logged"). The variant is kept in
/// the taxonomy for completeness and for callers building their own
/// diagnostics on top of a [`crate::HandleId`].
#[derive(derive_more::From, Debug)]
pub enum CoroutineError {
    /// A negative duration was passed to `YieldInstruction::wait_for_seconds`,
    /// or some other programmer-supplied argument was invalid.
    #[from(ignore)]
    InvalidArgument(String),

    /// A disposed `YieldInstruction` was ticked again.
    UseAfterDispose,

    /// An operation referenced a `HandleId` not present in the registry.
    #[from(ignore)]
    NotFound(HandleId),

    /// A `StepSource::advance()` call or a `WaitUntil` predicate panicked.
    #[from(ignore)]
    StepSourceFailure(String),
}

impl std::error::Error for CoroutineError {}

impl core::fmt::Display for CoroutineError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::UseAfterDispose => write!(f, "yield instruction ticked after disposal"),
            Self::NotFound(id) => write!(f, "no coroutine handle registered for {id:?}"),
            Self::StepSourceFailure(msg) => write!(f, "step source failed: {msg}"),
        }
    }
}
