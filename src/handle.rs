use crate::registry::HandleId;
use crate::step_source::StepSource;
use crate::yield_instruction::{CoroutineState, YieldInstruction};

/// The scheduler's record for one coroutine. Owned exclusively by the
/// [`crate::Scheduler`]; parents reference children (and children their
/// parent) by [`HandleId`] only — never an owning link, so no cycle is ever
/// constructible.
pub(crate) struct CoroutineHandle {
    /// `None` only for the brief window `Scheduler::advance_source` holds
    /// the source out of the registry to call `advance()` without an
    /// interior-mutability borrow held — never observable from outside a
    /// single `process()` call.
    pub(crate) source: Option<Box<dyn StepSource>>,
    pub(crate) state: CoroutineState,
    pub(crate) pre_pause_state: Option<CoroutineState>,
    pub(crate) current_yield: Option<YieldInstruction>,
    pub(crate) parent: Option<HandleId>,
    pub(crate) children: Vec<HandleId>,
    pub(crate) is_first_tick: bool,
    pub(crate) disposed: bool,
}

impl CoroutineHandle {
    pub(crate) fn new(source: Box<dyn StepSource>, parent: Option<HandleId>) -> Self {
        Self {
            source: Some(source),
            state: CoroutineState::Initializing,
            pre_pause_state: None,
            current_yield: None,
            parent,
            children: Vec::new(),
            is_first_tick: true,
            disposed: false,
        }
    }

    /// Disposes the current yield instruction exactly once, if present.
    pub(crate) fn dispose_current_yield(&mut self) {
        if let Some(mut yi) = self.current_yield.take() {
            yi.dispose();
        }
    }
}
