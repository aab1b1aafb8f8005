use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::thread::ThreadId;

use crate::errors::CoroutineError;
use crate::handle::CoroutineHandle;
use crate::registry::{HandleId, Slots};
use crate::step_source::{StepSource, Yield};
use crate::yield_instruction::{panic_message, CoroutineState, YieldInstruction};

enum PendingOp {
    Stop(HandleId),
    Pause(HandleId),
    Resume(HandleId),
}

struct SchedulerInner {
    registry: Slots<CoroutineHandle>,
    roots: Vec<HandleId>,
    pending_start: VecDeque<HandleId>,
    pending_remove: Vec<HandleId>,
    pending_ops: VecDeque<PendingOp>,
    traversing: bool,
}

/// Registry of [`CoroutineHandle`]s and the driver of the per-tick
/// algorithm: promote pending starts, walk the forest of roots in
/// registration order, drain completed handles.
///
/// Single-threaded and cooperative: every call asserts it runs on the
/// thread that constructed the scheduler. State lives behind a `RefCell`
/// rather than requiring `&mut self` so a `StepSource` or `WaitUntil`
/// predicate can hold its own `Rc<Scheduler>` clone and call back into
/// `start`/`stop`/`pause`/`resume` from inside its own advance — the
/// re-entrancy the pending-ops queue exists to make safe. No borrow is ever
/// held across a call into user code: every method takes what it needs
/// from the `RefCell`, drops the borrow, then calls out.
pub struct Scheduler {
    inner: RefCell<SchedulerInner>,
    listeners: RefCell<Vec<Rc<dyn Fn(HandleId, CoroutineState)>>>,
    owner_thread: ThreadId,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: RefCell::new(SchedulerInner {
                registry: Slots::new(),
                roots: Vec::new(),
                pending_start: VecDeque::new(),
                pending_remove: Vec::new(),
                pending_ops: VecDeque::new(),
                traversing: false,
            }),
            listeners: RefCell::new(Vec::new()),
            owner_thread: std::thread::current().id(),
        }
    }

    /// Registers a fan-out callback invoked synchronously after a handle's
    /// state field is updated, for every write the algorithm makes
    /// (including the transient `Waiting -> Running` write within a single
    /// `process` call).
    pub fn on_state_change(&self, listener: impl Fn(HandleId, CoroutineState) + 'static) {
        self.listeners.borrow_mut().push(Rc::new(listener));
    }

    /// Allocates a handle for `source`, enqueues it as pending, and returns
    /// its id immediately. The handle is promoted into the traversal (and
    /// receives its first `advance()`) starting with the next call to
    /// [`Scheduler::tick`] — uniformly, whether `start` was called between
    /// ticks or reentrantly from inside a running coroutine; see
    /// `DESIGN.md` for why "next tick" was chosen over "same tick".
    pub fn start(&self, source: impl StepSource + 'static) -> HandleId {
        self.assert_owner_thread();
        let mut inner = self.inner.borrow_mut();
        let id = inner.registry.insert(CoroutineHandle::new(Box::new(source), None));
        inner.pending_start.push_back(id);
        id
    }

    /// Marks `id` and its entire subtree `Completed`. Synchronous and
    /// immediate on state; storage is freed at the end of the current tick.
    /// A no-op (logged) if `id` is unknown. Deferred to a handle boundary if
    /// called while a tick is traversing, so a reentrant call from inside a
    /// predicate never mutates the registry mid-walk.
    pub fn stop(&self, id: HandleId) {
        self.assert_owner_thread();
        if !self.inner.borrow().registry.has(&id) {
            tracing::warn!(handle = ?id, "stop: no such coroutine handle");
            return;
        }
        if self.inner.borrow().traversing {
            self.inner.borrow_mut().pending_ops.push_back(PendingOp::Stop(id));
        } else {
            self.cascade_complete(id);
        }
    }

    /// Finds the (root or child) handle whose step source is `source` by
    /// identity and stops it. O(n) over the registry.
    pub fn stop_by_source(&self, source: &dyn StepSource) {
        self.assert_owner_thread();
        let needle = source as *const dyn StepSource as *const ();
        let found = {
            let inner = self.inner.borrow();
            inner.registry.ids().into_iter().find(|id| {
                inner
                    .registry
                    .get(id)
                    .and_then(|h| h.source.as_deref())
                    .map(|s| (s as *const dyn StepSource as *const ()) == needle)
                    .unwrap_or(false)
            })
        };
        match found {
            Some(id) => self.stop(id),
            None => tracing::warn!("stop_by_source: no coroutine matches the given source"),
        }
    }

    /// Stops every handle currently known to the scheduler, active or
    /// still pending promotion.
    pub fn stop_all(&self) {
        self.assert_owner_thread();
        let ids: Vec<HandleId> = {
            let inner = self.inner.borrow();
            inner
                .registry
                .ids()
                .into_iter()
                .filter(|id| {
                    inner
                        .registry
                        .get(id)
                        .map(|h| h.parent.is_none() && h.state != CoroutineState::Completed)
                        .unwrap_or(false)
                })
                .collect()
        };
        for id in ids {
            self.stop(id);
        }
    }

    /// If `id` is `Running` or `Waiting`, saves that state and transitions
    /// to `Paused`, cascading to every descendant (each saving its own
    /// prior state). No-op if `id` is unknown, already `Paused`, or
    /// terminal.
    pub fn pause(&self, id: HandleId) {
        self.assert_owner_thread();
        if !self.inner.borrow().registry.has(&id) {
            tracing::warn!(handle = ?id, "pause: no such coroutine handle");
            return;
        }
        if self.inner.borrow().traversing {
            self.inner.borrow_mut().pending_ops.push_back(PendingOp::Pause(id));
        } else {
            self.apply_pause(id);
        }
    }

    /// If `id` is `Paused`, restores its saved state and cascades to
    /// descendants, each restoring its own saved state. No-op otherwise.
    pub fn resume(&self, id: HandleId) {
        self.assert_owner_thread();
        if !self.inner.borrow().registry.has(&id) {
            tracing::warn!(handle = ?id, "resume: no such coroutine handle");
            return;
        }
        if self.inner.borrow().traversing {
            self.inner.borrow_mut().pending_ops.push_back(PendingOp::Resume(id));
        } else {
            self.apply_resume(id);
        }
    }

    /// Count of handles not in `Completed`, active or still pending
    /// promotion.
    pub fn active_count(&self) -> usize {
        let inner = self.inner.borrow();
        inner
            .registry
            .ids()
            .into_iter()
            .filter(|id| {
                inner
                    .registry
                    .get(id)
                    .map(|h| h.state != CoroutineState::Completed)
                    .unwrap_or(false)
            })
            .count()
    }

    /// Advances every active coroutine once.
    pub fn tick(&self, dt: f64) {
        self.assert_owner_thread();
        tracing::debug!(dt, "tick: begin");

        {
            let mut inner = self.inner.borrow_mut();
            while let Some(id) = inner.pending_start.pop_front() {
                let is_root = inner.registry.get(&id).map(|h| h.parent.is_none()).unwrap_or(false);
                if is_root {
                    inner.roots.push(id);
                }
            }
        }

        self.inner.borrow_mut().traversing = true;
        let roots_snapshot = self.inner.borrow().roots.clone();
        for root_id in roots_snapshot {
            self.process(root_id, dt);
            self.drain_pending_ops();
        }
        self.inner.borrow_mut().traversing = false;

        let removals: Vec<HandleId> = self.inner.borrow_mut().pending_remove.drain(..).collect();
        for id in &removals {
            let mut inner = self.inner.borrow_mut();
            let parent_id = inner.registry.get(id).and_then(|h| h.parent);
            if let Some(parent_id) = parent_id {
                if let Some(parent) = inner.registry.get_mut(&parent_id) {
                    parent.children.retain(|c| c != id);
                }
            }
            inner.roots.retain(|r| r != id);
            inner.registry.take(id);
        }
        tracing::debug!(dt, removed = removals.len(), "tick: end");
    }

    fn process(&self, id: HandleId, dt: f64) {
        let state = self.inner.borrow().registry.get(&id).map(|h| h.state);
        match state {
            None | Some(CoroutineState::Completed) | Some(CoroutineState::Paused) => return,
            _ => {}
        }

        let children_snapshot = self
            .inner
            .borrow()
            .registry
            .get(&id)
            .map(|h| h.children.clone())
            .unwrap_or_default();
        for child_id in &children_snapshot {
            self.process(*child_id, dt);
            self.drain_pending_ops();
        }

        // A drain just above may have applied a deferred `stop`/`pause`
        // targeting `id` itself — reentered from a child's `StepSource` or
        // `WaitUntil` predicate via its own `Rc<Scheduler>` clone, aimed at
        // this still-on-the-call-stack ancestor rather than a sibling. Bail
        // out here rather than falling through into the yield/advance
        // phases below with a state this frame's snapshot no longer
        // reflects: re-advancing a handle the drain just completed would
        // violate completion monotonicity, and one it just paused must not
        // advance this tick either.
        let state_after_children = self.inner.borrow().registry.get(&id).map(|h| h.state);
        match state_after_children {
            None | Some(CoroutineState::Completed) | Some(CoroutineState::Paused) => return,
            _ => {}
        }

        // Tracks whether a child transitioned to `Completed` during the
        // recursion just above (as opposed to already being gone from an
        // earlier tick) — needed below to honor the tie-break rule that a
        // `WaitForChild` resolving because of this same call's child
        // completion must not also advance the source this same tick.
        let child_completed_this_call = {
            let mut inner = self.inner.borrow_mut();
            let completed: std::collections::HashSet<HandleId> = children_snapshot
                .iter()
                .copied()
                .filter(|cid| {
                    inner
                        .registry
                        .get(cid)
                        .map(|c| c.state == CoroutineState::Completed)
                        .unwrap_or(true)
                })
                .collect();
            let any = !completed.is_empty();
            if let Some(h) = inner.registry.get_mut(&id) {
                h.children.retain(|cid| !completed.contains(cid));
            }
            any
        };

        let still_has_children = self
            .inner
            .borrow()
            .registry
            .get(&id)
            .map(|h| !h.children.is_empty())
            .unwrap_or(false);
        if still_has_children {
            let is_waiting = self.inner.borrow().registry.get(&id).map(|h| h.state) == Some(CoroutineState::Waiting);
            if !is_waiting {
                self.set_state(id, CoroutineState::Waiting);
            }
            return;
        }

        let taken_yield = self
            .inner
            .borrow_mut()
            .registry
            .get_mut(&id)
            .and_then(|h| h.current_yield.take());
        if let Some(mut yi) = taken_yield {
            let was_wait_for_child = matches!(yi, YieldInstruction::WaitForChild { .. });
            // No borrow of `inner` is held here: `yi.tick` may call a
            // user-supplied `WaitUntil` predicate which, via its own
            // `Rc<Scheduler>` clone, may reentrantly call back into any
            // public method on this scheduler.
            match yi.tick(dt) {
                Ok(false) => {
                    if let Some(h) = self.inner.borrow_mut().registry.get_mut(&id) {
                        h.current_yield = Some(yi);
                    }
                    return;
                }
                Ok(true) => {
                    yi.dispose();
                    self.set_state(id, CoroutineState::Running);
                    if was_wait_for_child && child_completed_this_call {
                        // The child finished during this very call; the
                        // source gets its chance to advance on the next
                        // tick instead of chaining into it here.
                        return;
                    }
                }
                Err(CoroutineError::StepSourceFailure(msg)) => {
                    tracing::error!(handle = ?id, error = %msg, "yield instruction failed");
                    self.cascade_complete(id);
                    return;
                }
                Err(err) => {
                    tracing::error!(handle = ?id, error = %err, "yield instruction error");
                    self.cascade_complete(id);
                    return;
                }
            }
        }

        // Advance, and keep advancing, as long as each freshly-produced
        // yield also resolves against this same `dt`: a `WaitForSeconds`
        // created this tick must start accumulating `dt` immediately, not
        // only from the following tick. The chain stops the moment a yield
        // doesn't resolve, the source terminates, or a child is spawned
        // (which can never resolve before it has had its own first tick).
        while self.advance_once(id, dt).is_continue() {}
    }

    fn advance_once(&self, id: HandleId, dt: f64) -> std::ops::ControlFlow<()> {
        use std::ops::ControlFlow;

        let taken_source = {
            let mut inner = self.inner.borrow_mut();
            match inner.registry.get_mut(&id) {
                Some(h) => {
                    h.is_first_tick = false;
                    h.source.take()
                }
                None => return ControlFlow::Break(()),
            }
        };
        let source = match taken_source {
            Some(s) => s,
            None => return ControlFlow::Break(()),
        };

        // Advance with no borrow of `inner` held, so a panic, or a
        // reentrant call the advance makes through its own scheduler
        // handle, never trips a `RefCell` double-borrow.
        let outcome = catch_unwind(AssertUnwindSafe(move || {
            let mut source = source;
            let yielded = source.advance();
            (source, yielded)
        }));

        match outcome {
            Err(payload) => {
                let msg = panic_message(&payload);
                tracing::error!(handle = ?id, error = %msg, "step source panicked");
                self.cascade_complete(id);
                ControlFlow::Break(())
            }
            Ok((_source, None)) => {
                self.set_state(id, CoroutineState::Completed);
                self.inner.borrow_mut().pending_remove.push(id);
                ControlFlow::Break(())
            }
            Ok((source, Some(Yield::WaitForSeconds(duration)))) => match YieldInstruction::wait_for_seconds(duration) {
                Ok(yi) => {
                    if let Some(h) = self.inner.borrow_mut().registry.get_mut(&id) {
                        h.source = Some(source);
                    }
                    self.tick_fresh_yield(id, yi, dt)
                }
                Err(err) => {
                    tracing::error!(handle = ?id, error = %err, "step source yielded an invalid WaitForSeconds");
                    self.cascade_complete(id);
                    ControlFlow::Break(())
                }
            },
            Ok((source, Some(Yield::WaitUntil(predicate)))) => {
                if let Some(h) = self.inner.borrow_mut().registry.get_mut(&id) {
                    h.source = Some(source);
                }
                let yi = YieldInstruction::WaitUntil {
                    predicate,
                    disposed: false,
                };
                self.tick_fresh_yield(id, yi, dt)
            }
            Ok((source, Some(Yield::Child(child_source)))) => {
                {
                    let mut inner = self.inner.borrow_mut();
                    if let Some(h) = inner.registry.get_mut(&id) {
                        h.source = Some(source);
                    }
                    let child_id = inner.registry.insert(CoroutineHandle::new(child_source, Some(id)));
                    inner.pending_start.push_back(child_id);
                    if let Some(h) = inner.registry.get_mut(&id) {
                        h.children.push(child_id);
                        h.current_yield = Some(YieldInstruction::wait_for_child(child_id));
                    }
                }
                self.set_state(id, CoroutineState::Waiting);
                ControlFlow::Break(())
            }
        }
    }

    /// Ticks a `WaitForSeconds`/`WaitUntil` just produced by this same
    /// `advance_once` call against the current `dt`, immediately. Resolves
    /// the chain-or-stop decision: `Continue` if it already resolved
    /// (caller loops back into another `advance_once`), `Break` (stored as
    /// `current_yield`, `Waiting`) otherwise.
    fn tick_fresh_yield(&self, id: HandleId, mut yi: YieldInstruction, dt: f64) -> std::ops::ControlFlow<()> {
        use std::ops::ControlFlow;
        match yi.tick(dt) {
            Ok(true) => {
                yi.dispose();
                self.set_state(id, CoroutineState::Running);
                ControlFlow::Continue(())
            }
            Ok(false) => {
                if let Some(h) = self.inner.borrow_mut().registry.get_mut(&id) {
                    h.current_yield = Some(yi);
                }
                self.set_state(id, CoroutineState::Waiting);
                ControlFlow::Break(())
            }
            Err(CoroutineError::StepSourceFailure(msg)) => {
                tracing::error!(handle = ?id, error = %msg, "freshly yielded wait-until predicate panicked");
                self.cascade_complete(id);
                ControlFlow::Break(())
            }
            Err(_) => unreachable!("a freshly-built yield instruction is never disposed"),
        }
    }

    fn cascade_complete(&self, id: HandleId) {
        let already_done = self
            .inner
            .borrow()
            .registry
            .get(&id)
            .map(|h| h.state == CoroutineState::Completed)
            .unwrap_or(true);
        if already_done {
            return;
        }

        let children = self.inner.borrow().registry.get(&id).map(|h| h.children.clone()).unwrap_or_default();
        tracing::debug!(handle = ?id, children = children.len(), "cascade: completing subtree");
        for child_id in children {
            self.cascade_complete(child_id);
        }

        {
            let mut inner = self.inner.borrow_mut();
            if let Some(h) = inner.registry.get_mut(&id) {
                h.dispose_current_yield();
                h.children.clear();
                h.disposed = true;
            }
        }
        self.set_state(id, CoroutineState::Completed);
        self.inner.borrow_mut().pending_remove.push(id);
    }

    fn apply_pause(&self, id: HandleId) {
        let state = self.inner.borrow().registry.get(&id).map(|h| h.state);
        let state = match state {
            Some(s) => s,
            None => return,
        };
        if state != CoroutineState::Running && state != CoroutineState::Waiting {
            return;
        }
        if let Some(h) = self.inner.borrow_mut().registry.get_mut(&id) {
            h.pre_pause_state = Some(state);
        }
        self.set_state(id, CoroutineState::Paused);

        let children = self.inner.borrow().registry.get(&id).map(|h| h.children.clone()).unwrap_or_default();
        for child_id in children {
            self.apply_pause(child_id);
        }
    }

    fn apply_resume(&self, id: HandleId) {
        let state = self.inner.borrow().registry.get(&id).map(|h| h.state);
        let state = match state {
            Some(s) => s,
            None => return,
        };
        if state != CoroutineState::Paused {
            return;
        }
        let restored = self
            .inner
            .borrow_mut()
            .registry
            .get_mut(&id)
            .and_then(|h| h.pre_pause_state.take())
            .unwrap_or(CoroutineState::Running);
        self.set_state(id, restored);

        let children = self.inner.borrow().registry.get(&id).map(|h| h.children.clone()).unwrap_or_default();
        for child_id in children {
            self.apply_resume(child_id);
        }
    }

    fn drain_pending_ops(&self) {
        loop {
            let op = self.inner.borrow_mut().pending_ops.pop_front();
            match op {
                Some(PendingOp::Stop(id)) => self.cascade_complete(id),
                Some(PendingOp::Pause(id)) => self.apply_pause(id),
                Some(PendingOp::Resume(id)) => self.apply_resume(id),
                None => break,
            }
        }
    }

    fn set_state(&self, id: HandleId, new_state: CoroutineState) {
        let updated = {
            let mut inner = self.inner.borrow_mut();
            match inner.registry.get_mut(&id) {
                Some(h) => {
                    h.state = new_state;
                    true
                }
                None => false,
            }
        };
        if !updated {
            return;
        }
        // Snapshot the listener list and drop the borrow before invoking
        // any of it: a listener is free to call back into the scheduler.
        let callbacks: Vec<Rc<dyn Fn(HandleId, CoroutineState)>> = self.listeners.borrow().clone();
        for callback in callbacks {
            callback(id, new_state);
        }
    }

    fn assert_owner_thread(&self) {
        let current = std::thread::current().id();
        assert!(
            current == self.owner_thread,
            "Scheduler accessed from a thread other than the one that created it; \
             the scheduler is single-threaded and cooperative"
        );
    }
}
