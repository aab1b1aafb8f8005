//! End-to-end scenarios exercising the scheduler through its public API
//! only, covering single waits, predicate gates, nested composition, pause
//! and stop cascades, and sibling parallelism.

use std::cell::RefCell;
use std::rc::Rc;

use ewe_coroutine::{Scheduler, Steps, Yield};

#[test]
fn single_wait_for_seconds_completes_once_its_duration_elapses() {
    let scheduler = Scheduler::new();
    scheduler.start(Steps::new(vec![Yield::wait_for_seconds(1.0)]));

    scheduler.tick(0.5);
    assert_eq!(scheduler.active_count(), 1);

    scheduler.tick(0.6);
    assert_eq!(scheduler.active_count(), 0);
}

#[test]
fn predicate_gate_holds_until_the_flag_flips() {
    let flag = Rc::new(RefCell::new(false));
    let flag_clone = flag.clone();
    let scheduler = Scheduler::new();
    scheduler.start(Steps::new(vec![Yield::wait_until(move || *flag_clone.borrow())]));

    scheduler.tick(0.1);
    assert_eq!(scheduler.active_count(), 1);

    *flag.borrow_mut() = true;
    scheduler.tick(0.1);
    assert_eq!(scheduler.active_count(), 0);
}

#[test]
fn nested_child_resolves_before_the_parent_advances_past_it() {
    let outer = Steps::new(vec![
        Yield::wait_for_seconds(1.0),
        Yield::child(Steps::new(vec![Yield::wait_for_seconds(1.0)])),
        Yield::wait_for_seconds(1.0),
    ]);
    let scheduler = Scheduler::new();
    scheduler.start(outer);

    scheduler.tick(1.1);
    assert_eq!(scheduler.active_count(), 2, "parent waiting on its just-spawned child");

    scheduler.tick(1.1);
    assert_eq!(scheduler.active_count(), 1, "child has completed and been pruned");

    scheduler.tick(1.1);
    assert_eq!(scheduler.active_count(), 0, "parent's final wait has elapsed");
}

#[test]
fn pausing_the_parent_freezes_its_elapsed_wait_and_its_future_child() {
    let outer = Steps::new(vec![
        Yield::wait_for_seconds(1.0),
        Yield::child(Steps::new(vec![Yield::wait_for_seconds(1.0)])),
        Yield::wait_for_seconds(1.0),
    ]);
    let scheduler = Scheduler::new();
    let handle = scheduler.start(outer);

    scheduler.tick(0.5);
    assert_eq!(scheduler.active_count(), 1);

    scheduler.pause(handle);
    scheduler.tick(1.0);
    assert_eq!(scheduler.active_count(), 1, "a paused subtree does not advance at all");

    scheduler.resume(handle);
    // Only 0.6 more seconds were actually needed to cross the first wait's
    // 1.0s threshold: the paused tick(1.0) contributed nothing.
    scheduler.tick(0.6);
    assert_eq!(scheduler.active_count(), 2, "the first wait resolved and spawned the child");

    scheduler.tick(1.1);
    assert_eq!(scheduler.active_count(), 1);

    scheduler.tick(1.1);
    assert_eq!(scheduler.active_count(), 0);
}

#[test]
fn stopping_the_parent_completes_its_active_child_too() {
    let outer = Steps::new(vec![Yield::child(Steps::new(vec![Yield::wait_for_seconds(1.0)]))]);
    let scheduler = Scheduler::new();
    let handle = scheduler.start(outer);

    scheduler.tick(0.5);
    assert_eq!(scheduler.active_count(), 2, "parent waiting on one active child");

    scheduler.stop(handle);
    // stop() outside of a tick's traversal applies synchronously.
    assert_eq!(scheduler.active_count(), 0);

    scheduler.tick(0.1);
    assert_eq!(scheduler.active_count(), 0);
}

#[test]
fn sibling_coroutines_stop_all_together() {
    let scheduler = Scheduler::new();
    for _ in 0..3 {
        scheduler.start(Steps::new(vec![Yield::wait_for_seconds(1.0)]));
    }

    scheduler.tick(0.1);
    assert_eq!(scheduler.active_count(), 3);

    scheduler.stop_all();
    scheduler.tick(0.1);
    assert_eq!(scheduler.active_count(), 0);
}
