//! End-to-end semantics of the core effect combinators.

mod common;

use common::{init_tracing, EventLog};
use filament::{Cause, Effect, Runtime};
use std::convert::Infallible;

#[test]
fn map_and_flat_map_compose() {
    init_tracing();
    let runtime = Runtime::new();
    let effect = Effect::<_, Infallible>::succeed(1)
        .map(|n| n + 1)
        .flat_map(|n| Effect::succeed(n * 2));
    assert_eq!(runtime.run(effect).unwrap(), 4);
}

#[test]
fn succeed_with_defers_work_until_run() {
    init_tracing();
    let log = EventLog::new();
    let seen = log.clone();
    let effect = Effect::<_, Infallible>::succeed_with(move || {
        seen.push("ran");
        10
    });
    assert!(log.events().is_empty());

    let runtime = Runtime::new();
    assert_eq!(runtime.run(effect).unwrap(), 10);
    assert_eq!(log.events(), vec!["ran"]);
}

#[test]
fn typed_failure_reaches_the_exit() {
    init_tracing();
    let runtime = Runtime::new();
    let exit = runtime.run(Effect::<u32, String>::fail("boom".to_string()));
    let cause = exit.cause().expect("must fail");
    assert_eq!(cause.failure_option(), Some(&"boom".to_string()));
}

#[test]
fn catch_all_recovers_typed_failures() {
    init_tracing();
    let runtime = Runtime::new();
    let effect = Effect::<u32, String>::fail("boom".to_string())
        .catch_all(|e| Effect::succeed(e.len() as u32));
    assert_eq!(runtime.run(effect).unwrap(), 4);
}

#[test]
fn catch_all_does_not_see_defects() {
    init_tracing();
    let runtime = Runtime::new();
    let effect =
        Effect::<u32, String>::die("bug").catch_all(|_| Effect::succeed(0));
    let exit = runtime.run(effect);
    let cause = exit.cause().expect("defect must pass through");
    assert!(cause.is_die());
    assert!(cause.failure_option().is_none());
}

#[test]
fn fold_collapses_both_sides() {
    init_tracing();
    let runtime = Runtime::new();
    let ok = Effect::<u32, String>::succeed(3).fold(|_| "err", |_| "ok");
    assert_eq!(runtime.run(ok).unwrap(), "ok");

    let err = Effect::<u32, String>::fail("e".to_string()).fold(|_| "err", |_| "ok");
    assert_eq!(runtime.run(err).unwrap(), "err");
}

#[test]
fn map_error_transforms_the_channel() {
    init_tracing();
    let runtime = Runtime::new();
    let effect = Effect::<u32, String>::fail("four".to_string()).map_error(|e| e.len());
    let exit = runtime.run(effect);
    assert_eq!(exit.cause().and_then(Cause::failure_option), Some(&4));
}

#[test]
fn or_die_promotes_failures_to_defects() {
    init_tracing();
    let runtime = Runtime::new();
    let effect = Effect::<u32, String>::fail("boom".to_string()).or_die();
    let exit = runtime.run(effect);
    let cause = exit.cause().expect("must die");
    assert!(cause.is_die());
    assert!(cause.defects()[0].message().contains("boom"));
}

#[test]
fn exit_materializes_failures_as_values() {
    init_tracing();
    let runtime = Runtime::new();
    let effect = Effect::<u32, String>::fail("boom".to_string()).exit();
    let exit = runtime.run(effect).unwrap();
    assert!(exit.is_failure());
    assert_eq!(exit.into_result(), Err(Some("boom".to_string())));
}

#[test]
fn ignore_discards_failures_but_not_defects() {
    init_tracing();
    let runtime = Runtime::new();
    let ignored = Effect::<u32, String>::fail("e".to_string()).ignore();
    assert!(runtime.run(ignored).is_success());

    let defect = Effect::<u32, String>::die("bug").ignore();
    assert!(runtime.run(defect).is_failure());
}

#[test]
fn from_result_round_trips() {
    init_tracing();
    let runtime = Runtime::new();
    assert_eq!(
        runtime.run(Effect::<u32, String>::from_result(Ok(5))).unwrap(),
        5
    );
    let exit = runtime.run(Effect::<u32, String>::from_result(Err("e".to_string())));
    assert!(exit.is_failure());
}

#[test]
fn panics_in_thunks_become_defects() {
    init_tracing();
    let runtime = Runtime::new();
    let exit = runtime.run(Effect::<u32, Infallible>::succeed_with(|| {
        panic!("kaboom");
    }));
    let cause = exit.cause().expect("panic must not succeed");
    assert!(cause.is_die());
    assert!(cause.defects()[0].message().contains("kaboom"));
}

#[test]
fn sequential_failures_compose_with_then() {
    init_tracing();
    let log = EventLog::new();
    let fin = log.clone();
    let runtime = Runtime::new();
    let effect = Effect::<u32, String>::fail("primary".to_string()).ensuring(
        Effect::succeed_with(move || {
            fin.push("finalizer");
        })
        .flat_map(|()| Effect::die("cleanup bug")),
    );
    let exit = runtime.run(effect);
    let cause = exit.cause().expect("must fail");
    // Primary failure first, finalizer defect sequenced after it.
    assert_eq!(cause.failure_option(), Some(&"primary".to_string()));
    assert!(cause.is_die());
    assert_eq!(log.events(), vec!["finalizer"]);
}

#[test]
fn async_resume_delivers_a_value() {
    init_tracing();
    let runtime = Runtime::new();
    let effect = Effect::<u32, String>::async_(|resume| {
        resume.succeed(42);
        None
    });
    assert_eq!(runtime.run(effect).unwrap(), 42);
}

#[test]
fn async_only_first_resume_counts() {
    init_tracing();
    let runtime = Runtime::new();
    let effect = Effect::<u32, String>::async_(|resume| {
        resume.succeed(1);
        resume.succeed(2);
        resume.fail("late".to_string());
        None
    });
    assert_eq!(runtime.run(effect).unwrap(), 1);
}

#[test]
fn suspend_defers_effect_construction() {
    init_tracing();
    let log = EventLog::new();
    let seen = log.clone();
    let effect = Effect::<u32, Infallible>::suspend(move || {
        seen.push("built");
        Effect::succeed(1)
    });
    assert!(log.events().is_empty());
    let runtime = Runtime::new();
    assert_eq!(runtime.run(effect).unwrap(), 1);
    assert_eq!(log.events(), vec!["built"]);
}

#[test]
fn fiber_id_is_observable_from_inside() {
    init_tracing();
    let runtime = Runtime::new();
    let id = runtime.run(Effect::fiber_id()).unwrap();
    assert!(!id.is_none());
    assert_eq!(id.sequence(), 1);
}
