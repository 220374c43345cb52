//! Scope lifecycle: LIFO finalization, early release, late registration,
//! and bracket-style resource handling.

mod common;

use common::{init_tracing, EventLog};
use filament::{Effect, ExitStatus, FinalizerKey, Runtime, Scope};
use std::convert::Infallible;

fn record(log: &EventLog, event: &'static str) -> Effect<(), Infallible> {
    let log = log.clone();
    Effect::succeed_with(move || log.push(event))
}

#[test]
fn finalizers_close_in_lifo_order() {
    init_tracing();
    let log = EventLog::new();
    let (f1, f2, f3) = (record(&log, "f1"), record(&log, "f2"), record(&log, "f3"));
    let program = Effect::<u32, String>::scoped(move |scope| {
        scope
            .add_finalizer(f1)
            .infallible()
            .zip_right(scope.add_finalizer(f2).infallible())
            .zip_right(scope.add_finalizer(f3).infallible())
            .zip_right(Effect::succeed(7))
    });
    let runtime = Runtime::new();
    assert_eq!(runtime.run(program).unwrap(), 7);
    assert_eq!(log.events(), vec!["f3", "f2", "f1"]);
}

#[test]
fn released_finalizers_do_not_run_again_at_close() {
    init_tracing();
    let log = EventLog::new();
    let (f1, f2) = (record(&log, "f1"), record(&log, "f2"));
    let program = Effect::<bool, String>::scoped(move |scope| {
        let early = scope.clone();
        scope
            .add_finalizer(f1)
            .infallible()
            .flat_map(move |key| {
                early
                    .add_finalizer(f2)
                    .infallible()
                    .flat_map(move |_| early.release(key).infallible())
            })
    });
    let runtime = Runtime::new();
    // release found and ran f1 ahead of close; close then ran only f2.
    assert!(runtime.run(program).unwrap());
    assert_eq!(log.events(), vec!["f1", "f2"]);
}

#[test]
fn releasing_an_unknown_key_is_a_no_op() {
    init_tracing();
    let runtime = Runtime::new();
    let program = Effect::<bool, String>::scoped(|scope| {
        scope.release(FinalizerKey::SENTINEL).infallible()
    });
    assert!(!runtime.run(program).unwrap());
}

#[test]
fn adding_to_a_closed_scope_runs_immediately() {
    init_tracing();
    let log = EventLog::new();
    let fin = record(&log, "late");
    let escape: Scope = {
        let runtime = Runtime::new();
        let program = Effect::<Scope, String>::scoped(|scope| Effect::succeed(scope));
        runtime.run(program).unwrap()
    };
    assert!(escape.is_closed());

    let runtime = Runtime::new();
    let key = runtime.run(escape.add_finalizer(fin)).unwrap();
    assert!(key.is_sentinel());
    assert_eq!(log.events(), vec!["late"]);
}

#[test]
fn finalizers_observe_the_exit_status() {
    init_tracing();
    let log = EventLog::new();
    let seen = log.clone();
    let program = Effect::<u32, String>::scoped(move |scope| {
        scope
            .add_finalizer_exit(move |status| {
                let seen = seen.clone();
                Effect::succeed_with(move || seen.push(format!("{status:?}")))
            })
            .infallible()
            .zip_right(Effect::fail("boom".to_string()))
    });
    let runtime = Runtime::new();
    let exit = runtime.run(program);
    assert!(exit.is_failure());
    assert_eq!(log.events(), vec!["Failed"]);
}

#[test]
fn a_failing_finalizer_surfaces_in_the_cause() {
    init_tracing();
    let program = Effect::<u32, String>::scoped(|scope| {
        scope
            .add_finalizer(Effect::succeed(()).flat_map(|()| Effect::die("cleanup bug")))
            .infallible()
            .zip_right(Effect::succeed(1))
    });
    let runtime = Runtime::new();
    let exit = runtime.run(program);
    let cause = exit.cause().expect("close must surface the defect");
    assert!(cause.is_die());
    assert!(cause.defects()[0].message().contains("cleanup bug"));
}

#[test]
fn body_failure_sequences_before_finalizer_failure() {
    init_tracing();
    let program = Effect::<u32, String>::scoped(|scope| {
        scope
            .add_finalizer(Effect::unit().flat_map(|()| Effect::die("secondary")))
            .infallible()
            .zip_right(Effect::fail("primary".to_string()))
    });
    let runtime = Runtime::new();
    let exit = runtime.run(program);
    let cause = exit.cause().expect("must fail");
    assert_eq!(cause.failure_option(), Some(&"primary".to_string()));
    assert!(cause.is_die());
}

#[test]
fn extend_defers_cleanup_to_the_outer_scope() {
    init_tracing();
    let log = EventLog::new();
    let fin = record(&log, "resource closed");
    let probe = log.clone();
    let program = Effect::<u32, String>::scoped(move |scope| {
        scope
            .extend(move |s| s.add_finalizer(fin).infallible::<String>())
            .flat_map(move |_key| {
                Effect::succeed_with(move || {
                    // The extended effect already finished, but its cleanup
                    // waits for the owning scope.
                    assert!(probe.events().is_empty());
                    3
                })
            })
    });
    let runtime = Runtime::new();
    assert_eq!(runtime.run(program).unwrap(), 3);
    assert_eq!(log.events(), vec!["resource closed"]);
}

#[test]
fn acquire_release_pairs_on_success_and_failure() {
    init_tracing();
    let log = EventLog::new();
    let runtime = Runtime::new();

    let rel = log.clone();
    let ok = Effect::<u32, String>::acquire_release(
        Effect::succeed("res"),
        |r| Effect::succeed(r.len() as u32),
        move |_r, status| {
            let rel = rel.clone();
            Effect::succeed_with(move || rel.push(format!("ok:{status:?}")))
        },
    );
    assert_eq!(runtime.run(ok).unwrap(), 3);

    let rel = log.clone();
    let err = Effect::<u32, String>::acquire_release(
        Effect::succeed("res"),
        |_r| Effect::fail("use failed".to_string()),
        move |_r, status| {
            let rel = rel.clone();
            Effect::succeed_with(move || rel.push(format!("err:{status:?}")))
        },
    );
    assert!(runtime.run(err).is_failure());

    assert_eq!(log.events(), vec!["ok:Succeeded", "err:Failed"]);
}

#[test]
fn acquire_release_releases_on_interrupt() {
    init_tracing();
    let log = EventLog::new();
    let rel = log.clone();
    let worker = Effect::<u32, String>::acquire_release(
        Effect::succeed(0u8),
        |_| Effect::never(),
        move |_, status| {
            let rel = rel.clone();
            Effect::succeed_with(move || rel.push(format!("{status:?}")))
        },
    );
    let program = worker.fork().flat_map(|fiber| {
        Effect::yield_now()
            .infallible()
            .flat_map(move |()| fiber.interrupt())
    });
    let runtime = Runtime::new();
    let exit = runtime.run(program).unwrap();
    assert!(exit.is_interrupted());
    assert_eq!(log.events(), vec!["Interrupted"]);
}
