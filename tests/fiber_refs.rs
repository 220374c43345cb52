//! Fiber-ref behavior through the running interpreter: scoping, fork
//! inheritance, and join-time merging.

mod common;

use common::init_tracing;
use filament::{Effect, FiberRef, Runtime};
use std::convert::Infallible;

#[test]
fn set_get_and_update_round_trip() {
    init_tracing();
    let runtime = Runtime::new();
    let program = FiberRef::make(1_i64).flat_map(|r| {
        let bump = r.clone();
        let read = r.clone();
        r.set(10)
            .flat_map(move |()| bump.update(|n| n + 5))
            .flat_map(move |()| read.get())
    });
    assert_eq!(runtime.run(program).unwrap(), 15);
}

#[test]
fn unset_refs_read_their_initial_value() {
    init_tracing();
    let runtime = Runtime::new();
    let program = FiberRef::make("fallback".to_string()).flat_map(|r| r.get());
    assert_eq!(runtime.run(program).unwrap(), "fallback");
}

#[test]
fn locally_scopes_a_value_and_restores_it() {
    init_tracing();
    let runtime = Runtime::new();
    let program = FiberRef::make("outer".to_string()).infallible::<String>().flat_map(|r| {
        let inner = r.clone();
        let after = r.clone();
        r.locally("inner".to_string(), inner.get().infallible::<String>())
            .flat_map(move |seen| {
                after
                    .get()
                    .infallible()
                    .map(move |restored| (seen, restored))
            })
    });
    let (seen, restored) = runtime.run(program).unwrap();
    assert_eq!(seen, "inner");
    assert_eq!(restored, "outer");
}

#[test]
fn locally_restores_on_failure() {
    init_tracing();
    let runtime = Runtime::new();
    let program = FiberRef::make(1_u32).infallible::<String>().flat_map(|r| {
        let after = r.clone();
        r.locally(2, Effect::<u32, String>::fail("boom".to_string()))
            .catch_all(move |_| after.get().infallible())
    });
    assert_eq!(runtime.run(program).unwrap(), 1);
}

#[test]
fn forked_children_inherit_the_parent_value() {
    init_tracing();
    let runtime = Runtime::new();
    let program = FiberRef::make(0_i64).flat_map(|r| {
        let reader = r.clone();
        r.set(7).flat_map(move |()| {
            reader
                .get()
                .fork()
                .flat_map(|fiber| fiber.join())
        })
    });
    assert_eq!(runtime.run(program).unwrap(), 7);
}

#[test]
fn awaiting_a_child_does_not_merge_its_refs() {
    init_tracing();
    let runtime = Runtime::new();
    let program = FiberRef::make(0_i64).flat_map(|r| {
        let writer = r.clone();
        let after = r.clone();
        r.set(1).flat_map(move |()| {
            writer.clone().set(99).fork().flat_map(move |fiber| {
                fiber
                    .await_()
                    .flat_map(move |_exit| after.get())
            })
        })
    });
    assert_eq!(runtime.run(program).unwrap(), 1);
}

#[test]
fn joining_a_child_merges_its_refs() {
    init_tracing();
    let runtime = Runtime::new();
    let program = FiberRef::make(0_i64).flat_map(|r| {
        let after = r.clone();
        r.set(1).flat_map({
            let writer = r.clone();
            move |()| {
                writer.set(99).fork().flat_map(move |fiber| {
                    fiber.join().flat_map(move |()| after.get())
                })
            }
        })
    });
    assert_eq!(runtime.run(program).unwrap(), 99);
}

#[test]
fn sibling_mutations_stay_isolated() {
    init_tracing();
    let runtime = Runtime::new();
    let program = FiberRef::make(0_i64).flat_map(|r| {
        let (a, b, after) = (r.clone(), r.clone(), r.clone());
        a.set(10).fork().flat_map(move |left| {
            b.set(20).fork().flat_map(move |right| {
                left.await_().flat_map(move |_| {
                    right
                        .await_()
                        .flat_map(move |_| after.get())
                })
            })
        })
    });
    // Neither child was joined, so neither write merged back.
    assert_eq!(runtime.run(program).unwrap(), 0);
}
