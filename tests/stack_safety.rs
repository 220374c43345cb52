//! The interpreter must trampoline: deep effect chains run in constant
//! native stack, on both the success and the failure path.

mod common;

use common::init_tracing;
use filament::{Effect, Runtime};
use std::convert::Infallible;

#[test]
fn a_million_flat_maps_do_not_overflow() {
    init_tracing();
    let mut effect: Effect<u64, Infallible> = Effect::succeed(0);
    for _ in 0..1_000_000 {
        effect = effect.flat_map(|n| Effect::succeed(n + 1));
    }
    let runtime = Runtime::new();
    assert_eq!(runtime.run(effect).unwrap(), 1_000_000);
}

#[test]
fn a_million_maps_do_not_overflow() {
    init_tracing();
    let mut effect: Effect<u64, Infallible> = Effect::succeed(0);
    for _ in 0..1_000_000 {
        effect = effect.map(|n| n + 1);
    }
    let runtime = Runtime::new();
    assert_eq!(runtime.run(effect).unwrap(), 1_000_000);
}

#[test]
fn failure_unwinds_through_a_deep_continuation_stack() {
    init_tracing();
    let mut effect: Effect<u64, String> = Effect::fail("deep".to_string());
    for _ in 0..200_000 {
        effect = effect.map(|n| n + 1);
    }
    let runtime = Runtime::new();
    let exit = runtime.run(effect);
    assert_eq!(
        exit.cause().and_then(|c| c.failure_option()),
        Some(&"deep".to_string())
    );
}

#[test]
fn deep_recovery_chain_is_stack_safe() {
    init_tracing();
    let mut effect: Effect<u64, String> = Effect::fail("seed".to_string());
    for _ in 0..100_000 {
        effect = effect.catch_all(|e| Effect::fail(e));
    }
    let runtime = Runtime::new();
    let exit = runtime.run(effect);
    assert_eq!(
        exit.cause().and_then(|c| c.failure_option()),
        Some(&"seed".to_string())
    );
}
