//! Scoped resource finalization.
//!
//! A [`Scope`] owns a registry of finalizers executed when the scope closes.
//! The registry is a keyed release map:
//!
//! - While `Running`, finalizers are inserted under fresh monotonically
//!   increasing keys.
//! - `close` is a one-way, idempotent transition to `Exited`; it runs every
//!   registered finalizer in strict LIFO (descending key) order,
//!   uninterruptibly, folding finalizer failures into the pending cause via
//!   [`Cause::then`](crate::cause::Cause::then) instead of discarding them.
//! - Once `Exited`, newly added finalizers run immediately against the
//!   stored exit status and receive a sentinel key.
//!
//! Finalizers are unfailable effects (`Effect<(), Infallible>`): convert a
//! fallible cleanup with [`Effect::ignore`] or [`Effect::or_die`] before
//! registering it. Defects and interruptions inside finalizers are still
//! surfaced through the close cause.

use crate::effect::node::{ECause, Node};
use crate::effect::Effect;
use crate::fiber::flags::{FlagsPatch, RuntimeFlag};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::rc::Rc;

/// How the extent guarded by a scope ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// The extent produced a value.
    Succeeded,
    /// The extent failed with an error or defect.
    Failed,
    /// The extent was interrupted.
    Interrupted,
}

/// The key under which a finalizer is registered.
///
/// Keys increase monotonically with registration order; closing runs
/// finalizers in descending key order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FinalizerKey(u64);

impl FinalizerKey {
    /// The key returned when a finalizer is added to an already-exited
    /// scope (the finalizer has run by the time the add resolves).
    pub const SENTINEL: Self = Self(u64::MAX);

    /// Returns true if this is the sentinel key.
    #[must_use]
    pub const fn is_sentinel(self) -> bool {
        self.0 == u64::MAX
    }
}

type Finalizer = Box<dyn FnOnce(ExitStatus) -> Node>;

enum State {
    Running {
        next_key: u64,
        finalizers: BTreeMap<u64, Finalizer>,
    },
    Exited {
        status: ExitStatus,
    },
}

/// A resource-lifetime boundary owning a set of finalizers.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct Scope {
    inner: Rc<RefCell<State>>,
}

impl Scope {
    /// Creates a new open scope.
    #[must_use]
    pub fn make() -> Self {
        Self {
            inner: Rc::new(RefCell::new(State::Running {
                next_key: 0,
                finalizers: BTreeMap::new(),
            })),
        }
    }

    /// Returns true if the scope has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(&*self.inner.borrow(), State::Exited { .. })
    }

    /// Registers a finalizer, returning its key.
    ///
    /// If the scope has already exited, the finalizer runs immediately and
    /// the returned key is [`FinalizerKey::SENTINEL`].
    pub fn add_finalizer(&self, finalizer: Effect<(), Infallible>) -> Effect<FinalizerKey, Infallible> {
        self.add_finalizer_exit(move |_| finalizer)
    }

    /// Registers an exit-aware finalizer.
    pub fn add_finalizer_exit<F>(&self, f: F) -> Effect<FinalizerKey, Infallible>
    where
        F: FnOnce(ExitStatus) -> Effect<(), Infallible> + 'static,
    {
        let inner = self.inner.clone();
        Effect::from_node(Node::suspend(move || {
            let mut state = inner.borrow_mut();
            match &mut *state {
                State::Running {
                    next_key,
                    finalizers,
                } => {
                    let key = *next_key;
                    *next_key += 1;
                    finalizers.insert(key, Box::new(move |status| f(status).into_node()));
                    Node::Succeed(Box::new(FinalizerKey(key)))
                }
                State::Exited { status } => {
                    let status = *status;
                    drop(state);
                    Node::OnSuccess(
                        Box::new(f(status).into_node()),
                        Box::new(|_| Node::Succeed(Box::new(FinalizerKey::SENTINEL))),
                    )
                }
            }
        }))
    }

    /// Hands this scope to `f` without scheduling a close.
    ///
    /// Finalizers registered inside `f` outlive its effect; they run when
    /// whoever owns the scope closes it. This is how a resource constructor
    /// attaches cleanup to a caller-provided scope.
    pub fn extend<A: 'static, E: 'static>(
        &self,
        f: impl FnOnce(Scope) -> Effect<A, E> + 'static,
    ) -> Effect<A, E> {
        let scope = self.clone();
        Effect::suspend(move || f(scope))
    }

    /// Removes and runs a single finalizer ahead of scope close.
    ///
    /// The finalizer observes [`ExitStatus::Succeeded`]. Resolves to true if
    /// a finalizer was found under `key`.
    pub fn release(&self, key: FinalizerKey) -> Effect<bool, Infallible> {
        let inner = self.inner.clone();
        Effect::from_node(Node::suspend(move || {
            let removed = match &mut *inner.borrow_mut() {
                State::Running { finalizers, .. } => finalizers.remove(&key.0),
                State::Exited { .. } => None,
            };
            match removed {
                Some(finalizer) => Node::OnSuccess(
                    Box::new(finalizer(ExitStatus::Succeeded)),
                    Box::new(|_| Node::Succeed(Box::new(true))),
                ),
                None => Node::Succeed(Box::new(false)),
            }
        }))
    }

    /// Closes the scope, running all finalizers in LIFO order.
    ///
    /// One-way and idempotent: a second close does nothing. The whole close
    /// runs uninterruptibly. Finalizer defects are folded together via
    /// `Cause::then` and surfaced in the returned effect's cause.
    pub fn close(&self, status: ExitStatus) -> Effect<(), Infallible> {
        let drain = self.close_collect(status);
        Effect::from_node(Node::UpdateFlags(
            FlagsPatch::disable(RuntimeFlag::Interruption),
            Box::new(Node::OnSuccess(
                Box::new(drain),
                Box::new(|collected| {
                    let cause = *collected
                        .downcast::<ECause>()
                        .unwrap_or_else(|_| Box::new(ECause::Empty));
                    if cause.is_empty() {
                        Node::unit()
                    } else {
                        Node::fail_cause(cause)
                    }
                }),
            )),
        ))
    }

    /// Drains all finalizers (LIFO), producing the folded finalizer cause
    /// as a value. Used by `close` and by the `scoped` combinator, which
    /// must combine the collected cause with the body's own exit.
    pub(crate) fn close_collect(&self, status: ExitStatus) -> Node {
        let inner = self.inner.clone();
        Node::suspend(move || {
            let mut state = inner.borrow_mut();
            match &mut *state {
                State::Running { finalizers, .. } => {
                    let taken = std::mem::take(finalizers);
                    *state = State::Exited { status };
                    drop(state);
                    // Ascending key order in the vec; popping from the end
                    // yields descending keys, i.e. reverse-of-registration.
                    let pending: Vec<Finalizer> = taken.into_values().collect();
                    drain(
                        Rc::new(RefCell::new(DrainState {
                            pending,
                            acc: ECause::Empty,
                        })),
                        status,
                    )
                }
                State::Exited { .. } => Node::Succeed(Box::new(ECause::Empty)),
            }
        })
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::make()
    }
}

impl core::fmt::Debug for Scope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &*self.inner.borrow() {
            State::Running { finalizers, .. } => {
                write!(f, "Scope(running, {} finalizers)", finalizers.len())
            }
            State::Exited { status } => write!(f, "Scope(exited, {status:?})"),
        }
    }
}

struct DrainState {
    pending: Vec<Finalizer>,
    acc: ECause,
}

/// Runs the remaining finalizers one at a time, folding each failure into
/// the accumulated cause. Recursion happens through continuation closures,
/// so the interpreter's trampoline bounds the depth.
fn drain(state: Rc<RefCell<DrainState>>, status: ExitStatus) -> Node {
    let next = state.borrow_mut().pending.pop();
    match next {
        None => {
            let acc = std::mem::replace(&mut state.borrow_mut().acc, ECause::Empty);
            Node::Succeed(Box::new(acc))
        }
        Some(finalizer) => {
            let on_fail_state = state.clone();
            Node::Fold {
                inner: Box::new(finalizer(status)),
                on_failure: Box::new(move |cause| {
                    {
                        let mut s = on_fail_state.borrow_mut();
                        let acc = std::mem::replace(&mut s.acc, ECause::Empty);
                        s.acc = acc.then(cause);
                    }
                    drain(on_fail_state, status)
                }),
                on_success: Box::new(move |_| drain(state, status)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_monotonic_and_sentinel_is_distinct() {
        assert!(FinalizerKey(0) < FinalizerKey(1));
        assert!(FinalizerKey::SENTINEL.is_sentinel());
        assert!(!FinalizerKey(0).is_sentinel());
    }

    #[test]
    fn fresh_scope_is_open() {
        let scope = Scope::make();
        assert!(!scope.is_closed());
        assert!(format!("{scope:?}").contains("running"));
    }
}

