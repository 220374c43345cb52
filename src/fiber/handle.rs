//! Typed handles to running fibers.
//!
//! A [`Fiber`] is the caller's view of a forked computation. Result-bearing
//! operations (`await_`, `join`, `interrupt`) consume the handle: the
//! success payload is owned and handed over exactly once. [`Fiber::poll`] is
//! the non-consuming peek and therefore needs `A: Clone`.

use crate::cause::Cause;
use crate::effect::node::Node;
use crate::effect::{typed_cause, typed_exit, Effect};
use crate::error::RuntimeError;
use crate::fiber::id::FiberId;
use crate::fiber::runtime::FiberCell;
use crate::Exit;
use std::any::Any;
use std::convert::Infallible;
use std::marker::PhantomData;
use std::rc::Rc;

/// Suspends the current fiber until `cell`'s fiber completes.
pub(crate) fn await_node(cell: Rc<FiberCell>) -> Node {
    Node::Async(Box::new(move |resume| {
        cell.subscribe(Box::new(move || resume.resume(Node::unit())));
        None
    }))
}

/// Replays a completed fiber's exit into the current fiber: failure causes
/// rethrow as-is, the success payload transfers ownership. Must only run
/// once the fiber is done.
pub(crate) fn exit_node(cell: &Rc<FiberCell>) -> Node {
    match cell.exit_cause() {
        Some(Some(cause)) => Node::fail_cause(cause),
        Some(None) => match cell.take_value() {
            Some(value) => Node::Succeed(value),
            None => Node::fail_cause(Cause::Die(
                RuntimeError::ResultConsumed { fiber: cell.id() }.into_defect(),
            )),
        },
        None => Node::fail_cause(Cause::Die(
            RuntimeError::ResultConsumed { fiber: cell.id() }.into_defect(),
        )),
    }
}

/// A handle to a fiber running an `Effect<A, E>`.
pub struct Fiber<A, E> {
    cell: Rc<FiberCell>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A: 'static, E: 'static> Fiber<A, E> {
    pub(crate) fn from_cell(cell: Rc<FiberCell>) -> Self {
        Self {
            cell,
            _marker: PhantomData,
        }
    }

    /// The fiber's identity.
    #[must_use]
    pub fn id(&self) -> FiberId {
        self.cell.id()
    }

    /// Requests interruption without waiting for the fiber to wind down.
    pub fn interrupt_fork(&self) -> Effect<(), Infallible> {
        let cell = self.cell.clone();
        Effect::from_node(Node::Stateful(Box::new(move |view| {
            view.interrupt_cell(&cell);
            Node::unit()
        })))
    }

    /// A snapshot of the ids of the fiber's live children, taken when the
    /// effect runs. Empty once the fiber has completed.
    pub fn children(&self) -> Effect<Vec<FiberId>, Infallible> {
        let cell = self.cell.clone();
        Effect::from_node(Node::suspend(move || {
            Node::Succeed(Box::new(cell.child_ids()))
        }))
    }
}

impl<A: 'static, E: Any + Clone + 'static> Fiber<A, E> {
    /// Suspends until the fiber completes, producing its full exit. Never
    /// fails itself; the fiber's failure lands inside the [`Exit`].
    pub fn await_(self) -> Effect<Exit<A, E>, Infallible> {
        let cell = self.cell;
        let reader = cell.clone();
        Effect::from_node(Node::OnSuccess(
            Box::new(await_node(cell)),
            Box::new(move |_| match reader.exit_cause() {
                Some(cause) => {
                    if cause.is_none() && !reader.with_value(|v| v.is_some()) {
                        return Node::fail_cause(Cause::Die(
                            RuntimeError::ResultConsumed { fiber: reader.id() }.into_defect(),
                        ));
                    }
                    let exit: Exit<A, E> = typed_exit(reader.take_value(), cause);
                    Node::Succeed(Box::new(exit))
                }
                None => Node::fail_cause(Cause::Die(
                    RuntimeError::ResultConsumed { fiber: reader.id() }.into_defect(),
                )),
            }),
        ))
    }

    /// Suspends until the fiber completes, then adopts its outcome: success
    /// flows through, failure (including interruption) rethrows, and the
    /// fiber's ref-store mutations merge into the joiner via each ref's
    /// patch algebra.
    pub fn join(self) -> Effect<A, E> {
        let cell = self.cell;
        let joined = cell.clone();
        Effect::from_node(Node::OnSuccess(
            Box::new(await_node(cell)),
            Box::new(move |_| {
                Node::Stateful(Box::new(move |view| {
                    if let Some(refs) = joined.take_final_refs() {
                        if let Err(error) = view.merge_refs(refs) {
                            return Node::fail_cause(Cause::Die(error.into_defect()));
                        }
                    }
                    exit_node(&joined)
                }))
            }),
        ))
    }

    /// Interrupts the fiber and waits for it to wind down completely,
    /// producing its final exit.
    pub fn interrupt(self) -> Effect<Exit<A, E>, Infallible> {
        let target = self.cell.clone();
        let awaited = self.await_();
        Effect::from_node(Node::OnSuccess(
            Box::new(Node::Stateful(Box::new(move |view| {
                view.interrupt_cell(&target);
                Node::unit()
            }))),
            Box::new(move |_| awaited.into_node()),
        ))
    }

    /// Like [`Fiber::interrupt`], but the interruption is attributed to
    /// `by` instead of the calling fiber.
    pub fn interrupt_as(self, by: FiberId) -> Effect<Exit<A, E>, Infallible> {
        let target = self.cell.clone();
        let awaited = self.await_();
        Effect::from_node(Node::OnSuccess(
            Box::new(Node::suspend(move || {
                crate::fiber::runtime::interrupt_cell(&target, by);
                Node::unit()
            })),
            Box::new(move |_| awaited.into_node()),
        ))
    }
}

impl<A: Clone + 'static, E: Any + Clone + 'static> Fiber<A, E> {
    /// Checks for completion without suspending or consuming the handle.
    pub fn poll(&self) -> Effect<Option<Exit<A, E>>, Infallible> {
        let cell = self.cell.clone();
        Effect::from_node(Node::suspend(move || match cell.exit_cause() {
            None => Node::Succeed(Box::new(None::<Exit<A, E>>)),
            Some(Some(cause)) => {
                Node::Succeed(Box::new(Some(Exit::<A, E>::Failure(typed_cause(cause)))))
            }
            Some(None) => cell.with_value(|value| {
                match value.and_then(|v| v.downcast_ref::<A>()).cloned() {
                    Some(a) => Node::Succeed(Box::new(Some(Exit::<A, E>::Success(a)))),
                    None => Node::fail_cause(Cause::Die(
                        RuntimeError::ResultConsumed { fiber: cell.id() }.into_defect(),
                    )),
                }
            }),
        }))
    }
}

impl<A, E> core::fmt::Debug for Fiber<A, E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Fiber({})", self.cell.id())
    }
}
