//! The erased effect-description tree.
//!
//! [`Node`] is the closed sum type the interpreter walks. The typed
//! [`Effect`](crate::effect::Effect) surface is a phantom-typed wrapper over
//! it: values travel through the tree as owned `Box<dyn Any>`, typed errors
//! are erased into cheaply clonable [`ErrValue`]s at construction time and
//! recovered by downcast in handlers.
//!
//! Nodes are immutable descriptions. Composition always allocates new nodes;
//! the interpreter consumes each node exactly once.

use crate::cause::Cause;
use crate::fiber::flags::FlagsPatch;
use crate::fiber::runtime::FiberView;
use std::any::Any;
use std::cell::Cell;
use std::rc::Rc;

/// An owned, type-erased success value.
pub(crate) type AnyValue = Box<dyn Any>;

/// An erased typed error, shareable across cause trees.
///
/// Errors enter the erased world once (at `fail` time) and are recovered by
/// downcast. Extraction clones, so the concrete error type must be `Clone`;
/// the `Rc` makes sharing inside `Then`/`Both` trees cheap.
#[derive(Clone)]
pub(crate) struct ErrValue {
    value: Rc<dyn Any>,
}

impl ErrValue {
    pub(crate) fn new<E: Any>(error: E) -> Self {
        Self {
            value: Rc::new(error),
        }
    }

    /// Recovers the typed error by downcast, cloning out of the shared cell.
    pub(crate) fn downcast<E: Any + Clone>(&self) -> Option<E> {
        self.value.downcast_ref::<E>().cloned()
    }
}

impl core::fmt::Debug for ErrValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ErrValue(..)")
    }
}

/// The erased cause type flowing through the interpreter.
pub(crate) type ECause = Cause<ErrValue>;

/// Moves an erased value back into its concrete type.
pub(crate) fn downcast_value<A: 'static>(value: AnyValue) -> Result<A, AnyValue> {
    value.downcast::<A>().map(|boxed| *boxed)
}

/// The erased resume callback handed to an async registration.
///
/// First call wins: the interpreter arms the callback once per suspension
/// and ignores later invocations (a canceled registration may still fire).
#[derive(Clone)]
pub(crate) struct ResumeErased {
    inner: Rc<dyn Fn(Node)>,
    armed: Rc<Cell<bool>>,
}

impl ResumeErased {
    pub(crate) fn new(inner: Rc<dyn Fn(Node)>) -> Self {
        Self {
            inner,
            armed: Rc::new(Cell::new(true)),
        }
    }

    /// Resumes the suspended fiber with `node`. Later calls are ignored.
    pub(crate) fn resume(&self, node: Node) {
        if self.armed.replace(false) {
            (self.inner)(node);
        }
    }

    /// Returns true if no resume has been delivered yet.
    pub(crate) fn is_armed(&self) -> bool {
        self.armed.get()
    }
}

/// An effect-description node.
///
/// The interpreter in [`crate::fiber::runtime`] evaluates this tree with an
/// explicit continuation stack; nothing here recurses natively.
pub(crate) enum Node {
    /// An already-computed value.
    Succeed(AnyValue),
    /// A synchronous step. Panics inside the thunk become defects.
    SucceedWith(Box<dyn FnOnce() -> AnyValue>),
    /// A failure, built lazily so causes can capture fresh context.
    Fail(Box<dyn FnOnce() -> ECause>),
    /// An asynchronous boundary. The registration receives a resume
    /// callback and may return an optional canceler effect, run if the
    /// fiber is interrupted while suspended here.
    Async(Box<dyn FnOnce(ResumeErased) -> Option<Node>>),
    /// Sequencing: run `inner`, feed its value to the continuation.
    OnSuccess(Box<Node>, Box<dyn FnOnce(AnyValue) -> Node>),
    /// Error handling: run `inner`, feed its cause to the handler.
    OnFailure(Box<Node>, Box<dyn FnOnce(ECause) -> Node>),
    /// Both-sided fold over `inner`'s exit.
    Fold {
        /// The effect being folded over.
        inner: Box<Node>,
        /// Continuation for the failure side.
        on_failure: Box<dyn FnOnce(ECause) -> Node>,
        /// Continuation for the success side.
        on_success: Box<dyn FnOnce(AnyValue) -> Node>,
    },
    /// Applies a flags patch for the dynamic extent of `inner`.
    UpdateFlags(FlagsPatch, Box<Node>),
    /// An explicit cooperative yield point.
    Yield,
    /// A step with access to the executing fiber's state (fork, fiber refs,
    /// scope wiring, identity).
    Stateful(Box<dyn FnOnce(&mut FiberView<'_>) -> Node>),
}

impl Node {
    /// A node succeeding with the unit value.
    pub(crate) fn unit() -> Self {
        Self::Succeed(Box::new(()))
    }

    /// A node failing with an eagerly-known cause.
    pub(crate) fn fail_cause(cause: ECause) -> Self {
        Self::Fail(Box::new(move || cause))
    }

    /// Lazily builds a node; evaluation order is controlled by the
    /// interpreter, not by Rust expression evaluation.
    pub(crate) fn suspend(f: impl FnOnce() -> Node + 'static) -> Self {
        Self::OnSuccess(Box::new(Self::unit()), Box::new(move |_| f()))
    }
}

impl core::fmt::Debug for Node {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Succeed(_) => "Succeed",
            Self::SucceedWith(_) => "SucceedWith",
            Self::Fail(_) => "Fail",
            Self::Async(_) => "Async",
            Self::OnSuccess(..) => "OnSuccess",
            Self::OnFailure(..) => "OnFailure",
            Self::Fold { .. } => "Fold",
            Self::UpdateFlags(..) => "UpdateFlags",
            Self::Yield => "Yield",
            Self::Stateful(_) => "Stateful",
        };
        write!(f, "Node::{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn err_value_round_trip() {
        let e = ErrValue::new("boom".to_string());
        assert_eq!(e.downcast::<String>(), Some("boom".to_string()));
        assert!(e.downcast::<u32>().is_none());
    }

    #[test]
    fn err_value_clone_shares_payload() {
        let e = ErrValue::new(7_u32);
        let e2 = e.clone();
        assert_eq!(e2.downcast::<u32>(), Some(7));
        assert_eq!(e.downcast::<u32>(), Some(7));
    }

    #[test]
    fn downcast_value_returns_original_on_mismatch() {
        let v: AnyValue = Box::new(5_i64);
        let back = downcast_value::<String>(v).unwrap_err();
        assert_eq!(downcast_value::<i64>(back).unwrap(), 5);
    }

    #[test]
    fn resume_first_call_wins() {
        let count = Rc::new(Cell::new(0_u32));
        let seen = count.clone();
        let resume = ResumeErased::new(Rc::new(move |_node| {
            seen.set(seen.get() + 1);
        }));
        assert!(resume.is_armed());
        resume.resume(Node::unit());
        resume.resume(Node::unit());
        assert_eq!(count.get(), 1);
        assert!(!resume.is_armed());
    }
}
