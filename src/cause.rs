//! Structured failure algebra.
//!
//! A [`Cause`] is a tree describing everything that went wrong during the
//! execution of an effect. It distinguishes three failure classes:
//!
//! - `Fail(E)`: a typed, expected, recoverable error
//! - `Die(Defect)`: an unexpected, unchecked failure (panic, runtime bug)
//! - `Interrupt(FiberId)`: cooperative cancellation, attributed to the
//!   interrupting fiber
//!
//! Causes compose sequentially ([`Cause::then`], order is causal) and in
//! parallel ([`Cause::both`], order is not causally meaningful). `Empty` is
//! the identity for both compositions. Causes are pure immutable trees;
//! every operation here is side-effect free.

use crate::fiber::id::FiberId;
use core::fmt;
use std::any::Any;
use std::rc::Rc;

/// An unexpected, unchecked failure carried as an opaque payload.
///
/// Defects arise from panics inside effect thunks, from runtime invariant
/// violations, and from `die` in user code. The payload is kept for
/// cause-aware inspection; the message is a best-effort rendering used for
/// reporting and equality.
#[derive(Clone)]
pub struct Defect {
    payload: Rc<dyn Any>,
    message: String,
}

impl Defect {
    /// Creates a defect from an arbitrary payload.
    #[must_use]
    pub fn new<T: Any + fmt::Debug>(payload: T) -> Self {
        let message = format!("{payload:?}");
        Self {
            payload: Rc::new(payload),
            message,
        }
    }

    /// Creates a defect with an explicit message and payload.
    #[must_use]
    pub fn with_message(message: impl Into<String>, payload: Rc<dyn Any>) -> Self {
        Self {
            payload,
            message: message.into(),
        }
    }

    /// Creates a defect from a caught panic payload.
    ///
    /// Extracts the conventional `&str`/`String` panic message when present.
    #[must_use]
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        Self {
            payload: Rc::new(payload),
            message: format!("panic: {message}"),
        }
    }

    /// Returns the rendered message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Attempts to view the payload as a concrete type.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

impl fmt::Debug for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Defect({})", self.message)
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl PartialEq for Defect {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.payload, &other.payload) || self.message == other.message
    }
}

impl Eq for Defect {}

/// A structured failure value.
///
/// See the module docs for the composition rules. Constructed via the
/// associated functions; `then`/`both` are smart constructors that collapse
/// `Empty` operands so the identity laws hold structurally.
#[derive(Clone, PartialEq, Eq)]
pub enum Cause<E> {
    /// No failure. Identity for `then` and `both`.
    Empty,
    /// A typed, expected error.
    Fail(E),
    /// An unexpected defect.
    Die(Defect),
    /// Cooperative interruption, attributed to the interrupting fiber.
    Interrupt(FiberId),
    /// Sequential composition: `left` happened, then `right`.
    Then(Branch<E>, Branch<E>),
    /// Parallel composition: both branches failed concurrently.
    Both(Branch<E>, Branch<E>),
}

/// An owned subtree of a composite cause.
///
/// Tears its subtree down iteratively on drop, so arbitrarily deep
/// `Then`/`Both` chains cannot overflow the host stack in drop glue.
pub struct Branch<E>(Box<Cause<E>>);

impl<E> Branch<E> {
    fn new(cause: Cause<E>) -> Self {
        Self(Box::new(cause))
    }

    /// Takes the subtree out of the branch.
    #[must_use]
    pub fn into_cause(mut self) -> Cause<E> {
        std::mem::replace(&mut *self.0, Cause::Empty)
    }
}

impl<E> std::ops::Deref for Branch<E> {
    type Target = Cause<E>;

    fn deref(&self) -> &Cause<E> {
        &self.0
    }
}

impl<E> Drop for Branch<E> {
    fn drop(&mut self) {
        if !matches!(&*self.0, Cause::Then(..) | Cause::Both(..)) {
            return;
        }
        let mut stack = vec![std::mem::replace(&mut *self.0, Cause::Empty)];
        while let Some(node) = stack.pop() {
            if let Cause::Then(mut l, mut r) | Cause::Both(mut l, mut r) = node {
                stack.push(std::mem::replace(&mut *l.0, Cause::Empty));
                stack.push(std::mem::replace(&mut *r.0, Cause::Empty));
            }
        }
    }
}

impl<E: Clone> Clone for Branch<E> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<E: PartialEq> PartialEq for Branch<E> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<E: Eq> Eq for Branch<E> {}

impl<E: fmt::Debug> fmt::Debug for Branch<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl<E: fmt::Display> fmt::Display for Branch<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The single failure a cause collapses to at a host boundary.
///
/// Produced by [`Cause::squash`]; the tie-break prefers the leftmost typed
/// failure, then the leftmost defect, then an interruption marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Squashed<E> {
    /// The leftmost typed failure.
    Error(E),
    /// The leftmost defect (no typed failure present).
    Defect(Defect),
    /// Interruption only (or an empty cause).
    Interrupt(FiberId),
}

impl<E> Cause<E> {
    /// The empty cause.
    #[must_use]
    pub const fn empty() -> Self {
        Self::Empty
    }

    /// A typed failure.
    #[must_use]
    pub const fn fail(error: E) -> Self {
        Self::Fail(error)
    }

    /// A defect.
    #[must_use]
    pub const fn die(defect: Defect) -> Self {
        Self::Die(defect)
    }

    /// An interruption attributed to `fiber`.
    #[must_use]
    pub const fn interrupt(fiber: FiberId) -> Self {
        Self::Interrupt(fiber)
    }

    /// Sequential composition. `Empty` operands collapse.
    #[must_use]
    pub fn then(self, right: Self) -> Self {
        match (self, right) {
            (Self::Empty, r) => r,
            (l, Self::Empty) => l,
            (l, r) => Self::Then(Branch::new(l), Branch::new(r)),
        }
    }

    /// Parallel composition. `Empty` operands collapse.
    #[must_use]
    pub fn both(self, right: Self) -> Self {
        match (self, right) {
            (Self::Empty, r) => r,
            (l, Self::Empty) => l,
            (l, r) => Self::Both(Branch::new(l), Branch::new(r)),
        }
    }

    /// Returns true if the cause is structurally empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Fail(_) | Self::Die(_) | Self::Interrupt(_) => false,
            Self::Then(l, r) | Self::Both(l, r) => l.is_empty() && r.is_empty(),
        }
    }

    /// Returns all typed failures, leftmost first.
    #[must_use]
    pub fn failures(&self) -> Vec<&E> {
        let mut out = Vec::new();
        self.visit(&mut |leaf| {
            if let Self::Fail(e) = leaf {
                out.push(e);
            }
        });
        out
    }

    /// Returns all defects, leftmost first.
    #[must_use]
    pub fn defects(&self) -> Vec<&Defect> {
        let mut out = Vec::new();
        self.visit(&mut |leaf| {
            if let Self::Die(d) = leaf {
                out.push(d);
            }
        });
        out
    }

    /// Returns the ids of all interrupting fibers, leftmost first.
    #[must_use]
    pub fn interruptors(&self) -> Vec<FiberId> {
        let mut out = Vec::new();
        self.visit(&mut |leaf| {
            if let Self::Interrupt(id) = leaf {
                out.push(*id);
            }
        });
        out
    }

    /// Returns the leftmost typed failure, if any.
    #[must_use]
    pub fn failure_option(&self) -> Option<&E> {
        let mut found = None;
        self.visit(&mut |leaf| {
            if found.is_none() {
                if let Self::Fail(e) = leaf {
                    found = Some(e);
                }
            }
        });
        found
    }

    /// Returns true if the cause contains at least one interruption.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        !self.interruptors().is_empty()
    }

    /// Returns true if the cause contains interruptions and nothing else.
    ///
    /// An empty cause is not "interrupted only".
    #[must_use]
    pub fn is_interrupted_only(&self) -> bool {
        let mut saw_interrupt = false;
        let mut saw_other = false;
        self.visit(&mut |leaf| match leaf {
            Self::Interrupt(_) => saw_interrupt = true,
            Self::Fail(_) | Self::Die(_) => saw_other = true,
            Self::Empty | Self::Then(..) | Self::Both(..) => {}
        });
        saw_interrupt && !saw_other
    }

    /// Returns true if the cause contains at least one defect.
    #[must_use]
    pub fn is_die(&self) -> bool {
        !self.defects().is_empty()
    }

    /// Replaces every typed failure with `Empty`, preserving defects and
    /// interruptions and the structure around them.
    #[must_use]
    pub fn strip_failures(self) -> Self {
        self.transform_leaves(&mut |leaf| match leaf {
            Self::Fail(_) => Self::Empty,
            other => other,
        })
    }

    /// Maps the typed failure values.
    #[must_use]
    pub fn map<F, M: FnMut(E) -> F>(self, mut f: M) -> Cause<F> {
        self.transform_leaves(&mut |leaf| match leaf {
            Self::Fail(e) => Cause::Fail(f(e)),
            Self::Empty => Cause::Empty,
            Self::Die(d) => Cause::Die(d),
            Self::Interrupt(id) => Cause::Interrupt(id),
            // Composites are deconstructed before leaves reach the closure.
            Self::Then(..) | Self::Both(..) => Cause::Empty,
        })
    }

    /// Rebuilds the cause bottom-up with `f` applied to every leaf.
    /// Iterative: the worklist carries its own stack, like `visit`.
    fn transform_leaves<F>(self, f: &mut impl FnMut(Self) -> Cause<F>) -> Cause<F> {
        enum Item<E> {
            Node(Cause<E>),
            Then,
            Both,
        }
        let mut input = vec![Item::Node(self)];
        let mut output: Vec<Cause<F>> = Vec::new();
        while let Some(item) = input.pop() {
            match item {
                Item::Node(Cause::Then(l, r)) => {
                    input.push(Item::Then);
                    input.push(Item::Node(r.into_cause()));
                    input.push(Item::Node(l.into_cause()));
                }
                Item::Node(Cause::Both(l, r)) => {
                    input.push(Item::Both);
                    input.push(Item::Node(r.into_cause()));
                    input.push(Item::Node(l.into_cause()));
                }
                Item::Node(leaf) => output.push(f(leaf)),
                Item::Then => {
                    let right = output.pop().unwrap_or(Cause::Empty);
                    let left = output.pop().unwrap_or(Cause::Empty);
                    output.push(left.then(right));
                }
                Item::Both => {
                    let right = output.pop().unwrap_or(Cause::Empty);
                    let left = output.pop().unwrap_or(Cause::Empty);
                    output.push(left.both(right));
                }
            }
        }
        output.pop().unwrap_or(Cause::Empty)
    }

    /// Collapses the cause to a single failure for host-boundary reporting.
    ///
    /// Tie-break: the leftmost `Fail` wins; otherwise the leftmost `Die`;
    /// otherwise an interrupt marker (using the leftmost interruptor, or
    /// [`FiberId::NONE`] for an empty cause).
    #[must_use]
    pub fn squash(&self) -> Squashed<E>
    where
        E: Clone,
    {
        if let Some(e) = self.failure_option() {
            return Squashed::Error(e.clone());
        }
        if let Some(d) = self.defects().first() {
            return Squashed::Defect((*d).clone());
        }
        let interruptor = self.interruptors().first().copied().unwrap_or(FiberId::NONE);
        Squashed::Interrupt(interruptor)
    }

    /// Visits every leaf, leftmost first. Iterative: the traversal carries
    /// its own stack so arbitrarily deep causes cannot overflow the host
    /// call stack.
    fn visit<'a>(&'a self, f: &mut impl FnMut(&'a Self)) {
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            match node {
                Self::Then(l, r) | Self::Both(l, r) => {
                    stack.push(&**r);
                    stack.push(&**l);
                }
                leaf => f(leaf),
            }
        }
    }
}

impl<E: fmt::Debug> fmt::Debug for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "Empty"),
            Self::Fail(e) => write!(f, "Fail({e:?})"),
            Self::Die(d) => write!(f, "Die({})", d.message()),
            Self::Interrupt(id) => write!(f, "Interrupt({id})"),
            Self::Then(l, r) => write!(f, "Then({l:?}, {r:?})"),
            Self::Both(l, r) => write!(f, "Both({l:?}, {r:?})"),
        }
    }
}

impl<E: fmt::Display> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "(empty)"),
            Self::Fail(e) => write!(f, "error: {e}"),
            Self::Die(d) => write!(f, "defect: {d}"),
            Self::Interrupt(id) => write!(f, "interrupted by {id}"),
            Self::Then(l, r) => write!(f, "{l}; then {r}"),
            Self::Both(l, r) => write!(f, "({l}) and ({r})"),
        }
    }
}
