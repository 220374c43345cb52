//! Per-fiber contextual state with a patch-based fork/merge algebra.
//!
//! A [`FiberRef`] is mutable state scoped to a fiber. When a fiber forks,
//! each ref's value crosses into the child through the ref's `fork`
//! transform; when the child is joined, the child's accumulated local
//! mutations are merged back into the parent by applying
//! `patch(diff(parent, child))` — no intermediate history is replayed.
//!
//! Every ref carries a [`RefAlgebra`] obeying the patch law
//! `patch(combine(diff(a,b), diff(b,c)), a) == patch(diff(a,c), a)`. The
//! default algebra is last-write-wins; delta-style algebras (counters, flag
//! bitsets) compose through the same interface.
//!
//! Per-fiber values live in an arena indexed by the ref's stable integer id,
//! assigned by the runtime context at ref creation; lookup never goes
//! through reference identity.

use crate::effect::node::Node;
use crate::effect::Effect;
use crate::error::RuntimeError;
use std::any::Any;
use std::convert::Infallible;
use std::marker::PhantomData;
use std::rc::Rc;

/// The stable integer identity of a fiber ref, assigned at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefId(pub(crate) u32);

impl RefId {
    /// Returns the raw arena index.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }
}

/// The patch algebra governing how a ref's values fork and merge.
pub trait RefAlgebra<T: 'static>: 'static {
    /// The patch type: a self-contained description of "what changed".
    type Patch: 'static;

    /// Computes the patch transforming `old` into `new`.
    fn diff(&self, old: &T, new: &T) -> Self::Patch;

    /// Sequentially composes two patches. Must be associative.
    fn combine(&self, first: Self::Patch, second: Self::Patch) -> Self::Patch;

    /// Applies a patch to a value.
    fn patch(&self, patch: &Self::Patch, value: T) -> T;

    /// Transforms the parent's value into the child's starting value.
    fn fork(&self, value: &T) -> T;
}

/// The default algebra: the child's final value wins on merge.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins;

impl<T: Clone + 'static> RefAlgebra<T> for LastWriteWins {
    type Patch = T;

    fn diff(&self, _old: &T, new: &T) -> T {
        new.clone()
    }

    fn combine(&self, _first: T, second: T) -> T {
        second
    }

    fn patch(&self, patch: &T, _value: T) -> T {
        patch.clone()
    }

    fn fork(&self, value: &T) -> T {
        value.clone()
    }
}

/// Type-erased algebra operations over arena slots. `None` means a slot or
/// patch did not hold the type the algebra expects.
pub(crate) trait ErasedRefOps {
    fn diff(&self, old: &Rc<dyn Any>, new: &Rc<dyn Any>) -> Option<Box<dyn Any>>;
    fn patch(&self, patch: &dyn Any, value: &Rc<dyn Any>) -> Option<Rc<dyn Any>>;
    fn fork(&self, value: &Rc<dyn Any>) -> Option<Rc<dyn Any>>;
}

struct TypedOps<T, A> {
    algebra: A,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static, A: RefAlgebra<T>> ErasedRefOps for TypedOps<T, A>
where
    T: Clone,
{
    fn diff(&self, old: &Rc<dyn Any>, new: &Rc<dyn Any>) -> Option<Box<dyn Any>> {
        let old = old.downcast_ref::<T>()?;
        let new = new.downcast_ref::<T>()?;
        Some(Box::new(self.algebra.diff(old, new)))
    }

    fn patch(&self, patch: &dyn Any, value: &Rc<dyn Any>) -> Option<Rc<dyn Any>> {
        let patch = patch.downcast_ref::<A::Patch>()?;
        let value = value.downcast_ref::<T>()?.clone();
        Some(Rc::new(self.algebra.patch(patch, value)))
    }

    fn fork(&self, value: &Rc<dyn Any>) -> Option<Rc<dyn Any>> {
        let value = value.downcast_ref::<T>()?;
        Some(Rc::new(self.algebra.fork(value)))
    }
}

/// Shared per-ref metadata: the initial value and the erased algebra.
pub(crate) struct RefMeta {
    pub(crate) initial: Rc<dyn Any>,
    pub(crate) ops: Rc<dyn ErasedRefOps>,
}

/// The crate-internal, untyped view of a fiber ref.
#[derive(Clone)]
pub(crate) struct ErasedFiberRef {
    pub(crate) id: RefId,
    pub(crate) meta: Rc<RefMeta>,
}

/// Per-fiber contextual mutable state, forked and merged across fiber
/// boundaries via each ref's patch algebra.
pub struct FiberRef<T> {
    erased: ErasedFiberRef,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for FiberRef<T> {
    fn clone(&self) -> Self {
        Self {
            erased: self.erased.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Clone + 'static> FiberRef<T> {
    /// Creates a new fiber ref with the last-write-wins algebra.
    #[must_use]
    pub fn make(initial: T) -> Effect<Self, Infallible> {
        Self::make_with(initial, LastWriteWins)
    }

    /// Creates a new fiber ref with an explicit patch algebra.
    #[must_use]
    pub fn make_with<A: RefAlgebra<T>>(initial: T, algebra: A) -> Effect<Self, Infallible> {
        Effect::from_node(Node::Stateful(Box::new(move |view| {
            let meta = Rc::new(RefMeta {
                initial: Rc::new(initial),
                ops: Rc::new(TypedOps {
                    algebra,
                    _marker: PhantomData::<fn() -> T>,
                }),
            });
            let id = view.allocate_ref_id();
            Node::Succeed(Box::new(Self {
                erased: ErasedFiberRef { id, meta },
                _marker: PhantomData,
            }))
        })))
    }

    /// Reads the current fiber's value of this ref.
    #[must_use]
    pub fn get(&self) -> Effect<T, Infallible> {
        let erased = self.erased.clone();
        Effect::from_node(Node::Stateful(Box::new(move |view| {
            let value = view.ref_get(&erased);
            match value.downcast_ref::<T>() {
                Some(v) => Node::Succeed(Box::new(v.clone())),
                None => Node::fail_cause(crate::cause::Cause::Die(
                    RuntimeError::RefTypeMismatch { id: erased.id }.into_defect(),
                )),
            }
        })))
    }

    /// Sets the current fiber's value of this ref.
    #[must_use]
    pub fn set(&self, value: T) -> Effect<(), Infallible> {
        let erased = self.erased.clone();
        Effect::from_node(Node::Stateful(Box::new(move |view| {
            view.ref_set(&erased, Rc::new(value));
            Node::unit()
        })))
    }

    /// Updates the current fiber's value of this ref.
    #[must_use]
    pub fn update(&self, f: impl FnOnce(T) -> T + 'static) -> Effect<(), Infallible> {
        let erased = self.erased.clone();
        Effect::from_node(Node::Stateful(Box::new(move |view| {
            let value = view.ref_get(&erased);
            match value.downcast_ref::<T>() {
                Some(v) => {
                    view.ref_set(&erased, Rc::new(f(v.clone())));
                    Node::unit()
                }
                None => Node::fail_cause(crate::cause::Cause::Die(
                    RuntimeError::RefTypeMismatch { id: erased.id }.into_defect(),
                )),
            }
        })))
    }

    /// Runs `effect` with this ref set to `value`, restoring the previous
    /// value afterwards regardless of how the effect exits.
    #[must_use]
    pub fn locally<A: 'static, E: Clone + 'static>(
        &self,
        value: T,
        effect: Effect<A, E>,
    ) -> Effect<A, E> {
        let this = self.clone();
        let setter = self.clone();
        self.get().infallible().flat_map(move |previous| {
            setter
                .set(value)
                .infallible()
                .flat_map(move |()| effect.ensuring(this.set(previous)))
        })
    }
}

impl<T> core::fmt::Debug for FiberRef<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "FiberRef({:?})", self.erased.id)
    }
}

/// One occupied arena slot in a fiber's ref store.
struct Slot {
    value: Rc<dyn Any>,
    meta: Rc<RefMeta>,
}

impl Slot {
    fn fork(&self) -> Self {
        // A slot that no longer holds its own type restarts the child from
        // the ref's initial value.
        Self {
            value: self
                .meta
                .ops
                .fork(&self.value)
                .unwrap_or_else(|| self.meta.initial.clone()),
            meta: self.meta.clone(),
        }
    }
}

/// The per-fiber ref store: an arena indexed by [`RefId`].
#[derive(Default)]
pub(crate) struct FiberRefs {
    slots: Vec<Option<Slot>>,
}

impl FiberRefs {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reads the fiber's value, falling back to the ref's initial value.
    pub(crate) fn get(&self, r: &ErasedFiberRef) -> Rc<dyn Any> {
        self.slots
            .get(r.id.0 as usize)
            .and_then(Option::as_ref)
            .map_or_else(|| r.meta.initial.clone(), |slot| slot.value.clone())
    }

    pub(crate) fn set(&mut self, r: &ErasedFiberRef, value: Rc<dyn Any>) {
        let index = r.id.0 as usize;
        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, || None);
        }
        self.slots[index] = Some(Slot {
            value,
            meta: r.meta.clone(),
        });
    }

    /// Produces the child's starting store: every slot crosses through its
    /// ref's fork transform.
    pub(crate) fn fork_child(&self) -> Self {
        Self {
            slots: self
                .slots
                .iter()
                .map(|slot| slot.as_ref().map(Slot::fork))
                .collect(),
        }
    }

    /// Merges a joined child's store into this one: for each slot the child
    /// touched, `patch(diff(parent, child), parent)` becomes the parent's
    /// new value. A slot whose value does not hold its ref's type aborts the
    /// merge with [`RuntimeError::RefTypeMismatch`].
    pub(crate) fn merge_child(&mut self, child: Self) -> Result<(), RuntimeError> {
        for (index, slot) in child.slots.into_iter().enumerate() {
            let Some(child_slot) = slot else { continue };
            let id = RefId(u32::try_from(index).unwrap_or(u32::MAX));
            let parent_value = self
                .slots
                .get(index)
                .and_then(Option::as_ref)
                .map_or_else(|| child_slot.meta.initial.clone(), |s| s.value.clone());
            let ops = &child_slot.meta.ops;
            let patch = ops
                .diff(&parent_value, &child_slot.value)
                .ok_or(RuntimeError::RefTypeMismatch { id })?;
            let merged = ops
                .patch(patch.as_ref(), &parent_value)
                .ok_or(RuntimeError::RefTypeMismatch { id })?;
            if self.slots.len() <= index {
                self.slots.resize_with(index + 1, || None);
            }
            self.slots[index] = Some(Slot {
                value: merged,
                meta: child_slot.meta,
            });
        }
        Ok(())
    }
}
