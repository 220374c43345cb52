//! The typed effect surface.
//!
//! An [`Effect<A, E>`] is an immutable description of a computation that,
//! when interpreted by a fiber, either succeeds with an `A`, fails with an
//! `E` (or a defect, or an interruption — see
//! [`Cause`](crate::cause::Cause)), or never finishes. Building an effect
//! performs no work; all evaluation happens inside
//! [`Runtime::run`](crate::runtime::Runtime::run) or a forked fiber.
//!
//! Internally the typed surface is a phantom-typed wrapper over the erased
//! [`Node`] tree. Success values travel as `Box<dyn Any>`; typed errors are
//! erased at construction and recovered by downcast in handlers, which is
//! why error-observing combinators carry an `E: Clone` bound.

pub(crate) mod node;

use crate::cause::{Cause, Defect};
use crate::error::RuntimeError;
use crate::fiber::flags::{FlagsPatch, RuntimeFlag};
use crate::fiber::handle::Fiber;
use crate::fiber::id::FiberId;
use crate::scope::ExitStatus;
use crate::Exit;
use node::{downcast_value, ECause, ErrValue, Node, ResumeErased};
use std::any::Any;
use std::convert::Infallible;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::rc::Rc;

/// A lazy, composable description of a computation.
///
/// `A` is the success type, `E` the typed error channel. Defects and
/// interruptions travel outside `E`, in the cause.
#[must_use = "effects describe work; nothing runs until a runtime interprets them"]
pub struct Effect<A, E> {
    node: Node,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Effect<A, E> {
    pub(crate) fn from_node(node: Node) -> Self {
        Self {
            node,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_node(self) -> Node {
        self.node
    }
}

// =============================================================================
// Cause plumbing between the typed and erased worlds
// =============================================================================

/// Rebuilds an erased cause with each `Fail` leaf replaced by `f`'s output.
/// Iterative, so pathological cause trees cannot overflow the stack.
pub(crate) fn transform_fail_leaves(
    cause: ECause,
    f: &dyn Fn(ErrValue) -> ECause,
) -> ECause {
    enum Step {
        Node(ECause),
        Then,
        Both,
    }
    let mut input = vec![Step::Node(cause)];
    let mut output: Vec<ECause> = Vec::new();
    while let Some(step) = input.pop() {
        match step {
            Step::Node(Cause::Then(left, right)) => {
                input.push(Step::Then);
                input.push(Step::Node(right.into_cause()));
                input.push(Step::Node(left.into_cause()));
            }
            Step::Node(Cause::Both(left, right)) => {
                input.push(Step::Both);
                input.push(Step::Node(right.into_cause()));
                input.push(Step::Node(left.into_cause()));
            }
            Step::Node(Cause::Fail(error)) => output.push(f(error)),
            Step::Node(leaf) => output.push(leaf),
            Step::Then => {
                let right = output.pop().unwrap_or(Cause::Empty);
                let left = output.pop().unwrap_or(Cause::Empty);
                output.push(left.then(right));
            }
            Step::Both => {
                let right = output.pop().unwrap_or(Cause::Empty);
                let left = output.pop().unwrap_or(Cause::Empty);
                output.push(left.both(right));
            }
        }
    }
    output.pop().unwrap_or(Cause::Empty)
}

/// Recovers a typed cause from the erased one. A `Fail` leaf that does not
/// hold an `E` is demoted to a defect rather than impersonating one.
pub(crate) fn typed_cause<E: Any + Clone>(cause: ECause) -> Cause<E> {
    enum Step {
        Node(ECause),
        Then,
        Both,
    }
    let mut input = vec![Step::Node(cause)];
    let mut output: Vec<Cause<E>> = Vec::new();
    while let Some(step) = input.pop() {
        match step {
            Step::Node(Cause::Then(left, right)) => {
                input.push(Step::Then);
                input.push(Step::Node(right.into_cause()));
                input.push(Step::Node(left.into_cause()));
            }
            Step::Node(Cause::Both(left, right)) => {
                input.push(Step::Both);
                input.push(Step::Node(right.into_cause()));
                input.push(Step::Node(left.into_cause()));
            }
            Step::Node(Cause::Fail(error)) => output.push(match error.downcast::<E>() {
                Some(e) => Cause::Fail(e),
                None => Cause::Die(RuntimeError::ErrorEscapedChannel.into_defect()),
            }),
            Step::Node(Cause::Empty) => output.push(Cause::Empty),
            Step::Node(Cause::Die(defect)) => output.push(Cause::Die(defect)),
            Step::Node(Cause::Interrupt(id)) => output.push(Cause::Interrupt(id)),
            Step::Then => {
                let right = output.pop().unwrap_or(Cause::Empty);
                let left = output.pop().unwrap_or(Cause::Empty);
                output.push(left.then(right));
            }
            Step::Both => {
                let right = output.pop().unwrap_or(Cause::Empty);
                let left = output.pop().unwrap_or(Cause::Empty);
                output.push(left.both(right));
            }
        }
    }
    output.pop().unwrap_or(Cause::Empty)
}

/// Erases a typed cause into the interpreter's currency.
pub(crate) fn erase_cause<E: Any>(cause: Cause<E>) -> ECause {
    enum Step<E> {
        Node(Cause<E>),
        Then,
        Both,
    }
    let mut input = vec![Step::Node(cause)];
    let mut output: Vec<ECause> = Vec::new();
    while let Some(step) = input.pop() {
        match step {
            Step::Node(Cause::Then(left, right)) => {
                input.push(Step::Then);
                input.push(Step::Node(right.into_cause()));
                input.push(Step::Node(left.into_cause()));
            }
            Step::Node(Cause::Both(left, right)) => {
                input.push(Step::Both);
                input.push(Step::Node(right.into_cause()));
                input.push(Step::Node(left.into_cause()));
            }
            Step::Node(Cause::Fail(error)) => output.push(Cause::Fail(ErrValue::new(error))),
            Step::Node(Cause::Empty) => output.push(Cause::Empty),
            Step::Node(Cause::Die(defect)) => output.push(Cause::Die(defect)),
            Step::Node(Cause::Interrupt(id)) => output.push(Cause::Interrupt(id)),
            Step::Then => {
                let right = output.pop().unwrap_or(Cause::Empty);
                let left = output.pop().unwrap_or(Cause::Empty);
                output.push(left.then(right));
            }
            Step::Both => {
                let right = output.pop().unwrap_or(Cause::Empty);
                let left = output.pop().unwrap_or(Cause::Empty);
                output.push(left.both(right));
            }
        }
    }
    output.pop().unwrap_or(Cause::Empty)
}

/// Converts an erased exit payload back into a typed [`Exit`].
pub(crate) fn typed_exit<A: 'static, E: Any + Clone>(
    value: Option<node::AnyValue>,
    cause: Option<ECause>,
) -> Exit<A, E> {
    match cause {
        Some(cause) => Exit::Failure(typed_cause(cause)),
        None => match value.map(downcast_value::<A>) {
            Some(Ok(v)) => Exit::Success(v),
            _ => Exit::Failure(Cause::Die(
                RuntimeError::ErrorEscapedChannel.into_defect(),
            )),
        },
    }
}

/// Shares a single-use value between the two arms of a fold; exactly one
/// arm runs, so the other's clone simply never takes it.
struct SharedOnce<T>(Rc<std::cell::RefCell<Option<T>>>);

impl<T> Clone for SharedOnce<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> SharedOnce<T> {
    fn new(value: T) -> Self {
        Self(Rc::new(std::cell::RefCell::new(Some(value))))
    }

    fn take(&self) -> Option<T> {
        self.0.borrow_mut().take()
    }
}

fn status_of(cause: &ECause) -> ExitStatus {
    if cause.is_interrupted_only() {
        ExitStatus::Interrupted
    } else {
        ExitStatus::Failed
    }
}

// =============================================================================
// Constructors
// =============================================================================

impl<A: 'static, E: 'static> Effect<A, E> {
    /// Lifts an already-computed value.
    pub fn succeed(value: A) -> Self {
        Self::from_node(Node::Succeed(Box::new(value)))
    }

    /// Lifts a synchronous computation, run when the effect is interpreted.
    /// A panic inside the thunk becomes a defect on the running fiber.
    pub fn succeed_with(f: impl FnOnce() -> A + 'static) -> Self {
        Self::from_node(Node::SucceedWith(Box::new(move || Box::new(f()))))
    }

    /// Fails with a typed error.
    pub fn fail(error: E) -> Self
    where
        E: Any,
    {
        Self::from_node(Node::Fail(Box::new(move || {
            Cause::Fail(ErrValue::new(error))
        })))
    }

    /// Fails with a full typed cause.
    pub fn fail_cause(cause: Cause<E>) -> Self
    where
        E: Any,
    {
        Self::from_node(Node::Fail(Box::new(move || erase_cause(cause))))
    }

    /// Dies with a defect. The payload never enters the typed error channel.
    pub fn die(payload: impl Any + Debug) -> Self {
        let defect = Defect::new(payload);
        Self::from_node(Node::Fail(Box::new(move || Cause::Die(defect))))
    }

    /// Lifts a `Result`, failing on `Err`.
    pub fn from_result(result: Result<A, E>) -> Self
    where
        E: Any,
    {
        match result {
            Ok(value) => Self::succeed(value),
            Err(error) => Self::fail(error),
        }
    }

    /// Defers construction of an effect until interpretation time.
    pub fn suspend(f: impl FnOnce() -> Effect<A, E> + 'static) -> Self {
        Self::from_node(Node::suspend(move || f().into_node()))
    }

    /// An effect that never completes. The running fiber suspends forever
    /// (still interruptible, and visible to deadlock detection).
    pub fn never() -> Self {
        Self::from_node(Node::Async(Box::new(|_resume| None)))
    }

    /// Bridges a callback-style computation into an effect.
    ///
    /// The registration receives a [`Resume`] and may hand back an optional
    /// canceler, run if the fiber is interrupted while suspended here. Only
    /// the first `Resume` delivery counts.
    pub fn async_<F>(register: F) -> Self
    where
        F: FnOnce(Resume<A, E>) -> Option<Effect<(), Infallible>> + 'static,
    {
        Self::from_node(Node::Async(Box::new(move |erased| {
            register(Resume {
                erased,
                _marker: PhantomData,
            })
            .map(Effect::into_node)
        })))
    }
}

impl Effect<(), Infallible> {
    /// The unit effect.
    pub fn unit() -> Self {
        Self::from_node(Node::unit())
    }

    /// Yields the current fiber back to the scheduler for one turn.
    pub fn yield_now() -> Self {
        Self::from_node(Node::Yield)
    }
}

impl Effect<FiberId, Infallible> {
    /// The identity of the fiber interpreting this effect.
    pub fn fiber_id() -> Self {
        Self::from_node(Node::Stateful(Box::new(|view| {
            Node::Succeed(Box::new(view.id()))
        })))
    }
}

// =============================================================================
// Combinators
// =============================================================================

impl<A: 'static, E: 'static> Effect<A, E> {
    /// Transforms the success value.
    pub fn map<B: 'static>(self, f: impl FnOnce(A) -> B + 'static) -> Effect<B, E> {
        Effect::from_node(Node::OnSuccess(
            Box::new(self.node),
            Box::new(move |value| match downcast_value::<A>(value) {
                Ok(a) => Node::Succeed(Box::new(f(a))),
                Err(_) => Node::fail_cause(Cause::Die(
                    RuntimeError::ErrorEscapedChannel.into_defect(),
                )),
            }),
        ))
    }

    /// Sequences a dependent effect after this one.
    pub fn flat_map<B: 'static>(
        self,
        f: impl FnOnce(A) -> Effect<B, E> + 'static,
    ) -> Effect<B, E> {
        Effect::from_node(Node::OnSuccess(
            Box::new(self.node),
            Box::new(move |value| match downcast_value::<A>(value) {
                Ok(a) => f(a).into_node(),
                Err(_) => Node::fail_cause(Cause::Die(
                    RuntimeError::ErrorEscapedChannel.into_defect(),
                )),
            }),
        ))
    }

    /// Sequences another effect, discarding this one's value.
    pub fn zip_right<B: 'static>(self, that: Effect<B, E>) -> Effect<B, E> {
        self.flat_map(move |_| that)
    }

    /// Transforms the typed error, leaving defects and interruptions alone.
    pub fn map_error<E2: Any>(self, f: impl Fn(E) -> E2 + 'static) -> Effect<A, E2>
    where
        E: Any + Clone,
    {
        Effect::from_node(Node::OnFailure(
            Box::new(self.node),
            Box::new(move |cause| {
                Node::fail_cause(transform_fail_leaves(cause, &|error| {
                    match error.downcast::<E>() {
                        Some(e) => Cause::Fail(ErrValue::new(f(e))),
                        None => Cause::Fail(error),
                    }
                }))
            }),
        ))
    }

    /// Recovers from typed failures. Defects and interrupt-only causes pass
    /// through untouched; when a cause mixes failures with interruption the
    /// interruption wins and the handler is not run.
    pub fn catch_all(self, handler: impl FnOnce(E) -> Effect<A, E> + 'static) -> Effect<A, E>
    where
        E: Any + Clone,
    {
        Effect::from_node(Node::OnFailure(
            Box::new(self.node),
            Box::new(move |cause| {
                if cause.is_interrupted() {
                    return Node::fail_cause(cause);
                }
                let recovered = cause.failure_option().and_then(ErrValue::downcast::<E>);
                match recovered {
                    Some(error) => handler(error).into_node(),
                    None => Node::fail_cause(cause),
                }
            }),
        ))
    }

    /// Recovers from any non-interrupt cause with full cause visibility.
    pub fn catch_all_cause(
        self,
        handler: impl FnOnce(Cause<E>) -> Effect<A, E> + 'static,
    ) -> Effect<A, E>
    where
        E: Any + Clone,
    {
        Effect::from_node(Node::OnFailure(
            Box::new(self.node),
            Box::new(move |cause| {
                if cause.is_interrupted() {
                    return Node::fail_cause(cause);
                }
                handler(typed_cause(cause)).into_node()
            }),
        ))
    }

    /// Folds both sides into an infallible effect. Defects and
    /// interruptions still propagate.
    pub fn fold<B: 'static>(
        self,
        failure: impl FnOnce(E) -> B + 'static,
        success: impl FnOnce(A) -> B + 'static,
    ) -> Effect<B, Infallible>
    where
        E: Any + Clone,
    {
        Effect::from_node(Node::Fold {
            inner: Box::new(self.node),
            on_failure: Box::new(move |cause| {
                let recovered = cause.failure_option().and_then(ErrValue::downcast::<E>);
                match recovered {
                    Some(e) if !cause.is_interrupted() => Node::Succeed(Box::new(failure(e))),
                    _ => Node::fail_cause(cause),
                }
            }),
            on_success: Box::new(move |value| match downcast_value::<A>(value) {
                Ok(a) => Node::Succeed(Box::new(success(a))),
                Err(_) => Node::fail_cause(Cause::Die(
                    RuntimeError::ErrorEscapedChannel.into_defect(),
                )),
            }),
        })
    }

    /// Folds over the full cause on the failure side.
    pub fn fold_cause<B: 'static>(
        self,
        failure: impl FnOnce(Cause<E>) -> B + 'static,
        success: impl FnOnce(A) -> B + 'static,
    ) -> Effect<B, Infallible>
    where
        E: Any + Clone,
    {
        Effect::from_node(Node::Fold {
            inner: Box::new(self.node),
            on_failure: Box::new(move |cause| Node::Succeed(Box::new(failure(typed_cause(cause))))),
            on_success: Box::new(move |value| match downcast_value::<A>(value) {
                Ok(a) => Node::Succeed(Box::new(success(a))),
                Err(_) => Node::fail_cause(Cause::Die(
                    RuntimeError::ErrorEscapedChannel.into_defect(),
                )),
            }),
        })
    }

    /// Materializes this effect's exit as a value, capturing failures,
    /// defects, and interruptions alike.
    pub fn exit(self) -> Effect<Exit<A, E>, Infallible>
    where
        E: Any + Clone,
    {
        self.fold_cause(Exit::Failure, Exit::Success)
    }

    /// Discards the typed error channel, keeping defects and interruptions.
    pub fn ignore(self) -> Effect<(), Infallible> {
        Effect::from_node(Node::Fold {
            inner: Box::new(self.node),
            on_failure: Box::new(|cause| {
                let stripped = cause.strip_failures();
                if stripped.is_empty() {
                    Node::unit()
                } else {
                    Node::fail_cause(stripped)
                }
            }),
            on_success: Box::new(|_| Node::unit()),
        })
    }

    /// Converts typed failures into defects.
    pub fn or_die(self) -> Effect<A, Infallible>
    where
        E: Any + Clone + Debug,
    {
        Effect::from_node(Node::OnFailure(
            Box::new(self.node),
            Box::new(|cause| {
                Node::fail_cause(transform_fail_leaves(cause, &|error| {
                    match error.downcast::<E>() {
                        Some(e) => Cause::Die(Defect::new(e)),
                        None => Cause::Die(RuntimeError::ErrorEscapedChannel.into_defect()),
                    }
                }))
            }),
        ))
    }

    /// Runs a finalizer after this effect, on every exit path. The
    /// finalizer runs uninterruptibly; a finalizer defect is sequenced onto
    /// the primary cause rather than discarded.
    pub fn ensuring(self, finalizer: Effect<(), Infallible>) -> Effect<A, E> {
        let fin = SharedOnce::new(Node::UpdateFlags(
            FlagsPatch::disable(RuntimeFlag::Interruption),
            Box::new(finalizer.into_node()),
        ));
        let fin_ok = fin.clone();
        Effect::from_node(Node::Fold {
            inner: Box::new(self.node),
            on_failure: Box::new(move |cause| {
                let sc = cause.clone();
                Node::Fold {
                    inner: Box::new(fin.take().unwrap_or_else(Node::unit)),
                    on_failure: Box::new(move |fin_cause| Node::fail_cause(cause.then(fin_cause))),
                    on_success: Box::new(move |_| Node::fail_cause(sc)),
                }
            }),
            on_success: Box::new(move |value| Node::Fold {
                inner: Box::new(fin_ok.take().unwrap_or_else(Node::unit)),
                on_failure: Box::new(Node::fail_cause),
                on_success: Box::new(move |_| Node::Succeed(value)),
            }),
        })
    }

    /// Runs an exit-aware finalizer after this effect, uninterruptibly.
    pub fn on_exit(
        self,
        f: impl FnOnce(&Exit<A, E>) -> Effect<(), Infallible> + 'static,
    ) -> Effect<A, E>
    where
        E: Any + Clone,
    {
        let f = SharedOnce::new(f);
        let f_ok = f.clone();
        Effect::from_node(Node::Fold {
            inner: Box::new(self.node),
            on_failure: Box::new(move |cause| {
                let exit: Exit<A, E> = Exit::Failure(typed_cause(cause.clone()));
                let fin = match f.take() {
                    Some(f) => Node::UpdateFlags(
                        FlagsPatch::disable(RuntimeFlag::Interruption),
                        Box::new(f(&exit).into_node()),
                    ),
                    None => Node::unit(),
                };
                let sc = cause.clone();
                Node::Fold {
                    inner: Box::new(fin),
                    on_failure: Box::new(move |fin_cause| Node::fail_cause(cause.then(fin_cause))),
                    on_success: Box::new(move |_| Node::fail_cause(sc)),
                }
            }),
            on_success: Box::new(move |value| match downcast_value::<A>(value) {
                Ok(a) => {
                    let exit = Exit::Success(a);
                    let fin = match f_ok.take() {
                        Some(f) => Node::UpdateFlags(
                            FlagsPatch::disable(RuntimeFlag::Interruption),
                            Box::new(f(&exit).into_node()),
                        ),
                        None => Node::unit(),
                    };
                    Node::Fold {
                        inner: Box::new(fin),
                        on_failure: Box::new(Node::fail_cause),
                        on_success: Box::new(move |_| match exit {
                            Exit::Success(a) => Node::Succeed(Box::new(a)),
                            Exit::Failure(_) => Node::unit(),
                        }),
                    }
                }
                Err(_) => Node::fail_cause(Cause::Die(
                    RuntimeError::ErrorEscapedChannel.into_defect(),
                )),
            }),
        })
    }

    // -------------------------------------------------------------------------
    // Interruption control
    // -------------------------------------------------------------------------

    /// Makes this effect's extent immune to interruption.
    pub fn uninterruptible(self) -> Self {
        Self::from_node(Node::UpdateFlags(
            FlagsPatch::disable(RuntimeFlag::Interruption),
            Box::new(self.node),
        ))
    }

    /// Re-enables interruption for this effect's extent.
    pub fn interruptible(self) -> Self {
        Self::from_node(Node::UpdateFlags(
            FlagsPatch::enable(RuntimeFlag::Interruption),
            Box::new(self.node),
        ))
    }

    /// Runs `f` uninterruptibly, handing it a [`Restore`] that reinstates
    /// the interruptibility in force at mask entry for selected regions.
    pub fn uninterruptible_mask<F>(f: F) -> Self
    where
        F: FnOnce(Restore) -> Effect<A, E> + 'static,
    {
        Self::from_node(Node::Stateful(Box::new(move |view| {
            let restore = Restore {
                interruptible: view.flags().interruption(),
            };
            Node::UpdateFlags(
                FlagsPatch::disable(RuntimeFlag::Interruption),
                Box::new(f(restore).into_node()),
            )
        })))
    }

    // -------------------------------------------------------------------------
    // Resources
    // -------------------------------------------------------------------------

    /// The classic bracket: `acquire` runs uninterruptibly, `release` runs
    /// on every exit of `use_fn` (also uninterruptibly), and interruption is
    /// only possible inside `use_fn`.
    pub fn acquire_release<R, Use, Rel>(
        acquire: Effect<R, E>,
        use_fn: Use,
        release: Rel,
    ) -> Effect<A, E>
    where
        R: Clone + 'static,
        Use: FnOnce(R) -> Effect<A, E> + 'static,
        Rel: FnOnce(R, ExitStatus) -> Effect<(), Infallible> + 'static,
    {
        Self::uninterruptible_mask(move |restore| {
            acquire.flat_map(move |resource| {
                let release = SharedOnce::new((release, resource.clone()));
                let release_ok = release.clone();
                let body = restore.apply(use_fn(resource));
                Effect::from_node(Node::Fold {
                    inner: Box::new(body.into_node()),
                    on_failure: Box::new(move |cause| {
                        let status = status_of(&cause);
                        let fin = match release.take() {
                            Some((release, resource)) => release(resource, status).into_node(),
                            None => Node::unit(),
                        };
                        let sc = cause.clone();
                        Node::Fold {
                            inner: Box::new(fin),
                            on_failure: Box::new(move |fin_cause| {
                                Node::fail_cause(cause.then(fin_cause))
                            }),
                            on_success: Box::new(move |_| Node::fail_cause(sc)),
                        }
                    }),
                    on_success: Box::new(move |value| {
                        let fin = match release_ok.take() {
                            Some((release, resource)) => {
                                release(resource, ExitStatus::Succeeded).into_node()
                            }
                            None => Node::unit(),
                        };
                        Node::Fold {
                            inner: Box::new(fin),
                            on_failure: Box::new(Node::fail_cause),
                            on_success: Box::new(move |_| Node::Succeed(value)),
                        }
                    }),
                })
            })
        })
    }

    /// Opens a [`Scope`](crate::scope::Scope) for the extent of `f`'s
    /// effect. The scope closes when the effect exits, running finalizers in
    /// LIFO order; finalizer failures are sequenced onto the body's cause.
    pub fn scoped<F>(f: F) -> Effect<A, E>
    where
        F: FnOnce(crate::scope::Scope) -> Effect<A, E> + 'static,
    {
        Effect::from_node(Node::suspend(move || {
            let scope = crate::scope::Scope::make();
            let on_fail_scope = scope.clone();
            let on_ok_scope = scope.clone();
            Node::Fold {
                inner: Box::new(f(scope).into_node()),
                on_failure: Box::new(move |cause| {
                    let status = status_of(&cause);
                    let close = Node::UpdateFlags(
                        FlagsPatch::disable(RuntimeFlag::Interruption),
                        Box::new(on_fail_scope.close_collect(status)),
                    );
                    Node::OnSuccess(
                        Box::new(close),
                        Box::new(move |collected| {
                            let collected = *collected
                                .downcast::<ECause>()
                                .unwrap_or_else(|_| Box::new(Cause::Empty));
                            Node::fail_cause(cause.then(collected))
                        }),
                    )
                }),
                on_success: Box::new(move |value| {
                    let close = Node::UpdateFlags(
                        FlagsPatch::disable(RuntimeFlag::Interruption),
                        Box::new(on_ok_scope.close_collect(ExitStatus::Succeeded)),
                    );
                    Node::OnSuccess(
                        Box::new(close),
                        Box::new(move |collected| {
                            let collected = *collected
                                .downcast::<ECause>()
                                .unwrap_or_else(|_| Box::new(Cause::Empty));
                            if collected.is_empty() {
                                Node::Succeed(value)
                            } else {
                                Node::fail_cause(collected)
                            }
                        }),
                    )
                }),
            }
        }))
    }

    // -------------------------------------------------------------------------
    // Concurrency
    // -------------------------------------------------------------------------

    /// Forks this effect onto a new fiber, a child of the current one.
    /// Children are interrupted when their parent's extent ends.
    pub fn fork(self) -> Effect<Fiber<A, E>, Infallible> {
        let node = self.node;
        Effect::from_node(Node::Stateful(Box::new(move |view| {
            let cell = view.fork(node, false);
            Node::Succeed(Box::new(Fiber::<A, E>::from_cell(cell)))
        })))
    }

    /// Forks this effect onto a daemon fiber, parented to the runtime root
    /// instead of the current fiber. It outlives its forker.
    pub fn fork_daemon(self) -> Effect<Fiber<A, E>, Infallible> {
        let node = self.node;
        Effect::from_node(Node::Stateful(Box::new(move |view| {
            let cell = view.fork(node, true);
            Node::Succeed(Box::new(Fiber::<A, E>::from_cell(cell)))
        })))
    }

    /// Races two effects: the first to complete (by any exit) decides the
    /// outcome, and the loser is interrupted and fully finalized before the
    /// race resolves.
    pub fn race(self, that: Effect<A, E>) -> Effect<A, E>
    where
        E: Any + Clone,
    {
        let left_node = self.node;
        let right_node = that.node;
        Effect::from_node(Node::Stateful(Box::new(move |view| {
            let left = view.fork(left_node, false);
            let right = view.fork(right_node, false);
            Node::Async(Box::new(move |resume: ResumeErased| {
                let settle = |winner: Rc<crate::fiber::runtime::FiberCell>,
                              loser: Rc<crate::fiber::runtime::FiberCell>|
                 -> Node {
                    Node::Stateful(Box::new(move |view| {
                        view.interrupt_cell(&loser);
                        let winner_for_exit = winner.clone();
                        Node::OnSuccess(
                            Box::new(crate::fiber::handle::await_node(loser)),
                            Box::new(move |_| {
                                crate::fiber::handle::exit_node(&winner_for_exit)
                            }),
                        )
                    }))
                };
                {
                    let resume = resume.clone();
                    let winner = left.clone();
                    let loser = right.clone();
                    left.subscribe(Box::new(move || {
                        resume.resume(settle(winner, loser));
                    }));
                }
                {
                    let winner = right.clone();
                    let loser = left.clone();
                    right.subscribe(Box::new(move || {
                        resume.resume(settle(winner, loser));
                    }));
                }
                None
            }))
        })))
    }
}

impl<A: 'static> Effect<A, Infallible> {
    /// Widens an unfailable effect to any error channel. Sound because no
    /// `Infallible` failure can ever have been constructed.
    pub fn infallible<E2: 'static>(self) -> Effect<A, E2> {
        Effect::from_node(self.node)
    }
}

/// Reinstates the interruptibility captured at
/// [`Effect::uninterruptible_mask`] entry.
#[derive(Debug, Clone, Copy)]
pub struct Restore {
    interruptible: bool,
}

impl Restore {
    /// Runs `effect` with the masked region's original interruptibility.
    pub fn apply<A: 'static, E: 'static>(&self, effect: Effect<A, E>) -> Effect<A, E> {
        let patch = if self.interruptible {
            FlagsPatch::enable(RuntimeFlag::Interruption)
        } else {
            FlagsPatch::disable(RuntimeFlag::Interruption)
        };
        Effect::from_node(Node::UpdateFlags(patch, Box::new(effect.into_node())))
    }
}

/// The typed resume callback handed to [`Effect::async_`] registrations.
///
/// Cheap to clone; only the first delivery across all clones counts.
#[derive(Clone)]
pub struct Resume<A, E> {
    erased: ResumeErased,
    _marker: PhantomData<fn(A, E)>,
}

impl<A: 'static, E: Any + 'static> Resume<A, E> {
    /// Resumes the suspended fiber with a success value.
    pub fn succeed(&self, value: A) {
        self.erased.resume(Node::Succeed(Box::new(value)));
    }

    /// Resumes the suspended fiber with a typed failure.
    pub fn fail(&self, error: E) {
        self.erased
            .resume(Node::fail_cause(Cause::Fail(ErrValue::new(error))));
    }

    /// Resumes the suspended fiber with a whole follow-up effect.
    pub fn resume(&self, effect: Effect<A, E>) {
        self.erased.resume(effect.into_node());
    }
}

impl<A, E> core::fmt::Debug for Effect<A, E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Effect({:?})", self.node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Boom(&'static str);

    // =========================================================================
    // Cause transforms
    // =========================================================================

    #[test]
    fn typed_cause_recovers_failures() {
        let cause: ECause = Cause::Fail(ErrValue::new(Boom("a")))
            .then(Cause::Fail(ErrValue::new(Boom("b"))));
        let typed: Cause<Boom> = typed_cause(cause);
        assert_eq!(typed.failures(), vec![&Boom("a"), &Boom("b")]);
    }

    #[test]
    fn typed_cause_demotes_foreign_errors_to_defects() {
        let cause: ECause = Cause::Fail(ErrValue::new(42_u32));
        let typed: Cause<Boom> = typed_cause(cause);
        assert!(typed.failures().is_empty());
        assert!(typed.is_die());
    }

    #[test]
    fn erase_then_type_round_trips_structure() {
        let original: Cause<Boom> = Cause::Fail(Boom("x"))
            .both(Cause::Interrupt(FiberId::NONE).then(Cause::Fail(Boom("y"))));
        let back: Cause<Boom> = typed_cause(erase_cause(original.clone()));
        assert_eq!(back.failures(), original.failures());
        assert_eq!(back.interruptors(), original.interruptors());
    }

    #[test]
    fn transform_fail_leaves_is_stack_safe() {
        let mut cause: ECause = Cause::Fail(ErrValue::new(Boom("seed")));
        for _ in 0..100_000 {
            cause = cause.then(Cause::Fail(ErrValue::new(Boom("more"))));
        }
        let out = transform_fail_leaves(cause, &|_| Cause::Empty);
        assert!(out.is_empty());
    }

    // =========================================================================
    // Construction is inert
    // =========================================================================

    #[test]
    fn building_an_effect_runs_nothing() {
        let effect: Effect<u32, Infallible> = Effect::succeed_with(|| {
            panic!("must not run at construction time");
        });
        // Only formatting the description, never interpreting it.
        assert!(format!("{effect:?}").contains("SucceedWith"));
    }

    #[test]
    fn typed_exit_success() {
        let exit: Exit<u32, Boom> = typed_exit(Some(Box::new(7_u32)), None);
        assert_eq!(exit, Exit::Success(7));
    }

    #[test]
    fn typed_exit_mismatch_is_a_defect() {
        let exit: Exit<u32, Boom> = typed_exit(Some(Box::new("wrong")), None);
        assert!(exit.is_failure());
    }
}
