//! The fiber interpreter.
//!
//! A fiber evaluates one effect tree with an explicit continuation stack and
//! a trampolined step loop, so arbitrarily deep effect compositions use
//! constant native stack. A fiber runs one *turn* at a time: it executes
//! synchronous steps until it suspends (async boundary), yields (explicit or
//! op-budget exhaustion), or completes. Between turns the fiber's whole state
//! lives in [`FiberRuntime`]; the scheduler only ever holds opaque resume
//! tasks.
//!
//! Interruption is cooperative and deterministic: an interrupt request sets
//! a pending flag on the fiber's cell; the loop converts it into an ordinary
//! failure unwind at the next interruptible step, so `ensuring` finalizers
//! and scope closes run normally. Delivery is one-shot: injecting the
//! interrupt cause puts the fiber into wind-down, so the unwind's own
//! recovery steps are never preempted by a second injection. A fiber that
//! was asked to stop never reports success: its final exit is overwritten
//! with the interruption.

use crate::cause::{Cause, Defect};
use crate::effect::node::{AnyValue, ECause, Node, ResumeErased};
use crate::fiber::flags::RuntimeFlags;
use crate::fiber::id::FiberId;
use crate::fiber::refs::{ErasedFiberRef, FiberRefs, RefId};
use crate::runtime::RuntimeInner;
use crate::supervisor::FiberOutcome;
use smallvec::SmallVec;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

pub(crate) const DEFAULT_PRIORITY: u8 = 100;

/// A fiber's completed exit, stored on its cell. The success payload is
/// owned and can be extracted exactly once; the cause is freely clonable.
pub(crate) enum StoredExit {
    Success(RefCell<Option<AnyValue>>),
    Failure(ECause),
}

/// The shared handle state of one fiber: its identity, completion slot,
/// observer list, and pending-interrupt flag. Handles, parents, and the
/// runtime all reach the fiber through its cell.
pub(crate) struct FiberCell {
    id: FiberId,
    exit: RefCell<Option<StoredExit>>,
    observers: RefCell<Vec<Box<dyn FnOnce()>>>,
    pending_interrupt: Cell<Option<FiberId>>,
    fiber: RefCell<Option<Rc<RefCell<FiberRuntime>>>>,
    final_refs: RefCell<Option<FiberRefs>>,
}

impl FiberCell {
    fn new(id: FiberId) -> Self {
        Self {
            id,
            exit: RefCell::new(None),
            observers: RefCell::new(Vec::new()),
            pending_interrupt: Cell::new(None),
            fiber: RefCell::new(None),
            final_refs: RefCell::new(None),
        }
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    pub(crate) fn is_done(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Registers a completion observer; runs immediately if already done.
    pub(crate) fn subscribe(&self, observer: Box<dyn FnOnce()>) {
        if self.is_done() {
            observer();
        } else {
            self.observers.borrow_mut().push(observer);
        }
    }

    /// `None`: still running. `Some(None)`: succeeded. `Some(Some(c))`:
    /// failed with cause `c`.
    pub(crate) fn exit_cause(&self) -> Option<Option<ECause>> {
        self.exit.borrow().as_ref().map(|stored| match stored {
            StoredExit::Success(_) => None,
            StoredExit::Failure(cause) => Some(cause.clone()),
        })
    }

    /// Extracts the success payload. Returns `None` if the fiber failed, is
    /// still running, or the payload was already taken.
    pub(crate) fn take_value(&self) -> Option<AnyValue> {
        match &*self.exit.borrow() {
            Some(StoredExit::Success(slot)) => slot.borrow_mut().take(),
            _ => None,
        }
    }

    /// Borrows the success payload without consuming it.
    pub(crate) fn with_value<R>(&self, f: impl FnOnce(Option<&AnyValue>) -> R) -> R {
        match &*self.exit.borrow() {
            Some(StoredExit::Success(slot)) => f(slot.borrow().as_ref()),
            _ => f(None),
        }
    }

    /// Takes the fiber's final ref store, for merge into a joiner.
    pub(crate) fn take_final_refs(&self) -> Option<FiberRefs> {
        self.final_refs.borrow_mut().take()
    }

    /// Ids of the fiber's live children. Empty once the fiber is done.
    pub(crate) fn child_ids(&self) -> Vec<FiberId> {
        let Some(fiber_rc) = self.fiber.borrow().clone() else {
            return Vec::new();
        };
        let Ok(fiber) = fiber_rc.try_borrow() else {
            return Vec::new();
        };
        fiber
            .children
            .iter()
            .filter(|child| !child.is_done())
            .map(|child| child.id())
            .collect()
    }
}

impl core::fmt::Debug for FiberCell {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "FiberCell({}, done={})", self.id, self.is_done())
    }
}

enum Status {
    /// A turn is scheduled but not running.
    Runnable,
    /// Inside `turn` right now.
    Running,
    /// Parked at an async boundary; only a resume carrying this epoch (or an
    /// interrupt preemption) wakes it.
    Suspended { epoch: u64 },
    /// Own work finished; waiting for children to finalize.
    AwaitingChildren,
    Done,
}

enum Frame {
    OnSuccess(Box<dyn FnOnce(AnyValue) -> Node>),
    OnFailure(Box<dyn FnOnce(ECause) -> Node>),
    Fold {
        on_failure: Box<dyn FnOnce(ECause) -> Node>,
        on_success: Box<dyn FnOnce(AnyValue) -> Node>,
    },
    RestoreFlags(RuntimeFlags),
}

enum Step {
    Node(Node),
    Value(AnyValue),
    Cause(ECause),
}

/// The per-fiber interpreter state.
pub(crate) struct FiberRuntime {
    cell: Rc<FiberCell>,
    runtime: Rc<RuntimeInner>,
    frames: Vec<Frame>,
    refs: FiberRefs,
    flags: RuntimeFlags,
    status: Status,
    children: SmallVec<[Rc<FiberCell>; 4]>,
    epoch: u64,
    canceler: Option<Node>,
    pending_exit: Option<Result<AnyValue, ECause>>,
    priority: u8,
    /// Latched when the interrupt cause has been delivered. Unlike the
    /// `WindDown` runtime flag it survives `RestoreFlags` frames popping
    /// during the unwind.
    winding_down: bool,
}

/// Creates a fiber, wires its cell, and schedules its first turn on the
/// ready lane. Parent bookkeeping is the caller's job.
pub(crate) fn spawn_fiber(
    runtime: &Rc<RuntimeInner>,
    node: Node,
    refs: FiberRefs,
    flags: RuntimeFlags,
    origin: Option<&'static core::panic::Location<'static>>,
) -> Rc<FiberCell> {
    let id = runtime.next_fiber_id(origin);
    let cell = Rc::new(FiberCell::new(id));
    let fiber = FiberRuntime {
        cell: cell.clone(),
        runtime: runtime.clone(),
        frames: Vec::new(),
        refs,
        flags,
        status: Status::Runnable,
        children: SmallVec::new(),
        epoch: 0,
        canceler: None,
        pending_exit: None,
        priority: DEFAULT_PRIORITY,
        winding_down: false,
    };
    *cell.fiber.borrow_mut() = Some(Rc::new(RefCell::new(fiber)));
    let start_cell = cell.clone();
    runtime.schedule_ready(
        Box::new(move || run_turn(&start_cell, node)),
        DEFAULT_PRIORITY,
    );
    tracing::trace!(fiber = %id, "fiber spawned");
    cell
}

/// Runs one turn of a runnable fiber. No-op if the fiber is gone, busy, or
/// not in the runnable state (a stale task).
pub(crate) fn run_turn(cell: &Rc<FiberCell>, start: Node) {
    let Some(fiber_rc) = cell.fiber.borrow().clone() else {
        return;
    };
    let Ok(mut fiber) = fiber_rc.try_borrow_mut() else {
        return;
    };
    if !matches!(fiber.status, Status::Runnable) {
        return;
    }
    fiber.turn(start);
}

/// Resume task scheduled by an async registration's callback. The epoch
/// guard discards deliveries to a suspension that has since been preempted.
fn resume_turn(cell: &Rc<FiberCell>, epoch: u64, node: Node) {
    let Some(fiber_rc) = cell.fiber.borrow().clone() else {
        return;
    };
    let Ok(mut fiber) = fiber_rc.try_borrow_mut() else {
        return;
    };
    match fiber.status {
        Status::Suspended { epoch: current } if current == epoch => {}
        _ => return,
    }
    fiber.canceler = None;
    fiber.runtime.supervisor().on_resume(cell.id);
    fiber.turn(node);
}

/// Runs the queued finalization of a fiber whose children have all ended.
fn finish_turn(cell: &Rc<FiberCell>) {
    let Some(fiber_rc) = cell.fiber.borrow().clone() else {
        return;
    };
    let Ok(mut fiber) = fiber_rc.try_borrow_mut() else {
        return;
    };
    if !matches!(fiber.status, Status::AwaitingChildren) {
        return;
    }
    if let Some(result) = fiber.pending_exit.take() {
        fiber.finish(result);
    }
}

/// Requests interruption of the fiber behind `cell`, attributed to `by`.
///
/// The first interruptor wins attribution. A fiber suspended at an
/// interruptible async boundary is preempted: its canceler (if any) runs
/// uninterruptibly and the interrupt then unwinds through its continuation
/// stack on the scheduler's interrupt lane. A running or masked fiber
/// observes the pending flag at its next interruptible step instead.
pub(crate) fn interrupt_cell(cell: &Rc<FiberCell>, by: FiberId) {
    if cell.is_done() {
        return;
    }
    if cell.pending_interrupt.get().is_none() {
        cell.pending_interrupt.set(Some(by));
    }
    let interruptor = cell.pending_interrupt.get().unwrap_or(by);
    tracing::debug!(fiber = %cell.id, by = %interruptor, "interrupt requested");
    let Some(fiber_rc) = cell.fiber.borrow().clone() else {
        return;
    };
    // A fiber interrupting itself holds its own borrow; it will observe the
    // pending flag from inside its step loop.
    let Ok(mut fiber) = fiber_rc.try_borrow_mut() else {
        return;
    };
    if !matches!(fiber.status, Status::Suspended { .. }) {
        return;
    }
    if !fiber.interruptible() {
        return;
    }
    fiber.winding_down = true;
    fiber.epoch += 1;
    let cause = ECause::Interrupt(interruptor);
    let resume = match fiber.canceler.take() {
        Some(canceler) => {
            let canceler = Node::UpdateFlags(
                crate::fiber::flags::FlagsPatch::disable(
                    crate::fiber::flags::RuntimeFlag::Interruption,
                ),
                Box::new(canceler),
            );
            let fail_cause = cause.clone();
            Node::Fold {
                inner: Box::new(canceler),
                on_failure: Box::new(move |cancel_cause| {
                    Node::fail_cause(cause.then(cancel_cause))
                }),
                on_success: Box::new(move |_| Node::fail_cause(fail_cause)),
            }
        }
        None => Node::fail_cause(cause),
    };
    fiber.status = Status::Runnable;
    let task_cell = cell.clone();
    let priority = fiber.priority;
    fiber.runtime.schedule_interrupt_lane(
        Box::new(move || run_turn(&task_cell, resume)),
        priority,
    );
}

impl FiberRuntime {
    fn interruptible(&self) -> bool {
        self.flags.interruption() && !self.flags.wind_down() && !self.winding_down
    }

    /// One scheduler turn: trampoline until suspension, yield, or exit.
    fn turn(&mut self, start: Node) {
        self.status = Status::Running;
        let mut ops: u32 = 0;
        let mut step = Step::Node(start);
        loop {
            if ops > 0
                && self.flags.cooperative_yielding()
                && self.runtime.scheduler_should_yield(ops)
            {
                let node = match step {
                    Step::Node(node) => node,
                    Step::Value(value) => Node::Succeed(value),
                    Step::Cause(cause) => Node::fail_cause(cause),
                };
                self.reschedule(node);
                return;
            }
            ops += 1;
            if let Some(by) = self.cell.pending_interrupt.get() {
                let already_failing =
                    matches!(step, Step::Cause(_)) || matches!(step, Step::Node(Node::Fail(_)));
                if !already_failing && self.interruptible() {
                    // One-shot: the fiber is winding down from here on, and
                    // the finalizers the unwind produces run unimpeded.
                    self.winding_down = true;
                    step = Step::Cause(Cause::Interrupt(by));
                }
            }
            step = match step {
                Step::Node(node) => match node {
                    Node::Succeed(value) => Step::Value(value),
                    Node::SucceedWith(thunk) => {
                        match catch_unwind(AssertUnwindSafe(thunk)) {
                            Ok(value) => Step::Value(value),
                            Err(panic) => Step::Cause(Cause::Die(Defect::from_panic(panic))),
                        }
                    }
                    Node::Fail(thunk) => match catch_unwind(AssertUnwindSafe(thunk)) {
                        Ok(cause) => Step::Cause(cause),
                        Err(panic) => Step::Cause(Cause::Die(Defect::from_panic(panic))),
                    },
                    Node::OnSuccess(inner, k) => {
                        self.frames.push(Frame::OnSuccess(k));
                        Step::Node(*inner)
                    }
                    Node::OnFailure(inner, k) => {
                        self.frames.push(Frame::OnFailure(k));
                        Step::Node(*inner)
                    }
                    Node::Fold {
                        inner,
                        on_failure,
                        on_success,
                    } => {
                        self.frames.push(Frame::Fold {
                            on_failure,
                            on_success,
                        });
                        Step::Node(*inner)
                    }
                    Node::UpdateFlags(patch, inner) => {
                        self.frames.push(Frame::RestoreFlags(self.flags));
                        self.flags = self.flags.patch(patch);
                        Step::Node(*inner)
                    }
                    Node::Yield => {
                        if self.flags.cooperative_yielding() {
                            self.reschedule(Node::unit());
                            return;
                        }
                        Step::Value(Box::new(()))
                    }
                    Node::Stateful(f) => {
                        let mut view = FiberView { fiber: &mut *self };
                        match catch_unwind(AssertUnwindSafe(move || f(&mut view))) {
                            Ok(next) => Step::Node(next),
                            Err(panic) => Step::Cause(Cause::Die(Defect::from_panic(panic))),
                        }
                    }
                    Node::Async(register) => {
                        self.epoch += 1;
                        let epoch = self.epoch;
                        self.status = Status::Suspended { epoch };
                        self.runtime.supervisor().on_suspend(self.cell.id);
                        let resume_cell = self.cell.clone();
                        let resume_runtime = self.runtime.clone();
                        let priority = self.priority;
                        let resume = ResumeErased::new(Rc::new(move |node: Node| {
                            let cell = resume_cell.clone();
                            resume_runtime.schedule_ready(
                                Box::new(move || resume_turn(&cell, epoch, node)),
                                priority,
                            );
                        }));
                        match catch_unwind(AssertUnwindSafe(move || register(resume))) {
                            Ok(canceler) => {
                                self.canceler = canceler;
                                return;
                            }
                            Err(panic) => {
                                self.status = Status::Running;
                                self.epoch += 1;
                                Step::Cause(Cause::Die(Defect::from_panic(panic)))
                            }
                        }
                    }
                },
                Step::Value(value) => match self.frames.pop() {
                    None => {
                        self.complete(Ok(value));
                        return;
                    }
                    Some(Frame::OnSuccess(k)) => run_value_cont(k, value),
                    Some(Frame::OnFailure(_)) => Step::Value(value),
                    Some(Frame::Fold { on_success, .. }) => run_value_cont(on_success, value),
                    Some(Frame::RestoreFlags(flags)) => {
                        self.flags = flags;
                        Step::Value(value)
                    }
                },
                Step::Cause(cause) => match self.frames.pop() {
                    None => {
                        self.complete(Err(cause));
                        return;
                    }
                    Some(Frame::OnSuccess(_)) => Step::Cause(cause),
                    Some(Frame::OnFailure(k)) => run_cause_cont(k, cause),
                    Some(Frame::Fold { on_failure, .. }) => run_cause_cont(on_failure, cause),
                    Some(Frame::RestoreFlags(flags)) => {
                        self.flags = flags;
                        Step::Cause(cause)
                    }
                },
            };
        }
    }

    fn reschedule(&mut self, node: Node) {
        self.status = Status::Runnable;
        let cell = self.cell.clone();
        self.runtime.schedule_ready(
            Box::new(move || run_turn(&cell, node)),
            self.priority,
        );
    }

    /// The fiber's own tree is fully evaluated. Live children are
    /// interrupted and awaited before the exit becomes observable, so a
    /// parent's extent always outlives its (non-daemon) children.
    fn complete(&mut self, result: Result<AnyValue, ECause>) {
        self.children.retain(|child| !child.is_done());
        if self.children.is_empty() {
            self.finish(result);
            return;
        }
        let own_id = self.cell.id;
        for child in &self.children {
            interrupt_cell(child, own_id);
        }
        self.pending_exit = Some(result);
        self.status = Status::AwaitingChildren;
        let remaining = Rc::new(Cell::new(self.children.len()));
        for child in self.children.clone() {
            let remaining = remaining.clone();
            let cell = self.cell.clone();
            let runtime = self.runtime.clone();
            let priority = self.priority;
            child.subscribe(Box::new(move || {
                remaining.set(remaining.get() - 1);
                if remaining.get() == 0 {
                    runtime.schedule_ready(Box::new(move || finish_turn(&cell)), priority);
                }
            }));
        }
    }

    /// Seals the exit. An interrupted fiber never reports success: the
    /// pending interruption overrides a success and is appended to any
    /// cause that does not already record it.
    fn finish(&mut self, result: Result<AnyValue, ECause>) {
        let result = match self.cell.pending_interrupt.get() {
            Some(by) => match result {
                Ok(_) => Err(Cause::Interrupt(by)),
                Err(cause) if cause.is_interrupted() => Err(cause),
                Err(cause) => Err(cause.then(Cause::Interrupt(by))),
            },
            None => result,
        };
        let outcome = match &result {
            Ok(_) => FiberOutcome::Succeeded,
            Err(cause) if cause.is_interrupted_only() => FiberOutcome::Interrupted,
            Err(cause) if cause.failure_option().is_some() => FiberOutcome::Failed,
            Err(_) => FiberOutcome::Died,
        };
        let stored = match result {
            Ok(value) => StoredExit::Success(RefCell::new(Some(value))),
            Err(cause) => StoredExit::Failure(cause),
        };
        *self.cell.exit.borrow_mut() = Some(stored);
        *self.cell.final_refs.borrow_mut() = Some(std::mem::take(&mut self.refs));
        self.frames.clear();
        self.status = Status::Done;
        tracing::trace!(fiber = %self.cell.id, outcome = ?outcome, "fiber completed");
        self.runtime.supervisor().on_end(self.cell.id, outcome);
        *self.cell.fiber.borrow_mut() = None;
        let observers = std::mem::take(&mut *self.cell.observers.borrow_mut());
        for observer in observers {
            observer();
        }
    }
}

/// The window a [`Node::Stateful`] step gets into its executing fiber.
pub(crate) struct FiberView<'a> {
    fiber: &'a mut FiberRuntime,
}

impl FiberView<'_> {
    pub(crate) fn id(&self) -> FiberId {
        self.fiber.cell.id
    }

    pub(crate) fn flags(&self) -> RuntimeFlags {
        self.fiber.flags
    }

    pub(crate) fn allocate_ref_id(&mut self) -> RefId {
        self.fiber.runtime.next_ref_id()
    }

    pub(crate) fn ref_get(&self, r: &ErasedFiberRef) -> Rc<dyn Any> {
        self.fiber.refs.get(r)
    }

    pub(crate) fn ref_set(&mut self, r: &ErasedFiberRef, value: Rc<dyn Any>) {
        self.fiber.refs.set(r, value);
    }

    /// Merges a joined child's final ref store into this fiber's.
    pub(crate) fn merge_refs(&mut self, refs: FiberRefs) -> Result<(), crate::error::RuntimeError> {
        self.fiber.refs.merge_child(refs)
    }

    /// Forks `node` onto a new fiber. Non-daemon children are tied to this
    /// fiber's extent; daemons are parented to the runtime root. Children
    /// always start interruptible, even when forked inside a mask.
    pub(crate) fn fork(&mut self, node: Node, daemon: bool) -> Rc<FiberCell> {
        let flags = self
            .fiber
            .flags
            .enable(crate::fiber::flags::RuntimeFlag::Interruption);
        let child = spawn_fiber(
            &self.fiber.runtime,
            node,
            self.fiber.refs.fork_child(),
            flags,
            None,
        );
        if daemon {
            self.fiber.runtime.adopt_root_child(child.clone());
        } else {
            self.fiber.children.push(child.clone());
        }
        self.fiber
            .runtime
            .supervisor()
            .on_fork(self.fiber.cell.id, child.id());
        child
    }

    /// Requests interruption of another fiber, attributed to this one.
    pub(crate) fn interrupt_cell(&mut self, cell: &Rc<FiberCell>) {
        interrupt_cell(cell, self.fiber.cell.id);
    }
}

fn run_value_cont(k: Box<dyn FnOnce(AnyValue) -> Node>, value: AnyValue) -> Step {
    match catch_unwind(AssertUnwindSafe(move || k(value))) {
        Ok(node) => Step::Node(node),
        Err(panic) => Step::Cause(Cause::Die(Defect::from_panic(panic))),
    }
}

fn run_cause_cont(k: Box<dyn FnOnce(ECause) -> Node>, cause: ECause) -> Step {
    match catch_unwind(AssertUnwindSafe(move || k(cause))) {
        Ok(node) => Step::Node(node),
        Err(panic) => Step::Cause(Cause::Die(Defect::from_panic(panic))),
    }
}
