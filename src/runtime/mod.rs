//! The runtime context and blocking entrypoint.
//!
//! A [`Runtime`] owns everything fibers share: the scheduler, the
//! supervisor, the fiber-id and ref-id counters, and the daemon-fiber list.
//! There is no global state; two runtimes in one process are fully
//! independent.
//!
//! [`Runtime::run`] spawns a root fiber for the given effect and drives the
//! scheduler on the calling thread until the root completes. If the task
//! queue drains while the root is still suspended, every live fiber is
//! waiting on a resumption that cannot arrive, and `run` returns a
//! [`RuntimeError::Deadlock`] defect instead of hanging.

pub mod config;

pub use config::RuntimeConfig;

use crate::cause::{Cause, Defect};
use crate::effect::{typed_exit, Effect};
use crate::error::RuntimeError;
use crate::fiber::id::FiberId;
use crate::fiber::refs::{FiberRefs, RefId};
use crate::fiber::runtime::{spawn_fiber, FiberCell};
use crate::scheduler::{QueueScheduler, Scheduler, Task};
use crate::supervisor::{NoopSupervisor, Supervisor};
use crate::Exit;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

type FatalHook = Box<dyn Fn(&Defect)>;

/// The shared state behind a [`Runtime`].
pub(crate) struct RuntimeInner {
    scheduler: Box<dyn Scheduler>,
    supervisor: Box<dyn Supervisor>,
    fiber_seq: Cell<u64>,
    ref_seq: Cell<u32>,
    root_children: RefCell<Vec<Rc<FiberCell>>>,
    start_seconds: u64,
    initial_flags: crate::fiber::flags::RuntimeFlags,
    fatal_hook: RefCell<Option<FatalHook>>,
}

impl RuntimeInner {
    pub(crate) fn next_fiber_id(
        &self,
        origin: Option<&'static core::panic::Location<'static>>,
    ) -> FiberId {
        let sequence = self.fiber_seq.get() + 1;
        self.fiber_seq.set(sequence);
        FiberId::new(sequence, self.start_seconds, origin)
    }

    pub(crate) fn next_ref_id(&self) -> RefId {
        let id = self.ref_seq.get();
        self.ref_seq.set(id + 1);
        RefId(id)
    }

    pub(crate) fn schedule_ready(&self, task: Task, priority: u8) {
        self.scheduler.schedule_task(task, priority);
    }

    pub(crate) fn schedule_interrupt_lane(&self, task: Task, priority: u8) {
        self.scheduler.schedule_interrupt(task, priority);
    }

    pub(crate) fn scheduler_should_yield(&self, ops: u32) -> bool {
        self.scheduler.should_yield(ops)
    }

    pub(crate) fn supervisor(&self) -> &dyn Supervisor {
        self.supervisor.as_ref()
    }

    /// Parents a daemon fiber to the runtime root, so it survives its
    /// forking fiber's extent.
    pub(crate) fn adopt_root_child(&self, cell: Rc<FiberCell>) {
        let mut children = self.root_children.borrow_mut();
        children.retain(|c| !c.is_done());
        children.push(cell);
    }

    fn next_task(&self) -> Option<Task> {
        self.scheduler.next_task()
    }
}

/// A single-threaded, cooperative effect runtime.
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

impl Runtime {
    /// Creates a runtime with the default configuration, scheduler, and a
    /// no-op supervisor.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Creates a runtime with the given configuration.
    #[must_use]
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_parts(
            config,
            Box::new(QueueScheduler::new(config.op_budget)),
            Box::new(NoopSupervisor),
        )
    }

    /// Creates a runtime with a custom supervisor.
    #[must_use]
    pub fn with_supervisor(config: RuntimeConfig, supervisor: Box<dyn Supervisor>) -> Self {
        Self::with_parts(
            config,
            Box::new(QueueScheduler::new(config.op_budget)),
            supervisor,
        )
    }

    /// Creates a runtime from explicit parts.
    #[must_use]
    pub fn with_parts(
        config: RuntimeConfig,
        scheduler: Box<dyn Scheduler>,
        supervisor: Box<dyn Supervisor>,
    ) -> Self {
        let start_seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            inner: Rc::new(RuntimeInner {
                scheduler,
                supervisor,
                fiber_seq: Cell::new(0),
                ref_seq: Cell::new(0),
                root_children: RefCell::new(Vec::new()),
                start_seconds,
                initial_flags: config.initial_flags,
                fatal_hook: RefCell::new(None),
            }),
        }
    }

    /// Installs a hook invoked for every defect in an uncaught root cause,
    /// leftmost first, just before [`Runtime::run`] returns.
    pub fn set_fatal_defect_hook(&self, hook: impl Fn(&Defect) + 'static) {
        *self.inner.fatal_hook.borrow_mut() = Some(Box::new(hook));
    }

    /// Runs an effect to completion on the calling thread.
    ///
    /// Drives the scheduler until the root fiber exits. Daemon fibers still
    /// queued when the root completes are abandoned. Returns a
    /// [`RuntimeError::Deadlock`] defect if no task is runnable while the
    /// root is suspended.
    #[track_caller]
    pub fn run<A: 'static, E: Any + Clone + 'static>(&self, effect: Effect<A, E>) -> Exit<A, E> {
        let origin = Some(core::panic::Location::caller());
        let root = spawn_fiber(
            &self.inner,
            effect.into_node(),
            FiberRefs::new(),
            self.inner.initial_flags,
            origin,
        );
        tracing::debug!(fiber = %root.id(), "root fiber started");
        while !root.is_done() {
            match self.inner.next_task() {
                Some(task) => task(),
                None => {
                    tracing::error!(fiber = %root.id(), "scheduler drained with root suspended");
                    let defect = RuntimeError::Deadlock { root: root.id() }.into_defect();
                    self.report_fatal_defect(&defect);
                    return Exit::Failure(Cause::Die(defect));
                }
            }
        }
        match root.exit_cause() {
            Some(cause) => {
                if let Some(cause) = &cause {
                    for defect in cause.defects() {
                        self.report_fatal_defect(defect);
                    }
                }
                typed_exit(root.take_value(), cause)
            }
            None => {
                let defect = RuntimeError::Deadlock { root: root.id() }.into_defect();
                self.report_fatal_defect(&defect);
                Exit::Failure(Cause::Die(defect))
            }
        }
    }

    fn report_fatal_defect(&self, defect: &Defect) {
        if let Some(hook) = &*self.inner.fatal_hook.borrow() {
            hook(defect);
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Runtime(fibers={}, daemons={})",
            self.inner.fiber_seq.get(),
            self.inner.root_children.borrow().len()
        )
    }
}
