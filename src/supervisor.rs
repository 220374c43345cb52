//! Fiber lifecycle observation hooks.
//!
//! A [`Supervisor`] receives callbacks as fibers fork, suspend, resume, and
//! end. Every hook has an empty default body, so implementors override only
//! what they observe. The runtime installs [`NoopSupervisor`] unless
//! configured otherwise.

use crate::fiber::id::FiberId;

/// How a fiber's execution ended, as reported to supervisors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberOutcome {
    /// Completed with a value.
    Succeeded,
    /// Completed with a typed error.
    Failed,
    /// Completed with an interrupt-only cause.
    Interrupted,
    /// Completed with a defect.
    Died,
}

/// Observer of fiber lifecycle events.
///
/// Hooks run synchronously on the runtime's logical thread, between fiber
/// turns. They must not block.
pub trait Supervisor {
    /// A fiber forked a child.
    fn on_fork(&self, parent: FiberId, child: FiberId) {
        let _ = (parent, child);
    }

    /// A fiber reached a terminal exit.
    fn on_end(&self, fiber: FiberId, outcome: FiberOutcome) {
        let _ = (fiber, outcome);
    }

    /// A fiber suspended at an asynchronous boundary or yield point.
    fn on_suspend(&self, fiber: FiberId) {
        let _ = fiber;
    }

    /// A suspended fiber was rescheduled.
    fn on_resume(&self, fiber: FiberId) {
        let _ = fiber;
    }
}

/// The default supervisor: observes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSupervisor;

impl Supervisor for NoopSupervisor {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recording {
        events: RefCell<Vec<String>>,
    }

    impl Supervisor for Recording {
        fn on_fork(&self, parent: FiberId, child: FiberId) {
            self.events.borrow_mut().push(format!("fork {parent}->{child}"));
        }

        fn on_end(&self, fiber: FiberId, outcome: FiberOutcome) {
            self.events
                .borrow_mut()
                .push(format!("end {fiber} {outcome:?}"));
        }
    }

    #[test]
    fn default_hooks_are_noops() {
        let sup = NoopSupervisor;
        sup.on_fork(FiberId::NONE, FiberId::NONE);
        sup.on_end(FiberId::NONE, FiberOutcome::Succeeded);
        sup.on_suspend(FiberId::NONE);
        sup.on_resume(FiberId::NONE);
    }

    #[test]
    fn overridden_hooks_fire() {
        let sup = Recording::default();
        sup.on_end(FiberId::NONE, FiberOutcome::Interrupted);
        // Unoverridden hook stays silent.
        sup.on_suspend(FiberId::NONE);
        let events = sup.events.borrow();
        assert_eq!(events.len(), 1);
        assert!(events[0].contains("Interrupted"));
    }
}
