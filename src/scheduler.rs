//! The cooperative scheduler contract and default implementation.
//!
//! The interpreter hands the scheduler opaque tasks (a task is one fiber
//! turn) and consults [`Scheduler::should_yield`] as it counts synchronous
//! steps, which bounds how long one fiber can monopolize the host's logical
//! thread.
//!
//! The default [`QueueScheduler`] uses two lanes: the interrupt lane (fibers
//! resuming to observe a pending interrupt, always drained first, so
//! cancellation is never starved by ready work) and the ready lane. Within a
//! lane, tasks are ordered by priority, stable for equal priorities.

use std::cell::RefCell;
use std::collections::VecDeque;

/// One unit of scheduler work: a single fiber turn.
pub type Task = Box<dyn FnOnce()>;

/// A host-provided task-queue abstraction.
///
/// Implementations are single-threaded: the runtime drives `next_task` from
/// one logical thread and tasks never run re-entrantly.
pub trait Scheduler {
    /// Enqueues a task on the ready lane.
    fn schedule_task(&self, task: Task, priority: u8);

    /// Enqueues a task on the interrupt lane, drained before ready work.
    fn schedule_interrupt(&self, task: Task, priority: u8);

    /// Dequeues the next task to run, if any.
    fn next_task(&self) -> Option<Task>;

    /// Returns true if a fiber that has executed `ops` synchronous steps
    /// this turn should yield back to the scheduler.
    fn should_yield(&self, ops: u32) -> bool;

    /// Returns true if any task is queued.
    fn has_work(&self) -> bool;
}

struct Entry {
    task: Task,
    priority: u8,
}

/// Higher priority first; stable for equal priorities (inserts after
/// existing equals).
fn insert_by_priority(lane: &mut VecDeque<Entry>, entry: Entry) {
    let pos = lane
        .iter()
        .position(|e| entry.priority > e.priority)
        .unwrap_or(lane.len());
    lane.insert(pos, entry);
}

/// The default two-lane, priority-ordered scheduler.
pub struct QueueScheduler {
    interrupt_lane: RefCell<VecDeque<Entry>>,
    ready_lane: RefCell<VecDeque<Entry>>,
    op_budget: u32,
}

impl QueueScheduler {
    /// Creates a scheduler with the given per-turn op budget.
    #[must_use]
    pub fn new(op_budget: u32) -> Self {
        Self {
            interrupt_lane: RefCell::new(VecDeque::new()),
            ready_lane: RefCell::new(VecDeque::new()),
            op_budget: op_budget.max(1),
        }
    }

    /// Returns the number of queued tasks across both lanes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.interrupt_lane.borrow().len() + self.ready_lane.borrow().len()
    }

    /// Returns true if no tasks are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Scheduler for QueueScheduler {
    fn schedule_task(&self, task: Task, priority: u8) {
        insert_by_priority(&mut self.ready_lane.borrow_mut(), Entry { task, priority });
    }

    fn schedule_interrupt(&self, task: Task, priority: u8) {
        insert_by_priority(
            &mut self.interrupt_lane.borrow_mut(),
            Entry { task, priority },
        );
    }

    fn next_task(&self) -> Option<Task> {
        let entry = self
            .interrupt_lane
            .borrow_mut()
            .pop_front()
            .or_else(|| self.ready_lane.borrow_mut().pop_front())?;
        Some(entry.task)
    }

    fn should_yield(&self, ops: u32) -> bool {
        ops >= self.op_budget
    }

    fn has_work(&self) -> bool {
        !self.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recorder(log: &Rc<RefCell<Vec<u32>>>, n: u32) -> Task {
        let log = log.clone();
        Box::new(move || log.borrow_mut().push(n))
    }

    fn drain(sched: &QueueScheduler) {
        while let Some(task) = sched.next_task() {
            task();
        }
    }

    #[test]
    fn interrupt_lane_drains_first() {
        let sched = QueueScheduler::new(128);
        let log = Rc::new(RefCell::new(Vec::new()));

        sched.schedule_task(recorder(&log, 1), 200);
        sched.schedule_interrupt(recorder(&log, 2), 0);

        drain(&sched);
        assert_eq!(*log.borrow(), vec![2, 1]);
    }

    #[test]
    fn priority_orders_within_a_lane() {
        let sched = QueueScheduler::new(128);
        let log = Rc::new(RefCell::new(Vec::new()));

        sched.schedule_task(recorder(&log, 1), 10);
        sched.schedule_task(recorder(&log, 2), 200);
        sched.schedule_task(recorder(&log, 3), 10);

        drain(&sched);
        assert_eq!(*log.borrow(), vec![2, 1, 3]);
    }

    #[test]
    fn equal_priority_is_fifo() {
        let sched = QueueScheduler::new(128);
        let log = Rc::new(RefCell::new(Vec::new()));

        for n in 1..=4 {
            sched.schedule_task(recorder(&log, n), 100);
        }
        drain(&sched);
        assert_eq!(*log.borrow(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn should_yield_trips_at_budget() {
        let sched = QueueScheduler::new(64);
        assert!(!sched.should_yield(63));
        assert!(sched.should_yield(64));
        assert!(sched.should_yield(65));
    }

    #[test]
    fn zero_budget_is_clamped() {
        let sched = QueueScheduler::new(0);
        assert!(!sched.should_yield(0));
        assert!(sched.should_yield(1));
    }

    #[test]
    fn has_work_tracks_queue_state() {
        let sched = QueueScheduler::new(128);
        assert!(!sched.has_work());
        sched.schedule_task(Box::new(|| {}), 100);
        assert!(sched.has_work());
        drain(&sched);
        assert!(!sched.has_work());
    }
}
