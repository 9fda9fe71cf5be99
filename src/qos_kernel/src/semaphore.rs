//! Semaphores
use alloc::boxed::Box;
use core::{
    fmt,
    sync::atomic::{AtomicI32, Ordering},
};

use crate::{
    klock::CriticalSection,
    task::{CoreId, TaskState},
    time::{Deadline, TimeValue},
    wait::WaitQueue,
    Kernel, Port,
};

/// A counting semaphore bound to a core.
///
/// A waiter records how many units it needs. A release scans the wait list
/// once in priority order and wakes every waiter whose request fits in the
/// remaining count, so a large request doesn't hold up smaller ones behind
/// it.
pub struct Semaphore {
    count: AtomicI32,
    wait_queue: WaitQueue,
}

impl Semaphore {
    pub const fn new(core: CoreId, initial: i32) -> Self {
        assert!(initial >= 0, "initial count must be non-negative");
        Self {
            count: AtomicI32::new(initial),
            wait_queue: WaitQueue::new(core),
        }
    }

    #[inline]
    pub fn core(&self) -> CoreId {
        self.wait_queue.core()
    }

    /// Get the number of available units.
    #[inline]
    pub fn count(&self) -> i32 {
        self.count.load(Ordering::Acquire)
    }

    /// Take `count` units, blocking for at most `timeout` until they're
    /// available. Returns `false` on timeout, in which case nothing is taken.
    pub fn acquire<P: Port>(&'static self, kernel: &Kernel<P>, count: i32, timeout: TimeValue) -> bool {
        debug_assert!(count >= 0, "negative semaphore acquire");
        let caller = kernel.dispatched_caller();
        debug_assert_eq!(caller.core(), self.core(), "semaphore used from a foreign core");

        if self.take(count) {
            return true;
        }

        let deadline = timeout.to_deadline(kernel.now());
        if deadline == Deadline::Poll {
            return false;
        }

        kernel.critical_section(|cs| self.acquire_critical(cs, count, deadline))
    }

    /// Equivalent to `acquire(kernel, count, TimeValue::NO_BLOCKING)`.
    pub fn try_acquire<P: Port>(&'static self, kernel: &Kernel<P>, count: i32) -> bool {
        self.acquire(kernel, count, TimeValue::NO_BLOCKING)
    }

    pub(crate) fn acquire_critical(
        &'static self,
        cs: &mut CriticalSection<'_>,
        count: i32,
        deadline: Deadline,
    ) -> TaskState {
        if self.take(count) {
            cs.set_current_result(true);
            return TaskState::Running;
        }

        if deadline == Deadline::Poll {
            return TaskState::Running;
        }

        let caller = cs.current_task();
        cs.state().task_mut(caller).sync_state = count;
        cs.block_current(Some(&self.wait_queue), deadline)
    }

    /// Take `count` units if they're available. Fast-path acquirers update
    /// the count outside the kernel lock, so this is a compare-and-swap loop.
    fn take(&self, count: i32) -> bool {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
                (old >= count).then(|| old - count)
            })
            .is_ok()
    }

    /// Return `count` units and wake up the waiters they satisfy.
    ///
    /// # Panics
    ///
    /// Panics if the count would exceed `i32::MAX`.
    pub fn release<P: Port>(&'static self, kernel: &Kernel<P>, count: i32) {
        debug_assert!(count >= 0, "negative semaphore release");
        kernel.critical_section(|cs| self.release_critical(cs, count));
    }

    pub(crate) fn release_critical(&'static self, cs: &mut CriticalSection<'_>, count: i32) -> TaskState {
        let added = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
                old.checked_add(count)
            });
        assert!(added.is_ok(), "semaphore count overflow");

        let mut should_yield = false;
        let mut cursor = self.wait_queue.first_waiting_task(cs.state());
        while let Some(task) = cursor {
            cursor = self.wait_queue.next_waiting_task(cs.state(), task);

            let need = cs.state().task(task).sync_state;
            if self.take(need) {
                self.wait_queue.remove(cs.state(), task);
                cs.set_result(task, true);
                should_yield |= cs.ready_task(task);
            }
        }

        if should_yield {
            TaskState::Ready
        } else {
            TaskState::Running
        }
    }

    /// Get the number of tasks waiting for the semaphore.
    pub fn num_waiting_tasks<P: Port>(&self, kernel: &Kernel<P>) -> usize {
        kernel
            .core(self.core())
            .lock(kernel.port(), |st| self.wait_queue.len(st))
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("core", &self.core())
            .field("count", &self.count())
            .finish_non_exhaustive()
    }
}

impl<P: Port> Kernel<P> {
    /// Allocate a semaphore bound to the caller's core. It's never freed.
    pub fn new_semaphore(&self, initial: i32) -> &'static Semaphore {
        Box::leak(Box::new(Semaphore::new(self.port().current_core(), initial)))
    }
}
