//! Condition variables
use alloc::boxed::Box;
use core::fmt;

use crate::{
    klock::CriticalSection,
    mutex::{pack, Mutex, MutexState},
    task::TaskState,
    time::{Deadline, TimeValue},
    timeout,
    wait::WaitQueue,
    Kernel, Port,
};

/// A condition variable paired with a [`Mutex`] of the same core.
///
/// Releasing the mutex and joining the wait list happen in one critical
/// section, and so do signalling and releasing, so no wakeup can slip in
/// between. A signalled waiter is moved to the mutex's wait list rather than
/// woken, and resumes only once the mutex has been handed to it.
pub struct ConditionVar {
    mutex: &'static Mutex,
    wait_queue: WaitQueue,
}

impl ConditionVar {
    pub const fn new(mutex: &'static Mutex) -> Self {
        Self {
            mutex,
            wait_queue: WaitQueue::new(mutex.core()),
        }
    }

    #[inline]
    pub fn mutex(&self) -> &'static Mutex {
        self.mutex
    }

    /// Acquire the associated mutex.
    #[inline]
    pub fn acquire<P: Port>(&'static self, kernel: &Kernel<P>, timeout: TimeValue) -> bool {
        self.mutex.acquire(kernel, timeout)
    }

    /// Release the associated mutex without signalling.
    #[inline]
    pub fn release<P: Port>(&'static self, kernel: &Kernel<P>) {
        self.mutex.release(kernel);
    }

    /// Atomically release the associated mutex (which the caller must own)
    /// and wait until signalled or until `timeout` elapses.
    ///
    /// Returns `true` once signalled and the mutex has been handed back to
    /// the caller. Returns `false` on timeout, in which case the caller does
    /// **not** own the mutex.
    pub fn wait<P: Port>(&'static self, kernel: &Kernel<P>, timeout: TimeValue) -> bool {
        debug_assert!(self.mutex.owns(kernel), "condvar wait without owning the mutex");

        let deadline = timeout.to_deadline(kernel.now());
        debug_assert_ne!(deadline, Deadline::Poll, "condvar wait can't poll");

        kernel.critical_section(|cs| self.wait_critical(cs, deadline))
    }

    pub(crate) fn wait_critical(
        &'static self,
        cs: &mut CriticalSection<'_>,
        deadline: Deadline,
    ) -> TaskState {
        // The caller blocks regardless of whether the handoff outranks it
        let _ = self.mutex.release_critical(cs);
        cs.block_current(Some(&self.wait_queue), deadline)
    }

    /// Move the highest-priority waiter to the mutex's wait list, then
    /// release the mutex.
    pub fn release_and_signal<P: Port>(&'static self, kernel: &Kernel<P>) {
        debug_assert!(self.mutex.owns(kernel), "condvar signal without owning the mutex");
        kernel.critical_section(|cs| self.release_and_signal_critical(cs, false));
    }

    /// Move every waiter to the mutex's wait list, then release the mutex.
    pub fn release_and_broadcast<P: Port>(&'static self, kernel: &Kernel<P>) {
        debug_assert!(self.mutex.owns(kernel), "condvar broadcast without owning the mutex");
        kernel.critical_section(|cs| self.release_and_signal_critical(cs, true));
    }

    pub(crate) fn release_and_signal_critical(
        &'static self,
        cs: &mut CriticalSection<'_>,
        broadcast: bool,
    ) -> TaskState {
        let caller = cs.current_task();

        while let Some(task) = self.wait_queue.pop_front(cs.state()) {
            self.mutex.wait_queue.insert(cs.state(), task);
            timeout::remove(cs.state(), task);
            self.mutex
                .set_word(pack(Some(caller), MutexState::AcquiredContended));

            if !broadcast {
                break;
            }
        }

        self.mutex.release_critical(cs)
    }

    /// Get the number of tasks waiting on the condition variable (excluding
    /// those already moved to the mutex).
    pub fn num_waiting_tasks<P: Port>(&self, kernel: &Kernel<P>) -> usize {
        kernel
            .core(self.mutex.core())
            .lock(kernel.port(), |st| self.wait_queue.len(st))
    }
}

impl fmt::Debug for ConditionVar {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConditionVar")
            .field("mutex", self.mutex)
            .finish_non_exhaustive()
    }
}

impl<P: Port> Kernel<P> {
    /// Allocate a condition variable paired with `mutex`. It's never freed.
    pub fn new_condvar(&self, mutex: &'static Mutex) -> &'static ConditionVar {
        Box::leak(Box::new(ConditionVar::new(mutex)))
    }
}
