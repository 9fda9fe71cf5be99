//! Mutexes
use alloc::boxed::Box;
use core::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};

use crate::{
    klock::CriticalSection,
    task::{CoreId, TaskId, TaskState},
    time::{Deadline, TimeValue},
    wait::WaitQueue,
    Kernel, Port,
};

/// The state bits (0-1) of a mutex's owner/state word.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MutexState {
    AcquiredUncontended = 0,
    Available = 1,
    /// The wait list was non-empty when ownership last changed hands, so the
    /// release must take the slow path.
    AcquiredContended = 2,
}

const STATE_MASK: u32 = 0b11;
const OWNER_SHIFT: u32 = 2;

/// The word of an unowned mutex.
const AVAILABLE: u32 = MutexState::Available as u32;

#[inline]
pub(crate) fn pack(owner: Option<TaskId>, state: MutexState) -> u32 {
    (owner.map_or(0, TaskId::to_raw) << OWNER_SHIFT) | state as u32
}

#[inline]
pub(crate) fn unpack_owner(word: u32) -> Option<TaskId> {
    TaskId::from_raw(word >> OWNER_SHIFT)
}

#[inline]
pub(crate) fn unpack_state(word: u32) -> MutexState {
    match word & STATE_MASK {
        0 => MutexState::AcquiredUncontended,
        1 => MutexState::Available,
        2 => MutexState::AcquiredContended,
        _ => unreachable!("corrupted mutex word {:#x}", word),
    }
}

/// A mutual exclusion lock bound to a core. Only the tasks of that core may
/// use it.
///
/// The owner and the state are packed into a single atomic word so that
/// uncontended acquisition and release are a single compare-and-swap each.
/// Ownership is handed directly to the highest-priority waiter on release.
/// Re-entrant locking is not supported.
pub struct Mutex {
    owner_state: AtomicU32,
    pub(crate) wait_queue: WaitQueue,
}

impl Mutex {
    pub const fn new(core: CoreId) -> Self {
        Self {
            owner_state: AtomicU32::new(AVAILABLE),
            wait_queue: WaitQueue::new(core),
        }
    }

    #[inline]
    pub const fn core(&self) -> CoreId {
        self.wait_queue.core()
    }

    /// Get the task currently owning the mutex.
    #[inline]
    pub fn owner(&self) -> Option<TaskId> {
        unpack_owner(self.owner_state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn word(&self) -> u32 {
        self.owner_state.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_word(&self, word: u32) {
        self.owner_state.store(word, Ordering::Release);
    }

    /// Get whether the calling task owns the mutex.
    pub fn owns<P: Port>(&self, kernel: &Kernel<P>) -> bool {
        kernel.current_task().is_some() && self.owner() == kernel.current_task()
    }

    /// Acquire the mutex, blocking for at most `timeout`. Returns `false` on
    /// timeout.
    pub fn acquire<P: Port>(&'static self, kernel: &Kernel<P>, timeout: TimeValue) -> bool {
        let caller = kernel.dispatched_caller();
        debug_assert_eq!(caller.core(), self.core(), "mutex used from a foreign core");
        debug_assert_ne!(self.owner(), Some(caller), "re-entrant mutex acquire");

        if self
            .owner_state
            .compare_exchange(
                AVAILABLE,
                pack(Some(caller), MutexState::AcquiredUncontended),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            return true;
        }

        let deadline = timeout.to_deadline(kernel.now());
        if deadline == Deadline::Poll {
            return false;
        }

        kernel.critical_section(|cs| self.acquire_critical(cs, deadline))
    }

    /// Equivalent to `acquire(kernel, TimeValue::NO_BLOCKING)`.
    pub fn try_acquire<P: Port>(&'static self, kernel: &Kernel<P>) -> bool {
        self.acquire(kernel, TimeValue::NO_BLOCKING)
    }

    pub(crate) fn acquire_critical(
        &'static self,
        cs: &mut CriticalSection<'_>,
        deadline: Deadline,
    ) -> TaskState {
        let caller = cs.current_task();

        // The owner may release through the fast path until the word says
        // contended, so every transition here is a compare-and-swap
        let update = self
            .owner_state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                match unpack_state(word) {
                    MutexState::Available => {
                        Some(pack(Some(caller), MutexState::AcquiredUncontended))
                    }
                    _ if deadline == Deadline::Poll => None,
                    _ => Some(pack(unpack_owner(word), MutexState::AcquiredContended)),
                }
            });

        match update {
            Ok(word) if unpack_state(word) == MutexState::Available => {
                cs.set_current_result(true);
                TaskState::Running
            }
            Ok(_) => cs.block_current(Some(&self.wait_queue), deadline),
            Err(_) => TaskState::Running,
        }
    }

    /// Release the mutex, handing it over to the highest-priority waiter if
    /// there's one. The calling task must own the mutex.
    pub fn release<P: Port>(&'static self, kernel: &Kernel<P>) {
        let caller = kernel.dispatched_caller();
        debug_assert_eq!(
            self.owner(),
            Some(caller),
            "release of a mutex not owned by the caller"
        );

        if self
            .owner_state
            .compare_exchange(
                pack(Some(caller), MutexState::AcquiredUncontended),
                AVAILABLE,
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            return;
        }

        kernel.critical_section(|cs| self.release_critical(cs));
    }

    pub(crate) fn release_critical(&'static self, cs: &mut CriticalSection<'_>) -> TaskState {
        let word = self.word();

        if unpack_state(word) != MutexState::AcquiredContended {
            self.set_word(AVAILABLE);
            return TaskState::Running;
        }

        let Some(next) = self.wait_queue.pop_front(cs.state()) else {
            // Every waiter has timed out
            self.set_word(AVAILABLE);
            return TaskState::Running;
        };

        let state = if self.wait_queue.is_empty(cs.state()) {
            MutexState::AcquiredUncontended
        } else {
            MutexState::AcquiredContended
        };
        self.set_word(pack(Some(next), state));
        cs.set_result(next, true);

        if cs.ready_task(next) {
            TaskState::Ready
        } else {
            TaskState::Running
        }
    }

    /// Get the number of tasks waiting for the mutex.
    pub fn num_waiting_tasks<P: Port>(&self, kernel: &Kernel<P>) -> usize {
        kernel
            .core(self.core())
            .lock(kernel.port(), |st| self.wait_queue.len(st))
    }
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = self.word();
        f.debug_struct("Mutex")
            .field("core", &self.core())
            .field("owner", &unpack_owner(word))
            .field("state", &unpack_state(word))
            .finish_non_exhaustive()
    }
}

impl<P: Port> Kernel<P> {
    /// Allocate a mutex bound to the caller's core. It's never freed.
    pub fn new_mutex(&self) -> &'static Mutex {
        Box::leak(Box::new(Mutex::new(self.port().current_core())))
    }
}
