//! A preemptive priority kernel for dual-core microcontrollers.
//!
//! Each core runs its own strict-priority scheduler. Tasks never migrate
//! between cores. Every synchronization primitive is bound to a core: its
//! waiters live in an intrusive, priority-ordered wait list protected by that
//! core's kernel lock. The cores only talk through the doorbell interrupt:
//! [`Event`]'s signalled flags, and each core's control channel, which
//! carries the requests a task makes on another core's kernel objects and
//! is served by [`Kernel::handle_doorbell`].
//!
//! Blocking operations try a lock-free fast path first and fall back to
//! [`Kernel::critical_section`], which runs a state-transition handler
//! atomically and parks the caller if needed. They return `false` on timeout
//! (see [`TimeValue`]).
//!
//! The kernel is hardware-agnostic. A [`Port`] supplies the execution
//! contexts, the clock, interrupt masking, and the inter-core doorbell.
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![warn(rust_2018_idioms)]
#![warn(unsafe_op_in_unsafe_fn)]

extern crate alloc;

use core::sync::atomic::{AtomicBool, Ordering};

mod cfg;
mod condvar;
mod error;
mod event;
mod klock;
mod mutex;
mod queue;
mod semaphore;
mod state;
mod task;
mod time;
mod timeout;
mod utils;
mod wait;

#[cfg(test)]
mod test_port;

pub use crate::{
    cfg::{
        KernelBuilder, KernelCfg, Priority, CONTROL_CHANNEL_LEN, DEFAULT_TICK_PERIOD_US,
        MAX_EVENTS_PER_CORE, MAX_TASKS_PER_CORE, NUM_CORES, NUM_PRIORITY_LEVELS,
    },
    condvar::ConditionVar,
    error::{ActivateTaskError, CreateTaskError, ResultCode},
    event::Event,
    klock::CriticalSection,
    mutex::Mutex,
    queue::Queue,
    semaphore::Semaphore,
    task::{CoreId, TaskId, TaskState},
    time::{Deadline, TimeValue},
};

/// The services the kernel needs from the platform.
///
/// Every task is backed by an execution context (a thread of execution with
/// its own stack) that the port can suspend and resume. The kernel decides
/// which task owns each core; the port only has to make the backing contexts
/// follow that decision.
pub trait Port: Send + Sync + 'static {
    /// Get the core executing the caller.
    fn current_core(&self) -> CoreId;

    /// Get the task whose context is executing the caller. `None` in an
    /// interrupt or boot context.
    fn current_task(&self) -> Option<TaskId>;

    /// Get the monotonic time in microseconds since boot.
    fn now(&self) -> u64;

    /// Disable the tick and doorbell interrupts of the current core. Calls
    /// are paired with [`Self::unmask_interrupts`].
    fn mask_interrupts(&self);

    fn unmask_interrupts(&self);

    /// Suspend the calling context, which backs `task`, until
    /// [`Self::notify_dispatch`] is called for `task`. May return spuriously.
    fn wait_for_dispatch(&self, task: TaskId);

    /// `task` has become the current task of its core. Resume its context.
    fn notify_dispatch(&self, task: TaskId);

    /// `task` was the current task of its core and has been preempted by an
    /// interrupt or by a task of another core. Stop its context before the
    /// accompanying [`Self::notify_dispatch`] takes effect; it may resume
    /// once `task` is dispatched again.
    ///
    /// A port that can't stop a context from the outside may leave this
    /// empty, in which case the preempted task stops at its next kernel
    /// call.
    fn notify_preempt(&self, task: TaskId);

    /// Raise the inter-core doorbell interrupt of `core`, which must end up
    /// calling [`Kernel::handle_doorbell`] on that core.
    fn ring_doorbell(&self, core: CoreId);
}

/// The kernel: the scheduler of every core plus the port driving them.
///
/// Synchronization primitives don't hold a reference to the kernel. Every
/// operation takes it as a parameter instead.
pub struct Kernel<P> {
    port: P,
    cfg: KernelCfg,
    cores: [klock::Core; NUM_CORES],
    started: AtomicBool,
}

impl<P: Port> Kernel<P> {
    /// Construct a kernel with the default configuration.
    pub fn new(port: P) -> Self {
        Self::build().finish(port)
    }

    /// Start configuring a kernel.
    pub const fn build() -> KernelBuilder<P> {
        KernelBuilder::new()
    }

    pub(crate) fn with_cfg(port: P, cfg: KernelCfg) -> Self {
        Self {
            port,
            cfg,
            cores: core::array::from_fn(|i| match CoreId::new(i) {
                Some(id) => klock::Core::new(id),
                None => unreachable!(),
            }),
            started: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn port(&self) -> &P {
        &self.port
    }

    #[inline]
    pub fn cfg(&self) -> &KernelCfg {
        &self.cfg
    }

    #[inline]
    pub(crate) fn core(&self, core: CoreId) -> &klock::Core {
        &self.cores[core.index()]
    }

    /// Dispatch the highest-priority ready task on every core. Tasks
    /// activated before this call don't run until then, and ticks are
    /// ignored.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            log::warn!("the kernel has already been started");
            return;
        }

        log::debug!("starting the kernel");

        for core in CoreId::ALL {
            let switch = self.core(core).lock(&self.port, |st| st.preempt_switch());
            self.apply_switch(switch);
        }
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Get the task executing the caller.
    #[inline]
    pub fn current_task(&self) -> Option<TaskId> {
        self.port.current_task()
    }

    /// Get the time in microseconds since boot.
    #[inline]
    pub fn now(&self) -> u64 {
        self.port.now()
    }

    #[track_caller]
    pub(crate) fn expect_task_context(&self) -> TaskId {
        match self.port.current_task() {
            Some(task) => {
                debug_assert_eq!(
                    task.core(),
                    self.port.current_core(),
                    "{:?} is executing on a foreign core",
                    task
                );
                task
            }
            None => panic!("this operation requires a task context"),
        }
    }
}
