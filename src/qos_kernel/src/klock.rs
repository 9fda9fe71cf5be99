//! Kernel state locking mechanism and the critical-section engine
use arrayvec::ArrayVec;
use core::{
    cell::UnsafeCell,
    fmt,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
};

use crate::{
    cfg::{CONTROL_CHANNEL_LEN, MAX_EVENTS_PER_CORE},
    event::Event,
    state::CoreState,
    task::{CoreId, TaskId, TaskState},
    time::Deadline,
    timeout,
    wait::WaitQueue,
    Kernel, Port,
};

/// Cell type that can only be accessed by presenting the [`CoreState`] of the
/// core it belongs to, i.e., while holding that core's kernel lock.
pub(crate) struct CoreLockCell<T> {
    core: CoreId,
    value: UnsafeCell<T>,
}

// Safety: The contents are only accessed through `&CoreState`/`&mut
// CoreState` of `core`, which only exist while its kernel lock is held.
unsafe impl<T: Send> Sync for CoreLockCell<T> {}

impl<T: Copy> CoreLockCell<T> {
    pub(crate) const fn new(core: CoreId, x: T) -> Self {
        Self {
            core,
            value: UnsafeCell::new(x),
        }
    }

    #[inline]
    pub(crate) const fn core(&self) -> CoreId {
        self.core
    }

    #[inline]
    #[track_caller]
    fn check(&self, st: &CoreState) {
        assert_eq!(
            self.core, st.core,
            "a kernel object of {:?} was accessed under the lock of {:?}",
            self.core, st.core
        );
    }

    #[inline]
    #[track_caller]
    pub(crate) fn get(&self, st: &CoreState) -> T {
        self.check(st);
        // Safety: We hold the kernel lock of `self.core`
        unsafe { *self.value.get() }
    }

    #[inline]
    #[track_caller]
    pub(crate) fn set(&self, st: &mut CoreState, x: T) {
        self.check(st);
        // Safety: We hold the kernel lock of `self.core`, and `&mut` proves
        //         nobody is reading the cell
        unsafe { *self.value.get() = x };
    }
}

/// The kernel object of one core.
pub(crate) struct Core {
    state: spin::Mutex<CoreState>,

    /// Mirrors `CoreState::current` (as a raw task ID or zero) so that a task
    /// can check whether it's been dispatched without taking the lock.
    running: AtomicU32,

    /// The signalled flag of each event slot. Written by any core, consumed
    /// by the owning core.
    pub(crate) signalled: [AtomicBool; MAX_EVENTS_PER_CORE],

    /// The control channel. Other cores post here and ring the doorbell; the
    /// doorbell handler drains it. Never locked while holding `state`
    /// of another core.
    mailbox: spin::Mutex<ArrayVec<Request, CONTROL_CHANNEL_LEN>>,
}

impl Core {
    pub(crate) fn new(id: CoreId) -> Self {
        Self {
            state: spin::Mutex::new(CoreState::new(id)),
            running: AtomicU32::new(0),
            signalled: core::array::from_fn(|_| AtomicBool::new(false)),
            mailbox: spin::Mutex::new(ArrayVec::new()),
        }
    }

    /// Run `f` with the core's kernel lock held and interrupts masked.
    pub(crate) fn lock<P: Port, R>(&self, port: &P, f: impl FnOnce(&mut CoreState) -> R) -> R {
        port.mask_interrupts();
        let ret = {
            let mut st = self.state.lock();
            let ret = f(&mut st);
            self.running
                .store(st.current.map_or(0, TaskId::to_raw), Ordering::Release);
            ret
        };
        port.unmask_interrupts();
        ret
    }

    #[inline]
    pub(crate) fn is_running(&self, task: TaskId) -> bool {
        self.running.load(Ordering::Acquire) == task.to_raw()
    }

    /// Take the requests posted so far.
    pub(crate) fn take_requests(&self) -> ArrayVec<Request, CONTROL_CHANNEL_LEN> {
        core::mem::take(&mut *self.mailbox.lock())
    }
}

/// A request a core makes on a kernel object of another core, delivered
/// through the target core's control channel.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Request {
    /// `waiter`, a task of another core, waits for `event`.
    Await {
        event: &'static Event,
        waiter: TaskId,
    },
    /// `waiter` timed out waiting for `event`.
    CancelAwait {
        event: &'static Event,
        waiter: TaskId,
    },
    /// `event` was delivered to `waiter`, a task of the target core.
    Deliver {
        event: &'static Event,
        waiter: TaskId,
    },
    /// `event`'s flag was raised again by a core other than its own.
    Signal { event: &'static Event },
}

impl Request {
    /// Get the core that serves the request.
    pub(crate) fn target(&self) -> CoreId {
        match *self {
            Self::Await { event, .. }
            | Self::CancelAwait { event, .. }
            | Self::Signal { event } => event.core(),
            Self::Deliver { waiter, .. } => waiter.core(),
        }
    }
}

/// A change of a core's current task, applied through the port once the
/// kernel lock is released.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub(crate) struct Switch {
    /// The task that lost the processor without asking for it.
    pub(crate) preempted: Option<TaskId>,
    pub(crate) dispatched: Option<TaskId>,
}

/// The context passed to a critical-section handler (see
/// [`Kernel::critical_section`]).
pub struct CriticalSection<'a> {
    st: &'a mut CoreState,
    caller: TaskId,
}

impl fmt::Debug for CriticalSection<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CriticalSection")
            .field("caller", &self.caller)
            .finish_non_exhaustive()
    }
}

impl<'a> CriticalSection<'a> {
    pub(crate) fn new(st: &'a mut CoreState, caller: TaskId) -> Self {
        Self { st, caller }
    }

    /// Get the task that entered the critical section.
    #[inline]
    pub fn current_task(&self) -> TaskId {
        self.caller
    }

    #[inline]
    pub fn core(&self) -> CoreId {
        self.st.core
    }

    /// Set the value [`Kernel::critical_section`] returns to the caller.
    #[inline]
    pub fn set_current_result(&mut self, result: bool) {
        let caller = self.caller;
        self.set_result(caller, result);
    }

    /// Set the value the blocking call of `task` returns once it resumes.
    #[inline]
    pub fn set_result(&mut self, task: TaskId, result: bool) {
        self.st.task_mut(task).sync_result = result;
    }

    #[inline]
    pub(crate) fn state(&mut self) -> &mut CoreState {
        &mut *self.st
    }

    /// Park the caller on `queue` (if any) until woken or until `deadline`.
    pub(crate) fn block_current(
        &mut self,
        queue: Option<&'static WaitQueue>,
        deadline: Deadline,
    ) -> TaskState {
        debug_assert_ne!(deadline, Deadline::Poll);
        if let Some(queue) = queue {
            queue.insert(self.st, self.caller);
        }
        if let Deadline::At(at) = deadline {
            timeout::insert(self.st, self.caller, at);
        }
        TaskState::SyncBlocked
    }

    /// Make a blocked task ready. Returns whether it outranks the caller, in
    /// which case the handler should return [`TaskState::Ready`].
    #[inline]
    pub(crate) fn ready_task(&mut self, task: TaskId) -> bool {
        self.st.make_ready(task)
    }
}

impl<P: Port> Kernel<P> {
    /// Run `handler` atomically with respect to interrupts and the other
    /// core, then apply the [`TaskState`] it returns to the calling task.
    ///
    /// Returns the calling task's result slot, which starts as `false` and
    /// may be set by the handler ([`CriticalSection::set_current_result`]) or,
    /// if the caller blocked, by whoever wakes it up.
    ///
    /// Must be called from a task context.
    pub fn critical_section<F>(&self, handler: F) -> bool
    where
        F: FnOnce(&mut CriticalSection<'_>) -> TaskState,
    {
        let caller = self.expect_task_context();

        let dispatched = self.enter(caller, |st| {
            st.task_mut(caller).sync_result = false;
            let next = handler(&mut CriticalSection::new(st, caller));
            if next != TaskState::Running {
                log::trace!("{:?} leaves a critical section as {:?}", caller, next);
            }
            st.resolve(caller, next)
        });

        if let Some(task) = dispatched {
            self.port().notify_dispatch(task);
        }

        self.wait_until_dispatched(caller);

        self.core(caller.core())
            .lock(self.port(), |st| st.task(caller).sync_result)
    }

    /// Run `f` under the kernel lock of the caller's core once `caller` is the
    /// core's current task, waiting for dispatch first if it was preempted.
    /// The requests `f` posts are sent after the lock is released.
    pub(crate) fn enter<R>(&self, caller: TaskId, f: impl FnOnce(&mut CoreState) -> R) -> R {
        let core = self.core(caller.core());
        let mut f = Some(f);
        loop {
            let ret = core.lock(self.port(), |st| {
                if st.current != Some(caller) {
                    return None;
                }
                f.take().map(|f| (f(st), st.take_outbox()))
            });
            match ret {
                Some((x, outbox)) => {
                    self.send_requests(outbox);
                    return x;
                }
                None => self.wait_until_dispatched(caller),
            }
        }
    }

    /// Run `f` under the kernel lock of `core` from an interrupt context, then
    /// preempt the current task if a higher-priority task became ready.
    pub(crate) fn interrupt_section<R>(
        &self,
        core: CoreId,
        f: impl FnOnce(&mut CoreState) -> R,
    ) -> R {
        let (ret, switch, outbox) = self.core(core).lock(self.port(), |st| {
            let ret = f(st);
            (ret, st.preempt_switch(), st.take_outbox())
        });
        self.send_requests(outbox);
        self.apply_switch(switch);
        ret
    }

    /// Tell the port about a change of a core's current task. The caller
    /// can't be stopped between the two notifications.
    pub(crate) fn apply_switch(&self, switch: Switch) {
        self.port().mask_interrupts();
        if let Some(task) = switch.preempted {
            // A task preempted by its own call waits by itself
            if self.port().current_task() != Some(task) {
                log::trace!("{:?} is preempted", task);
                self.port().notify_preempt(task);
            }
        }
        if let Some(task) = switch.dispatched {
            self.port().notify_dispatch(task);
        }
        self.port().unmask_interrupts();
    }

    /// Post `requests` to the control channels of their target cores and
    /// ring their doorbells.
    ///
    /// # Panics
    ///
    /// Panics if a control channel overflows.
    pub(crate) fn send_requests(&self, requests: impl IntoIterator<Item = Request>) {
        for request in requests {
            let target = request.target();
            log::trace!("posting {:?}", request);

            self.port().mask_interrupts();
            let posted = self.core(target).mailbox.lock().try_push(request).is_ok();
            if posted {
                self.port().ring_doorbell(target);
            }
            self.port().unmask_interrupts();

            assert!(posted, "the control channel of {:?} is full", target);
        }
    }

    /// Get the calling task once it's the current task of its core. Lock-free
    /// fast paths start here so that a preempted task doesn't touch a kernel
    /// object while another task of its core runs.
    #[track_caller]
    pub(crate) fn dispatched_caller(&self) -> TaskId {
        let caller = self.expect_task_context();
        self.wait_until_dispatched(caller);
        caller
    }

    /// Block the context backing `task` until `task` is its core's current
    /// task. Used by ports to hold a newly spawned task until it's
    /// dispatched.
    pub fn wait_until_dispatched(&self, task: TaskId) {
        let core = self.core(task.core());
        while !core.is_running(task) {
            self.port().wait_for_dispatch(task);
        }
    }
}
