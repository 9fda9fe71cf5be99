//! Events
use alloc::boxed::Box;
use core::{
    fmt, ptr,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{
    cfg::MAX_EVENTS_PER_CORE,
    klock::{CoreLockCell, CriticalSection, Request},
    state::CoreState,
    task::{CoreId, TaskId, TaskState},
    time::{Deadline, TimeValue},
    wait::WaitQueue,
    Kernel, Port,
};

/// A binary signal that can be raised from any core and awaited by one task
/// at a time.
///
/// Each event occupies a slot in its core's event table. The slot's
/// signalled flag is the only kernel state written across cores: a signal
/// from a foreign core (or an interrupt) sets the flag and rings the owning
/// core's doorbell, and [`Kernel::handle_doorbell`] hands the flag to the
/// waiter, if there's one. Signals don't accumulate.
///
/// A task of another core waits through the owning core's control channel:
/// the owning core records it as the event's remote waiter, and a delivered
/// signal travels back to the waiter's core the same way.
pub struct Event {
    slot: usize,
    wait_queue: WaitQueue,
    remote_waiter: CoreLockCell<Option<TaskId>>,
}

impl Event {
    const fn new(core: CoreId, slot: usize) -> Self {
        Self {
            slot,
            wait_queue: WaitQueue::new(core),
            remote_waiter: CoreLockCell::new(core, None),
        }
    }

    #[inline]
    pub fn core(&self) -> CoreId {
        self.wait_queue.core()
    }

    #[inline]
    fn flag<'k, P: Port>(&self, kernel: &'k Kernel<P>) -> &'k AtomicBool {
        &kernel.core(self.core()).signalled[self.slot]
    }

    /// Get whether the event is signalled and not consumed yet.
    pub fn is_signalled<P: Port>(&self, kernel: &Kernel<P>) -> bool {
        self.flag(kernel).load(Ordering::Acquire)
    }

    /// Wait for the event to be signalled and consume the signal. Returns
    /// `false` on timeout.
    ///
    /// A task of any core may wait. A pending signal is consumed on the spot;
    /// otherwise a task of another core has its wait carried out by the
    /// owning core.
    pub fn await_event<P: Port>(&'static self, kernel: &Kernel<P>, timeout: TimeValue) -> bool {
        let flag = self.flag(kernel);
        if flag.swap(false, Ordering::AcqRel) {
            return true;
        }

        let deadline = timeout.to_deadline(kernel.now());
        if deadline == Deadline::Poll {
            return false;
        }

        let caller = kernel.expect_task_context();
        if caller.core() == self.core() {
            kernel.critical_section(|cs| self.await_critical(cs, flag, deadline))
        } else {
            kernel.critical_section(|cs| self.await_remote_critical(cs, deadline))
        }
    }

    pub(crate) fn await_critical(
        &'static self,
        cs: &mut CriticalSection<'_>,
        flag: &AtomicBool,
        deadline: Deadline,
    ) -> TaskState {
        debug_assert!(
            self.wait_queue.is_empty(cs.state()),
            "an event can't have more than one waiter"
        );

        // A foreign signal may have landed since the fast path
        if flag.swap(false, Ordering::AcqRel) {
            cs.set_current_result(true);
            return TaskState::Running;
        }

        cs.block_current(Some(&self.wait_queue), deadline)
    }

    /// Block the caller, a task of another core, and ask the owning core to
    /// register it as the waiter. The flag is checked again over there.
    pub(crate) fn await_remote_critical(
        &'static self,
        cs: &mut CriticalSection<'_>,
        deadline: Deadline,
    ) -> TaskState {
        let caller = cs.current_task();
        let st = cs.state();
        debug_assert!(st.task(caller).awaiting.is_none());
        st.task_mut(caller).awaiting = Some(self);
        st.post(Request::Await {
            event: self,
            waiter: caller,
        });
        cs.block_current(None, deadline)
    }

    /// Signal the event, waking up the waiter if there's one.
    pub fn signal<P: Port>(&'static self, kernel: &Kernel<P>) {
        let local = kernel
            .current_task()
            .map_or(false, |task| task.core() == self.core());

        if local {
            let flag = self.flag(kernel);
            kernel.critical_section(|cs| self.signal_critical(cs, flag));
        } else {
            self.flag(kernel).store(true, Ordering::Release);
            kernel.port().ring_doorbell(self.core());
        }
    }

    pub(crate) fn signal_critical(
        &'static self,
        cs: &mut CriticalSection<'_>,
        flag: &AtomicBool,
    ) -> TaskState {
        if let Some(waiter) = self.wait_queue.pop_front(cs.state()) {
            cs.set_result(waiter, true);
            return if cs.ready_task(waiter) {
                TaskState::Ready
            } else {
                TaskState::Running
            };
        }

        match self.take_remote_waiter(cs.state()) {
            Some(waiter) => cs.state().post(Request::Deliver {
                event: self,
                waiter,
            }),
            None => flag.store(true, Ordering::Release),
        }
        TaskState::Running
    }

    fn take_remote_waiter(&self, st: &mut CoreState) -> Option<TaskId> {
        let waiter = self.remote_waiter.get(st);
        self.remote_waiter.set(st, None);
        waiter
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Event")
            .field("core", &self.core())
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

impl<P: Port> Kernel<P> {
    /// Allocate an event in the event table of `core` (the caller's core if
    /// `None`). It's never freed.
    ///
    /// # Panics
    ///
    /// Panics if the table already holds [`MAX_EVENTS_PER_CORE`] events.
    pub fn new_event(&self, core: Option<CoreId>) -> &'static Event {
        let core = core.unwrap_or_else(|| self.port().current_core());
        let flags = &self.core(core).signalled;

        self.core(core).lock(self.port(), |st| {
            let slot = st.events.len();
            assert!(
                slot < MAX_EVENTS_PER_CORE,
                "the event table of {:?} is full",
                core
            );

            let event: &'static Event = Box::leak(Box::new(Event::new(core, slot)));
            flags[slot].store(false, Ordering::Relaxed);
            st.events.push(event);
            log::debug!("allocated {:?}", event);
            event
        })
    }

    /// Serve the control channel of `core` and deliver the signals raised
    /// for its events from elsewhere. Called by the port's doorbell
    /// interrupt handler on `core`.
    ///
    /// A flag is consumed only if its event has a waiter; otherwise it's left
    /// for the next [`Event::await_event`].
    pub fn handle_doorbell(&self, core: CoreId) {
        if !self.is_started() {
            return;
        }

        let this = self.core(core);
        self.interrupt_section(core, |st| {
            for request in this.take_requests() {
                log::trace!("{:?}: serving {:?}", core, request);
                self.serve_request(st, request);
            }

            for slot in 0..st.events.len() {
                let event = st.events[slot];
                let has_waiter =
                    !event.wait_queue.is_empty(st) || event.remote_waiter.get(st).is_some();
                if !has_waiter || !this.signalled[slot].swap(false, Ordering::AcqRel) {
                    continue;
                }

                if let Some(waiter) = event.wait_queue.pop_front(st) {
                    log::trace!("{:?}: doorbell wakes {:?}", core, waiter);
                    st.task_mut(waiter).sync_result = true;
                    st.make_ready(waiter);
                } else if let Some(waiter) = event.take_remote_waiter(st) {
                    st.post(Request::Deliver { event, waiter });
                }
            }
        });
    }

    fn serve_request(&self, st: &mut CoreState, request: Request) {
        match request {
            Request::Await { event, waiter } => {
                debug_assert!(
                    event.wait_queue.is_empty(st)
                        && event.remote_waiter.get(st).map_or(true, |w| w == waiter),
                    "an event can't have more than one waiter"
                );
                if event.flag(self).swap(false, Ordering::AcqRel) {
                    st.post(Request::Deliver { event, waiter });
                } else {
                    event.remote_waiter.set(st, Some(waiter));
                }
            }
            Request::CancelAwait { event, waiter } => {
                if event.remote_waiter.get(st) == Some(waiter) {
                    event.remote_waiter.set(st, None);
                }
            }
            Request::Deliver { event, waiter } => {
                let cb = st.task_mut(waiter);
                if cb.awaiting.map_or(false, |e| ptr::eq(e, event)) {
                    cb.awaiting = None;
                    cb.sync_result = true;
                    st.make_ready(waiter);
                } else {
                    // The waiter timed out in the meantime; keep the signal
                    // for whoever waits next
                    event.flag(self).store(true, Ordering::Release);
                    st.post(Request::Signal { event });
                }
            }
            // The flag scan that follows delivers it
            Request::Signal { .. } => {}
        }
    }
}
