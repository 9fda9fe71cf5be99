//! A scripted single-threaded port for the kernel's unit tests
//!
//! The test itself plays the role of every task: it picks the calling task
//! with [`TestPort::set_caller`] and the time with [`TestPort::set_now`].
//! Blocking is not possible, so blocking paths are driven through
//! [`Kernel::run_as`], which runs a critical-section handler on behalf of a
//! task without waiting for the task to be dispatched again.
use std::{cell::Cell, vec::Vec};

use crate::{
    cfg::Priority,
    task::{CoreId, TaskId, TaskState},
    CriticalSection, Kernel, Port,
};

pub(crate) struct TestPort {
    caller: spin::Mutex<Option<TaskId>>,
    now: spin::Mutex<u64>,
    notified: spin::Mutex<Vec<TaskId>>,
    preempted: spin::Mutex<Vec<TaskId>>,
    doorbells: spin::Mutex<Vec<CoreId>>,
}

std::thread_local! {
    static MASK_DEPTH: Cell<usize> = Cell::new(0);
}

impl TestPort {
    pub(crate) fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self {
            caller: spin::Mutex::new(None),
            now: spin::Mutex::new(0),
            notified: spin::Mutex::new(Vec::new()),
            preempted: spin::Mutex::new(Vec::new()),
            doorbells: spin::Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn set_caller(&self, task: Option<TaskId>) {
        *self.caller.lock() = task;
    }

    pub(crate) fn set_now(&self, now: u64) {
        *self.now.lock() = now;
    }

    pub(crate) fn mask_depth(&self) -> usize {
        MASK_DEPTH.with(|x| x.get())
    }

    pub(crate) fn take_notified(&self) -> Vec<TaskId> {
        core::mem::take(&mut *self.notified.lock())
    }

    pub(crate) fn take_preempted(&self) -> Vec<TaskId> {
        core::mem::take(&mut *self.preempted.lock())
    }

    pub(crate) fn take_doorbells(&self) -> Vec<CoreId> {
        core::mem::take(&mut *self.doorbells.lock())
    }
}

impl Port for TestPort {
    fn current_core(&self) -> CoreId {
        self.caller.lock().map_or(CoreId::CORE0, TaskId::core)
    }

    fn current_task(&self) -> Option<TaskId> {
        *self.caller.lock()
    }

    fn now(&self) -> u64 {
        *self.now.lock()
    }

    fn mask_interrupts(&self) {
        MASK_DEPTH.with(|x| x.set(x.get() + 1));
    }

    fn unmask_interrupts(&self) {
        MASK_DEPTH.with(|x| {
            assert_ne!(x.get(), 0);
            x.set(x.get() - 1)
        });
    }

    fn wait_for_dispatch(&self, task: TaskId) {
        panic!("{:?} would block", task);
    }

    fn notify_dispatch(&self, task: TaskId) {
        self.notified.lock().push(task);
    }

    fn notify_preempt(&self, task: TaskId) {
        self.preempted.lock().push(task);
    }

    fn ring_doorbell(&self, core: CoreId) {
        self.doorbells.lock().push(core);
    }
}

/// Create a kernel with the given `(core, priority)` tasks, all activated.
pub(crate) fn kernel_with(tasks: &[(CoreId, Priority)]) -> (Kernel<TestPort>, Vec<TaskId>) {
    let kernel = Kernel::new(TestPort::new());
    let ids = tasks
        .iter()
        .map(|&(core, priority)| {
            let task = kernel.create_task(core, priority).unwrap();
            kernel.activate_task(task).unwrap();
            task
        })
        .collect();
    (kernel, ids)
}

/// [`kernel_with`], started.
pub(crate) fn started_kernel(tasks: &[(CoreId, Priority)]) -> (Kernel<TestPort>, Vec<TaskId>) {
    let (kernel, ids) = kernel_with(tasks);
    kernel.start();
    kernel.port().take_notified();
    (kernel, ids)
}

impl Kernel<TestPort> {
    /// Make `task` the current task of its core and the port's caller.
    pub(crate) fn switch_to(&self, task: TaskId) {
        self.core(task.core())
            .lock(self.port(), |st| st.switch_to(task));
        self.port().set_caller(Some(task));
    }

    /// Run a critical-section handler as `task`, resolving the state it
    /// returns but not waiting for `task` to be dispatched again.
    pub(crate) fn run_as<F>(&self, task: TaskId, handler: F) -> TaskState
    where
        F: FnOnce(&mut CriticalSection<'_>) -> TaskState,
    {
        self.switch_to(task);
        let (next, dispatched, outbox) = self.core(task.core()).lock(self.port(), |st| {
            st.task_mut(task).sync_result = false;
            let next = handler(&mut CriticalSection::new(st, task));
            (next, st.resolve(task, next), st.take_outbox())
        });
        self.send_requests(outbox);
        if let Some(dispatched) = dispatched {
            self.port().notify_dispatch(dispatched);
        }
        next
    }

    pub(crate) fn result_of(&self, task: TaskId) -> bool {
        self.core(task.core())
            .lock(self.port(), |st| st.task(task).sync_result)
    }

    pub(crate) fn current_task_of(&self, core: CoreId) -> Option<TaskId> {
        self.core(core).lock(self.port(), |st| st.current)
    }
}
