//! Tasks
use core::{fmt, num::NonZeroU32};

use crate::{
    cfg::{Priority, MAX_TASKS_PER_CORE, NUM_CORES, NUM_PRIORITY_LEVELS},
    error::{ActivateTaskError, CreateTaskError},
    event::Event,
    klock::Switch,
    time::{Deadline, TimeValue},
    utils::intrusive_list::Link,
    wait::WaitQueue,
    Kernel, Port,
};

/// Identifies one of the cores.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoreId(u8);

impl CoreId {
    pub const CORE0: Self = Self(0);
    pub const CORE1: Self = Self(1);

    /// Every core, in index order.
    pub const ALL: [Self; NUM_CORES] = [Self::CORE0, Self::CORE1];

    pub const fn new(index: usize) -> Option<Self> {
        if index < NUM_CORES {
            Some(Self(index as u8))
        } else {
            None
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "core{}", self.0)
    }
}

/// Identifies a task. The raw value packs the owning core into bits 16-23
/// and the task's index in that core's task table (plus one) into bits 0-15,
/// and is never zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(NonZeroU32);

impl TaskId {
    pub(crate) fn new(core: CoreId, index: usize) -> Self {
        debug_assert!(index < MAX_TASKS_PER_CORE);
        let raw = ((core.0 as u32) << 16) | (index as u32 + 1);
        match NonZeroU32::new(raw) {
            Some(x) => Self(x),
            None => unreachable!(),
        }
    }

    /// Reconstruct a `TaskId` from a value returned by [`Self::to_raw`].
    pub fn from_raw(raw: u32) -> Option<Self> {
        let core = CoreId::new((raw >> 16) as usize)?;
        let index = (raw & 0xffff) as usize;
        if index == 0 || index > MAX_TASKS_PER_CORE || raw >> 24 != 0 {
            return None;
        }
        Some(Self::new(core, index - 1))
    }

    #[inline]
    pub fn to_raw(self) -> u32 {
        self.0.get()
    }

    /// Get the core the task is bound to.
    #[inline]
    pub fn core(self) -> CoreId {
        CoreId((self.0.get() >> 16) as u8)
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        (self.0.get() & 0xffff) as usize - 1
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Task({:?}#{})", self.core(), self.index())
    }
}

/// The state a critical-section handler leaves the calling task in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Keep running.
    Running,
    /// Yield the processor to the highest-priority ready task.
    Ready,
    /// Run only when no other task is ready.
    BusyBlocked,
    /// Wait until another task or a timeout wakes the task up. The handler
    /// must have linked the task to a wait list or the timeout list.
    SyncBlocked,
}

/// Task state machine, including the states no handler can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskSt {
    /// Created but not activated, or exited.
    Dormant,
    Ready,
    Running,
    BusyBlocked,
    SyncBlocked,
}

impl TaskSt {
    pub(crate) fn to_public(self) -> Option<TaskState> {
        match self {
            Self::Dormant => None,
            Self::Ready => Some(TaskState::Ready),
            Self::Running => Some(TaskState::Running),
            Self::BusyBlocked => Some(TaskState::BusyBlocked),
            Self::SyncBlocked => Some(TaskState::SyncBlocked),
        }
    }
}

/// *Task control block* - the state data of a task.
pub(crate) struct TaskCb {
    pub(crate) id: TaskId,
    pub(crate) priority: Priority,
    pub(crate) st: TaskSt,

    /// Links the task into the ready list, the busy list, or a wait list.
    /// A task belongs to at most one of them.
    pub(crate) link: Option<Link>,

    /// Links the task into the timeout list.
    pub(crate) delay_link: Option<Link>,

    /// Valid while `delay_link` is `Some(_)`.
    pub(crate) deadline: u64,

    /// The wait list `link` currently belongs to, if any.
    pub(crate) waiting_on: Option<&'static WaitQueue>,

    /// The event of another core the task is waiting for, if any. The wait
    /// is registered on that core, not in `waiting_on`.
    pub(crate) awaiting: Option<&'static Event>,

    /// Primitive-specific wait parameter, e.g., the count a semaphore waiter
    /// needs.
    pub(crate) sync_state: i32,

    /// The result of the last blocking operation. `false` means timeout.
    pub(crate) sync_result: bool,
}

impl TaskCb {
    pub(crate) fn new(id: TaskId, priority: Priority) -> Self {
        Self {
            id,
            priority,
            st: TaskSt::Dormant,
            link: None,
            delay_link: None,
            deadline: 0,
            waiting_on: None,
            awaiting: None,
            sync_state: 0,
            sync_result: false,
        }
    }
}

impl fmt::Debug for TaskCb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("st", &self.st)
            .field("waiting", &self.waiting_on.is_some())
            .field("awaiting", &self.awaiting)
            .field("delayed", &self.delay_link.map(|_| self.deadline))
            .finish()
    }
}

/// These associate functions implement the task lifecycle and the scheduling
/// calls a task makes on itself.
impl<P: Port> Kernel<P> {
    /// Create a dormant task bound to `core`.
    pub fn create_task(&self, core: CoreId, priority: Priority) -> Result<TaskId, CreateTaskError> {
        if usize::from(priority) >= NUM_PRIORITY_LEVELS {
            return Err(CreateTaskError::BadParam);
        }

        let task = self.core(core).lock(self.port(), |st| st.create_task(priority))?;
        log::debug!("created {:?} with priority {}", task, priority);
        Ok(task)
    }

    /// Transition a dormant task to the Ready state, preempting the current
    /// task of its core if the kernel is running and the new task outranks
    /// it.
    pub fn activate_task(&self, task: TaskId) -> Result<(), ActivateTaskError> {
        let started = self.is_started();
        let switch = self.core(task.core()).lock(self.port(), |st| {
            st.activate(task)?;
            Ok::<_, ActivateTaskError>(if started {
                st.preempt_switch()
            } else {
                Switch::default()
            })
        })?;

        log::debug!("activated {:?}", task);

        self.apply_switch(switch);

        // The caller may have been the preempted task
        if let Some(caller) = self.port().current_task() {
            if caller.core() == task.core() {
                self.wait_until_dispatched(caller);
            }
        }

        Ok(())
    }

    /// Terminate the calling task. It returns to the Dormant state and the
    /// next task is dispatched. The caller must not make any further kernel
    /// calls.
    pub fn exit_task(&self) {
        let caller = self.expect_task_context();
        let dispatched = self.enter(caller, |st| st.exit_current(caller));
        log::debug!("{:?} exited", caller);
        if let Some(dispatched) = dispatched {
            self.port().notify_dispatch(dispatched);
        }
    }

    /// Block the calling task until `timeout` elapses. Always returns `false`
    /// (the wait can only end by timing out).
    pub fn sleep(&self, timeout: TimeValue) -> bool {
        let deadline = timeout.to_deadline(self.now());
        if deadline == Deadline::Poll {
            return false;
        }
        self.critical_section(|cs| cs.block_current(None, deadline))
    }

    /// Move the calling task behind the other ready tasks of the same
    /// priority.
    pub fn yield_now(&self) {
        self.critical_section(|_| TaskState::Ready);
    }

    /// Let every other runnable task of the core run before the caller
    /// resumes. Before the kernel starts, this is a spin-loop hint.
    pub fn busy_block(&self) {
        if !self.is_started() {
            core::hint::spin_loop();
            return;
        }
        self.critical_section(|_| TaskState::BusyBlocked);
    }

    /// [`Self::busy_block`], then report whether `until` has been reached.
    /// Intended for polling loops that must give way to other tasks.
    pub fn busy_block_until(&self, until: TimeValue) -> bool {
        let at = match until.to_deadline(self.now()) {
            Deadline::Poll => return true,
            Deadline::Forever => {
                self.busy_block();
                return false;
            }
            Deadline::At(at) => at,
        };

        self.busy_block();
        self.now() >= at
    }

    /// Get the state of `task`. Returns `None` if it's dormant or doesn't
    /// exist.
    pub fn task_state(&self, task: TaskId) -> Option<TaskState> {
        self.core(task.core()).lock(self.port(), |st| {
            st.get_task(task).and_then(|cb| cb.st.to_public())
        })
    }

    pub fn task_priority(&self, task: TaskId) -> Option<Priority> {
        self.core(task.core())
            .lock(self.port(), |st| st.get_task(task).map(|cb| cb.priority))
    }
}

pub(crate) fn map_link(task: &mut TaskCb) -> &mut Option<Link> {
    &mut task.link
}

pub(crate) fn map_delay_link(task: &mut TaskCb) -> &mut Option<Link> {
    &mut task.delay_link
}
