//! Per-core scheduler state
use arrayvec::ArrayVec;

use crate::{
    cfg::{Priority, CONTROL_CHANNEL_LEN, MAX_EVENTS_PER_CORE, MAX_TASKS_PER_CORE},
    error::{ActivateTaskError, CreateTaskError},
    event::Event,
    klock::{Request, Switch},
    task::{self, CoreId, TaskCb, TaskId, TaskSt, TaskState},
    timeout,
    utils::intrusive_list::{ExpectConsistent, Link, ListAccessor, ListHead},
};

/// Accessor to a list of tasks threaded through [`TaskCb::link`] or
/// [`TaskCb::delay_link`].
pub(crate) type TaskList<'a> = ListAccessor<'a, TaskCb, MapLinkFn>;

type MapLinkFn = fn(&mut TaskCb) -> &mut Option<Link>;

pub(crate) fn task_list<'a>(head: &'a mut ListHead, tasks: &'a mut [TaskCb]) -> TaskList<'a> {
    ListAccessor::new(head, tasks, task::map_link as MapLinkFn)
}

pub(crate) fn delay_list<'a>(head: &'a mut ListHead, tasks: &'a mut [TaskCb]) -> TaskList<'a> {
    ListAccessor::new(head, tasks, task::map_delay_link as MapLinkFn)
}

/// Insert `item` behind every task of a higher or equal priority.
pub(crate) fn insert_by_priority(list: &mut TaskList<'_>, item: usize) {
    let priority = list.pool()[item].priority;

    let mut insert_at = None;
    let mut cursor = list.back().consistent();
    while let Some(next_cursor) = cursor {
        if list.pool()[next_cursor].priority >= priority {
            break;
        }
        insert_at = Some(next_cursor);
        cursor = list.prev(next_cursor).consistent();
    }

    list.insert(item, insert_at).consistent();
}

/// The scheduler of one core. Only accessible while holding the core's kernel
/// lock.
pub(crate) struct CoreState {
    pub(crate) core: CoreId,
    pub(crate) tasks: ArrayVec<TaskCb, MAX_TASKS_PER_CORE>,

    /// The task owning the processor, or `None` if the core is idle.
    pub(crate) current: Option<TaskId>,

    /// `Ready` tasks in descending priority order.
    ready: ListHead,

    /// `BusyBlocked` tasks in FIFO order.
    busy: ListHead,

    /// Tasks with a deadline, in ascending deadline order.
    pub(crate) timeouts: ListHead,

    pub(crate) tick_count: u64,

    /// Events owned by this core, indexed by their slot number.
    pub(crate) events: ArrayVec<&'static Event, MAX_EVENTS_PER_CORE>,

    /// Requests for other cores, sent once the lock is released.
    outbox: ArrayVec<Request, CONTROL_CHANNEL_LEN>,
}

impl CoreState {
    pub(crate) fn new(core: CoreId) -> Self {
        Self {
            core,
            tasks: ArrayVec::new(),
            current: None,
            ready: ListHead::new(),
            busy: ListHead::new(),
            timeouts: ListHead::new(),
            tick_count: 0,
            events: ArrayVec::new(),
            outbox: ArrayVec::new(),
        }
    }

    /// Queue a request for another core.
    ///
    /// # Panics
    ///
    /// Panics if too many requests are queued in one critical section.
    pub(crate) fn post(&mut self, request: Request) {
        debug_assert_ne!(request.target(), self.core);
        if self.outbox.try_push(request).is_err() {
            panic!("{:?}: too many outgoing requests", self.core);
        }
    }

    pub(crate) fn take_outbox(&mut self) -> ArrayVec<Request, CONTROL_CHANNEL_LEN> {
        core::mem::take(&mut self.outbox)
    }

    #[inline]
    #[track_caller]
    pub(crate) fn task(&self, task: TaskId) -> &TaskCb {
        debug_assert_eq!(task.core(), self.core);
        &self.tasks[task.index()]
    }

    #[inline]
    #[track_caller]
    pub(crate) fn task_mut(&mut self, task: TaskId) -> &mut TaskCb {
        debug_assert_eq!(task.core(), self.core);
        &mut self.tasks[task.index()]
    }

    pub(crate) fn get_task(&self, task: TaskId) -> Option<&TaskCb> {
        if task.core() == self.core {
            self.tasks.get(task.index())
        } else {
            None
        }
    }

    pub(crate) fn create_task(&mut self, priority: Priority) -> Result<TaskId, CreateTaskError> {
        let id = TaskId::new(self.core, self.tasks.len());
        self.tasks
            .try_push(TaskCb::new(id, priority))
            .map_err(|_| CreateTaskError::QueueOverflow)?;
        Ok(id)
    }

    /// Transition a `Dormant` task to `Ready`. Returns whether it outranks the
    /// current task.
    pub(crate) fn activate(&mut self, task: TaskId) -> Result<bool, ActivateTaskError> {
        match self.get_task(task) {
            None => return Err(ActivateTaskError::BadId),
            Some(cb) if cb.st != TaskSt::Dormant => {
                return Err(ActivateTaskError::BadObjectState)
            }
            Some(_) => {}
        }

        let cb = self.task_mut(task);
        cb.sync_state = 0;
        cb.sync_result = false;

        Ok(self.make_ready(task))
    }

    /// Unlink a blocked or dormant task from every list and put it into the
    /// ready list. Returns whether it outranks the current task.
    pub(crate) fn make_ready(&mut self, task: TaskId) -> bool {
        timeout::remove(self, task);
        let waiting_on = self.task(task).waiting_on;
        if let Some(queue) = waiting_on {
            queue.remove(self, task);
        }

        let i = task.index();
        match self.tasks[i].st {
            TaskSt::Dormant | TaskSt::SyncBlocked => {}
            TaskSt::BusyBlocked => {
                task_list(&mut self.busy, &mut self.tasks)
                    .remove(i)
                    .consistent();
            }
            st @ (TaskSt::Ready | TaskSt::Running) => {
                panic!("{:?} can't be readied from {:?}", task, st);
            }
        }

        self.tasks[i].st = TaskSt::Ready;
        insert_by_priority(&mut task_list(&mut self.ready, &mut self.tasks), i);
        log::trace!("{:?} is ready", task);

        match self.current {
            Some(current) => self.task(task).priority > self.task(current).priority,
            None => true,
        }
    }

    /// Apply the state requested by a critical-section handler to the
    /// current task `caller`. Returns the newly dispatched task, if the
    /// processor changed hands.
    pub(crate) fn resolve(&mut self, caller: TaskId, next: TaskState) -> Option<TaskId> {
        debug_assert_eq!(self.current, Some(caller));
        let i = caller.index();

        match next {
            TaskState::Running => return None,
            TaskState::Ready => {
                self.tasks[i].st = TaskSt::Ready;
                insert_by_priority(&mut task_list(&mut self.ready, &mut self.tasks), i);
            }
            TaskState::BusyBlocked => {
                self.tasks[i].st = TaskSt::BusyBlocked;
                task_list(&mut self.busy, &mut self.tasks)
                    .push_back(i)
                    .consistent();
            }
            TaskState::SyncBlocked => {
                self.tasks[i].st = TaskSt::SyncBlocked;
            }
        }

        self.current = None;
        match self.dispatch_next() {
            Some(next) if next == caller => None,
            next => next,
        }
    }

    /// The current task has exited. Returns the newly dispatched task.
    pub(crate) fn exit_current(&mut self, caller: TaskId) -> Option<TaskId> {
        debug_assert_eq!(self.current, Some(caller));
        let cb = self.task_mut(caller);
        debug_assert!(cb.link.is_none() && cb.delay_link.is_none());
        cb.st = TaskSt::Dormant;
        self.current = None;
        self.dispatch_next()
    }

    /// Preempt the current task if a higher-priority task is ready, or
    /// dispatch a task if the core is idle. Returns the newly dispatched
    /// task.
    pub(crate) fn preempt(&mut self) -> Option<TaskId> {
        let Some(current) = self.current else {
            return self.dispatch_next();
        };

        let best = match self.ready.first {
            Some(i) => self.tasks[i].priority,
            None => return None,
        };

        if best <= self.task(current).priority {
            return None;
        }

        let i = current.index();
        self.tasks[i].st = TaskSt::Ready;
        insert_by_priority(&mut task_list(&mut self.ready, &mut self.tasks), i);
        self.current = None;
        self.dispatch_next()
    }

    /// [`Self::preempt`], also reporting the task that lost the processor.
    pub(crate) fn preempt_switch(&mut self) -> Switch {
        let previous = self.current;
        let dispatched = self.preempt();
        Switch {
            preempted: dispatched.and(previous),
            dispatched,
        }
    }

    /// Give the processor to the highest-priority ready task, falling back to
    /// the oldest busy-blocked task.
    fn dispatch_next(&mut self) -> Option<TaskId> {
        debug_assert!(self.current.is_none());

        let mut next = task_list(&mut self.ready, &mut self.tasks)
            .pop_front()
            .consistent();
        if next.is_none() {
            next = task_list(&mut self.busy, &mut self.tasks)
                .pop_front()
                .consistent();
        }

        if let Some(i) = next {
            self.tasks[i].st = TaskSt::Running;
            self.current = Some(self.tasks[i].id);
            log::trace!("{:?}: dispatching {:?}", self.core, self.current);
        } else {
            log::trace!("{:?}: idle", self.core);
        }

        self.current
    }

    /// Make `task` the current task regardless of priority.
    #[cfg(test)]
    pub(crate) fn switch_to(&mut self, task: TaskId) {
        if self.current == Some(task) {
            return;
        }
        if let Some(current) = self.current.take() {
            let i = current.index();
            self.tasks[i].st = TaskSt::Ready;
            insert_by_priority(&mut task_list(&mut self.ready, &mut self.tasks), i);
        }
        let i = task.index();
        assert_eq!(self.tasks[i].st, TaskSt::Ready, "{:?} is not ready", task);
        task_list(&mut self.ready, &mut self.tasks)
            .remove(i)
            .consistent();
        self.tasks[i].st = TaskSt::Running;
        self.current = Some(task);
    }

    #[cfg(test)]
    pub(crate) fn ready_tasks(&mut self) -> std::vec::Vec<TaskId> {
        let mut out = std::vec::Vec::new();
        let mut list = task_list(&mut self.ready, &mut self.tasks);
        let mut cursor = list.front();
        while let Some(i) = cursor {
            out.push(list.pool()[i].id);
            cursor = list.next(i).consistent();
        }
        out
    }
}
