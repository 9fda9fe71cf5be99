//! Priority-ordered wait lists
use crate::{
    klock::CoreLockCell,
    state::{insert_by_priority, task_list, CoreState},
    task::{CoreId, TaskId},
    utils::intrusive_list::{ExpectConsistent, ListHead},
};

/// A list of tasks blocked on a synchronization primitive, in descending
/// priority order (FIFO among equal priorities). The links live in the
/// waiting tasks' [`TaskCb`](crate::task::TaskCb)s, so joining or leaving
/// the list never allocates.
pub(crate) struct WaitQueue {
    head: CoreLockCell<ListHead>,
}

impl WaitQueue {
    pub(crate) const fn new(core: CoreId) -> Self {
        Self {
            head: CoreLockCell::new(core, ListHead::new()),
        }
    }

    #[inline]
    pub(crate) const fn core(&self) -> CoreId {
        self.head.core()
    }

    pub(crate) fn is_empty(&self, st: &CoreState) -> bool {
        self.head.get(st).is_empty()
    }

    pub(crate) fn first_waiting_task(&self, st: &CoreState) -> Option<TaskId> {
        self.head.get(st).first.map(|i| st.tasks[i].id)
    }

    /// Get the waiting task following `task`.
    pub(crate) fn next_waiting_task(&self, st: &mut CoreState, task: TaskId) -> Option<TaskId> {
        let mut head = self.head.get(st);
        let next = task_list(&mut head, &mut st.tasks)
            .next(task.index())
            .consistent();
        next.map(|i| st.tasks[i].id)
    }

    pub(crate) fn len(&self, st: &mut CoreState) -> usize {
        let mut count = 0;
        let mut cursor = self.first_waiting_task(st);
        while let Some(task) = cursor {
            count += 1;
            cursor = self.next_waiting_task(st, task);
        }
        count
    }

    /// Link `task` into the list, placing it behind every waiting task of a
    /// higher or equal priority.
    pub(crate) fn insert(&'static self, st: &mut CoreState, task: TaskId) {
        debug_assert!(st.task(task).waiting_on.is_none());

        let mut head = self.head.get(st);
        insert_by_priority(&mut task_list(&mut head, &mut st.tasks), task.index());
        self.head.set(st, head);

        st.task_mut(task).waiting_on = Some(self);
    }

    pub(crate) fn remove(&self, st: &mut CoreState, task: TaskId) {
        debug_assert!(st
            .task(task)
            .waiting_on
            .map_or(false, |q| core::ptr::eq(q, self)));

        let mut head = self.head.get(st);
        task_list(&mut head, &mut st.tasks)
            .remove(task.index())
            .consistent();
        self.head.set(st, head);

        st.task_mut(task).waiting_on = None;
    }

    /// Unlink and return the highest-priority waiting task.
    pub(crate) fn pop_front(&self, st: &mut CoreState) -> Option<TaskId> {
        let task = self.first_waiting_task(st)?;
        self.remove(st, task);
        Some(task)
    }
}
