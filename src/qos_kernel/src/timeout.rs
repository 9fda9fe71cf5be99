//! Timeout list and tick handling
use crate::{
    klock::Request,
    state::{delay_list, CoreState},
    task::{CoreId, TaskId},
    utils::intrusive_list::ExpectConsistent,
    Kernel, Port,
};

/// Link `task` into the timeout list, keeping the list sorted by deadline
/// (FIFO among equal deadlines).
pub(crate) fn insert(st: &mut CoreState, task: TaskId, deadline: u64) {
    let i = task.index();
    debug_assert!(st.tasks[i].delay_link.is_none());
    st.tasks[i].deadline = deadline;

    let mut list = delay_list(&mut st.timeouts, &mut st.tasks);
    let mut insert_at = None;
    let mut cursor = list.back().consistent();
    while let Some(next_cursor) = cursor {
        if list.pool()[next_cursor].deadline <= deadline {
            break;
        }
        insert_at = Some(next_cursor);
        cursor = list.prev(next_cursor).consistent();
    }
    list.insert(i, insert_at).consistent();
}

/// Unlink `task` from the timeout list if it's linked.
pub(crate) fn remove(st: &mut CoreState, task: TaskId) {
    let i = task.index();
    if st.tasks[i].delay_link.is_some() {
        delay_list(&mut st.timeouts, &mut st.tasks)
            .remove(i)
            .consistent();
    }
}

/// Wake up every task whose deadline is not later than `now`. The woken
/// tasks observe `false` (timeout) as their result.
pub(crate) fn expire(st: &mut CoreState, now: u64) -> usize {
    let mut count = 0;
    while let Some(i) = st.timeouts.first {
        if st.tasks[i].deadline > now {
            break;
        }
        let task = st.tasks[i].id;
        log::trace!("{:?} timed out", task);
        if let Some(event) = st.tasks[i].awaiting.take() {
            st.post(Request::CancelAwait {
                event,
                waiter: task,
            });
        }
        st.make_ready(task);
        count += 1;
    }
    count
}

impl<P: Port> Kernel<P> {
    /// Advance the tick counter of `core` and wake up the tasks whose
    /// deadlines have passed. Called by the port's tick interrupt once every
    /// [`KernelCfg::tick_period_us`](crate::KernelCfg::tick_period_us).
    pub fn tick(&self, core: CoreId) {
        if !self.is_started() {
            return;
        }
        let now = self.port().now();
        self.interrupt_section(core, |st| {
            st.tick_count += 1;
            let woken = expire(st, now);
            if woken > 0 {
                log::trace!("{:?}: tick woke {} task(s)", core, woken);
            }
        });
    }

    /// Get the number of ticks processed on `core` since the kernel started.
    pub fn tick_count(&self, core: CoreId) -> u64 {
        self.core(core).lock(self.port(), |st| st.tick_count)
    }
}
