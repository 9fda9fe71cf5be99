//! Tasks are dispatched by priority, and equal priorities take turns.
use qos_kernel::{CoreId, TaskState, TimeValue};
use qos_port_std::{SimConfig, Simulator};

use super::utils::SeqTracker;

/// Tasks of priorities 1, 5, and 3 activated before the kernel starts run
/// in the order of 5, 3, 1.
#[test]
fn start_order() {
    let mut sim = Simulator::new(SimConfig::default());
    let seq: &'static SeqTracker = Box::leak(Box::new(SeqTracker::new()));

    for (priority, slot) in [(1, 2), (5, 0), (3, 1)] {
        sim.spawn(CoreId::CORE1, priority, move |_| {
            seq.expect_and_replace(slot, slot + 1);
        })
        .unwrap();
    }

    sim.run().unwrap();
    assert_eq!(seq.get(), 3);
}

/// Two tasks of the same priority alternate by yielding.
///
/// 1. (`seq`: 0 → 1) `task0` yields.
/// 2. (`seq`: 1 → 2) `task1` yields.
/// 3. (`seq`: 2 → 3) `task0` yields.
/// 4. (`seq`: 3 → 4) `task1` exits.
/// 5. (`seq`: 4 → 5) `task0` yields, which returns immediately because it's
///    alone, and exits.
#[test]
fn yield_round_robin() {
    let mut sim = Simulator::new(SimConfig::default());
    let kernel = sim.kernel();
    let seq: &'static SeqTracker = Box::leak(Box::new(SeqTracker::new()));

    let task0 = sim
        .spawn(CoreId::CORE0, 4, move |kernel| {
            seq.expect_and_replace(0, 1);
            kernel.yield_now();
            seq.expect_and_replace(2, 3);
            kernel.yield_now();
            seq.expect_and_replace(4, 5);
            kernel.yield_now();
        })
        .unwrap();

    let task1 = sim
        .spawn(CoreId::CORE0, 4, move |kernel| {
            seq.expect_and_replace(1, 2);
            kernel.yield_now();
            seq.expect_and_replace(3, 4);
        })
        .unwrap();

    assert_eq!(kernel.task_state(task0), Some(TaskState::Ready));
    assert_eq!(kernel.task_priority(task1), Some(4));

    sim.run().unwrap();
    assert_eq!(seq.get(), 5);
}

/// The cores schedule independently: a task blocked on one core doesn't
/// hold up the other.
#[test]
fn cores_are_independent() {
    let mut sim = Simulator::new(SimConfig {
        tick_period_us: 1_000,
        ..SimConfig::default()
    });
    let kernel = sim.kernel();
    let sem = kernel.new_semaphore(0);

    let sleeper = sim
        .spawn(CoreId::CORE0, 1, move |kernel| {
            assert!(sem.acquire(kernel, 1, TimeValue::from_millis(2_000)));
        })
        .unwrap();

    let e = kernel.new_event(Some(CoreId::CORE0));
    sim.spawn(CoreId::CORE1, 1, move |kernel| {
        while kernel.task_state(sleeper) != Some(TaskState::SyncBlocked) {
            kernel.busy_block_until(TimeValue::NEXT_TICK);
        }
        // `sem` is bound to `core0`, so its helper task does the release
        e.signal(kernel);
    })
    .unwrap();

    sim.spawn(CoreId::CORE0, 2, move |kernel| {
        assert!(e.await_event(kernel, TimeValue::NO_TIMEOUT));
        sem.release(kernel, 1);
    })
    .unwrap();

    sim.run().unwrap();
}
