//! A preempted task stays stopped while a higher-priority task of its core
//! runs.
//!
//! 1. (`seq`: 0 → 1) `high` (priority 2) sleeps until the next tick.
//! 2. `low` (priority 1) starts hammering the fast paths of a mutex and a
//!    semaphore and counts its iterations. It never blocks.
//! 3. (`seq`: 1 → 2) The tick wakes up `high`, which preempts `low`. `high`
//!    spins for 30 milliseconds without making kernel calls, during which the
//!    iteration count doesn't change.
//! 4. (`seq`: 2 → 3) `high` lets `low` stop and exits, and `low` resumes.
use qos_kernel::{CoreId, TimeValue};
use qos_port_std::{SimConfig, Simulator};
use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use super::utils::SeqTracker;

#[test]
#[cfg_attr(not(unix), ignore = "preempted threads are only stopped on Unix")]
fn preempted_task_is_stopped() {
    let mut sim = Simulator::new(SimConfig {
        tick_period_us: 1_000,
        ..SimConfig::default()
    });
    let kernel = sim.kernel();
    let seq: &'static SeqTracker = Box::leak(Box::new(SeqTracker::new()));
    let iterations: &'static AtomicUsize = Box::leak(Box::new(AtomicUsize::new(0)));
    let done: &'static AtomicBool = Box::leak(Box::new(AtomicBool::new(false)));
    let m = kernel.new_mutex();
    let s = kernel.new_semaphore(1);

    sim.spawn(CoreId::CORE0, 2, move |kernel| {
        seq.expect_and_replace(0, 1);
        kernel.sleep(TimeValue::NEXT_TICK);
        seq.expect_and_replace(1, 2);

        let before = iterations.load(Ordering::SeqCst);
        assert!(before > 0, "`low` didn't run before the tick");

        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(30) {
            std::hint::spin_loop();
        }
        assert_eq!(iterations.load(Ordering::SeqCst), before);

        seq.expect_and_replace(2, 3);
        done.store(true, Ordering::SeqCst);
    })
    .unwrap();

    sim.spawn(CoreId::CORE0, 1, move |kernel| {
        while !done.load(Ordering::SeqCst) {
            assert!(m.acquire(kernel, TimeValue::NO_TIMEOUT));
            assert!(s.acquire(kernel, 1, TimeValue::NO_TIMEOUT));
            iterations.fetch_add(1, Ordering::SeqCst);
            s.release(kernel, 1);
            m.release(kernel);
        }
        assert_eq!(seq.get(), 3);
    })
    .unwrap();

    sim.run().unwrap();
    assert_eq!(m.owner(), None);
    assert_eq!(s.count(), 1);
}
