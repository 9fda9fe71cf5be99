//! A released mutex goes to the highest-priority waiter, not the oldest.
//!
//! 1. (`seq`: 0 → 1) `owner` (priority 10) takes the mutex and sleeps.
//! 2. The waiters, of priorities 1, 5, and 3, start waiting for the mutex
//!    in this order.
//! 3. (`seq`: 1 → 2) `owner` wakes up and releases the mutex.
//! 4. The waiters take the mutex in the order of priorities 5, 3, 1, each
//!    releasing it for the next.
use qos_kernel::{CoreId, Priority, TimeValue};
use qos_port_std::{SimConfig, Simulator};
use std::sync::{Arc, Mutex as StdMutex};

use super::utils::SeqTracker;

#[test]
fn run() {
    let mut sim = Simulator::new(SimConfig {
        tick_period_us: 1_000,
        ..SimConfig::default()
    });
    let kernel = sim.kernel();
    let seq: &'static SeqTracker = Box::leak(Box::new(SeqTracker::new()));
    let order = Arc::new(StdMutex::new(Vec::<Priority>::new()));

    // `new_mutex` binds the mutex to the boot context's core
    let m = kernel.new_mutex();
    assert_eq!(m.core(), CoreId::CORE0);

    sim.spawn(CoreId::CORE0, 10, move |kernel| {
        assert!(m.acquire(kernel, TimeValue::NO_TIMEOUT));
        seq.expect_and_replace(0, 1);

        kernel.sleep(TimeValue::from_millis(40));

        assert_eq!(m.num_waiting_tasks(kernel), 3);
        seq.expect_and_replace(1, 2);
        m.release(kernel);
        // The new owner has a lower priority, so this task keeps running
        assert_ne!(m.owner(), kernel.current_task());
    })
    .unwrap();

    for (priority, delay_ms) in [(1, 2), (5, 6), (3, 10)] {
        let order = Arc::clone(&order);
        sim.spawn(CoreId::CORE0, priority, move |kernel| {
            kernel.sleep(TimeValue::from_millis(delay_ms));
            assert!(m.acquire(kernel, TimeValue::NO_TIMEOUT));
            assert_eq!(seq.get(), 2);
            order.lock().unwrap().push(priority);
            m.release(kernel);
        })
        .unwrap();
    }

    sim.run().unwrap();

    assert_eq!(*order.lock().unwrap(), [5, 3, 1]);
    assert_eq!(m.owner(), None);
}
