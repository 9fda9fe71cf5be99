//! Items handed over through a condition variable are never missed.
//!
//! A producer increments a counter under the mutex and signals (or
//! broadcasts) after each batch. Two consumers of different priorities wait
//! for the counter to become non-zero, decrement it, and count what they
//! took. Every produced item must be consumed exactly once, and a consumer
//! whose wait times out must not be left holding the mutex.
use qos_kernel::{CoreId, TimeValue};
use qos_port_std::{SimConfig, Simulator};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::utils::Rng;

const NUM_ITEMS: usize = 200;

#[test]
fn run() {
    let mut sim = Simulator::new(SimConfig {
        tick_period_us: 1_000,
        ..SimConfig::default()
    });
    let kernel = sim.kernel();
    let m = kernel.new_mutex();
    let cv = kernel.new_condvar(m);

    // Protected by `m`
    let available: &'static AtomicUsize = Box::leak(Box::new(AtomicUsize::new(0)));
    let produced: &'static AtomicUsize = Box::leak(Box::new(AtomicUsize::new(0)));
    let consumed: &'static AtomicUsize = Box::leak(Box::new(AtomicUsize::new(0)));

    for priority in [3, 2] {
        sim.spawn(CoreId::CORE0, priority, move |kernel| {
            assert!(cv.acquire(kernel, TimeValue::NO_TIMEOUT));
            loop {
                if available.load(Ordering::Relaxed) > 0 {
                    available.fetch_sub(1, Ordering::Relaxed);
                    consumed.fetch_add(1, Ordering::Relaxed);
                } else if produced.load(Ordering::Relaxed) == NUM_ITEMS {
                    break;
                } else if !cv.wait(kernel, TimeValue::from_millis(5)) {
                    // Timed out without the mutex
                    assert!(!m.owns(kernel));
                    assert!(cv.acquire(kernel, TimeValue::NO_TIMEOUT));
                }
                assert!(m.owns(kernel));
            }
            cv.release(kernel);
        })
        .unwrap();
    }

    sim.spawn(CoreId::CORE0, 1, move |kernel| {
        let mut rng = Rng::new(0x5eed);
        while produced.load(Ordering::Relaxed) < NUM_ITEMS {
            assert!(cv.acquire(kernel, TimeValue::NO_TIMEOUT));
            let batch = (1 + rng.below(3) as usize)
                .min(NUM_ITEMS - produced.load(Ordering::Relaxed));
            available.fetch_add(batch, Ordering::Relaxed);
            produced.fetch_add(batch, Ordering::Relaxed);

            if batch > 1 {
                cv.release_and_broadcast(kernel);
            } else {
                cv.release_and_signal(kernel);
            }

            if rng.below(4) == 0 {
                kernel.sleep(TimeValue::NEXT_TICK);
            }
        }
        // Wake up the consumers so that they can see the end
        assert!(cv.acquire(kernel, TimeValue::NO_TIMEOUT));
        cv.release_and_broadcast(kernel);
    })
    .unwrap();

    sim.run().unwrap();

    assert_eq!(consumed.load(Ordering::Relaxed), NUM_ITEMS);
    assert_eq!(available.load(Ordering::Relaxed), 0);
    assert_eq!(cv.num_waiting_tasks(kernel), 0);
    assert_eq!(m.owner(), None);
}
