//! Events signalled from the other core are delivered exactly once.
//!
//! `ping` (core 0) and `pong` (core 1) take turns: `pong` signals `e0`, owned
//! by core 0, and waits for `e1`, owned by core 1, which `ping` signals after
//! each wakeup. Random delays on both sides move the signal around the
//! waiter's blocking point, so the signal lands both before and after the
//! waiter has blocked.
use qos_kernel::{CoreId, TimeValue};
use qos_port_std::{SimConfig, Simulator};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::utils::{Rng, SeqTracker};

const NUM_ROUNDS: usize = 200;

fn random_delay(kernel: &qos_port_std::StdKernel, rng: &mut Rng) {
    match rng.below(3) {
        0 => {}
        1 => {
            for _ in 0..rng.below(2000) {
                std::hint::spin_loop();
            }
        }
        _ => kernel.busy_block(),
    }
}

#[test]
fn ping_pong() {
    let mut sim = Simulator::new(SimConfig {
        tick_period_us: 1_000,
        ..SimConfig::default()
    });
    let kernel = sim.kernel();
    let e0 = kernel.new_event(Some(CoreId::CORE0));
    let e1 = kernel.new_event(Some(CoreId::CORE1));
    let pings: &'static AtomicUsize = Box::leak(Box::new(AtomicUsize::new(0)));

    sim.spawn(CoreId::CORE0, 1, move |kernel| {
        let mut rng = Rng::new(0);
        for round in 0..NUM_ROUNDS {
            assert!(e0.await_event(kernel, TimeValue::NO_TIMEOUT));
            assert_eq!(pings.fetch_add(1, Ordering::SeqCst), round);
            random_delay(kernel, &mut rng);
            e1.signal(kernel);
        }

        // No signal is delivered twice
        assert!(!e0.await_event(kernel, TimeValue::from_millis(20)));
    })
    .unwrap();

    sim.spawn(CoreId::CORE1, 1, move |kernel| {
        let mut rng = Rng::new(1);
        for round in 0..NUM_ROUNDS {
            random_delay(kernel, &mut rng);
            e0.signal(kernel);
            assert!(e1.await_event(kernel, TimeValue::NO_TIMEOUT));
            assert_eq!(pings.load(Ordering::SeqCst), round + 1);
        }
    })
    .unwrap();

    sim.run().unwrap();

    assert_eq!(pings.load(Ordering::SeqCst), NUM_ROUNDS);
    assert!(!e0.is_signalled(kernel));
    assert!(!e1.is_signalled(kernel));
}

/// A local signal wakes the waiter directly.
///
/// 1. (`seq`: 0 → 1) `waiter` (priority 2) starts waiting for the event.
/// 2. (`seq`: 1 → 2) `signaller` (priority 1) signals the event, and
///    `waiter` preempts it.
/// 3. (`seq`: 2 → 3) `waiter` exits.
/// 4. (`seq`: 3 → 4) `signaller` resumes and signals the event again, which
///    is left pending.
#[test]
fn local_signal_and_dispatch() {
    let mut sim = Simulator::new(SimConfig::default());
    let kernel = sim.kernel();
    let seq: &'static SeqTracker = Box::leak(Box::new(SeqTracker::new()));
    let e = kernel.new_event(None);

    sim.spawn(CoreId::CORE0, 2, move |kernel| {
        seq.expect_and_replace(0, 1);
        assert!(e.await_event(kernel, TimeValue::NO_TIMEOUT));
        seq.expect_and_replace(2, 3);
    })
    .unwrap();

    sim.spawn(CoreId::CORE0, 1, move |kernel| {
        seq.expect_and_replace(1, 2);
        e.signal(kernel);
        seq.expect_and_replace(3, 4);
        e.signal(kernel);
    })
    .unwrap();

    sim.run().unwrap();
    assert!(e.is_signalled(kernel));
}

/// A task waits for an event owned by the other core.
///
/// 1. (`seq`: 0 → 1, 0ms) `waiter` (core 1) waits for `e` (core 0) with a
///    20-millisecond timeout, which expires.
/// 2. (`seq`: 1 → 2) `waiter` waits for `e` again, without a timeout.
///    `signaller` (core 0) sees it and signals `e` after a while.
/// 3. (`seq`: 2 → 3) `waiter` wakes up with the signal consumed.
#[test]
fn foreign_core_waiter() {
    let mut sim = Simulator::new(SimConfig {
        tick_period_us: 1_000,
        ..SimConfig::default()
    });
    let kernel = sim.kernel();
    let seq: &'static SeqTracker = Box::leak(Box::new(SeqTracker::new()));
    let e = kernel.new_event(Some(CoreId::CORE0));

    sim.spawn(CoreId::CORE1, 1, move |kernel| {
        let start = kernel.now();
        assert!(!e.await_event(kernel, TimeValue::from_millis(20)));
        assert!(kernel.now() - start >= 20_000);
        seq.expect_and_replace(0, 1);

        assert!(e.await_event(kernel, TimeValue::from_millis(5_000)));
        seq.expect_and_replace(2, 3);
    })
    .unwrap();

    sim.spawn(CoreId::CORE0, 1, move |kernel| {
        while seq.get() != 1 {
            kernel.sleep(TimeValue::NEXT_TICK);
        }
        kernel.sleep(TimeValue::from_millis(5));
        seq.expect_and_replace(1, 2);
        e.signal(kernel);
    })
    .unwrap();

    sim.run().unwrap();
    assert_eq!(seq.get(), 3);
    assert!(!e.is_signalled(kernel));
}
