//! Bytes pass through a bounded queue in order.
//!
//! A producer writes a byte stream in chunks of random sizes and a consumer
//! on the same core reads it back in chunks of other random sizes. The
//! queue is smaller than the stream, so both sides block on it. A chunk is
//! at most half the capacity, so a blocked writer and a blocked reader can't
//! both be short.
use qos_kernel::{CoreId, TimeValue};
use qos_port_std::{SimConfig, Simulator};
use std::sync::{Arc, Mutex as StdMutex};

use super::utils::Rng;

const CAPACITY: usize = 8;
const LEN: usize = 300;

fn stream() -> Vec<u8> {
    (0..LEN).map(|i| (i * 7 % 251) as u8).collect()
}

#[test]
fn run() {
    for (producer_priority, consumer_priority) in [(1, 2), (2, 1)] {
        run_with(producer_priority, consumer_priority);
    }
}

fn run_with(producer_priority: u8, consumer_priority: u8) {
    let mut sim = Simulator::new(SimConfig::default());
    let kernel = sim.kernel();
    let q = kernel.new_queue(CAPACITY);
    let received = Arc::new(StdMutex::new(Vec::new()));

    sim.spawn(CoreId::CORE0, producer_priority, move |kernel| {
        let data = stream();
        let mut rng = Rng::new(1);
        let mut rest = &data[..];
        while !rest.is_empty() {
            let n = (1 + rng.below(CAPACITY as u64 / 2) as usize).min(rest.len());
            assert!(q.write(kernel, &rest[..n], TimeValue::NO_TIMEOUT));
            rest = &rest[n..];
        }
    })
    .unwrap();

    let received2 = Arc::clone(&received);
    sim.spawn(CoreId::CORE0, consumer_priority, move |kernel| {
        let mut rng = Rng::new(2);
        let mut buf = [0u8; CAPACITY];
        let mut remaining = LEN;
        while remaining > 0 {
            let n = (1 + rng.below(CAPACITY as u64 / 2) as usize).min(remaining);
            assert!(q.read(kernel, &mut buf[..n], TimeValue::NO_TIMEOUT));
            received2.lock().unwrap().extend_from_slice(&buf[..n]);
            remaining -= n;
        }

        // Nothing more to read
        assert!(!q.read(kernel, &mut buf[..1], TimeValue::from_millis(30)));
    })
    .unwrap();

    sim.run().unwrap();

    assert_eq!(*received.lock().unwrap(), stream());
    assert!(q.is_empty());
}

#[test]
fn small_queue_transfer() {
    let mut sim = Simulator::new(SimConfig::default());
    let kernel = sim.kernel();
    let q = kernel.new_queue(CAPACITY);

    sim.spawn(CoreId::CORE0, 1, move |kernel| {
        assert!(q.write(kernel, b"hello", TimeValue::NO_TIMEOUT));
        // Blocks until the reader has made room
        assert!(q.write(kernel, b"world", TimeValue::NO_TIMEOUT));
    })
    .unwrap();

    sim.spawn(CoreId::CORE0, 2, move |kernel| {
        let mut buf = [0u8; 10];
        assert!(q.read(kernel, &mut buf[..5], TimeValue::NO_TIMEOUT));
        assert!(q.read(kernel, &mut buf[5..], TimeValue::NO_TIMEOUT));
        assert_eq!(&buf, b"helloworld");
    })
    .unwrap();

    sim.run().unwrap();
}
