//! Byte queues
use alloc::{boxed::Box, vec};
use core::{cell::UnsafeCell, fmt};

use crate::{
    mutex::Mutex, semaphore::Semaphore, task::CoreId, time::TimeValue, Kernel, Port,
};

/// A bounded FIFO byte queue bound to a core.
///
/// `write` claims space from one semaphore and `read` claims bytes from
/// another, so a transfer either happens in full or (on timeout) not at all.
/// The ring indices are only touched while holding the mutex.
pub struct Queue {
    /// Counts the bytes available for reading.
    read_semaphore: Semaphore,
    /// Counts the free space.
    write_semaphore: Semaphore,
    mutex: Mutex,
    capacity: usize,
    ring: UnsafeCell<Ring>,
}

// Safety: `ring` is only accessed while holding `mutex`
unsafe impl Sync for Queue {}

struct Ring {
    buf: Box<[u8]>,
    read_index: usize,
    write_index: usize,
}

impl Ring {
    fn push(&mut self, data: &[u8]) {
        let cap = self.buf.len();
        let head = (cap - self.write_index).min(data.len());
        let (first, second) = data.split_at(head);
        self.buf[self.write_index..][..head].copy_from_slice(first);
        self.buf[..second.len()].copy_from_slice(second);
        self.write_index = (self.write_index + data.len()) % cap;
    }

    fn pop(&mut self, out: &mut [u8]) {
        let cap = self.buf.len();
        let head = (cap - self.read_index).min(out.len());
        let (first, second) = out.split_at_mut(head);
        first.copy_from_slice(&self.buf[self.read_index..][..head]);
        let tail = second.len();
        second.copy_from_slice(&self.buf[..tail]);
        self.read_index = (self.read_index + out.len()) % cap;
    }
}

impl Queue {
    /// Construct a queue of `capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or doesn't fit in a semaphore count.
    pub fn new(core: CoreId, capacity: usize) -> Self {
        assert!(capacity > 0, "zero-capacity queue");
        assert!(capacity <= i32::MAX as usize, "queue capacity out of range");
        let count = capacity as i32;
        Self {
            read_semaphore: Semaphore::new(core, 0),
            write_semaphore: Semaphore::new(core, count),
            mutex: Mutex::new(core),
            capacity,
            ring: UnsafeCell::new(Ring {
                buf: vec![0; capacity].into_boxed_slice(),
                read_index: 0,
                write_index: 0,
            }),
        }
    }

    #[inline]
    pub fn core(&self) -> CoreId {
        self.mutex.core()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the number of bytes that can be read without blocking.
    #[inline]
    pub fn len(&self) -> usize {
        self.read_semaphore.count() as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `data` to the queue, blocking for at most `timeout` until
    /// there's room for all of it. Returns `false` on timeout, in which case
    /// nothing is written.
    pub fn write<P: Port>(&'static self, kernel: &Kernel<P>, data: &[u8], timeout: TimeValue) -> bool {
        debug_assert!(
            data.len() <= self.capacity(),
            "write of {} bytes exceeds the queue's capacity",
            data.len()
        );
        let len = data.len() as i32;

        if !self.write_semaphore.acquire(kernel, len, timeout) {
            return false;
        }

        self.with_ring(kernel, |ring| ring.push(data));

        self.read_semaphore.release(kernel, len);
        true
    }

    /// Fill `out` from the queue, blocking for at most `timeout` until enough
    /// bytes are available. Returns `false` on timeout, in which case nothing
    /// is consumed.
    pub fn read<P: Port>(&'static self, kernel: &Kernel<P>, out: &mut [u8], timeout: TimeValue) -> bool {
        debug_assert!(
            out.len() <= self.capacity(),
            "read of {} bytes exceeds the queue's capacity",
            out.len()
        );
        let len = out.len() as i32;

        if !self.read_semaphore.acquire(kernel, len, timeout) {
            return false;
        }

        self.with_ring(kernel, |ring| ring.pop(out));

        self.write_semaphore.release(kernel, len);
        true
    }

    fn with_ring<P: Port>(&'static self, kernel: &Kernel<P>, f: impl FnOnce(&mut Ring)) {
        let locked = self.mutex.acquire(kernel, TimeValue::NO_TIMEOUT);
        debug_assert!(locked);

        // Safety: We hold `mutex`
        f(unsafe { &mut *self.ring.get() });

        self.mutex.release(kernel);
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Queue")
            .field("core", &self.core())
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl<P: Port> Kernel<P> {
    /// Allocate a queue bound to the caller's core. It's never freed.
    pub fn new_queue(&self, capacity: usize) -> &'static Queue {
        Box::leak(Box::new(Queue::new(self.port().current_core(), capacity)))
    }
}
