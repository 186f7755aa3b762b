//! Bounded single-producer single-consumer ring.
//!
//! All inter-thread hand-offs in the datapath go through these rings:
//! RX classifier to session, session to consumer, kernel-socket burst to
//! sender thread, RTCP retransmit buffer. The SP/SC discipline is part of
//! the concurrency model, not an optimization — each end is owned by
//! exactly one thread.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

struct RingInner<T> {
    buf: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Capacity, power of two; index mask is `cap - 1`.
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
}

unsafe impl<T: Send> Send for RingInner<T> {}
unsafe impl<T: Send> Sync for RingInner<T> {}

/// Producer end of an SPSC ring.
pub struct SpscProducer<T> {
    inner: Arc<RingInner<T>>,
}

/// Consumer end of an SPSC ring.
pub struct SpscConsumer<T> {
    inner: Arc<RingInner<T>>,
}

/// Create an SPSC ring holding at least `capacity` items.
///
/// Capacity is rounded up to the next power of two. One slot is reserved
/// to distinguish full from empty, so the usable depth is `cap - 1`.
pub fn spsc<T>(capacity: usize) -> (SpscProducer<T>, SpscConsumer<T>) {
    let cap = capacity.max(2).next_power_of_two();
    let buf = (0..cap)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let inner = Arc::new(RingInner {
        buf,
        mask: cap - 1,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
    });
    (
        SpscProducer {
            inner: inner.clone(),
        },
        SpscConsumer { inner },
    )
}

impl<T> SpscProducer<T> {
    /// Free slots currently available to the producer.
    pub fn free_count(&self) -> usize {
        let head = self.inner.head.load(Ordering::Acquire);
        let tail = self.inner.tail.load(Ordering::Relaxed);
        self.inner.mask - tail.wrapping_sub(head)
    }

    /// Enqueue one item; returns it back on a full ring.
    pub fn push(&self, item: T) -> Result<(), T> {
        let tail = self.inner.tail.load(Ordering::Relaxed);
        let head = self.inner.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= self.inner.mask {
            return Err(item);
        }
        let slot = &self.inner.buf[tail & self.inner.mask];
        unsafe { (*slot.get()).write(item) };
        self.inner.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// All-or-nothing bulk enqueue, the shared-queue hand-off discipline:
    /// a partial enqueue would reorder packets within a session.
    pub fn push_bulk(&self, items: Vec<T>) -> Result<(), Vec<T>> {
        if items.len() > self.free_count() {
            return Err(items);
        }
        let mut tail = self.inner.tail.load(Ordering::Relaxed);
        for item in items {
            let slot = &self.inner.buf[tail & self.inner.mask];
            unsafe { (*slot.get()).write(item) };
            tail = tail.wrapping_add(1);
        }
        self.inner.tail.store(tail, Ordering::Release);
        Ok(())
    }
}

impl<T> SpscConsumer<T> {
    /// Items currently queued.
    pub fn len(&self) -> usize {
        let tail = self.inner.tail.load(Ordering::Acquire);
        let head = self.inner.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dequeue one item.
    pub fn pop(&self) -> Option<T> {
        let head = self.inner.head.load(Ordering::Relaxed);
        let tail = self.inner.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let slot = &self.inner.buf[head & self.inner.mask];
        let item = unsafe { (*slot.get()).assume_init_read() };
        self.inner.head.store(head.wrapping_add(1), Ordering::Release);
        Some(item)
    }

    /// Dequeue up to `max` items into `out`; returns the count taken.
    pub fn pop_bulk(&self, out: &mut Vec<T>, max: usize) -> usize {
        let mut head = self.inner.head.load(Ordering::Relaxed);
        let tail = self.inner.tail.load(Ordering::Acquire);
        let avail = tail.wrapping_sub(head).min(max);
        for _ in 0..avail {
            let slot = &self.inner.buf[head & self.inner.mask];
            out.push(unsafe { (*slot.get()).assume_init_read() });
            head = head.wrapping_add(1);
        }
        self.inner.head.store(head, Ordering::Release);
        avail
    }
}

impl<T> Drop for RingInner<T> {
    fn drop(&mut self) {
        let mut head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        while head != tail {
            let slot = &self.buf[head & self.mask];
            unsafe { (*slot.get()).assume_init_drop() };
            head = head.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn push_pop_roundtrip() {
        let (tx, rx) = spsc::<u32>(8);
        tx.push(1).unwrap();
        tx.push(2).unwrap();
        assert_eq!(rx.pop(), Some(1));
        assert_eq!(rx.pop(), Some(2));
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn full_ring_rejects() {
        let (tx, rx) = spsc::<u32>(4);
        // usable depth is cap - 1 = 3
        tx.push(1).unwrap();
        tx.push(2).unwrap();
        tx.push(3).unwrap();
        assert_eq!(tx.push(4), Err(4));
        rx.pop().unwrap();
        tx.push(4).unwrap();
    }

    #[test]
    fn bulk_is_all_or_nothing() {
        let (tx, rx) = spsc::<u32>(4);
        assert!(tx.push_bulk(vec![1, 2, 3]).is_ok());
        // ring now full; a bulk of one must fail whole
        assert_eq!(tx.push_bulk(vec![9]), Err(vec![9]));
        let mut out = Vec::new();
        assert_eq!(rx.pop_bulk(&mut out, 16), 3);
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn cross_thread_ordering() {
        let (tx, rx) = spsc::<usize>(64);
        let producer = thread::spawn(move || {
            for i in 0..10_000 {
                loop {
                    if tx.push(i).is_ok() {
                        break;
                    }
                    std::hint::spin_loop();
                }
            }
        });
        let mut expect = 0usize;
        while expect < 10_000 {
            if let Some(v) = rx.pop() {
                assert_eq!(v, expect);
                expect += 1;
            } else {
                std::hint::spin_loop();
            }
        }
        producer.join().unwrap();
    }

    #[test]
    fn drop_releases_queued_items() {
        let (tx, _rx) = spsc::<Vec<u8>>(8);
        tx.push(vec![0u8; 128]).unwrap();
        // ring dropped with an item still queued; Drop must free it
    }
}
