//! Fixed-size packet buffer pool.
//!
//! Every queue owns (or shares, with the mono-pool flags) one pool sized at
//! init. Buffers are linear and ownership-transferred: an [`Mbuf`] is held
//! by exactly one owner from alloc to drop, so non-external buffers carry no
//! reference count. External payload segments attached for zero-copy frames
//! are the only shared case and use an `Arc` internally.
//!
//! The free list is a lock-free index stack (CAS with a generation tag), so
//! alloc and free are safe from any thread without a pool lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{Error, Result};

/// Default bytes reserved in front of the packet for L2/L3/L4 headers.
pub const DEFAULT_HEADROOM: usize = 64;

const NIL: u32 = u32::MAX;

struct FreeStack {
    /// Packed (generation << 32 | index); generation defeats ABA.
    head: AtomicU64,
    next: Box<[AtomicU32]>,
}

impl FreeStack {
    fn new(count: u32) -> Self {
        let next: Vec<AtomicU32> = (0..count)
            .map(|i| AtomicU32::new(if i + 1 < count { i + 1 } else { NIL }))
            .collect();
        Self {
            head: AtomicU64::new(if count == 0 { NIL as u64 } else { 0 }),
            next: next.into_boxed_slice(),
        }
    }

    fn pop(&self) -> Option<u32> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let idx = head as u32;
            if idx == NIL {
                return None;
            }
            let tag = head >> 32;
            let next = self.next[idx as usize].load(Ordering::Relaxed);
            let new = ((tag + 1) << 32) | next as u64;
            if self
                .head
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(idx);
            }
        }
    }

    fn push(&self, idx: u32) {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tag = head >> 32;
            self.next[idx as usize].store(head as u32, Ordering::Relaxed);
            let new = ((tag + 1) << 32) | idx as u64;
            if self
                .head
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }
}

struct PoolInner {
    /// Backing store, `count * buf_size` bytes; each slot is written only
    /// through the unique `Mbuf` holding its index.
    storage: std::cell::UnsafeCell<Box<[u8]>>,
    buf_size: usize,
    headroom: usize,
    free: FreeStack,
    count: u32,
}

// Slot contents are only touched by the unique Mbuf holding that index.
unsafe impl Sync for PoolInner {}

/// Pool of fixed-size packet buffers.
#[derive(Clone)]
pub struct MbufPool {
    inner: Arc<PoolInner>,
}

impl MbufPool {
    /// Create a pool of `count` buffers of `buf_size` bytes each.
    pub fn new(name: &str, count: u32, buf_size: usize) -> Result<Self> {
        Self::with_headroom(name, count, buf_size, DEFAULT_HEADROOM)
    }

    pub fn with_headroom(
        name: &str,
        count: u32,
        buf_size: usize,
        headroom: usize,
    ) -> Result<Self> {
        if count == 0 || buf_size <= headroom {
            return Err(Error::InvalidArg(format!(
                "pool {name}: count {count}, buf_size {buf_size}, headroom {headroom}"
            )));
        }
        let storage = vec![0u8; count as usize * buf_size].into_boxed_slice();
        tracing::debug!(name, count, buf_size, "mbuf pool created");
        Ok(Self {
            inner: Arc::new(PoolInner {
                storage: std::cell::UnsafeCell::new(storage),
                buf_size,
                headroom,
                free: FreeStack::new(count),
                count,
            }),
        })
    }

    /// Buffers currently on the free list.
    pub fn free_count(&self) -> u32 {
        let mut n = 0;
        let mut idx = self.inner.free.head.load(Ordering::Acquire) as u32;
        while idx != NIL {
            n += 1;
            idx = self.inner.free.next[idx as usize].load(Ordering::Relaxed);
        }
        n
    }

    /// Total population.
    pub fn capacity(&self) -> u32 {
        self.inner.count
    }

    /// Usable bytes per buffer after headroom.
    pub fn payload_capacity(&self) -> usize {
        self.inner.buf_size - self.inner.headroom
    }

    /// Allocate one buffer.
    pub fn alloc(&self) -> Result<Mbuf> {
        let idx = self
            .inner
            .free
            .pop()
            .ok_or(Error::NoBuffer("mbuf pool empty"))?;
        Ok(Mbuf {
            pool: self.inner.clone(),
            idx,
            data_off: self.inner.headroom,
            data_len: 0,
            ext: None,
        })
    }

    /// All-or-nothing bulk allocation, the TX packetizer contract.
    pub fn alloc_bulk(&self, n: usize) -> Result<Vec<Mbuf>> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            match self.alloc() {
                Ok(m) => out.push(m),
                Err(e) => {
                    // roll back what we took; drop returns them
                    drop(out);
                    return Err(e);
                }
            }
        }
        Ok(out)
    }
}

/// Shared external payload segment for zero-copy frames.
///
/// The producer keeps its frame alive through the `Arc`; the mbuf chain
/// only references a window into it.
#[derive(Clone)]
pub struct ExtSeg {
    pub buf: Arc<Vec<u8>>,
    pub offset: usize,
    pub len: usize,
}

impl ExtSeg {
    pub fn bytes(&self) -> &[u8] {
        &self.buf[self.offset..self.offset + self.len]
    }
}

/// A packet buffer descriptor: headroom + linear data, optionally followed
/// by one external payload segment.
pub struct Mbuf {
    pool: Arc<PoolInner>,
    idx: u32,
    data_off: usize,
    data_len: usize,
    ext: Option<ExtSeg>,
}

impl Mbuf {
    fn slot(&self) -> *mut u8 {
        unsafe {
            (*self.pool.storage.get())
                .as_mut_ptr()
                .add(self.idx as usize * self.pool.buf_size)
        }
    }

    /// Bytes available in front of the packet start.
    pub fn headroom(&self) -> usize {
        self.data_off
    }

    /// Bytes available after the packet end.
    pub fn tailroom(&self) -> usize {
        self.pool.buf_size - self.data_off - self.data_len
    }

    /// Packet bytes in the linear segment.
    pub fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.slot().add(self.data_off), self.data_len) }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.slot().add(self.data_off), self.data_len)
        }
    }

    /// Linear segment length.
    pub fn data_len(&self) -> usize {
        self.data_len
    }

    /// Total packet length including the external segment.
    pub fn pkt_len(&self) -> usize {
        self.data_len + self.ext.as_ref().map_or(0, |e| e.len)
    }

    /// Grow the linear segment by `n` bytes at the tail and return the
    /// newly exposed region.
    pub fn append(&mut self, n: usize) -> Result<&mut [u8]> {
        if n > self.tailroom() {
            return Err(Error::NoBuffer("mbuf tailroom"));
        }
        let start = self.data_len;
        self.data_len += n;
        Ok(&mut self.data_mut()[start..])
    }

    /// Copy `bytes` onto the tail of the linear segment.
    pub fn append_from(&mut self, bytes: &[u8]) -> Result<()> {
        self.append(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// Extend the packet start into the headroom by `n` bytes.
    pub fn prepend(&mut self, n: usize) -> Result<&mut [u8]> {
        if n > self.data_off {
            return Err(Error::NoBuffer("mbuf headroom"));
        }
        self.data_off -= n;
        self.data_len += n;
        Ok(&mut self.data_mut()[..n])
    }

    /// Reset to an empty packet at the default headroom.
    pub fn reset(&mut self) {
        self.data_off = self.pool.headroom;
        self.data_len = 0;
        self.ext = None;
    }

    /// Truncate or extend the linear length (must fit the buffer).
    pub fn set_data_len(&mut self, len: usize) -> Result<()> {
        if self.data_off + len > self.pool.buf_size {
            return Err(Error::NoBuffer("mbuf overflow"));
        }
        self.data_len = len;
        Ok(())
    }

    /// Attach an external payload segment after the linear headers.
    pub fn set_ext(&mut self, seg: ExtSeg) {
        self.ext = Some(seg);
    }

    pub fn ext(&self) -> Option<&ExtSeg> {
        self.ext.as_ref()
    }

    /// Copy the whole packet (linear + external) into a fresh vector.
    ///
    /// Used where a wire-image copy must outlive the mbuf, e.g. the RTCP
    /// retransmit buffer and pcap dumps.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pkt_len());
        out.extend_from_slice(self.data());
        if let Some(ext) = &self.ext {
            out.extend_from_slice(ext.bytes());
        }
        out
    }
}

impl Drop for Mbuf {
    fn drop(&mut self) {
        self.pool.free.push(self.idx);
    }
}

impl std::fmt::Debug for Mbuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mbuf")
            .field("idx", &self.idx)
            .field("data_off", &self.data_off)
            .field("data_len", &self.data_len)
            .field("ext_len", &self.ext.as_ref().map(|e| e.len))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_pool() -> MbufPool {
        MbufPool::new("test", 8, 2048).unwrap()
    }

    #[test]
    fn alloc_free_cycle() {
        let pool = make_pool();
        assert_eq!(pool.free_count(), 8);
        let m = pool.alloc().unwrap();
        assert_eq!(pool.free_count(), 7);
        drop(m);
        assert_eq!(pool.free_count(), 8);
    }

    #[test]
    fn exhaustion_is_enomem() {
        let pool = MbufPool::new("small", 2, 512).unwrap();
        let _a = pool.alloc().unwrap();
        let _b = pool.alloc().unwrap();
        assert!(matches!(pool.alloc(), Err(Error::NoBuffer(_))));
    }

    #[test]
    fn bulk_alloc_rolls_back() {
        let pool = MbufPool::new("small", 4, 512).unwrap();
        let _held = pool.alloc().unwrap();
        // only 3 free; a bulk of 4 must fail and restore the free count
        assert!(pool.alloc_bulk(4).is_err());
        assert_eq!(pool.free_count(), 3);
        let got = pool.alloc_bulk(3).unwrap();
        assert_eq!(got.len(), 3);
    }

    #[test]
    fn append_prepend_layout() {
        let pool = make_pool();
        let mut m = pool.alloc().unwrap();
        assert_eq!(m.headroom(), DEFAULT_HEADROOM);
        m.append_from(b"payload").unwrap();
        m.prepend(4).unwrap().copy_from_slice(b"hdr!");
        assert_eq!(m.data(), b"hdr!payload");
        assert_eq!(m.headroom(), DEFAULT_HEADROOM - 4);
    }

    #[test]
    fn ext_segment_in_wire_copy() {
        let pool = make_pool();
        let mut m = pool.alloc().unwrap();
        m.append_from(b"hdr").unwrap();
        let frame = Arc::new(b"0123456789".to_vec());
        m.set_ext(ExtSeg {
            buf: frame,
            offset: 2,
            len: 5,
        });
        assert_eq!(m.pkt_len(), 8);
        assert_eq!(m.to_wire(), b"hdr23456");
    }

    #[test]
    fn concurrent_alloc_free() {
        let pool = MbufPool::new("mt", 64, 256).unwrap();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let p = pool.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    if let Ok(mut m) = p.alloc() {
                        m.append_from(&[0xAB; 16]).unwrap();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.free_count(), 64);
    }
}
