//! AF_XDP backend.
//!
//! One umem per (port, queue): a page-aligned region shared with the
//! kernel, carved into fixed frames. Four rings manage ownership — FILL
//! (frames handed to the kernel for RX), RX (received descriptors), TX
//! (outbound descriptors), COMP (transmit completions).
//!
//! The XDP program and its XSKS map belong to the manager daemon; this
//! backend only receives the map fd over IPC and inserts its socket. UDP
//! destination ports in use are pushed to the daemon so the BPF allow-list
//! admits them.
//!
//! Kernel ABI constants and structs are declared locally — the uapi surface
//! is small and stable, and carrying it here avoids a libbpf dependency.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use crate::config::PortConfig;
use crate::error::{Error, Result};
use crate::flow::RxFlow;
use crate::hdr::MacAddr;
use crate::mempool::{Mbuf, MbufPool};
use crate::stats::Counter;

use super::{PortCaps, PortInfo, TxPacket};

// --- XDP uapi (linux/if_xdp.h) ---

const AF_XDP: libc::c_int = 44;
const SOL_XDP: libc::c_int = 283;

const XDP_MMAP_OFFSETS: libc::c_int = 1;
const XDP_RX_RING: libc::c_int = 2;
const XDP_TX_RING: libc::c_int = 3;
const XDP_UMEM_REG: libc::c_int = 4;
const XDP_UMEM_FILL_RING: libc::c_int = 5;
const XDP_UMEM_COMPLETION_RING: libc::c_int = 6;

const XDP_PGOFF_RX_RING: libc::off_t = 0;
const XDP_PGOFF_TX_RING: libc::off_t = 0x80000000;
const XDP_UMEM_PGOFF_FILL_RING: libc::off_t = 0x100000000;
const XDP_UMEM_PGOFF_COMPLETION_RING: libc::off_t = 0x180000000;

const XDP_COPY: u16 = 1 << 1;
const XDP_ZEROCOPY: u16 = 1 << 2;
const XDP_USE_NEED_WAKEUP: u16 = 1 << 3;

const BPF_MAP_UPDATE_ELEM: libc::c_int = 2;
const BPF_ANY: u64 = 0;

#[repr(C)]
struct SockaddrXdp {
    sxdp_family: u16,
    sxdp_flags: u16,
    sxdp_ifindex: u32,
    sxdp_queue_id: u32,
    sxdp_shared_umem_fd: u32,
}

#[repr(C)]
struct XdpUmemReg {
    addr: u64,
    len: u64,
    chunk_size: u32,
    headroom: u32,
    flags: u32,
    tx_metadata_len: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct XdpRingOffset {
    producer: u64,
    consumer: u64,
    desc: u64,
    flags: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct XdpMmapOffsets {
    rx: XdpRingOffset,
    tx: XdpRingOffset,
    fr: XdpRingOffset,
    cr: XdpRingOffset,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct XdpDesc {
    addr: u64,
    len: u32,
    options: u32,
}

#[repr(C)]
#[derive(Default)]
struct BpfMapUpdateAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value: u64,
    flags: u64,
}

const UMEM_FRAME_SIZE: u64 = 2048;
const RING_SIZE: u32 = 2048;

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn io_err(what: &str) -> Error {
    Error::Io(std::io::Error::new(
        std::io::Error::last_os_error().kind(),
        format!("{what}: errno {}", errno()),
    ))
}

/// Manager daemon operations consumed by this backend.
///
/// The daemon loads the XDP program on the interface, owns the XSKS map,
/// and maintains the UDP destination-port allow-list of the BPF filter.
pub trait ManagerIpc: Send + Sync {
    /// File descriptor of the XSKS map for (ifname, queue), passed over
    /// `SCM_RIGHTS` by the daemon.
    fn xsks_map_fd(&self, ifname: &str, queue_id: u16) -> Result<RawFd>;
    /// Widen the BPF allow-list with a destination UDP port.
    fn add_udp_dst_port(&self, ifname: &str, port: u16) -> Result<()>;
    fn del_udp_dst_port(&self, ifname: &str, port: u16) -> Result<()>;
}

/// One mapped XSK ring (any of FILL/COMP/RX/TX).
struct XskRing {
    map: *mut libc::c_void,
    map_len: usize,
    producer: *mut u32,
    consumer: *mut u32,
    desc: *mut u8,
    size: u32,
}

unsafe impl Send for XskRing {}

impl XskRing {
    fn map(
        fd: RawFd,
        pgoff: libc::off_t,
        off: &XdpRingOffset,
        entries: u32,
        desc_size: usize,
    ) -> Result<XskRing> {
        let map_len = off.desc as usize + entries as usize * desc_size;
        let map = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd,
                pgoff,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(io_err("xsk ring mmap"));
        }
        Ok(XskRing {
            map,
            map_len,
            producer: unsafe { map.add(off.producer as usize) as *mut u32 },
            consumer: unsafe { map.add(off.consumer as usize) as *mut u32 },
            desc: unsafe { map.add(off.desc as usize) as *mut u8 },
            size: entries,
        })
    }

    #[inline]
    fn producer_ref(&self) -> &AtomicU32 {
        unsafe { AtomicU32::from_ptr(self.producer) }
    }

    #[inline]
    fn consumer_ref(&self) -> &AtomicU32 {
        unsafe { AtomicU32::from_ptr(self.consumer) }
    }

    #[inline]
    fn slot<T>(&self, idx: u32) -> *mut T {
        unsafe {
            (self.desc as *mut T).add((idx & (self.size - 1)) as usize)
        }
    }
}

impl Drop for XskRing {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.map, self.map_len);
        }
    }
}

/// The shared umem region plus its FILL/COMP rings and frame free-list.
struct Umem {
    area: *mut libc::c_void,
    len: usize,
    fill: XskRing,
    comp: XskRing,
    /// Frame addresses not owned by the kernel or in-flight.
    free_frames: Vec<u64>,
    total_frames: u32,
}

unsafe impl Send for Umem {}

impl Umem {
    fn frame(&self, addr: u64) -> *mut u8 {
        unsafe { (self.area as *mut u8).add(addr as usize) }
    }
}

impl Drop for Umem {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.area, self.len);
        }
    }
}

/// An XSK: socket fd, umem, RX/TX rings. One per (port, queue).
struct XskSocket {
    fd: RawFd,
    umem: Umem,
    rx: XskRing,
    tx: XskRing,
    zero_copy: bool,
}

impl XskSocket {
    fn open(ifname: &str, queue_id: u16, frame_count: u32) -> Result<XskSocket> {
        let fd = unsafe { libc::socket(AF_XDP, libc::SOCK_RAW, 0) };
        if fd < 0 {
            return Err(io_err("AF_XDP socket"));
        }
        let guard = FdGuard(fd);

        let len = frame_count as usize * UMEM_FRAME_SIZE as usize;
        let area = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE,
                -1,
                0,
            )
        };
        if area == libc::MAP_FAILED {
            return Err(io_err("umem mmap"));
        }

        let reg = XdpUmemReg {
            addr: area as u64,
            len: len as u64,
            chunk_size: UMEM_FRAME_SIZE as u32,
            headroom: 0,
            flags: 0,
            tx_metadata_len: 0,
        };
        unsafe {
            if libc::setsockopt(
                fd,
                SOL_XDP,
                XDP_UMEM_REG,
                &reg as *const _ as *const libc::c_void,
                std::mem::size_of::<XdpUmemReg>() as libc::socklen_t,
            ) != 0
            {
                libc::munmap(area, len);
                return Err(io_err("XDP_UMEM_REG"));
            }
            for (opt, name) in [
                (XDP_UMEM_FILL_RING, "fill"),
                (XDP_UMEM_COMPLETION_RING, "comp"),
                (XDP_RX_RING, "rx"),
                (XDP_TX_RING, "tx"),
            ] {
                let entries: u32 = RING_SIZE;
                if libc::setsockopt(
                    fd,
                    SOL_XDP,
                    opt,
                    &entries as *const _ as *const libc::c_void,
                    std::mem::size_of::<u32>() as libc::socklen_t,
                ) != 0
                {
                    libc::munmap(area, len);
                    return Err(io_err(name));
                }
            }
        }

        let mut offs = XdpMmapOffsets::default();
        let mut optlen = std::mem::size_of::<XdpMmapOffsets>() as libc::socklen_t;
        if unsafe {
            libc::getsockopt(
                fd,
                SOL_XDP,
                XDP_MMAP_OFFSETS,
                &mut offs as *mut _ as *mut libc::c_void,
                &mut optlen,
            )
        } != 0
        {
            unsafe { libc::munmap(area, len) };
            return Err(io_err("XDP_MMAP_OFFSETS"));
        }

        let fill = XskRing::map(
            fd,
            XDP_UMEM_PGOFF_FILL_RING,
            &offs.fr,
            RING_SIZE,
            std::mem::size_of::<u64>(),
        )?;
        let comp = XskRing::map(
            fd,
            XDP_UMEM_PGOFF_COMPLETION_RING,
            &offs.cr,
            RING_SIZE,
            std::mem::size_of::<u64>(),
        )?;
        let rx = XskRing::map(
            fd,
            XDP_PGOFF_RX_RING,
            &offs.rx,
            RING_SIZE,
            std::mem::size_of::<XdpDesc>(),
        )?;
        let tx = XskRing::map(
            fd,
            XDP_PGOFF_TX_RING,
            &offs.tx,
            RING_SIZE,
            std::mem::size_of::<XdpDesc>(),
        )?;

        let ifindex = {
            let c = std::ffi::CString::new(ifname).map_err(|_| {
                Error::InvalidArg(format!("ifname {ifname:?}"))
            })?;
            let idx = unsafe { libc::if_nametoindex(c.as_ptr()) };
            if idx == 0 {
                return Err(Error::InvalidArg(format!("unknown interface {ifname}")));
            }
            idx
        };

        // zero-copy first, copy mode as the degraded path
        let mut zero_copy = true;
        let mut addr = SockaddrXdp {
            sxdp_family: AF_XDP as u16,
            sxdp_flags: XDP_ZEROCOPY | XDP_USE_NEED_WAKEUP,
            sxdp_ifindex: ifindex,
            sxdp_queue_id: queue_id as u32,
            sxdp_shared_umem_fd: 0,
        };
        let bind = |a: &SockaddrXdp| unsafe {
            libc::bind(
                fd,
                a as *const _ as *const libc::sockaddr,
                std::mem::size_of::<SockaddrXdp>() as libc::socklen_t,
            )
        };
        if bind(&addr) != 0 {
            let e = errno();
            if e == libc::EPERM || e == libc::EOPNOTSUPP || e == libc::EINVAL {
                tracing::warn!(ifname, queue_id, errno = e, "zero-copy bind failed, falling back to copy mode");
                addr.sxdp_flags = XDP_COPY | XDP_USE_NEED_WAKEUP;
                zero_copy = false;
                if bind(&addr) != 0 {
                    return Err(io_err("xsk bind"));
                }
            } else {
                return Err(io_err("xsk bind"));
            }
        }

        std::mem::forget(guard);
        let mut umem = Umem {
            area,
            len,
            fill,
            comp,
            free_frames: (0..frame_count as u64).map(|i| i * UMEM_FRAME_SIZE).collect(),
            total_frames: frame_count,
        };

        // pre-fill half the frames for RX
        let mut sock = {
            let half = frame_count / 2;
            let frames: Vec<u64> = umem.free_frames.split_off(umem.free_frames.len() - half as usize);
            let s = XskSocket {
                fd,
                umem,
                rx,
                tx,
                zero_copy,
            };
            (s, frames)
        };
        sock.0.fill_frames(&sock.1);
        tracing::info!(ifname, queue_id, zero_copy = sock.0.zero_copy, "xsk socket bound");
        Ok(sock.0)
    }

    /// Hand frames to the kernel on the FILL ring.
    fn fill_frames(&mut self, addrs: &[u64]) {
        let ring = &self.umem.fill;
        let prod = ring.producer_ref().load(Ordering::Relaxed);
        let cons = ring.consumer_ref().load(Ordering::Acquire);
        let free = ring.size - prod.wrapping_sub(cons);
        let n = (addrs.len() as u32).min(free);
        for (i, &addr) in addrs[..n as usize].iter().enumerate() {
            unsafe {
                *ring.slot::<u64>(prod.wrapping_add(i as u32)) = addr;
            }
        }
        ring.producer_ref()
            .store(prod.wrapping_add(n), Ordering::Release);
        // leftover frames return to the free list
        for &addr in &addrs[n as usize..] {
            self.umem.free_frames.push(addr);
        }
    }

    /// Reclaim completed TX frames from the COMP ring.
    fn drain_completions(&mut self) -> usize {
        let ring = &self.umem.comp;
        let prod = ring.producer_ref().load(Ordering::Acquire);
        let cons = ring.consumer_ref().load(Ordering::Relaxed);
        let n = prod.wrapping_sub(cons);
        for i in 0..n {
            let addr = unsafe { *ring.slot::<u64>(cons.wrapping_add(i)) };
            self.umem.free_frames.push(addr);
        }
        ring.consumer_ref()
            .store(cons.wrapping_add(n), Ordering::Release);
        n as usize
    }

    fn kick_tx(&self) {
        unsafe {
            libc::sendto(
                self.fd,
                std::ptr::null(),
                0,
                libc::MSG_DONTWAIT,
                std::ptr::null(),
                0,
            );
        }
    }
}

impl Drop for XskSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

struct FdGuard(RawFd);

impl Drop for FdGuard {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

/// Insert the socket into the daemon's XSKS map so the XDP program can
/// redirect matching packets to it.
fn insert_into_xsks_map(map_fd: RawFd, queue_id: u16, xsk_fd: RawFd) -> Result<()> {
    let key = queue_id as u32;
    let value = xsk_fd as u32;
    let attr = BpfMapUpdateAttr {
        map_fd: map_fd as u32,
        _pad: 0,
        key: &key as *const u32 as u64,
        value: &value as *const u32 as u64,
        flags: BPF_ANY,
    };
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            BPF_MAP_UPDATE_ELEM,
            &attr as *const _ as *const libc::c_void,
            std::mem::size_of::<BpfMapUpdateAttr>(),
        )
    };
    if ret != 0 {
        return Err(io_err("bpf map update"));
    }
    Ok(())
}

/// AF_XDP port.
pub struct AfXdpBackend {
    info: PortInfo,
    manager: Arc<dyn ManagerIpc>,
    next_qid: AtomicU16,
}

impl AfXdpBackend {
    pub fn open(cfg: &PortConfig, manager: Arc<dyn ManagerIpc>) -> Result<AfXdpBackend> {
        if cfg.ifname.is_empty() {
            return Err(Error::InvalidArg("af_xdp requires an interface name".into()));
        }
        let info = PortInfo {
            ifname: cfg.ifname.clone(),
            pmd: cfg.pmd,
            sip: cfg.sip_addr,
            mac: MacAddr([0x02, 0, 0, 0, 0, 2]),
            caps: PortCaps::HW_RATE_LIMIT,
            tx_queues: cfg.tx_queues_cnt,
            rx_queues: cfg.rx_queues_cnt,
        };
        tracing::info!(ifname = %cfg.ifname, "af_xdp port opened");
        Ok(AfXdpBackend {
            info,
            manager,
            next_qid: AtomicU16::new(0),
        })
    }

    pub fn info(&self) -> &PortInfo {
        &self.info
    }

    pub fn get_tx_queue(&self, _pool: &MbufPool) -> Result<XdpTxQueue> {
        let qid = self.next_qid.fetch_add(1, Ordering::SeqCst);
        if qid >= self.info.tx_queues {
            return Err(Error::NoBuffer("xdp queues exhausted"));
        }
        let xsk = XskSocket::open(&self.info.ifname, qid, RING_SIZE * 2)?;
        Ok(XdpTxQueue {
            qid,
            ifname: self.info.ifname.clone(),
            xsk,
            stat_tx_pkts: Counter::new(),
        })
    }

    pub fn get_rx_queue(&self, pool: &MbufPool, flow: &RxFlow) -> Result<XdpRxQueue> {
        let qid = self.next_qid.fetch_add(1, Ordering::SeqCst);
        if qid >= self.info.rx_queues {
            return Err(Error::NoBuffer("xdp queues exhausted"));
        }
        let xsk = XskSocket::open(&self.info.ifname, qid, RING_SIZE * 2)?;
        let map_fd = self.manager.xsks_map_fd(&self.info.ifname, qid)?;
        insert_into_xsks_map(map_fd, qid, xsk.fd)?;
        self.manager
            .add_udp_dst_port(&self.info.ifname, flow.dst_port)?;
        Ok(XdpRxQueue {
            qid,
            ifname: self.info.ifname.clone(),
            dst_port: flow.dst_port,
            manager: self.manager.clone(),
            xsk,
            pool: pool.clone(),
            stat_rx_pkts: Counter::new(),
            stat_rx_nobuf: Counter::new(),
        })
    }
}

/// AF_XDP TX queue.
pub struct XdpTxQueue {
    qid: u16,
    ifname: String,
    xsk: XskSocket,
    pub stat_tx_pkts: Counter,
}

impl XdpTxQueue {
    pub fn queue_id(&self) -> u16 {
        self.qid
    }

    pub fn tx_burst(&mut self, pkts: &mut Vec<TxPacket>) -> Result<usize> {
        self.xsk.drain_completions();
        let mut sent = 0;
        while !pkts.is_empty() {
            let Some(frame_addr) = self.xsk.umem.free_frames.pop() else {
                break;
            };
            let ring = &self.xsk.tx;
            let prod = ring.producer_ref().load(Ordering::Relaxed);
            let cons = ring.consumer_ref().load(Ordering::Acquire);
            if prod.wrapping_sub(cons) >= ring.size {
                self.xsk.umem.free_frames.push(frame_addr);
                break;
            }
            let pkt = pkts.remove(0);
            let wire = pkt.mbuf.to_wire();
            let len = wire.len().min(UMEM_FRAME_SIZE as usize);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    wire.as_ptr(),
                    self.xsk.umem.frame(frame_addr),
                    len,
                );
                *ring.slot::<XdpDesc>(prod) = XdpDesc {
                    addr: frame_addr,
                    len: len as u32,
                    options: 0,
                };
            }
            ring.producer_ref()
                .store(prod.wrapping_add(1), Ordering::Release);
            sent += 1;
            self.stat_tx_pkts.inc();
        }
        if sent > 0 {
            self.xsk.kick_tx();
        }
        Ok(sent)
    }

    /// Per-queue hardware shaper through the net sysfs tx_maxrate knob.
    pub fn set_tx_rate(&mut self, bytes_per_sec: u64) -> Result<()> {
        let mbps = bytes_per_sec * 8 / 1_000_000;
        let path = format!(
            "/sys/class/net/{}/queues/tx-{}/tx_maxrate",
            self.ifname, self.qid
        );
        std::fs::write(&path, mbps.to_string())?;
        tracing::info!(path, mbps, "tx_maxrate set");
        Ok(())
    }

    pub fn flush(&mut self, pad: impl Fn() -> Result<Mbuf>) -> Result<()> {
        // emit padding until every in-flight frame completes; half the
        // population stays with the kernel on the FILL ring
        let idle_level = self.xsk.umem.total_frames as usize / 2;
        let mut spins = 0;
        while self.xsk.umem.free_frames.len() < idle_level {
            self.xsk.drain_completions();
            self.xsk.kick_tx();
            if spins > 1000 {
                let m = pad()?;
                let mut v = vec![TxPacket::from(m)];
                self.tx_burst(&mut v)?;
                spins = 0;
            }
            spins += 1;
            std::hint::spin_loop();
        }
        Ok(())
    }
}

/// AF_XDP RX queue.
pub struct XdpRxQueue {
    qid: u16,
    ifname: String,
    dst_port: u16,
    manager: Arc<dyn ManagerIpc>,
    xsk: XskSocket,
    pool: MbufPool,
    pub stat_rx_pkts: Counter,
    pub stat_rx_nobuf: Counter,
}

impl XdpRxQueue {
    pub fn queue_id(&self) -> u16 {
        self.qid
    }

    pub fn rx_burst(&mut self, out: &mut Vec<Mbuf>, max: usize) -> usize {
        let ring = &self.xsk.rx;
        let prod = ring.producer_ref().load(Ordering::Acquire);
        let cons = ring.consumer_ref().load(Ordering::Relaxed);
        let avail = prod.wrapping_sub(cons).min(max as u32);
        let mut taken = 0u32;
        let mut recycle = Vec::new();
        for i in 0..avail {
            let desc = unsafe { *ring.slot::<XdpDesc>(cons.wrapping_add(i)) };
            let Ok(mut mbuf) = self.pool.alloc() else {
                self.stat_rx_nobuf.inc();
                recycle.push(desc.addr & !(UMEM_FRAME_SIZE - 1));
                taken += 1;
                continue;
            };
            let src = self.xsk.umem.frame(desc.addr);
            if let Ok(dst) = mbuf.append(desc.len as usize) {
                unsafe {
                    std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), desc.len as usize);
                }
                out.push(mbuf);
                self.stat_rx_pkts.inc();
            }
            recycle.push(desc.addr & !(UMEM_FRAME_SIZE - 1));
            taken += 1;
        }
        ring.consumer_ref()
            .store(cons.wrapping_add(taken), Ordering::Release);
        if !recycle.is_empty() {
            self.xsk.fill_frames(&recycle);
        }
        taken as usize
    }
}

impl Drop for XdpRxQueue {
    fn drop(&mut self) {
        let _ = self.manager.del_udp_dst_port(&self.ifname, self.dst_port);
    }
}
