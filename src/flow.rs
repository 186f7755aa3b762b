//! RX flow classification table.
//!
//! A flow steers `(dst IP, dst UDP port[, src IP])` to a queue. When the
//! backend supports hardware classification the table mirrors what was
//! installed in the NIC; otherwise the same match logic runs in software in
//! the shared-queue dispatcher. Install and remove are serialized per port
//! by the command lock — flow programming is one of the control-plane
//! operations drivers cannot service concurrently.

use std::net::Ipv4Addr;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::hdr::PacketHeaders;

bitflags::bitflags! {
    /// Flow match relaxations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FlowFlags: u32 {
        /// Do not match on IP addresses.
        const NO_IP = 1 << 0;
        /// Do not match on the destination UDP port.
        const NO_PORT = 1 << 1;
        /// This is the catch-all system/CNI flow.
        const SYS_QUEUE = 1 << 2;
        /// Skip destination-port validation on shared/RSS paths. The caller
        /// guarantees port uniqueness at a higher layer.
        const SKIP_UDP_PORT_CHECK = 1 << 3;
    }
}

/// Classifier for one RX session.
#[derive(Debug, Clone)]
pub struct RxFlow {
    /// Destination of the stream (multicast group or our unicast IP).
    pub dst_ip: Ipv4Addr,
    /// Expected sender, used for unicast pairs; `None` for multicast.
    pub src_ip: Option<Ipv4Addr>,
    pub dst_port: u16,
    pub flags: FlowFlags,
}

impl RxFlow {
    /// Software match against a parsed packet, the same predicate hardware
    /// flows encode.
    ///
    /// Multicast flows key on destination IP only; unicast flows key on the
    /// (sender, receiver) pair, mirroring the NIC rule layout.
    pub fn matches(&self, hdrs: &PacketHeaders) -> bool {
        if !self.flags.contains(FlowFlags::NO_PORT)
            && !self.flags.contains(FlowFlags::SKIP_UDP_PORT_CHECK)
            && hdrs.dst_port != self.dst_port
        {
            return false;
        }
        if self.flags.contains(FlowFlags::NO_IP) {
            return true;
        }
        if self.dst_ip.is_multicast() {
            hdrs.dst_ip == self.dst_ip
        } else {
            match self.src_ip {
                Some(src) => hdrs.src_ip == src && hdrs.dst_ip == self.dst_ip,
                None => hdrs.dst_ip == self.dst_ip,
            }
        }
    }
}

/// Handle returned by [`FlowTable::install`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowHandle(u32);

struct FlowEntry {
    id: u32,
    queue_id: u16,
    flow: RxFlow,
}

/// Per-port registry of installed flows.
pub struct FlowTable {
    entries: Mutex<Vec<FlowEntry>>,
    next_id: std::sync::atomic::AtomicU32,
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Install a classifier steering `flow` to `queue_id`.
    pub fn install(&self, queue_id: u16, flow: RxFlow) -> FlowHandle {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        tracing::info!(
            queue = queue_id,
            ip = %flow.dst_ip,
            port = flow.dst_port,
            "flow installed"
        );
        self.entries.lock().push(FlowEntry {
            id,
            queue_id,
            flow,
        });
        FlowHandle(id)
    }

    /// Remove a previously installed classifier.
    pub fn remove(&self, handle: FlowHandle) -> Result<()> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.id != handle.0);
        if entries.len() == before {
            return Err(Error::NotFound("flow"));
        }
        Ok(())
    }

    /// Queue the first matching flow steers this packet to.
    pub fn classify(&self, hdrs: &PacketHeaders) -> Option<u16> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.flow.matches(hdrs))
            .map(|e| e.queue_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hdr::MacAddr;

    fn make_hdrs(src_ip: [u8; 4], dst_ip: [u8; 4], dst_port: u16) -> PacketHeaders {
        PacketHeaders {
            dst_mac: MacAddr::default(),
            src_mac: MacAddr::default(),
            src_ip: Ipv4Addr::from(src_ip),
            dst_ip: Ipv4Addr::from(dst_ip),
            src_port: 40000,
            dst_port,
            payload_len: 0,
        }
    }

    #[test]
    fn multicast_match_ignores_source() {
        let flow = RxFlow {
            dst_ip: Ipv4Addr::new(239, 0, 0, 1),
            src_ip: None,
            dst_port: 20000,
            flags: FlowFlags::empty(),
        };
        assert!(flow.matches(&make_hdrs([10, 0, 0, 1], [239, 0, 0, 1], 20000)));
        assert!(flow.matches(&make_hdrs([10, 0, 0, 99], [239, 0, 0, 1], 20000)));
        assert!(!flow.matches(&make_hdrs([10, 0, 0, 1], [239, 0, 0, 2], 20000)));
        assert!(!flow.matches(&make_hdrs([10, 0, 0, 1], [239, 0, 0, 1], 20002)));
    }

    #[test]
    fn unicast_match_keys_on_pair() {
        let flow = RxFlow {
            dst_ip: Ipv4Addr::new(192, 168, 1, 10),
            src_ip: Some(Ipv4Addr::new(192, 168, 1, 20)),
            dst_port: 20000,
            flags: FlowFlags::empty(),
        };
        assert!(flow.matches(&make_hdrs([192, 168, 1, 20], [192, 168, 1, 10], 20000)));
        assert!(!flow.matches(&make_hdrs([192, 168, 1, 21], [192, 168, 1, 10], 20000)));
    }

    #[test]
    fn port_only_flow() {
        let flow = RxFlow {
            dst_ip: Ipv4Addr::UNSPECIFIED,
            src_ip: None,
            dst_port: 20000,
            flags: FlowFlags::NO_IP,
        };
        assert!(flow.matches(&make_hdrs([1, 2, 3, 4], [5, 6, 7, 8], 20000)));
        assert!(!flow.matches(&make_hdrs([1, 2, 3, 4], [5, 6, 7, 8], 30000)));
    }

    #[test]
    fn skip_port_check_widens_match() {
        let flow = RxFlow {
            dst_ip: Ipv4Addr::new(239, 0, 0, 1),
            src_ip: None,
            dst_port: 20000,
            flags: FlowFlags::SKIP_UDP_PORT_CHECK,
        };
        assert!(flow.matches(&make_hdrs([10, 0, 0, 1], [239, 0, 0, 1], 30000)));
    }

    #[test]
    fn table_install_classify_remove() {
        let table = FlowTable::new();
        let handle = table.install(
            3,
            RxFlow {
                dst_ip: Ipv4Addr::new(239, 0, 0, 1),
                src_ip: None,
                dst_port: 20000,
                flags: FlowFlags::empty(),
            },
        );
        let hdrs = make_hdrs([10, 0, 0, 1], [239, 0, 0, 1], 20000);
        assert_eq!(table.classify(&hdrs), Some(3));
        table.remove(handle).unwrap();
        assert_eq!(table.classify(&hdrs), None);
        assert!(table.remove(handle).is_err());
    }
}
