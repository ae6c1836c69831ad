//! Network Stack
//!
//! Ethernet, ARP, IPv4, ICMP, UDP, DHCP, DNS, TCP, HTTP and WebSocket. One
//! [`NetStack`] value owns all protocol state (ARP cache, DHCP client, DNS
//! resolver, TCP connection pool); every operation that can transmit takes
//! the [`NetDevice`] it may send on, so the stack runs over the virtio-net
//! driver on hardware and over a frame-recording device in tests.
//!
//! All multi-byte wire fields are big-endian and are read and written
//! byte-by-byte - nothing here relies on struct layout or alignment of
//! packet memory.

pub mod arp;
pub mod dhcp;
pub mod dns;
pub mod http;
pub mod icmp;
pub mod tcp;
pub mod udp;
pub mod websocket;

pub use dhcp::DhcpState;
pub use dns::{DnsQuery, DnsQueryState};
pub use http::{HttpRequest, HttpState, Method};
pub use tcp::{TcpConn, TcpState};
pub use websocket::{WebSocket, WsState};

use arp::ArpEntry;
use icmp::PingStatus;

// ═══════════════════════════════════════════════════════════════════════════════
// ADDRESSES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Ipv4Addr(pub [u8; 4]);

impl Ipv4Addr {
    pub const UNSPECIFIED: Ipv4Addr = Ipv4Addr([0, 0, 0, 0]);
    pub const BROADCAST: Ipv4Addr = Ipv4Addr([255, 255, 255, 255]);

    pub fn is_unspecified(&self) -> bool {
        self.0 == [0, 0, 0, 0]
    }
}

impl core::fmt::Display for Ipv4Addr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);
    pub const ZERO: MacAddr = MacAddr([0; 6]);
}

impl core::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WIRE CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

pub const ETH_HLEN: usize = 14;
pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_ARP: u16 = 0x0806;

pub const IP_HLEN: usize = 20;
pub const IP_PROTO_ICMP: u8 = 1;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;

/// Largest frame the stack builds or accepts
pub const MAX_FRAME: usize = 1600;

// ═══════════════════════════════════════════════════════════════════════════════
// DEVICE ABSTRACTION
// ═══════════════════════════════════════════════════════════════════════════════

/// A device that moves Ethernet frames.
pub trait NetDevice {
    /// Send one frame (Ethernet header included, no virtio header)
    fn send(&mut self, frame: &[u8]) -> Result<(), &'static str>;

    /// Receive one frame into `buf`; returns 0 when nothing is pending
    fn recv(&mut self, buf: &mut [u8]) -> usize;

    /// Interface MAC address
    fn mac(&self) -> MacAddr;
}

// ═══════════════════════════════════════════════════════════════════════════════
// CHECKSUM (RFC 1071)
// ═══════════════════════════════════════════════════════════════════════════════

/// Internet checksum: 16-bit one's-complement sum with end-around carry.
/// Reads the data bytewise, so the caller never needs aligned buffers.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;

    while i + 1 < data.len() {
        sum += u16::from_be_bytes([data[i], data[i + 1]]) as u32;
        i += 2;
    }
    if i < data.len() {
        sum += (data[i] as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Interface configuration, filled in by DHCP (or statically in tests)
#[derive(Clone, Copy, Debug)]
pub struct NetConfig {
    pub ip: Ipv4Addr,
    pub subnet: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns: Ipv4Addr,
    pub configured: bool,
}

impl NetConfig {
    pub const fn new() -> Self {
        NetConfig {
            ip: Ipv4Addr([0, 0, 0, 0]),
            subnet: Ipv4Addr([255, 255, 255, 0]),
            gateway: Ipv4Addr([0, 0, 0, 0]),
            dns: Ipv4Addr([0, 0, 0, 0]),
            configured: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STACK
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything the protocol suite keeps between polls.
pub struct NetStack {
    pub config: NetConfig,
    pub(crate) arp_cache: [ArpEntry; arp::ARP_CACHE_SIZE],
    pub(crate) dhcp_state: DhcpState,
    pub(crate) dhcp_xid: u32,
    pub(crate) dns_query: DnsQuery,
    pub(crate) dns_id_counter: u16,
    pub(crate) ping: PingStatus,
    pub(crate) ping_seq: u16,
    pub(crate) ping_sent_tick: u32,
    pub(crate) tcp: [TcpConn; tcp::MAX_TCP_CONNS],
    pub(crate) next_local_port: u16,
    pub(crate) rand_seed: u32,
    /// One tick per poll; all protocol timeouts count these
    pub(crate) ticks: u32,
    /// IP identification counter
    pub(crate) ip_id: u16,
}

impl NetStack {
    pub fn new() -> Self {
        NetStack {
            config: NetConfig::new(),
            arp_cache: [ArpEntry::INVALID; arp::ARP_CACHE_SIZE],
            dhcp_state: DhcpState::Idle,
            dhcp_xid: dhcp::DHCP_XID,
            dns_query: DnsQuery::new(),
            dns_id_counter: 1,
            ping: PingStatus::new(),
            ping_seq: 0,
            ping_sent_tick: 0,
            tcp: [TcpConn::CLOSED; tcp::MAX_TCP_CONNS],
            next_local_port: 49152,
            rand_seed: 0x1234_5678,
            ticks: 0,
            ip_id: 1,
        }
    }

    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    pub fn dhcp_state(&self) -> DhcpState {
        self.dhcp_state
    }

    /// Install a static configuration (bypassing DHCP)
    pub fn configure(&mut self, ip: Ipv4Addr, subnet: Ipv4Addr, gateway: Ipv4Addr, dns: Ipv4Addr) {
        self.config = NetConfig {
            ip,
            subnet,
            gateway,
            dns,
            configured: true,
        };
        self.dhcp_state = DhcpState::Configured;
    }

    /// Linear-congruential step shared by the TCP ISS and frame masking
    pub(crate) fn rand(&mut self) -> u32 {
        self.rand_seed = self.rand_seed.wrapping_mul(1103515245).wrapping_add(12345);
        self.rand_seed
    }

    /// One iteration of the network poll: drain the device, advance the
    /// DHCP, DNS and TCP state machines.
    pub fn poll(&mut self, dev: &mut dyn NetDevice) {
        self.ticks = self.ticks.wrapping_add(1);

        let mut frame = [0u8; MAX_FRAME];
        let len = dev.recv(&mut frame);
        if len > 0 {
            self.handle_frame(dev, &frame[..len]);
        }

        self.tcp_poll(dev);

        // Kick (and re-kick) DHCP while unconfigured
        if !self.config.configured && self.dhcp_state != DhcpState::Configured {
            if self.dhcp_state == DhcpState::Idle || self.ticks % dhcp::DHCP_RETRY_TICKS == 0 {
                self.dhcp_discover(dev);
            }
        }
    }

    /// Top-down dispatch on Ethernet type
    pub fn handle_frame(&mut self, dev: &mut dyn NetDevice, frame: &[u8]) {
        if frame.len() < ETH_HLEN {
            return;
        }

        let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
        match ethertype {
            ETH_P_ARP => self.handle_arp(dev, frame),
            ETH_P_IP => self.handle_ip(dev, frame),
            _ => {}
        }
    }

    fn handle_ip(&mut self, dev: &mut dyn NetDevice, frame: &[u8]) {
        let packet = &frame[ETH_HLEN..];
        if packet.len() < IP_HLEN {
            return;
        }

        let version = packet[0] >> 4;
        let header_len = ((packet[0] & 0x0F) as usize) * 4;
        if version != 4 || header_len < IP_HLEN || packet.len() < header_len {
            return;
        }

        let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
        if total_len < header_len || packet.len() < total_len {
            return;
        }

        let protocol = packet[9];
        let src_ip = Ipv4Addr([packet[12], packet[13], packet[14], packet[15]]);
        let dst_ip = Ipv4Addr([packet[16], packet[17], packet[18], packet[19]]);

        // Only frames addressed to us (or limited broadcast)
        if dst_ip != self.config.ip && dst_ip != Ipv4Addr::BROADCAST {
            return;
        }

        let src_mac = MacAddr([frame[6], frame[7], frame[8], frame[9], frame[10], frame[11]]);
        let payload = &packet[header_len..total_len];

        match protocol {
            IP_PROTO_ICMP => {
                if payload.len() >= 8 {
                    self.handle_icmp(dev, src_mac, src_ip, payload);
                }
            }
            IP_PROTO_TCP => {
                if payload.len() >= 20 {
                    self.tcp_handle(dev, src_ip, payload);
                }
            }
            IP_PROTO_UDP => {
                if payload.len() >= 8 {
                    self.handle_udp(dev, payload);
                }
            }
            _ => {}
        }
    }

    /// Write an Ethernet header into `buf`
    pub(crate) fn eth_header(buf: &mut [u8], dst: MacAddr, src: MacAddr, ethertype: u16) {
        buf[0..6].copy_from_slice(&dst.0);
        buf[6..12].copy_from_slice(&src.0);
        buf[12..14].copy_from_slice(&ethertype.to_be_bytes());
    }

    /// Write a 20-byte IPv4 header (with checksum) into `buf`
    pub(crate) fn ipv4_header(
        &mut self,
        buf: &mut [u8],
        total_len: u16,
        protocol: u8,
        src: Ipv4Addr,
        dst: Ipv4Addr,
    ) {
        let id = self.ip_id;
        self.ip_id = self.ip_id.wrapping_add(1);

        buf[0] = 0x45; // version 4, IHL 5
        buf[1] = 0;
        buf[2..4].copy_from_slice(&total_len.to_be_bytes());
        buf[4..6].copy_from_slice(&id.to_be_bytes());
        buf[6..8].copy_from_slice(&[0, 0]); // flags / fragment offset
        buf[8] = 64; // TTL
        buf[9] = protocol;
        buf[10] = 0; // checksum placeholder
        buf[11] = 0;
        buf[12..16].copy_from_slice(&src.0);
        buf[16..20].copy_from_slice(&dst.0);

        let csum = checksum(&buf[..IP_HLEN]);
        buf[10..12].copy_from_slice(&csum.to_be_bytes());
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TEST DEVICE
// ═══════════════════════════════════════════════════════════════════════════════

/// Frame-recording loopback device for tests: everything sent is captured,
/// and frames queued with [`TestDevice::inject`] are returned by `recv`.
#[cfg(test)]
pub struct TestDevice {
    pub sent: alloc::vec::Vec<alloc::vec::Vec<u8>>,
    pub rx_queue: alloc::collections::VecDeque<alloc::vec::Vec<u8>>,
    pub mac: MacAddr,
}

#[cfg(test)]
impl TestDevice {
    pub fn new() -> Self {
        TestDevice {
            sent: alloc::vec::Vec::new(),
            rx_queue: alloc::collections::VecDeque::new(),
            mac: MacAddr([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]),
        }
    }

    pub fn inject(&mut self, frame: &[u8]) {
        self.rx_queue.push_back(frame.to_vec());
    }

    pub fn last_sent(&self) -> Option<&alloc::vec::Vec<u8>> {
        self.sent.last()
    }
}

#[cfg(test)]
impl NetDevice for TestDevice {
    fn send(&mut self, frame: &[u8]) -> Result<(), &'static str> {
        self.sent.push(frame.to_vec());
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> usize {
        match self.rx_queue.pop_front() {
            Some(frame) => {
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                len
            }
            None => 0,
        }
    }

    fn mac(&self) -> MacAddr {
        self.mac
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_verifies_to_zero() {
        // Build an IP header, then verify: the checksum of a checksummed
        // header is 0.
        let mut stack = NetStack::new();
        let mut hdr = [0u8; IP_HLEN];
        stack.ipv4_header(
            &mut hdr,
            40,
            IP_PROTO_TCP,
            Ipv4Addr([10, 0, 2, 15]),
            Ipv4Addr([10, 0, 2, 2]),
        );
        assert_eq!(checksum(&hdr), 0);
    }

    #[test]
    fn test_checksum_odd_length() {
        // End-around carry with a trailing odd byte
        let data = [0x45u8, 0x00, 0x00, 0x73, 0x00];
        let c = checksum(&data);
        // Recompute by hand: 0x4500 + 0x0073 + 0x0000
        let mut sum = 0x4500u32 + 0x0073;
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        assert_eq!(c, !(sum as u16));
    }

    #[test]
    fn test_display_formats() {
        let ip = Ipv4Addr([192, 168, 1, 7]);
        let mac = MacAddr([0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01]);
        assert_eq!(alloc::format!("{}", ip), "192.168.1.7");
        assert_eq!(alloc::format!("{}", mac), "DE:AD:BE:EF:00:01");
    }

    #[test]
    fn test_ignores_foreign_ip_frames() {
        let mut stack = NetStack::new();
        stack.configure(
            Ipv4Addr([10, 0, 2, 15]),
            Ipv4Addr([255, 255, 255, 0]),
            Ipv4Addr([10, 0, 2, 2]),
            Ipv4Addr([10, 0, 2, 3]),
        );
        let mut dev = TestDevice::new();

        // ICMP echo request addressed to someone else must not be answered
        let mut frame = alloc::vec![0u8; 64];
        NetStack::eth_header(&mut frame, MacAddr::BROADCAST, dev.mac(), ETH_P_IP);
        stack.ipv4_header(
            &mut frame[ETH_HLEN..],
            28,
            IP_PROTO_ICMP,
            Ipv4Addr([10, 0, 2, 99]),
            Ipv4Addr([10, 0, 2, 77]),
        );
        frame[ETH_HLEN + IP_HLEN] = 8; // echo request
        stack.handle_frame(&mut dev, &frame);
        assert!(dev.sent.is_empty());
    }
}
