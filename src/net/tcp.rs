//! TCP
//!
//! Connection-oriented transport over a fixed pool of four connections.
//! Outgoing connections only; segments route through the gateway, and an
//! ARP miss drops the segment (retransmission reissues it). All header
//! fields are written byte-by-byte in network order.

use super::{Ipv4Addr, NetDevice, NetStack, ETH_HLEN, ETH_P_IP, IP_HLEN, IP_PROTO_TCP};

pub const MAX_TCP_CONNS: usize = 4;
pub const TCP_RX_BUF_SIZE: usize = 4096;

/// Maximum segment payload
pub const TCP_MSS: usize = 1400;

// Header flags
pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;

const TCP_HLEN: usize = 20;

// Tick deadlines
const SYN_TIMEOUT: u32 = 500;
const SYN_MAX_RETRIES: u32 = 5;
const FIN_TIMEOUT: u32 = 5000;
const TIME_WAIT_TIMEOUT: u32 = 2000;

/// Connection states (client-side subset plus passive close)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    SynSent,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    LastAck,
    TimeWait,
}

/// One connection slot
pub struct TcpConn {
    pub state: TcpState,
    pub remote_ip: Ipv4Addr,
    pub local_port: u16,
    pub remote_port: u16,
    /// Our next sequence number
    pub seq_num: u32,
    /// Next byte we expect from the peer
    pub ack_num: u32,
    pub last_ack_sent: u32,
    pub(crate) rx_buffer: [u8; TCP_RX_BUF_SIZE],
    pub rx_len: usize,
    pub rx_ready: bool,
    pub(crate) timeout_tick: u32,
    pub(crate) retries: u32,
}

impl TcpConn {
    pub const CLOSED: TcpConn = TcpConn {
        state: TcpState::Closed,
        remote_ip: Ipv4Addr([0, 0, 0, 0]),
        local_port: 0,
        remote_port: 0,
        seq_num: 0,
        ack_num: 0,
        last_ack_sent: 0,
        rx_buffer: [0; TCP_RX_BUF_SIZE],
        rx_len: 0,
        rx_ready: false,
        timeout_tick: 0,
        retries: 0,
    };
}

/// TCP checksum over the standard pseudo-header plus the segment, summed
/// bytewise so the segment buffer needs no particular alignment.
pub fn tcp_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    // Pseudo-header: source, destination, protocol, TCP length
    sum += ((src.0[0] as u32) << 8) | src.0[1] as u32;
    sum += ((src.0[2] as u32) << 8) | src.0[3] as u32;
    sum += ((dst.0[0] as u32) << 8) | dst.0[1] as u32;
    sum += ((dst.0[2] as u32) << 8) | dst.0[3] as u32;
    sum += IP_PROTO_TCP as u32;
    sum += segment.len() as u32;

    let mut i = 0;
    while i + 1 < segment.len() {
        sum += ((segment[i] as u32) << 8) | segment[i + 1] as u32;
        i += 2;
    }
    if i < segment.len() {
        sum += (segment[i] as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

impl NetStack {
    /// Open a connection slot and send the SYN. Returns the slot index.
    pub fn tcp_connect(
        &mut self,
        dev: &mut dyn NetDevice,
        ip: Ipv4Addr,
        port: u16,
    ) -> Result<usize, &'static str> {
        if !self.config.configured {
            return Err("network not configured");
        }

        let idx = self
            .tcp
            .iter()
            .position(|c| c.state == TcpState::Closed)
            .ok_or("no free connections")?;

        let local_port = self.next_local_port;
        self.next_local_port += 1;
        if self.next_local_port > 65000 {
            self.next_local_port = 49152;
        }

        let iss = self.rand();

        let conn = &mut self.tcp[idx];
        *conn = TcpConn::CLOSED;
        conn.remote_ip = ip;
        conn.remote_port = port;
        conn.local_port = local_port;
        conn.seq_num = iss;
        conn.state = TcpState::SynSent;
        conn.timeout_tick = self.ticks.wrapping_add(SYN_TIMEOUT);

        self.send_segment(dev, idx, TCP_SYN, &[]);
        Ok(idx)
    }

    /// Build and transmit one segment for connection `idx`. Sequence space
    /// advances for SYN, FIN and payload bytes after a successful route.
    pub(crate) fn send_segment(
        &mut self,
        dev: &mut dyn NetDevice,
        idx: usize,
        flags: u8,
        payload: &[u8],
    ) {
        if !self.config.configured {
            return;
        }

        // All egress goes via the gateway; on a cache miss the segment is
        // dropped and the retransmit path reissues it.
        let gateway = self.config.gateway;
        let dst_mac = match self.arp_lookup(gateway) {
            Some(mac) => mac,
            None => {
                self.arp_request(dev, gateway);
                return;
            }
        };

        let local_port = self.tcp[idx].local_port;
        let remote_port = self.tcp[idx].remote_port;
        let remote_ip = self.tcp[idx].remote_ip;
        let seq = self.tcp[idx].seq_num;
        let ack = self.tcp[idx].ack_num;
        let src_ip = self.config.ip;

        let seg_len = TCP_HLEN + payload.len();
        let total = ETH_HLEN + IP_HLEN + seg_len;
        let mut frame = [0u8; super::MAX_FRAME];

        Self::eth_header(&mut frame, dst_mac, dev.mac(), ETH_P_IP);
        self.ipv4_header(
            &mut frame[ETH_HLEN..],
            (IP_HLEN + seg_len) as u16,
            IP_PROTO_TCP,
            src_ip,
            remote_ip,
        );

        {
            let tcp = &mut frame[ETH_HLEN + IP_HLEN..total];
            tcp[0..2].copy_from_slice(&local_port.to_be_bytes());
            tcp[2..4].copy_from_slice(&remote_port.to_be_bytes());
            tcp[4..8].copy_from_slice(&seq.to_be_bytes());
            tcp[8..12].copy_from_slice(&ack.to_be_bytes());
            tcp[12] = 0x50; // data offset: 5 words
            tcp[13] = flags;
            tcp[14..16].copy_from_slice(&(TCP_RX_BUF_SIZE as u16).to_be_bytes());
            tcp[16] = 0; // checksum placeholder
            tcp[17] = 0;
            tcp[18] = 0; // urgent pointer
            tcp[19] = 0;
            tcp[TCP_HLEN..].copy_from_slice(payload);

            let csum = tcp_checksum(src_ip, remote_ip, tcp);
            tcp[16..18].copy_from_slice(&csum.to_be_bytes());
        }

        let _ = dev.send(&frame[..total]);

        let conn = &mut self.tcp[idx];
        if flags & TCP_SYN != 0 {
            conn.seq_num = conn.seq_num.wrapping_add(1);
        }
        if flags & TCP_FIN != 0 {
            conn.seq_num = conn.seq_num.wrapping_add(1);
        }
        conn.seq_num = conn.seq_num.wrapping_add(payload.len() as u32);
    }

    /// Send application data, split into MSS-sized PSH|ACK segments
    pub fn tcp_send(
        &mut self,
        dev: &mut dyn NetDevice,
        idx: usize,
        data: &[u8],
    ) -> Result<usize, &'static str> {
        if idx >= MAX_TCP_CONNS || self.tcp[idx].state != TcpState::Established {
            return Err("connection not established");
        }

        let mut sent = 0;
        while sent < data.len() {
            let chunk = (data.len() - sent).min(TCP_MSS);
            self.send_segment(dev, idx, TCP_ACK | TCP_PSH, &data[sent..sent + chunk]);
            sent += chunk;
        }
        Ok(sent)
    }

    /// Copy received bytes out of the connection's buffer
    pub fn tcp_recv(&mut self, idx: usize, buf: &mut [u8]) -> usize {
        if idx >= MAX_TCP_CONNS {
            return 0;
        }
        let conn = &mut self.tcp[idx];
        if conn.rx_len == 0 {
            return 0;
        }

        let to_copy = conn.rx_len.min(buf.len());
        buf[..to_copy].copy_from_slice(&conn.rx_buffer[..to_copy]);

        if to_copy < conn.rx_len {
            conn.rx_buffer.copy_within(to_copy..conn.rx_len, 0);
        }
        conn.rx_len -= to_copy;
        conn.rx_ready = conn.rx_len > 0;

        to_copy
    }

    pub fn tcp_data_available(&self, idx: usize) -> bool {
        idx < MAX_TCP_CONNS && self.tcp[idx].rx_ready
    }

    pub fn tcp_state(&self, idx: usize) -> TcpState {
        if idx < MAX_TCP_CONNS {
            self.tcp[idx].state
        } else {
            TcpState::Closed
        }
    }

    /// Active close: FIN from Established, otherwise drop the slot
    pub fn tcp_close(&mut self, dev: &mut dyn NetDevice, idx: usize) {
        if idx >= MAX_TCP_CONNS {
            return;
        }
        if self.tcp[idx].state == TcpState::Established {
            self.send_segment(dev, idx, TCP_FIN | TCP_ACK, &[]);
            self.tcp[idx].state = TcpState::FinWait1;
            self.tcp[idx].timeout_tick = self.ticks.wrapping_add(FIN_TIMEOUT);
        } else {
            self.tcp[idx].state = TcpState::Closed;
        }
    }

    /// Retransmission and deadline sweep, one call per poll tick
    pub(crate) fn tcp_poll(&mut self, dev: &mut dyn NetDevice) {
        for idx in 0..MAX_TCP_CONNS {
            let (state, timeout) = (self.tcp[idx].state, self.tcp[idx].timeout_tick);
            if state == TcpState::Closed || self.ticks <= timeout {
                continue;
            }

            match state {
                TcpState::SynSent => {
                    self.tcp[idx].retries += 1;
                    if self.tcp[idx].retries > SYN_MAX_RETRIES {
                        self.tcp[idx].state = TcpState::Closed;
                    } else {
                        // The SYN consumed a sequence number; rewind so the
                        // retry carries the same one.
                        self.tcp[idx].seq_num = self.tcp[idx].seq_num.wrapping_sub(1);
                        self.send_segment(dev, idx, TCP_SYN, &[]);
                        self.tcp[idx].timeout_tick = self.ticks.wrapping_add(SYN_TIMEOUT);
                    }
                }
                TcpState::FinWait1 | TcpState::FinWait2 | TcpState::TimeWait => {
                    self.tcp[idx].state = TcpState::Closed;
                }
                _ => {}
            }
        }
    }

    /// Incoming segment for us, already validated down to the TCP payload
    pub(crate) fn tcp_handle(&mut self, dev: &mut dyn NetDevice, src_ip: Ipv4Addr, segment: &[u8]) {
        let src_port = u16::from_be_bytes([segment[0], segment[1]]);
        let dst_port = u16::from_be_bytes([segment[2], segment[3]]);
        let seq = u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]);
        let ack = u32::from_be_bytes([segment[8], segment[9], segment[10], segment[11]]);
        let header_len = ((segment[12] >> 4) as usize) * 4;
        let flags = segment[13];

        if header_len < TCP_HLEN || segment.len() < header_len {
            return;
        }

        let idx = match self.tcp.iter().position(|c| {
            c.state != TcpState::Closed
                && c.local_port == dst_port
                && c.remote_port == src_port
                && c.remote_ip == src_ip
        }) {
            Some(idx) => idx,
            None => return, // no connection - ignore
        };

        let data_len = segment.len() - header_len;

        if flags & TCP_RST != 0 {
            self.tcp[idx].state = TcpState::Closed;
            return;
        }

        match self.tcp[idx].state {
            TcpState::SynSent => {
                if flags & (TCP_SYN | TCP_ACK) == TCP_SYN | TCP_ACK {
                    self.tcp[idx].ack_num = seq.wrapping_add(1);
                    if ack == self.tcp[idx].seq_num {
                        self.tcp[idx].state = TcpState::Established;
                        self.send_segment(dev, idx, TCP_ACK, &[]);
                        self.tcp[idx].last_ack_sent = self.tcp[idx].ack_num;
                    }
                }
            }
            TcpState::Established => {
                if data_len > 0 {
                    let conn = &mut self.tcp[idx];
                    let space = TCP_RX_BUF_SIZE - conn.rx_len;
                    let to_copy = data_len.min(space);
                    if to_copy > 0 {
                        conn.rx_buffer[conn.rx_len..conn.rx_len + to_copy]
                            .copy_from_slice(&segment[header_len..header_len + to_copy]);
                        conn.rx_len += to_copy;
                        conn.rx_ready = true;
                    }
                    conn.ack_num = seq.wrapping_add(data_len as u32);
                    self.send_segment(dev, idx, TCP_ACK, &[]);
                    self.tcp[idx].last_ack_sent = self.tcp[idx].ack_num;
                }

                if flags & TCP_FIN != 0 {
                    self.tcp[idx].ack_num = seq.wrapping_add(data_len as u32).wrapping_add(1);
                    self.send_segment(dev, idx, TCP_ACK, &[]);
                    self.tcp[idx].state = TcpState::CloseWait;
                    self.send_segment(dev, idx, TCP_FIN | TCP_ACK, &[]);
                    self.tcp[idx].state = TcpState::LastAck;
                }
            }
            TcpState::FinWait1 => {
                if flags & TCP_ACK != 0 {
                    self.tcp[idx].state = TcpState::FinWait2;
                }
                if flags & TCP_FIN != 0 {
                    self.tcp[idx].ack_num = seq.wrapping_add(1);
                    self.send_segment(dev, idx, TCP_ACK, &[]);
                    self.tcp[idx].state = TcpState::TimeWait;
                    self.tcp[idx].timeout_tick = self.ticks.wrapping_add(TIME_WAIT_TIMEOUT);
                }
            }
            TcpState::FinWait2 => {
                if flags & TCP_FIN != 0 {
                    self.tcp[idx].ack_num = seq.wrapping_add(1);
                    self.send_segment(dev, idx, TCP_ACK, &[]);
                    self.tcp[idx].state = TcpState::TimeWait;
                    self.tcp[idx].timeout_tick = self.ticks.wrapping_add(TIME_WAIT_TIMEOUT);
                }
            }
            TcpState::LastAck => {
                if flags & TCP_ACK != 0 {
                    self.tcp[idx].state = TcpState::Closed;
                }
            }
            _ => {}
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{checksum, MacAddr, TestDevice};
    use alloc::vec::Vec;

    const OUR_IP: Ipv4Addr = Ipv4Addr([10, 0, 2, 15]);
    const PEER_IP: Ipv4Addr = Ipv4Addr([93, 184, 216, 34]);
    const GATEWAY: Ipv4Addr = Ipv4Addr([10, 0, 2, 2]);

    fn connected_stack() -> (NetStack, TestDevice) {
        let mut stack = NetStack::new();
        stack.configure(OUR_IP, Ipv4Addr([255, 255, 255, 0]), GATEWAY, Ipv4Addr([10, 0, 2, 3]));
        stack.arp_insert(GATEWAY, MacAddr([1, 2, 3, 4, 5, 6]));
        (stack, TestDevice::new())
    }

    /// A full Ethernet frame carrying a TCP segment from the peer
    fn peer_segment(seq: u32, ack: u32, flags: u8, payload: &[u8], ports: (u16, u16)) -> Vec<u8> {
        let seg_len = TCP_HLEN + payload.len();
        let mut frame = alloc::vec![0u8; ETH_HLEN + IP_HLEN + seg_len];

        NetStack::eth_header(&mut frame, MacAddr([0x52, 0x54, 0, 0x12, 0x34, 0x56]), MacAddr([1, 2, 3, 4, 5, 6]), ETH_P_IP);
        {
            let ip = &mut frame[ETH_HLEN..];
            ip[0] = 0x45;
            ip[2..4].copy_from_slice(&((IP_HLEN + seg_len) as u16).to_be_bytes());
            ip[8] = 64;
            ip[9] = IP_PROTO_TCP;
            ip[12..16].copy_from_slice(&PEER_IP.0);
            ip[16..20].copy_from_slice(&OUR_IP.0);
            let c = checksum(&ip[..IP_HLEN]);
            ip[10..12].copy_from_slice(&c.to_be_bytes());
        }
        {
            let tcp = &mut frame[ETH_HLEN + IP_HLEN..];
            tcp[0..2].copy_from_slice(&ports.0.to_be_bytes());
            tcp[2..4].copy_from_slice(&ports.1.to_be_bytes());
            tcp[4..8].copy_from_slice(&seq.to_be_bytes());
            tcp[8..12].copy_from_slice(&ack.to_be_bytes());
            tcp[12] = 0x50;
            tcp[13] = flags;
            tcp[14..16].copy_from_slice(&8192u16.to_be_bytes());
            tcp[TCP_HLEN..].copy_from_slice(payload);
            let c = tcp_checksum(PEER_IP, OUR_IP, tcp);
            tcp[16..18].copy_from_slice(&c.to_be_bytes());
        }
        frame
    }

    fn tcp_of(frame: &[u8]) -> &[u8] {
        &frame[ETH_HLEN + IP_HLEN..]
    }

    fn flags_of(frame: &[u8]) -> u8 {
        tcp_of(frame)[13]
    }

    fn seq_of(frame: &[u8]) -> u32 {
        let t = tcp_of(frame);
        u32::from_be_bytes([t[4], t[5], t[6], t[7]])
    }

    fn ack_of(frame: &[u8]) -> u32 {
        let t = tcp_of(frame);
        u32::from_be_bytes([t[8], t[9], t[10], t[11]])
    }

    /// Drive the three-way handshake, returning (conn idx, server seq, ports)
    fn establish(stack: &mut NetStack, dev: &mut TestDevice) -> (usize, u32, (u16, u16)) {
        let idx = stack.tcp_connect(dev, PEER_IP, 80).unwrap();
        let syn = dev.last_sent().unwrap().clone();
        assert_eq!(flags_of(&syn), TCP_SYN);
        let iss = seq_of(&syn);
        let local_port = u16::from_be_bytes([tcp_of(&syn)[0], tcp_of(&syn)[1]]);

        let server_iss = 5000u32;
        let synack = peer_segment(server_iss, iss.wrapping_add(1), TCP_SYN | TCP_ACK, &[], (80, local_port));
        stack.handle_frame(dev, &synack);

        assert_eq!(stack.tcp_state(idx), TcpState::Established);
        (idx, server_iss.wrapping_add(1), (80, local_port))
    }

    #[test]
    fn test_three_way_handshake() {
        let (mut stack, mut dev) = connected_stack();

        let idx = stack.tcp_connect(&mut dev, PEER_IP, 80).unwrap();
        assert_eq!(stack.tcp_state(idx), TcpState::SynSent);

        let syn = dev.last_sent().unwrap().clone();
        assert_eq!(flags_of(&syn), TCP_SYN);
        // Segment checksum verifies against the pseudo-header
        assert_eq!(tcp_checksum(OUR_IP, PEER_IP, tcp_of(&syn)), 0);

        let iss = seq_of(&syn);
        let local_port = u16::from_be_bytes([tcp_of(&syn)[0], tcp_of(&syn)[1]]);

        let synack = peer_segment(7000, iss.wrapping_add(1), TCP_SYN | TCP_ACK, &[], (80, local_port));
        stack.handle_frame(&mut dev, &synack);

        assert_eq!(stack.tcp_state(idx), TcpState::Established);
        let ack = dev.last_sent().unwrap();
        assert_eq!(flags_of(ack), TCP_ACK);
        assert_eq!(seq_of(ack), iss.wrapping_add(1));
        assert_eq!(ack_of(ack), 7001);
    }

    #[test]
    fn test_wrong_ack_stays_syn_sent() {
        let (mut stack, mut dev) = connected_stack();
        let idx = stack.tcp_connect(&mut dev, PEER_IP, 80).unwrap();
        let syn = dev.last_sent().unwrap().clone();
        let iss = seq_of(&syn);
        let local_port = u16::from_be_bytes([tcp_of(&syn)[0], tcp_of(&syn)[1]]);

        let bad = peer_segment(7000, iss.wrapping_add(9), TCP_SYN | TCP_ACK, &[], (80, local_port));
        stack.handle_frame(&mut dev, &bad);
        assert_eq!(stack.tcp_state(idx), TcpState::SynSent);
    }

    #[test]
    fn test_receive_data_and_ack() {
        let (mut stack, mut dev) = connected_stack();
        let (idx, server_seq, ports) = establish(&mut stack, &mut dev);

        let data = peer_segment(server_seq, 0, TCP_ACK | TCP_PSH, b"hello", ports);
        stack.handle_frame(&mut dev, &data);

        assert!(stack.tcp_data_available(idx));
        let mut buf = [0u8; 16];
        assert_eq!(stack.tcp_recv(idx, &mut buf), 5);
        assert_eq!(&buf[..5], b"hello");
        assert!(!stack.tcp_data_available(idx));

        let ack = dev.last_sent().unwrap();
        assert_eq!(ack_of(ack), server_seq.wrapping_add(5));
    }

    #[test]
    fn test_partial_recv_preserves_rest() {
        let (mut stack, mut dev) = connected_stack();
        let (idx, server_seq, ports) = establish(&mut stack, &mut dev);

        let data = peer_segment(server_seq, 0, TCP_ACK, b"abcdefgh", ports);
        stack.handle_frame(&mut dev, &data);

        let mut buf = [0u8; 3];
        assert_eq!(stack.tcp_recv(idx, &mut buf), 3);
        assert_eq!(&buf, b"abc");
        assert!(stack.tcp_data_available(idx));
        let mut rest = [0u8; 8];
        assert_eq!(stack.tcp_recv(idx, &mut rest), 5);
        assert_eq!(&rest[..5], b"defgh");
    }

    #[test]
    fn test_send_splits_at_mss() {
        let (mut stack, mut dev) = connected_stack();
        let (idx, _server_seq, _ports) = establish(&mut stack, &mut dev);

        let before = dev.sent.len();
        let data = alloc::vec![0x55u8; 3000];
        assert_eq!(stack.tcp_send(&mut dev, idx, &data).unwrap(), 3000);

        // 1400 + 1400 + 200
        assert_eq!(dev.sent.len(), before + 3);
        let first = &dev.sent[before];
        assert_eq!(flags_of(first), TCP_ACK | TCP_PSH);
        assert_eq!(first.len(), ETH_HLEN + IP_HLEN + TCP_HLEN + 1400);
        let last = &dev.sent[before + 2];
        assert_eq!(last.len(), ETH_HLEN + IP_HLEN + TCP_HLEN + 200);
    }

    #[test]
    fn test_syn_retransmits_same_sequence() {
        let (mut stack, mut dev) = connected_stack();
        let _idx = stack.tcp_connect(&mut dev, PEER_IP, 80).unwrap();
        let first_syn = dev.last_sent().unwrap().clone();
        let iss = seq_of(&first_syn);

        stack.ticks = stack.ticks.wrapping_add(SYN_TIMEOUT + 1);
        stack.tcp_poll(&mut dev);

        let second_syn = dev.last_sent().unwrap();
        assert_eq!(flags_of(second_syn), TCP_SYN);
        assert_eq!(seq_of(second_syn), iss);
    }

    #[test]
    fn test_syn_gives_up_after_retries() {
        let (mut stack, mut dev) = connected_stack();
        let idx = stack.tcp_connect(&mut dev, PEER_IP, 80).unwrap();

        for _ in 0..=SYN_MAX_RETRIES {
            stack.ticks = stack.tcp[idx].timeout_tick.wrapping_add(1);
            stack.tcp_poll(&mut dev);
        }
        assert_eq!(stack.tcp_state(idx), TcpState::Closed);
    }

    #[test]
    fn test_arp_miss_drops_segment_for_retry() {
        let mut stack = NetStack::new();
        stack.configure(OUR_IP, Ipv4Addr([255, 255, 255, 0]), GATEWAY, Ipv4Addr([10, 0, 2, 3]));
        let mut dev = TestDevice::new();

        let idx = stack.tcp_connect(&mut dev, PEER_IP, 80).unwrap();
        assert_eq!(stack.tcp_state(idx), TcpState::SynSent);

        // Only an ARP request went out, no TCP yet
        assert_eq!(dev.sent.len(), 1);
        let sent = &dev.sent[0];
        assert_eq!(u16::from_be_bytes([sent[12], sent[13]]), crate::net::ETH_P_ARP);

        // Resolve the gateway, then the retransmit timer reissues the SYN
        stack.arp_insert(GATEWAY, MacAddr([1, 2, 3, 4, 5, 6]));
        stack.ticks = stack.tcp[idx].timeout_tick.wrapping_add(1);
        stack.tcp_poll(&mut dev);
        let syn = dev.last_sent().unwrap();
        assert_eq!(flags_of(syn), TCP_SYN);
    }

    #[test]
    fn test_passive_close() {
        let (mut stack, mut dev) = connected_stack();
        let (idx, server_seq, ports) = establish(&mut stack, &mut dev);

        let before = dev.sent.len();
        let fin = peer_segment(server_seq, 0, TCP_FIN | TCP_ACK, &[], ports);
        stack.handle_frame(&mut dev, &fin);

        // We ack the FIN and send our own
        assert_eq!(stack.tcp_state(idx), TcpState::LastAck);
        assert_eq!(dev.sent.len(), before + 2);
        let our_ack = &dev.sent[before];
        assert_eq!(flags_of(our_ack), TCP_ACK);
        assert_eq!(ack_of(our_ack), server_seq.wrapping_add(1));
        let our_fin = &dev.sent[before + 1];
        assert_eq!(flags_of(our_fin) & TCP_FIN, TCP_FIN);

        let last_ack = peer_segment(server_seq.wrapping_add(1), 0, TCP_ACK, &[], ports);
        stack.handle_frame(&mut dev, &last_ack);
        assert_eq!(stack.tcp_state(idx), TcpState::Closed);
    }

    #[test]
    fn test_active_close() {
        let (mut stack, mut dev) = connected_stack();
        let (idx, server_seq, ports) = establish(&mut stack, &mut dev);

        stack.tcp_close(&mut dev, idx);
        assert_eq!(stack.tcp_state(idx), TcpState::FinWait1);
        assert_eq!(flags_of(dev.last_sent().unwrap()) & TCP_FIN, TCP_FIN);

        let ack = peer_segment(server_seq, stack.tcp[idx].seq_num, TCP_ACK, &[], ports);
        stack.handle_frame(&mut dev, &ack);
        assert_eq!(stack.tcp_state(idx), TcpState::FinWait2);

        let fin = peer_segment(server_seq, 0, TCP_FIN, &[], ports);
        stack.handle_frame(&mut dev, &fin);
        assert_eq!(stack.tcp_state(idx), TcpState::TimeWait);

        // TIME_WAIT expires to Closed
        stack.ticks = stack.tcp[idx].timeout_tick.wrapping_add(1);
        stack.tcp_poll(&mut dev);
        assert_eq!(stack.tcp_state(idx), TcpState::Closed);
    }

    #[test]
    fn test_rst_closes() {
        let (mut stack, mut dev) = connected_stack();
        let (idx, server_seq, ports) = establish(&mut stack, &mut dev);

        let rst = peer_segment(server_seq, 0, TCP_RST, &[], ports);
        stack.handle_frame(&mut dev, &rst);
        assert_eq!(stack.tcp_state(idx), TcpState::Closed);
    }

    #[test]
    fn test_pool_exhaustion() {
        let (mut stack, mut dev) = connected_stack();
        for _ in 0..MAX_TCP_CONNS {
            stack.tcp_connect(&mut dev, PEER_IP, 80).unwrap();
        }
        assert!(stack.tcp_connect(&mut dev, PEER_IP, 80).is_err());
    }
}
