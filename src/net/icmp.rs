//! ICMP (echo request/reply)
//!
//! Answers pings with the payload mirrored back, and can ping the gateway
//! for the terminal's connectivity check.

use super::{checksum, Ipv4Addr, MacAddr, NetDevice, NetStack, ETH_HLEN, ETH_P_IP, IP_HLEN, IP_PROTO_ICMP};

const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_ECHO_REQUEST: u8 = 8;

/// Echo payloads longer than this are truncated in the reply
const MAX_ECHO_DATA: usize = 1400;

/// Ping bookkeeping shown by the terminal
#[derive(Clone, Copy, Debug)]
pub struct PingStatus {
    pub sent: u32,
    pub received: u32,
    pub last_rtt_ms: u32,
}

impl PingStatus {
    pub const fn new() -> Self {
        PingStatus {
            sent: 0,
            received: 0,
            last_rtt_ms: 0,
        }
    }
}

impl NetStack {
    pub fn ping_status(&self) -> PingStatus {
        self.ping
    }

    pub(crate) fn handle_icmp(
        &mut self,
        dev: &mut dyn NetDevice,
        src_mac: MacAddr,
        src_ip: Ipv4Addr,
        icmp: &[u8],
    ) {
        match icmp[0] {
            ICMP_ECHO_REQUEST => {
                let id = u16::from_be_bytes([icmp[4], icmp[5]]);
                let seq = u16::from_be_bytes([icmp[6], icmp[7]]);
                let mut data = &icmp[8..];
                if data.len() > MAX_ECHO_DATA {
                    data = &data[..MAX_ECHO_DATA];
                }
                self.send_echo_reply(dev, src_mac, src_ip, id, seq, data);
            }
            ICMP_ECHO_REPLY => {
                self.ping.received += 1;
                self.ping.last_rtt_ms = self.ticks.wrapping_sub(self.ping_sent_tick) / 10;
            }
            _ => {}
        }
    }

    fn send_echo_reply(
        &mut self,
        dev: &mut dyn NetDevice,
        dst_mac: MacAddr,
        dst_ip: Ipv4Addr,
        id: u16,
        seq: u16,
        data: &[u8],
    ) {
        let mut frame = [0u8; ETH_HLEN + IP_HLEN + 8 + MAX_ECHO_DATA];
        let icmp_len = 8 + data.len();
        let total = ETH_HLEN + IP_HLEN + icmp_len;

        Self::eth_header(&mut frame, dst_mac, dev.mac(), ETH_P_IP);
        let src = self.config.ip;
        self.ipv4_header(
            &mut frame[ETH_HLEN..],
            (IP_HLEN + icmp_len) as u16,
            IP_PROTO_ICMP,
            src,
            dst_ip,
        );

        let icmp = &mut frame[ETH_HLEN + IP_HLEN..total];
        icmp[0] = ICMP_ECHO_REPLY;
        icmp[1] = 0;
        icmp[2] = 0;
        icmp[3] = 0;
        icmp[4..6].copy_from_slice(&id.to_be_bytes());
        icmp[6..8].copy_from_slice(&seq.to_be_bytes());
        icmp[8..8 + data.len()].copy_from_slice(data);

        let csum = checksum(icmp);
        frame[ETH_HLEN + IP_HLEN + 2..ETH_HLEN + IP_HLEN + 4].copy_from_slice(&csum.to_be_bytes());

        let _ = dev.send(&frame[..total]);
    }

    /// Ping the gateway. Routes through the ARP cache; on a miss an ARP
    /// request goes out instead and the caller may retry.
    pub fn ping_gateway(&mut self, dev: &mut dyn NetDevice) {
        if !self.config.configured || self.config.gateway.is_unspecified() {
            return;
        }
        let gateway = self.config.gateway;

        let dst_mac = match self.arp_lookup(gateway) {
            Some(mac) => mac,
            None => {
                self.arp_request(dev, gateway);
                return;
            }
        };

        let mut frame = [0u8; ETH_HLEN + IP_HLEN + 8 + 8];

        Self::eth_header(&mut frame, dst_mac, dev.mac(), ETH_P_IP);
        let src = self.config.ip;
        self.ipv4_header(
            &mut frame[ETH_HLEN..],
            (IP_HLEN + 16) as u16,
            IP_PROTO_ICMP,
            src,
            gateway,
        );

        let seq = self.ping_seq;
        self.ping_seq = self.ping_seq.wrapping_add(1);

        let icmp = &mut frame[ETH_HLEN + IP_HLEN..];
        icmp[0] = ICMP_ECHO_REQUEST;
        icmp[1] = 0;
        icmp[2] = 0;
        icmp[3] = 0;
        icmp[4..6].copy_from_slice(&0x1234u16.to_be_bytes());
        icmp[6..8].copy_from_slice(&seq.to_be_bytes());
        for b in icmp[8..16].iter_mut() {
            *b = b'T';
        }

        let csum = checksum(icmp);
        frame[ETH_HLEN + IP_HLEN + 2..ETH_HLEN + IP_HLEN + 4].copy_from_slice(&csum.to_be_bytes());

        let _ = dev.send(&frame);

        self.ping.sent += 1;
        self.ping_sent_tick = self.ticks;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::TestDevice;

    fn configured_stack() -> NetStack {
        let mut stack = NetStack::new();
        stack.configure(
            Ipv4Addr([10, 0, 2, 15]),
            Ipv4Addr([255, 255, 255, 0]),
            Ipv4Addr([10, 0, 2, 2]),
            Ipv4Addr([10, 0, 2, 3]),
        );
        stack
    }

    #[test]
    fn test_echo_request_is_mirrored() {
        let mut stack = configured_stack();
        let mut dev = TestDevice::new();

        // Hand-built echo request from 10.0.2.2 with payload "ping!"
        let payload = b"ping!";
        let icmp_len = 8 + payload.len();
        let mut frame = alloc::vec![0u8; ETH_HLEN + IP_HLEN + icmp_len];
        NetStack::eth_header(
            &mut frame,
            dev.mac(),
            MacAddr([9, 9, 9, 9, 9, 9]),
            ETH_P_IP,
        );
        stack.ipv4_header(
            &mut frame[ETH_HLEN..],
            (IP_HLEN + icmp_len) as u16,
            IP_PROTO_ICMP,
            Ipv4Addr([10, 0, 2, 2]),
            Ipv4Addr([10, 0, 2, 15]),
        );
        {
            let icmp = &mut frame[ETH_HLEN + IP_HLEN..];
            icmp[0] = 8;
            icmp[4..6].copy_from_slice(&0xBEEFu16.to_be_bytes());
            icmp[6..8].copy_from_slice(&7u16.to_be_bytes());
            icmp[8..].copy_from_slice(payload);
            let csum = checksum(icmp);
            icmp[2..4].copy_from_slice(&csum.to_be_bytes());
        }

        stack.handle_frame(&mut dev, &frame);

        let reply = dev.last_sent().expect("no echo reply");
        // Straight back to the sender's MAC
        assert_eq!(&reply[0..6], &[9, 9, 9, 9, 9, 9]);
        let icmp = &reply[ETH_HLEN + IP_HLEN..];
        assert_eq!(icmp[0], 0); // echo reply
        assert_eq!(u16::from_be_bytes([icmp[4], icmp[5]]), 0xBEEF);
        assert_eq!(u16::from_be_bytes([icmp[6], icmp[7]]), 7);
        assert_eq!(&icmp[8..], payload);
        // Reply checksum verifies
        assert_eq!(checksum(icmp), 0);
    }

    #[test]
    fn test_ping_gateway_needs_arp_first(){
        let mut stack = configured_stack();
        let mut dev = TestDevice::new();

        // Cache miss: an ARP request goes out, no ICMP yet
        stack.ping_gateway(&mut dev);
        assert_eq!(stack.ping_status().sent, 0);
        let sent = dev.last_sent().unwrap();
        assert_eq!(u16::from_be_bytes([sent[12], sent[13]]), crate::net::ETH_P_ARP);

        // With the cache primed the echo request goes out
        stack.arp_insert(Ipv4Addr([10, 0, 2, 2]), MacAddr([1, 1, 1, 1, 1, 1]));
        stack.ping_gateway(&mut dev);
        assert_eq!(stack.ping_status().sent, 1);
        let ping = dev.last_sent().unwrap();
        assert_eq!(ping[ETH_HLEN + 9], IP_PROTO_ICMP);
        assert_eq!(ping[ETH_HLEN + IP_HLEN], 8);
    }
}
