//! UDP
//!
//! Thin datagram layer: DHCP and DNS are the only consumers, dispatched by
//! port. The UDP checksum is left zero (optional over IPv4), matching what
//! the rest of the stack expects on this link.

use super::{dhcp, Ipv4Addr, NetDevice, NetStack, ETH_HLEN, ETH_P_IP, IP_HLEN, IP_PROTO_UDP};

pub const UDP_HLEN: usize = 8;

const DNS_SERVER_PORT: u16 = 53;

impl NetStack {
    /// Send a UDP datagram, routed through the gateway. An ARP miss sends a
    /// request and drops the datagram; the caller's retry cadence covers it.
    pub fn send_udp(
        &mut self,
        dev: &mut dyn NetDevice,
        dst_ip: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
    ) {
        if !self.config.configured || payload.len() > 1472 {
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

        let udp_len = UDP_HLEN + payload.len();
        let total = ETH_HLEN + IP_HLEN + udp_len;
        let mut frame = [0u8; super::MAX_FRAME];

        Self::eth_header(&mut frame, dst_mac, dev.mac(), ETH_P_IP);
        let src = self.config.ip;
        self.ipv4_header(
            &mut frame[ETH_HLEN..],
            (IP_HLEN + udp_len) as u16,
            IP_PROTO_UDP,
            src,
            dst_ip,
        );

        let udp = &mut frame[ETH_HLEN + IP_HLEN..total];
        udp[0..2].copy_from_slice(&src_port.to_be_bytes());
        udp[2..4].copy_from_slice(&dst_port.to_be_bytes());
        udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
        udp[6] = 0; // checksum optional over IPv4
        udp[7] = 0;
        udp[8..].copy_from_slice(payload);

        let _ = dev.send(&frame[..total]);
    }

    pub(crate) fn handle_udp(&mut self, dev: &mut dyn NetDevice, datagram: &[u8]) {
        let src_port = u16::from_be_bytes([datagram[0], datagram[1]]);
        let dst_port = u16::from_be_bytes([datagram[2], datagram[3]]);
        let length = u16::from_be_bytes([datagram[4], datagram[5]]) as usize;

        if length < UDP_HLEN || length > datagram.len() {
            return;
        }
        let payload = &datagram[UDP_HLEN..length];

        if src_port == DNS_SERVER_PORT {
            self.handle_dns(payload);
        } else if src_port == dhcp::DHCP_SERVER_PORT && dst_port == dhcp::DHCP_CLIENT_PORT {
            self.handle_dhcp(dev, payload);
        }
    }
}
