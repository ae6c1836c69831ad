//! DHCP client
//!
//! Discover -> Offer -> Request -> Ack with a fixed transaction id. All
//! messages go out as limited broadcasts with the BOOTP broadcast flag set;
//! Discover is resent on a fixed tick cadence until the lease lands.

use super::{checksum, Ipv4Addr, MacAddr, NetDevice, NetStack, ETH_HLEN, ETH_P_IP, IP_HLEN, IP_PROTO_UDP};

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

/// Fixed client transaction id
pub const DHCP_XID: u32 = 0x1234_5678;

/// Resend Discover whenever the tick counter hits a multiple of this while
/// unconfigured
pub const DHCP_RETRY_TICKS: u32 = 30_000;

// Message types (option 53)
const DHCP_DISCOVER: u8 = 1;
const DHCP_OFFER: u8 = 2;
const DHCP_REQUEST: u8 = 3;
const DHCP_ACK: u8 = 5;

const BOOTREQUEST: u8 = 1;

/// BOOTP fixed header size (op..file), options follow
const DHCP_FIXED_LEN: usize = 236;
/// Options area size; total message is fixed at 548 bytes
const DHCP_OPTIONS_LEN: usize = 312;
const DHCP_MSG_LEN: usize = DHCP_FIXED_LEN + DHCP_OPTIONS_LEN;

/// Safety cap on option iteration
const MAX_OPTIONS: u32 = 50;

/// Client state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DhcpState {
    Idle,
    Discovering,
    Requesting,
    Configured,
}

impl NetStack {
    /// Fill the fixed BOOTP part of an outgoing message
    fn dhcp_fixed(&self, msg: &mut [u8], mac: MacAddr) {
        msg[0] = BOOTREQUEST;
        msg[1] = 1; // htype: Ethernet
        msg[2] = 6; // hlen
        msg[3] = 0; // hops
        msg[4..8].copy_from_slice(&self.dhcp_xid.to_be_bytes());
        msg[8..10].copy_from_slice(&[0, 0]); // secs
        msg[10..12].copy_from_slice(&0x8000u16.to_be_bytes()); // broadcast flag
        // ciaddr/yiaddr/siaddr/giaddr stay zero
        msg[28..34].copy_from_slice(&mac.0); // chaddr
    }

    /// Broadcast a DHCP message built by `options` (which returns the number
    /// of option bytes written after the magic cookie).
    fn dhcp_broadcast(&mut self, dev: &mut dyn NetDevice, fill_options: impl Fn(&mut [u8]) -> usize) {
        let mac = dev.mac();
        let udp_len = 8 + DHCP_MSG_LEN;
        let total = ETH_HLEN + IP_HLEN + udp_len;
        let mut frame = [0u8; ETH_HLEN + IP_HLEN + 8 + DHCP_MSG_LEN];

        Self::eth_header(&mut frame, MacAddr::BROADCAST, mac, ETH_P_IP);

        // IP header by hand: source 0.0.0.0, destination 255.255.255.255
        {
            let ip = &mut frame[ETH_HLEN..];
            let id = self.ip_id;
            self.ip_id = self.ip_id.wrapping_add(1);
            ip[0] = 0x45;
            ip[1] = 0;
            ip[2..4].copy_from_slice(&((IP_HLEN + udp_len) as u16).to_be_bytes());
            ip[4..6].copy_from_slice(&id.to_be_bytes());
            ip[6..8].copy_from_slice(&[0, 0]);
            ip[8] = 64;
            ip[9] = IP_PROTO_UDP;
            ip[10] = 0;
            ip[11] = 0;
            ip[12..16].copy_from_slice(&[0, 0, 0, 0]);
            ip[16..20].copy_from_slice(&[255, 255, 255, 255]);
            let csum = checksum(&ip[..IP_HLEN]);
            ip[10..12].copy_from_slice(&csum.to_be_bytes());
        }

        {
            let udp = &mut frame[ETH_HLEN + IP_HLEN..];
            udp[0..2].copy_from_slice(&DHCP_CLIENT_PORT.to_be_bytes());
            udp[2..4].copy_from_slice(&DHCP_SERVER_PORT.to_be_bytes());
            udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
            udp[6] = 0;
            udp[7] = 0;
        }

        {
            let msg = &mut frame[ETH_HLEN + IP_HLEN + 8..total];
            self.dhcp_fixed(msg, mac);

            let opts = &mut msg[DHCP_FIXED_LEN..];
            opts[0] = 99; // magic cookie
            opts[1] = 130;
            opts[2] = 83;
            opts[3] = 99;
            let used = fill_options(&mut opts[4..]);
            opts[4 + used] = 255; // end
        }

        let _ = dev.send(&frame[..total]);
    }

    /// Send a Discover and enter `Discovering`
    pub fn dhcp_discover(&mut self, dev: &mut dyn NetDevice) {
        self.dhcp_broadcast(dev, |opts| {
            opts[0] = 53; // message type
            opts[1] = 1;
            opts[2] = DHCP_DISCOVER;
            opts[3] = 55; // parameter request list
            opts[4] = 3;
            opts[5] = 1; // subnet mask
            opts[6] = 3; // router
            opts[7] = 6; // DNS
            8
        });
        self.dhcp_state = DhcpState::Discovering;
    }

    fn dhcp_request(&mut self, dev: &mut dyn NetDevice, server_ip: Ipv4Addr) {
        let requested = self.config.ip;
        self.dhcp_broadcast(dev, |opts| {
            opts[0] = 53;
            opts[1] = 1;
            opts[2] = DHCP_REQUEST;
            opts[3] = 50; // requested IP
            opts[4] = 4;
            opts[5..9].copy_from_slice(&requested.0);
            opts[9] = 54; // server identifier
            opts[10] = 4;
            opts[11..15].copy_from_slice(&server_ip.0);
            15
        });
        self.dhcp_state = DhcpState::Requesting;
    }

    /// Handle a server message delivered on ports 67 -> 68
    pub(crate) fn handle_dhcp(&mut self, dev: &mut dyn NetDevice, msg: &[u8]) {
        if msg.len() < DHCP_FIXED_LEN + 4 {
            return;
        }

        let xid = u32::from_be_bytes([msg[4], msg[5], msg[6], msg[7]]);
        if xid != self.dhcp_xid {
            return;
        }

        let yiaddr = Ipv4Addr([msg[16], msg[17], msg[18], msg[19]]);

        // Parse options: skip the magic cookie, then iterate type/len/value
        // with a safety cap, stopping at option 255.
        let mut opts = &msg[DHCP_FIXED_LEN..];
        if opts.len() >= 4 && opts[0] == 99 && opts[1] == 130 && opts[2] == 83 && opts[3] == 99 {
            opts = &opts[4..];
        }

        let mut msg_type = 0u8;
        let mut server_ip = Ipv4Addr::UNSPECIFIED;
        let mut budget = MAX_OPTIONS;

        let mut i = 0usize;
        while i < opts.len() && opts[i] != 255 && budget > 0 {
            budget -= 1;
            let opt = opts[i];
            i += 1;
            if opt == 0 {
                continue; // pad
            }
            if i >= opts.len() {
                break;
            }
            let len = opts[i] as usize;
            i += 1;
            if i + len > opts.len() {
                break;
            }
            let value = &opts[i..i + len];
            match opt {
                53 if len >= 1 => msg_type = value[0],
                1 if len == 4 => {
                    self.config.subnet = Ipv4Addr([value[0], value[1], value[2], value[3]])
                }
                3 if len >= 4 => {
                    self.config.gateway = Ipv4Addr([value[0], value[1], value[2], value[3]])
                }
                6 if len >= 4 => {
                    self.config.dns = Ipv4Addr([value[0], value[1], value[2], value[3]])
                }
                54 if len == 4 => server_ip = Ipv4Addr([value[0], value[1], value[2], value[3]]),
                _ => {}
            }
            i += len;
        }

        match (msg_type, self.dhcp_state) {
            (DHCP_OFFER, DhcpState::Discovering) => {
                self.config.ip = yiaddr;
                self.dhcp_request(dev, server_ip);
            }
            (DHCP_ACK, DhcpState::Requesting) => {
                self.config.ip = yiaddr;
                self.config.configured = true;
                self.dhcp_state = DhcpState::Configured;
                crate::kprintln!("[DHCP] Got IP {}", self.config.ip);
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
    use crate::net::TestDevice;
    use alloc::vec::Vec;

    /// A server reply (Offer or Ack) as raw DHCP bytes
    fn server_msg(msg_type: u8, yiaddr: [u8; 4], extra: &[(u8, &[u8])]) -> Vec<u8> {
        let mut msg = alloc::vec![0u8; DHCP_MSG_LEN];
        msg[0] = 2; // BOOTREPLY
        msg[4..8].copy_from_slice(&DHCP_XID.to_be_bytes());
        msg[16..20].copy_from_slice(&yiaddr);
        let opts = &mut msg[DHCP_FIXED_LEN..];
        opts[0] = 99;
        opts[1] = 130;
        opts[2] = 83;
        opts[3] = 99;
        let mut i = 4;
        opts[i] = 53;
        opts[i + 1] = 1;
        opts[i + 2] = msg_type;
        i += 3;
        for (opt, value) in extra {
            opts[i] = *opt;
            opts[i + 1] = value.len() as u8;
            opts[i + 2..i + 2 + value.len()].copy_from_slice(value);
            i += 2 + value.len();
        }
        opts[i] = 255;
        msg
    }

    fn sent_dhcp_message_type(frame: &[u8]) -> u8 {
        // eth(14) + ip(20) + udp(8), options after fixed part + cookie
        let opts = &frame[ETH_HLEN + IP_HLEN + 8 + DHCP_FIXED_LEN + 4..];
        assert_eq!(opts[0], 53);
        opts[2]
    }

    #[test]
    fn test_discover_shape() {
        let mut stack = NetStack::new();
        let mut dev = TestDevice::new();

        stack.dhcp_discover(&mut dev);
        assert_eq!(stack.dhcp_state(), DhcpState::Discovering);

        let frame = dev.last_sent().unwrap();
        // Broadcast at every layer
        assert_eq!(&frame[0..6], &[0xFF; 6]);
        assert_eq!(&frame[ETH_HLEN + 16..ETH_HLEN + 20], &[255, 255, 255, 255]);
        // Ports 68 -> 67
        let udp = &frame[ETH_HLEN + IP_HLEN..];
        assert_eq!(u16::from_be_bytes([udp[0], udp[1]]), DHCP_CLIENT_PORT);
        assert_eq!(u16::from_be_bytes([udp[2], udp[3]]), DHCP_SERVER_PORT);
        // xid in network order, broadcast flag set
        let msg = &udp[8..];
        assert_eq!(&msg[4..8], &DHCP_XID.to_be_bytes());
        assert_eq!(u16::from_be_bytes([msg[10], msg[11]]), 0x8000);
        assert_eq!(sent_dhcp_message_type(frame), DHCP_DISCOVER);
    }

    #[test]
    fn test_offer_ack_sequence_configures() {
        let mut stack = NetStack::new();
        let mut dev = TestDevice::new();

        stack.dhcp_discover(&mut dev);

        let offer = server_msg(
            DHCP_OFFER,
            [10, 0, 2, 15],
            &[(54, &[10, 0, 2, 2]), (1, &[255, 255, 255, 0])],
        );
        stack.handle_dhcp(&mut dev, &offer);

        // The offer triggers a Request naming the offered address
        assert_eq!(stack.dhcp_state(), DhcpState::Requesting);
        let req = dev.last_sent().unwrap();
        assert_eq!(sent_dhcp_message_type(req), DHCP_REQUEST);

        let ack = server_msg(
            DHCP_ACK,
            [10, 0, 2, 15],
            &[
                (1, &[255, 255, 255, 0]),
                (3, &[10, 0, 2, 2]),
                (6, &[10, 0, 2, 3]),
            ],
        );
        stack.handle_dhcp(&mut dev, &ack);

        assert_eq!(stack.dhcp_state(), DhcpState::Configured);
        assert!(stack.config.configured);
        assert_eq!(stack.config.ip, Ipv4Addr([10, 0, 2, 15]));
        assert_eq!(stack.config.gateway, Ipv4Addr([10, 0, 2, 2]));
        assert_eq!(stack.config.dns, Ipv4Addr([10, 0, 2, 3]));
        assert_eq!(stack.config.subnet, Ipv4Addr([255, 255, 255, 0]));
    }

    #[test]
    fn test_wrong_xid_is_ignored() {
        let mut stack = NetStack::new();
        let mut dev = TestDevice::new();

        stack.dhcp_discover(&mut dev);

        let mut offer = server_msg(DHCP_OFFER, [10, 0, 2, 15], &[(54, &[10, 0, 2, 2])]);
        offer[4] ^= 0xFF; // corrupt the xid
        stack.handle_dhcp(&mut dev, &offer);

        assert_eq!(stack.dhcp_state(), DhcpState::Discovering);
        assert!(!stack.config.configured);
    }

    #[test]
    fn test_ack_in_wrong_state_is_ignored() {
        let mut stack = NetStack::new();
        let mut dev = TestDevice::new();

        // Ack while still Idle changes nothing
        let ack = server_msg(DHCP_ACK, [10, 0, 2, 15], &[]);
        stack.handle_dhcp(&mut dev, &ack);
        assert_eq!(stack.dhcp_state(), DhcpState::Idle);
        assert!(!stack.config.configured);
    }

    #[test]
    fn test_poll_retries_discover() {
        let mut stack = NetStack::new();
        let mut dev = TestDevice::new();

        // First poll kicks Discover from Idle
        stack.poll(&mut dev);
        let first = dev.sent.len();
        assert!(first >= 1);

        // Until the retry period elapses nothing else is sent
        for _ in 0..100 {
            stack.poll(&mut dev);
        }
        assert_eq!(dev.sent.len(), first);
    }
}
