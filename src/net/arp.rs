//! ARP (Address Resolution Protocol)
//!
//! Fixed 8-entry cache with linear lookup. Every ARP packet teaches us the
//! sender's mapping; requests for our configured address get answered.

use super::{Ipv4Addr, MacAddr, NetDevice, NetStack, ETH_HLEN, ETH_P_ARP};

pub const ARP_CACHE_SIZE: usize = 8;

const ARP_REQUEST: u16 = 1;
const ARP_REPLY: u16 = 2;

/// 28-byte ARP body after the Ethernet header
const ARP_PLEN: usize = 28;

#[derive(Clone, Copy)]
pub(crate) struct ArpEntry {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub valid: bool,
}

impl ArpEntry {
    pub const INVALID: ArpEntry = ArpEntry {
        ip: Ipv4Addr([0, 0, 0, 0]),
        mac: MacAddr([0; 6]),
        valid: false,
    };
}

impl NetStack {
    /// Linear cache lookup
    pub fn arp_lookup(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.arp_cache
            .iter()
            .find(|e| e.valid && e.ip == ip)
            .map(|e| e.mac)
    }

    /// Learn a mapping: update in place, fill a free slot, or displace
    /// entry 0 when the cache is full.
    pub fn arp_insert(&mut self, ip: Ipv4Addr, mac: MacAddr) {
        for entry in self.arp_cache.iter_mut() {
            if entry.valid && entry.ip == ip {
                entry.mac = mac;
                return;
            }
        }
        for entry in self.arp_cache.iter_mut() {
            if !entry.valid {
                *entry = ArpEntry { ip, mac, valid: true };
                return;
            }
        }
        self.arp_cache[0] = ArpEntry { ip, mac, valid: true };
    }

    fn build_arp(
        &self,
        dev: &mut dyn NetDevice,
        dst_mac: MacAddr,
        opcode: u16,
        target_mac: MacAddr,
        target_ip: Ipv4Addr,
    ) {
        let our_mac = dev.mac();
        let mut frame = [0u8; ETH_HLEN + ARP_PLEN];

        Self::eth_header(&mut frame, dst_mac, our_mac, ETH_P_ARP);

        let arp = &mut frame[ETH_HLEN..];
        arp[0..2].copy_from_slice(&1u16.to_be_bytes()); // Ethernet
        arp[2..4].copy_from_slice(&0x0800u16.to_be_bytes()); // IPv4
        arp[4] = 6;
        arp[5] = 4;
        arp[6..8].copy_from_slice(&opcode.to_be_bytes());
        arp[8..14].copy_from_slice(&our_mac.0);
        arp[14..18].copy_from_slice(&self.config.ip.0);
        arp[18..24].copy_from_slice(&target_mac.0);
        arp[24..28].copy_from_slice(&target_ip.0);

        let _ = dev.send(&frame);
    }

    /// Broadcast a who-has request
    pub fn arp_request(&mut self, dev: &mut dyn NetDevice, target_ip: Ipv4Addr) {
        self.build_arp(dev, MacAddr::BROADCAST, ARP_REQUEST, MacAddr::ZERO, target_ip);
    }

    fn arp_reply(&mut self, dev: &mut dyn NetDevice, target_mac: MacAddr, target_ip: Ipv4Addr) {
        self.build_arp(dev, target_mac, ARP_REPLY, target_mac, target_ip);
    }

    pub(crate) fn handle_arp(&mut self, dev: &mut dyn NetDevice, frame: &[u8]) {
        if frame.len() < ETH_HLEN + ARP_PLEN {
            return;
        }
        let arp = &frame[ETH_HLEN..];

        let hw_type = u16::from_be_bytes([arp[0], arp[1]]);
        let proto_type = u16::from_be_bytes([arp[2], arp[3]]);
        if hw_type != 1 || proto_type != 0x0800 || arp[4] != 6 || arp[5] != 4 {
            return;
        }

        let opcode = u16::from_be_bytes([arp[6], arp[7]]);
        let sender_mac = MacAddr([arp[8], arp[9], arp[10], arp[11], arp[12], arp[13]]);
        let sender_ip = Ipv4Addr([arp[14], arp[15], arp[16], arp[17]]);
        let target_ip = Ipv4Addr([arp[24], arp[25], arp[26], arp[27]]);

        // Always learn from ARP traffic
        self.arp_insert(sender_ip, sender_mac);

        if opcode == ARP_REQUEST && self.config.configured && target_ip == self.config.ip {
            self.arp_reply(dev, sender_mac, sender_ip);
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

    /// Ethernet + ARP frame as a peer would send it
    fn arp_frame(opcode: u16, sender_mac: [u8; 6], sender_ip: [u8; 4], target_ip: [u8; 4]) -> [u8; 42] {
        let mut f = [0u8; 42];
        f[0..6].copy_from_slice(&[0xFF; 6]);
        f[6..12].copy_from_slice(&sender_mac);
        f[12..14].copy_from_slice(&ETH_P_ARP.to_be_bytes());
        f[14..16].copy_from_slice(&1u16.to_be_bytes());
        f[16..18].copy_from_slice(&0x0800u16.to_be_bytes());
        f[18] = 6;
        f[19] = 4;
        f[20..22].copy_from_slice(&opcode.to_be_bytes());
        f[22..28].copy_from_slice(&sender_mac);
        f[28..32].copy_from_slice(&sender_ip);
        f[38..42].copy_from_slice(&target_ip);
        f
    }

    #[test]
    fn test_learns_sender_mapping() {
        let mut stack = configured_stack();
        let mut dev = TestDevice::new();

        let frame = arp_frame(2, [1, 2, 3, 4, 5, 6], [10, 0, 2, 2], [10, 0, 2, 15]);
        stack.handle_arp(&mut dev, &frame);

        assert_eq!(
            stack.arp_lookup(Ipv4Addr([10, 0, 2, 2])),
            Some(MacAddr([1, 2, 3, 4, 5, 6]))
        );
    }

    #[test]
    fn test_answers_request_for_our_ip() {
        let mut stack = configured_stack();
        let mut dev = TestDevice::new();

        let frame = arp_frame(1, [1, 2, 3, 4, 5, 6], [10, 0, 2, 2], [10, 0, 2, 15]);
        stack.handle_arp(&mut dev, &frame);

        let reply = dev.last_sent().expect("no ARP reply sent");
        // Addressed to the asker, opcode 2, carrying our IP as sender
        assert_eq!(&reply[0..6], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(u16::from_be_bytes([reply[20], reply[21]]), 2);
        assert_eq!(&reply[28..32], &[10, 0, 2, 15]);
    }

    #[test]
    fn test_ignores_request_for_other_ip() {
        let mut stack = configured_stack();
        let mut dev = TestDevice::new();

        let frame = arp_frame(1, [1, 2, 3, 4, 5, 6], [10, 0, 2, 2], [10, 0, 2, 99]);
        stack.handle_arp(&mut dev, &frame);
        assert!(dev.sent.is_empty());
    }

    #[test]
    fn test_full_cache_displaces_entry_zero() {
        let mut stack = configured_stack();

        for i in 0..ARP_CACHE_SIZE as u8 {
            stack.arp_insert(Ipv4Addr([10, 0, 3, i]), MacAddr([i; 6]));
        }
        // One more: entry 0 gets replaced, the rest survive
        stack.arp_insert(Ipv4Addr([10, 0, 4, 1]), MacAddr([0xAA; 6]));

        assert_eq!(stack.arp_lookup(Ipv4Addr([10, 0, 3, 0])), None);
        assert_eq!(stack.arp_lookup(Ipv4Addr([10, 0, 4, 1])), Some(MacAddr([0xAA; 6])));
        assert_eq!(stack.arp_lookup(Ipv4Addr([10, 0, 3, 7])), Some(MacAddr([7; 6])));
    }

    #[test]
    fn test_request_frame_shape() {
        let mut stack = configured_stack();
        let mut dev = TestDevice::new();

        stack.arp_request(&mut dev, Ipv4Addr([10, 0, 2, 2]));

        let req = dev.last_sent().unwrap();
        assert_eq!(req.len(), 42);
        assert_eq!(&req[0..6], &[0xFF; 6]); // broadcast
        assert_eq!(u16::from_be_bytes([req[12], req[13]]), ETH_P_ARP);
        assert_eq!(u16::from_be_bytes([req[20], req[21]]), 1); // request
        assert_eq!(&req[38..42], &[10, 0, 2, 2]); // target IP
        assert_eq!(&req[32..38], &[0u8; 6]); // unknown target MAC
    }
}
