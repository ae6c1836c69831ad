//! Virtio Network Driver
//!
//! Two 16-entry queues (RX=0, TX=1) with 2 KiB packet buffers. RX buffers
//! are pre-published device-writable and recycled as frames are consumed;
//! TX cycles descriptors round-robin through a single bounce buffer. Every
//! frame on the wire is prefixed with the 10-byte virtio-net header, zeroed
//! for plain frames.

use crate::arch::SpinLock;
use crate::kprintln;
use crate::net::{MacAddr, NetDevice};

use super::map;
use super::virtio::{MmioTransport, VirtQueue, DEVICE_ID_NET, VIRTQ_DESC_F_WRITE};

const QUEUE_SIZE: u16 = 16;
const RX_QUEUE: u32 = 0;
const TX_QUEUE: u32 = 1;

pub const PACKET_BUF_SIZE: usize = 2048;

/// Legacy virtio-net header: flags, gso_type, hdr_len, gso_size, csum_start,
/// csum_offset
pub const VIRTIO_NET_HDR_SIZE: usize = 10;

/// The only feature we accept: MAC address in config space
const VIRTIO_NET_F_MAC: u32 = 1 << 5;

// Region layout inside map::NET_REGION
const RX_QUEUE_OFFSET: usize = 0;
const TX_QUEUE_OFFSET: usize = 0x2000;
const RX_BUFFERS_OFFSET: usize = 0x4000;
const TX_BUFFER_OFFSET: usize = 0xC000;

// ═══════════════════════════════════════════════════════════════════════════════
// DRIVER
// ═══════════════════════════════════════════════════════════════════════════════

pub struct VirtioNet {
    transport: MmioTransport,
    rx: VirtQueue,
    tx: VirtQueue,
    rx_buffers: usize,
    tx_buffer: usize,
    tx_next: u16,
    mac: [u8; 6],
}

impl VirtioNet {
    /// Bring up the device with all rings and buffers inside `region`.
    ///
    /// # Safety
    /// `region` must be at least 56 KiB of device-reachable memory owned by
    /// this driver.
    pub unsafe fn init(transport: MmioTransport, region: usize) -> Result<Self, &'static str> {
        transport.begin_init();

        let mut rx = transport.setup_queue(RX_QUEUE, region + RX_QUEUE_OFFSET, QUEUE_SIZE)?;
        let tx = transport.setup_queue(TX_QUEUE, region + TX_QUEUE_OFFSET, QUEUE_SIZE)?;

        let offered = transport.negotiate_features(VIRTIO_NET_F_MAC);

        let mut mac = [0u8; 6];
        if offered & VIRTIO_NET_F_MAC != 0 {
            for (i, byte) in mac.iter_mut().enumerate() {
                *byte = transport.config_read8(i);
            }
        }

        // Pre-publish every RX descriptor with a full device-writable buffer
        let rx_buffers = region + RX_BUFFERS_OFFSET;
        for i in 0..QUEUE_SIZE {
            let addr = (rx_buffers + i as usize * PACKET_BUF_SIZE) as u64;
            rx.set_desc(i, addr, PACKET_BUF_SIZE as u32, VIRTQ_DESC_F_WRITE, 0);
            rx.push_avail(i);
        }
        transport.notify(RX_QUEUE);

        transport.finish_init()?;

        Ok(VirtioNet {
            transport,
            rx,
            tx,
            rx_buffers,
            tx_buffer: region + TX_BUFFER_OFFSET,
            tx_next: 0,
            mac,
        })
    }

    pub fn mac(&self) -> [u8; 6] {
        self.mac
    }

    /// Send one Ethernet frame (the virtio-net header is added here)
    pub fn send(&mut self, frame: &[u8]) -> Result<(), &'static str> {
        if frame.len() > PACKET_BUF_SIZE - VIRTIO_NET_HDR_SIZE {
            return Err("frame too large");
        }

        unsafe {
            let buf = self.tx_buffer as *mut u8;
            core::ptr::write_bytes(buf, 0, VIRTIO_NET_HDR_SIZE);
            core::ptr::copy_nonoverlapping(
                frame.as_ptr(),
                buf.add(VIRTIO_NET_HDR_SIZE),
                frame.len(),
            );

            let desc = self.tx_next;
            self.tx.set_desc(
                desc,
                self.tx_buffer as u64,
                (VIRTIO_NET_HDR_SIZE + frame.len()) as u32,
                0,
                0,
            );
            self.tx.push_avail(desc);
        }
        self.transport.notify(TX_QUEUE);

        self.tx_next = (self.tx_next + 1) % QUEUE_SIZE;
        Ok(())
    }

    /// Receive one Ethernet frame, header stripped. Returns 0 when nothing
    /// is pending. The consumed descriptor is immediately re-published.
    pub fn recv(&mut self, buf: &mut [u8]) -> usize {
        let (id, total_len) = match self.rx.pop_used() {
            Some(entry) => entry,
            None => return 0,
        };

        if id >= QUEUE_SIZE {
            return 0;
        }

        let mut copied = 0;
        if total_len as usize > VIRTIO_NET_HDR_SIZE {
            let pkt_len = total_len as usize - VIRTIO_NET_HDR_SIZE;
            copied = pkt_len.min(buf.len());
            unsafe {
                let pkt = (self.rx_buffers + id as usize * PACKET_BUF_SIZE) as *const u8;
                core::ptr::copy_nonoverlapping(
                    pkt.add(VIRTIO_NET_HDR_SIZE),
                    buf.as_mut_ptr(),
                    copied,
                );
            }
        }

        // Hand the buffer straight back to the device
        self.rx.push_avail(id);
        self.transport.notify(RX_QUEUE);

        copied
    }

    /// Acknowledge pending interrupt status (called from the poll loop)
    pub fn poll(&mut self) {
        self.transport.ack_interrupt();
    }

    fn ack_interrupt(&self) {
        self.transport.ack_interrupt();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// GLOBAL INSTANCE
// ═══════════════════════════════════════════════════════════════════════════════

static DRIVER: SpinLock<Option<VirtioNet>> = SpinLock::new(None);

/// Find and initialize the network device
pub fn init() {
    let transport = match unsafe { MmioTransport::scan(DEVICE_ID_NET) } {
        Some(t) => t,
        None => {
            kprintln!("[NET] No virtio-net device found");
            return;
        }
    };

    kprintln!("[NET] Found network device at {:#x}", transport.base());
    let irq = transport.irq();

    match unsafe { VirtioNet::init(transport, map::NET_REGION) } {
        Ok(drv) => {
            let m = drv.mac();
            kprintln!(
                "[NET] MAC: {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                m[0], m[1], m[2], m[3], m[4], m[5]
            );
            *DRIVER.lock() = Some(drv);
            super::gic::register_handler(irq, &NET_IRQ);
            super::gic::enable(irq);
        }
        Err(e) => kprintln!("[NET] Init failed: {}", e),
    }
}

pub fn available() -> bool {
    DRIVER.lock().is_some()
}

pub fn mac() -> [u8; 6] {
    DRIVER.lock().as_ref().map(|d| d.mac()).unwrap_or([0; 6])
}

pub fn poll() {
    if let Some(drv) = DRIVER.lock().as_mut() {
        drv.poll();
    }
}

/// [`NetDevice`] endpoint over the global driver, owned by the `System`
/// value and handed to the network stack.
pub struct SystemNet;

impl NetDevice for SystemNet {
    fn send(&mut self, frame: &[u8]) -> Result<(), &'static str> {
        DRIVER.lock().as_mut().ok_or("no network device")?.send(frame)
    }

    fn recv(&mut self, buf: &mut [u8]) -> usize {
        DRIVER.lock().as_mut().map(|d| d.recv(buf)).unwrap_or(0)
    }

    fn mac(&self) -> MacAddr {
        MacAddr(mac())
    }
}

/// IRQ handler: only acknowledges; the main loop's poll remains the consumer
pub struct NetIrq;

impl super::gic::DeviceHandler for NetIrq {
    fn on_irq(&self, _irq: u32) {
        if let Some(drv) = DRIVER.lock().as_ref() {
            drv.ack_interrupt();
        }
    }
}

pub static NET_IRQ: NetIrq = NetIrq;
