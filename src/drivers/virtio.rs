//! Virtio MMIO Transport
//!
//! One consolidated transport for all four device classes (net, block, gpu,
//! input): device probe, legacy/modern version handling, the status
//! handshake, and the split virtqueue. Per-device buffer layouts live in the
//! device drivers; everything ring-shaped lives here.
//!
//! The [`VirtQueue`] works over any caller-provided contiguous region, so the
//! ring mechanics can be exercised on the host with a plain buffer standing
//! in for device memory.

use crate::arch;

use super::map;

// ═══════════════════════════════════════════════════════════════════════════════
// REGISTERS (MMIO)
// ═══════════════════════════════════════════════════════════════════════════════

pub const MMIO_MAGIC: usize = 0x000;
pub const MMIO_VERSION: usize = 0x004;
pub const MMIO_DEVICE_ID: usize = 0x008;
pub const MMIO_VENDOR_ID: usize = 0x00c;
pub const MMIO_DEV_FEATURES: usize = 0x010;
pub const MMIO_DEV_FEATURES_SEL: usize = 0x014;
pub const MMIO_DRV_FEATURES: usize = 0x020;
pub const MMIO_DRV_FEATURES_SEL: usize = 0x024;
pub const MMIO_GUEST_PAGE_SIZE: usize = 0x028; // Legacy only
pub const MMIO_QUEUE_SEL: usize = 0x030;
pub const MMIO_QUEUE_NUM_MAX: usize = 0x034;
pub const MMIO_QUEUE_NUM: usize = 0x038;
pub const MMIO_QUEUE_ALIGN: usize = 0x03c;     // Legacy only
pub const MMIO_QUEUE_PFN: usize = 0x040;       // Legacy only
pub const MMIO_QUEUE_READY: usize = 0x044;     // Modern only
pub const MMIO_QUEUE_NOTIFY: usize = 0x050;
pub const MMIO_INT_STATUS: usize = 0x060;
pub const MMIO_INT_ACK: usize = 0x064;
pub const MMIO_STATUS: usize = 0x070;
pub const MMIO_QUEUE_DESC_LOW: usize = 0x080;  // Modern only
pub const MMIO_QUEUE_DESC_HIGH: usize = 0x084;
pub const MMIO_QUEUE_AVAIL_LOW: usize = 0x090;
pub const MMIO_QUEUE_AVAIL_HIGH: usize = 0x094;
pub const MMIO_QUEUE_USED_LOW: usize = 0x0a0;
pub const MMIO_QUEUE_USED_HIGH: usize = 0x0a4;
pub const MMIO_CONFIG: usize = 0x100;

/// "virt" in little-endian ASCII
pub const MAGIC_VALUE: u32 = 0x7472_6976;

// Device classes
pub const DEVICE_ID_NET: u32 = 1;
pub const DEVICE_ID_BLOCK: u32 = 2;
pub const DEVICE_ID_GPU: u32 = 16;
pub const DEVICE_ID_INPUT: u32 = 18;

// Status bits
pub const STATUS_ACKNOWLEDGE: u32 = 1;
pub const STATUS_DRIVER: u32 = 2;
pub const STATUS_DRIVER_OK: u32 = 4;
pub const STATUS_FEATURES_OK: u32 = 8;

// Descriptor flags
pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSPORT
// ═══════════════════════════════════════════════════════════════════════════════

/// One virtio-mmio device slot after a successful probe.
pub struct MmioTransport {
    base: usize,
    version: u32,
}

impl MmioTransport {
    /// Probe a transport slot. Returns the device class and the transport on
    /// a magic match with a non-zero device id.
    ///
    /// # Safety
    /// `base` must point at a mapped virtio-mmio register window (or, in
    /// tests, at a buffer laid out like one).
    pub unsafe fn probe(base: usize) -> Option<(u32, MmioTransport)> {
        let magic = arch::read32(base + MMIO_MAGIC);
        if magic != MAGIC_VALUE {
            return None;
        }
        let device_id = arch::read32(base + MMIO_DEVICE_ID);
        if device_id == 0 {
            return None;
        }
        let version = arch::read32(base + MMIO_VERSION);
        Some((device_id, MmioTransport { base, version }))
    }

    /// Scan the MMIO window for a device of the given class.
    ///
    /// # Safety
    /// Only valid on hardware exposing the `virt` machine's MMIO window.
    pub unsafe fn scan(device_id: u32) -> Option<MmioTransport> {
        for slot in 0..map::VIRTIO_MMIO_SLOTS {
            let base = map::VIRTIO_MMIO_BASE + slot * map::VIRTIO_MMIO_STRIDE;
            if let Some((id, transport)) = Self::probe(base) {
                if id == device_id {
                    return Some(transport);
                }
            }
        }
        None
    }

    pub fn base(&self) -> usize {
        self.base
    }

    /// GIC interrupt line for this transport slot (SPIs 16.. on `virt`)
    pub fn irq(&self) -> u32 {
        let slot = (self.base - map::VIRTIO_MMIO_BASE) / map::VIRTIO_MMIO_STRIDE;
        32 + 16 + slot as u32
    }

    /// 1 = legacy, 2 = modern
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn reg_read(&self, offset: usize) -> u32 {
        unsafe { arch::read32(self.base + offset) }
    }

    pub fn reg_write(&self, offset: usize, value: u32) {
        unsafe { arch::write32(self.base + offset, value) }
    }

    /// Reset the device and announce the driver (handshake steps 1-4).
    pub fn begin_init(&self) {
        self.reg_write(MMIO_STATUS, 0);
        arch::delay_cycles(10_000);

        if self.version == 1 {
            self.reg_write(MMIO_GUEST_PAGE_SIZE, 4096);
        }

        self.reg_write(MMIO_STATUS, STATUS_ACKNOWLEDGE);
        self.reg_write(MMIO_STATUS, STATUS_ACKNOWLEDGE | STATUS_DRIVER);
    }

    /// Negotiate feature word 0: offer is masked with `accept` and written
    /// back. Returns the device's offered features.
    pub fn negotiate_features(&self, accept: u32) -> u32 {
        self.reg_write(MMIO_DEV_FEATURES_SEL, 0);
        let offered = self.reg_read(MMIO_DEV_FEATURES);
        self.reg_write(MMIO_DRV_FEATURES_SEL, 0);
        self.reg_write(MMIO_DRV_FEATURES, offered & accept);
        offered
    }

    /// Select a queue, size it, and install ring memory at `mem`.
    ///
    /// # Safety
    /// `mem` must be a 4096-aligned region big enough for
    /// [`VirtQueue::region_size`] of the negotiated size, owned by this queue
    /// for the life of the device.
    pub unsafe fn setup_queue(
        &self,
        index: u32,
        mem: usize,
        want_size: u16,
    ) -> Result<VirtQueue, &'static str> {
        self.reg_write(MMIO_QUEUE_SEL, index);

        let num_max = self.reg_read(MMIO_QUEUE_NUM_MAX);
        if num_max == 0 {
            return Err("queue not available");
        }

        let mut size = want_size;
        if (num_max as u16) < size {
            size = num_max as u16;
        }

        self.reg_write(MMIO_QUEUE_NUM, size as u32);

        let queue = VirtQueue::new(mem, size);

        if self.version == 1 {
            self.reg_write(MMIO_QUEUE_ALIGN, 4096);
            self.reg_write(MMIO_QUEUE_PFN, (mem >> 12) as u32);
        } else {
            let desc = mem as u64;
            let avail = (mem + VirtQueue::avail_offset(size)) as u64;
            let used = (mem + VirtQueue::used_offset(size)) as u64;
            self.reg_write(MMIO_QUEUE_DESC_LOW, desc as u32);
            self.reg_write(MMIO_QUEUE_DESC_HIGH, (desc >> 32) as u32);
            self.reg_write(MMIO_QUEUE_AVAIL_LOW, avail as u32);
            self.reg_write(MMIO_QUEUE_AVAIL_HIGH, (avail >> 32) as u32);
            self.reg_write(MMIO_QUEUE_USED_LOW, used as u32);
            self.reg_write(MMIO_QUEUE_USED_HIGH, (used >> 32) as u32);
            self.reg_write(MMIO_QUEUE_READY, 1);
        }

        Ok(queue)
    }

    /// Complete the handshake (FEATURES_OK on modern devices, then
    /// DRIVER_OK).
    pub fn finish_init(&self) -> Result<(), &'static str> {
        if self.version == 1 {
            self.reg_write(
                MMIO_STATUS,
                STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_DRIVER_OK,
            );
            return Ok(());
        }

        let features_ok = STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_FEATURES_OK;
        self.reg_write(MMIO_STATUS, features_ok);
        if self.reg_read(MMIO_STATUS) & STATUS_FEATURES_OK == 0 {
            return Err("features not accepted");
        }
        self.reg_write(MMIO_STATUS, features_ok | STATUS_DRIVER_OK);
        Ok(())
    }

    /// Ring the doorbell for a queue
    pub fn notify(&self, queue: u32) {
        self.reg_write(MMIO_QUEUE_NOTIFY, queue);
    }

    /// Acknowledge any pending interrupt status bits. Returns what was
    /// acknowledged.
    pub fn ack_interrupt(&self) -> u32 {
        let status = self.reg_read(MMIO_INT_STATUS);
        if status != 0 {
            self.reg_write(MMIO_INT_ACK, status);
        }
        status
    }

    pub fn config_read8(&self, offset: usize) -> u8 {
        unsafe { arch::read8(self.base + MMIO_CONFIG + offset) }
    }

    pub fn config_read32(&self, offset: usize) -> u32 {
        self.reg_read(MMIO_CONFIG + offset)
    }

    pub fn config_write32(&self, offset: usize, value: u32) {
        self.reg_write(MMIO_CONFIG + offset, value);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// VIRTQUEUE (split ring, legacy layout)
// ═══════════════════════════════════════════════════════════════════════════════

/// Descriptor table entry (16 bytes)
#[repr(C)]
#[derive(Clone, Copy)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

/// A split virtqueue in driver memory: descriptors at offset 0, available
/// ring immediately after, used ring at the next 4096-byte boundary. The
/// free descriptors form an intrusive chain through `next`.
pub struct VirtQueue {
    mem: usize,
    size: u16,
    free_head: u16,
    num_free: u16,
    last_used: u16,
}

impl VirtQueue {
    pub const fn avail_offset(size: u16) -> usize {
        size as usize * 16
    }

    pub const fn used_offset(size: u16) -> usize {
        let avail_end = Self::avail_offset(size) + 6 + 2 * size as usize;
        (avail_end + 4095) & !4095
    }

    /// Bytes of driver memory a queue of `size` entries occupies
    pub const fn region_size(size: u16) -> usize {
        Self::used_offset(size) + 6 + 8 * size as usize
    }

    /// Lay out a queue over `mem`, zero it, and chain all descriptors into
    /// the free list.
    ///
    /// # Safety
    /// `mem` must be 4096-aligned, writable, and at least
    /// [`Self::region_size`] bytes.
    pub unsafe fn new(mem: usize, size: u16) -> Self {
        core::ptr::write_bytes(mem as *mut u8, 0, Self::region_size(size));

        let desc = mem as *mut VirtqDesc;
        for i in 0..size {
            (*desc.add(i as usize)).next = (i + 1) % size;
        }
        arch::dmb();

        VirtQueue {
            mem,
            size,
            free_head: 0,
            num_free: size,
            last_used: 0,
        }
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn num_free(&self) -> u16 {
        self.num_free
    }

    #[inline]
    fn desc_ptr(&self, idx: u16) -> *mut VirtqDesc {
        (self.mem as *mut VirtqDesc).wrapping_add(idx as usize)
    }

    /// Pop a descriptor off the free list
    pub fn alloc_desc(&mut self) -> Option<u16> {
        if self.num_free == 0 {
            return None;
        }
        let idx = self.free_head;
        self.free_head = unsafe { (*self.desc_ptr(idx)).next };
        self.num_free -= 1;
        Some(idx)
    }

    /// Push a descriptor back on the free list
    pub fn free_desc(&mut self, idx: u16) {
        if idx >= self.size {
            return;
        }
        unsafe { (*self.desc_ptr(idx)).next = self.free_head };
        self.free_head = idx;
        self.num_free += 1;
    }

    /// Free a whole chain starting at `head`, following `NEXT` links
    pub fn free_chain(&mut self, head: u16) {
        let mut idx = head;
        loop {
            let (flags, next) = unsafe {
                let d = self.desc_ptr(idx);
                ((*d).flags, (*d).next)
            };
            self.free_desc(idx);
            if flags & VIRTQ_DESC_F_NEXT == 0 {
                break;
            }
            idx = next;
        }
    }

    /// Fill in one descriptor
    ///
    /// # Safety
    /// `addr`/`len` must describe memory valid for the device to access for
    /// the lifetime of the request.
    pub unsafe fn set_desc(&mut self, idx: u16, addr: u64, len: u32, flags: u16, next: u16) {
        let d = self.desc_ptr(idx);
        (*d).addr = addr;
        (*d).len = len;
        (*d).flags = flags;
        (*d).next = next;
    }

    /// Read back a descriptor (used by the net RX path and tests)
    pub fn desc(&self, idx: u16) -> VirtqDesc {
        unsafe { core::ptr::read_volatile(self.desc_ptr(idx)) }
    }

    fn avail_idx_ptr(&self) -> *mut u16 {
        (self.mem + Self::avail_offset(self.size) + 2) as *mut u16
    }

    fn avail_ring_ptr(&self, slot: u16) -> *mut u16 {
        (self.mem + Self::avail_offset(self.size) + 4 + 2 * slot as usize) as *mut u16
    }

    fn used_idx_ptr(&self) -> *const u16 {
        (self.mem + Self::used_offset(self.size) + 2) as *const u16
    }

    fn used_elem_ptr(&self, slot: u16) -> *const u32 {
        (self.mem + Self::used_offset(self.size) + 4 + 8 * slot as usize) as *const u32
    }

    /// Publish a chain head to the available ring. A release barrier
    /// separates the ring write from the index update; the caller follows
    /// with [`MmioTransport::notify`].
    pub fn push_avail(&mut self, head: u16) {
        unsafe {
            let idx = core::ptr::read_volatile(self.avail_idx_ptr());
            core::ptr::write_volatile(self.avail_ring_ptr(idx % self.size), head);
            arch::dmb();
            core::ptr::write_volatile(self.avail_idx_ptr(), idx.wrapping_add(1));
            arch::dmb();
        }
    }

    /// Device-written used index
    pub fn used_idx(&self) -> u16 {
        arch::dmb();
        unsafe { core::ptr::read_volatile(self.used_idx_ptr()) }
    }

    /// True when the device has returned buffers we have not consumed yet
    pub fn has_used(&self) -> bool {
        self.used_idx() != self.last_used
    }

    /// Consume one used-ring entry: `(descriptor head, written length)`
    pub fn pop_used(&mut self) -> Option<(u16, u32)> {
        if !self.has_used() {
            return None;
        }
        let slot = self.last_used % self.size;
        let (id, len) = unsafe {
            let p = self.used_elem_ptr(slot);
            (core::ptr::read_volatile(p), core::ptr::read_volatile(p.add(1)))
        };
        self.last_used = self.last_used.wrapping_add(1);
        Some((id as u16, len))
    }
}

// SAFETY: a VirtQueue owns its ring memory; concurrent access is prevented
// by the SpinLock around each driver instance.
unsafe impl Send for VirtQueue {}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    #[repr(align(4096))]
    struct Region([u8; 16384]);

    fn region() -> Box<Region> {
        Box::new(Region([0; 16384]))
    }

    #[test]
    fn test_layout_matches_legacy_spec() {
        // 16 descriptors: desc 256 bytes, avail 6 + 32 = 38, used at the
        // next page boundary.
        assert_eq!(VirtQueue::avail_offset(16), 256);
        assert_eq!(VirtQueue::used_offset(16), 4096);
        assert_eq!(VirtQueue::region_size(16), 4096 + 6 + 128);
    }

    #[test]
    fn test_free_list_is_linear_chain() {
        let mut mem = region();
        let mut q = unsafe { VirtQueue::new(mem.0.as_mut_ptr() as usize, 16) };

        for expect in 0..16u16 {
            assert_eq!(q.alloc_desc(), Some(expect));
        }
        assert_eq!(q.alloc_desc(), None);
        assert_eq!(q.num_free(), 0);

        q.free_desc(7);
        q.free_desc(3);
        assert_eq!(q.alloc_desc(), Some(3));
        assert_eq!(q.alloc_desc(), Some(7));
    }

    #[test]
    fn test_chain_submit_and_complete() {
        let mut mem = region();
        let base = mem.0.as_mut_ptr() as usize;
        let mut q = unsafe { VirtQueue::new(base, 16) };

        let d0 = q.alloc_desc().unwrap();
        let d1 = q.alloc_desc().unwrap();
        let d2 = q.alloc_desc().unwrap();
        unsafe {
            q.set_desc(d0, 0x1000, 16, VIRTQ_DESC_F_NEXT, d1);
            q.set_desc(d1, 0x2000, 512, VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE, d2);
            q.set_desc(d2, 0x3000, 1, VIRTQ_DESC_F_WRITE, 0);
        }
        q.push_avail(d0);

        // The device would see the head in the ring and the index advanced
        unsafe {
            let avail = (base + VirtQueue::avail_offset(16)) as *const u16;
            assert_eq!(*avail.add(1), 1); // idx
            assert_eq!(*avail.add(2), d0); // ring[0]
        }

        // No completion yet
        assert_eq!(q.pop_used(), None);

        // Play the device: write a used element and bump the index
        unsafe {
            let used = (base + VirtQueue::used_offset(16)) as *mut u16;
            let elem = used.add(2) as *mut u32;
            *elem = d0 as u32;
            *elem.add(1) = 513;
            *used.add(1) = 1; // idx
        }

        assert!(q.has_used());
        assert_eq!(q.pop_used(), Some((d0, 513)));
        assert_eq!(q.pop_used(), None);

        q.free_chain(d0);
        assert_eq!(q.num_free(), 16);
    }

    #[test]
    fn test_transport_probe_and_handshake() {
        // A buffer stands in for the device register window.
        let mut mem = region();
        let base = mem.0.as_mut_ptr() as usize;
        unsafe {
            core::ptr::write_volatile((base + MMIO_MAGIC) as *mut u32, MAGIC_VALUE);
            core::ptr::write_volatile((base + MMIO_VERSION) as *mut u32, 2);
            core::ptr::write_volatile((base + MMIO_DEVICE_ID) as *mut u32, DEVICE_ID_BLOCK);
            core::ptr::write_volatile((base + MMIO_QUEUE_NUM_MAX) as *mut u32, 16);
            core::ptr::write_volatile((base + MMIO_DEV_FEATURES) as *mut u32, 0xffff_ffff);
        }

        let (id, transport) = unsafe { MmioTransport::probe(base) }.unwrap();
        assert_eq!(id, DEVICE_ID_BLOCK);
        assert_eq!(transport.version(), 2);

        transport.begin_init();
        let offered = transport.negotiate_features(1 << 5);
        assert_eq!(offered, 0xffff_ffff);
        assert_eq!(transport.reg_read(MMIO_DRV_FEATURES), 1 << 5);

        let mut qmem = region();
        let q = unsafe { transport.setup_queue(0, qmem.0.as_mut_ptr() as usize, 16) }.unwrap();
        assert_eq!(q.size(), 16);
        assert_eq!(transport.reg_read(MMIO_QUEUE_READY), 1);

        transport.finish_init().unwrap();
        assert_eq!(
            transport.reg_read(MMIO_STATUS),
            STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_FEATURES_OK | STATUS_DRIVER_OK
        );
    }

    #[test]
    fn test_transport_probe_rejects_bad_magic() {
        let mut mem = region();
        let base = mem.0.as_mut_ptr() as usize;
        unsafe {
            core::ptr::write_volatile((base + MMIO_MAGIC) as *mut u32, 0x1234_5678);
        }
        assert!(unsafe { MmioTransport::probe(base) }.is_none());
    }
}
