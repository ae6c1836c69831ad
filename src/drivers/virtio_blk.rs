//! Virtio Block Driver
//!
//! Disk I/O over a single virtqueue: every request is a three-descriptor
//! chain (16-byte header, data, status byte) through a fixed 64 KiB bounce
//! buffer. Requests larger than 128 sectors are split here so callers can
//! ask for arbitrary runs.

use crate::arch::SpinLock;
use crate::kprintln;

use super::map;
use super::virtio::{
    MmioTransport, VirtQueue, DEVICE_ID_BLOCK, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE,
};

pub const SECTOR_SIZE: usize = 512;

/// The bounce buffer holds this many sectors (64 KiB)
const MAX_CHUNK_SECTORS: u32 = 128;

const QUEUE_SIZE: u16 = 16;

// Request types
const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;
const VIRTIO_BLK_T_FLUSH: u32 = 4;

// Status byte values
const VIRTIO_BLK_S_OK: u8 = 0;

/// Completion poll budget (bounded busy wait, no timer dependency)
const IO_TIMEOUT_SPINS: u32 = 10_000_000;

/// Request header, placed in the fixed request region
#[repr(C)]
struct BlkReqHeader {
    req_type: u32,
    reserved: u32,
    sector: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// DRIVER
// ═══════════════════════════════════════════════════════════════════════════════

pub struct VirtioBlk {
    transport: MmioTransport,
    queue: VirtQueue,
    /// 16-byte request header
    req_header: usize,
    /// Status byte, right after the header
    status_byte: usize,
    /// 64 KiB data bounce buffer
    data: usize,
    capacity: u64,
}

impl VirtioBlk {
    /// Bring up the device with ring and buffers at the given regions.
    ///
    /// # Safety
    /// The regions must be valid, device-reachable memory owned by this
    /// driver.
    pub unsafe fn init(
        transport: MmioTransport,
        queue_mem: usize,
        request_mem: usize,
        data_mem: usize,
    ) -> Result<Self, &'static str> {
        transport.begin_init();
        let queue = transport.setup_queue(0, queue_mem, QUEUE_SIZE)?;
        transport.negotiate_features(0);
        transport.finish_init()?;

        // Capacity lives at config offset 0x100 as a little-endian u64
        let cap_low = transport.config_read32(0) as u64;
        let cap_high = transport.config_read32(4) as u64;
        let capacity = (cap_high << 32) | cap_low;

        Ok(VirtioBlk {
            transport,
            queue,
            req_header: request_mem,
            status_byte: request_mem + core::mem::size_of::<BlkReqHeader>(),
            data: data_mem,
            capacity,
        })
    }

    /// Disk capacity in sectors
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn write_header(&self, req_type: u32, sector: u64) {
        unsafe {
            let hdr = self.req_header as *mut BlkReqHeader;
            (*hdr).req_type = req_type;
            (*hdr).reserved = 0;
            (*hdr).sector = sector;
        }
    }

    fn submit_and_wait(&mut self, head: u16) -> Result<(), &'static str> {
        self.queue.push_avail(head);
        self.transport.notify(0);

        let mut timeout = IO_TIMEOUT_SPINS;
        while !self.queue.has_used() {
            if timeout == 0 {
                self.transport.ack_interrupt();
                return Err("block request timeout");
            }
            timeout -= 1;
            core::hint::spin_loop();
        }

        self.transport.ack_interrupt();
        self.queue.pop_used();
        Ok(())
    }

    /// One chunk of at most 128 sectors through the bounce buffer
    fn do_io(
        &mut self,
        req_type: u32,
        sector: u64,
        count: u32,
        buf: Option<&[u8]>,
    ) -> Result<(), &'static str> {
        let bytes = count as usize * SECTOR_SIZE;

        self.write_header(req_type, sector);
        unsafe { core::ptr::write_volatile(self.status_byte as *mut u8, 0xFF) };

        if req_type == VIRTIO_BLK_T_OUT {
            if let Some(src) = buf {
                unsafe {
                    core::ptr::copy_nonoverlapping(src.as_ptr(), self.data as *mut u8, bytes)
                };
            }
        }

        let d0 = self.queue.alloc_desc().ok_or("no free descriptors")?;
        let d1 = match self.queue.alloc_desc() {
            Some(d) => d,
            None => {
                self.queue.free_desc(d0);
                return Err("no free descriptors");
            }
        };
        let d2 = match self.queue.alloc_desc() {
            Some(d) => d,
            None => {
                self.queue.free_desc(d0);
                self.queue.free_desc(d1);
                return Err("no free descriptors");
            }
        };

        let data_flags = if req_type == VIRTIO_BLK_T_IN {
            VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE
        } else {
            VIRTQ_DESC_F_NEXT
        };

        unsafe {
            self.queue.set_desc(
                d0,
                self.req_header as u64,
                core::mem::size_of::<BlkReqHeader>() as u32,
                VIRTQ_DESC_F_NEXT,
                d1,
            );
            self.queue.set_desc(d1, self.data as u64, bytes as u32, data_flags, d2);
            self.queue.set_desc(d2, self.status_byte as u64, 1, VIRTQ_DESC_F_WRITE, 0);
        }

        let result = self.submit_and_wait(d0);
        self.queue.free_chain(d0);
        result?;

        if unsafe { core::ptr::read_volatile(self.status_byte as *const u8) } != VIRTIO_BLK_S_OK {
            return Err("block I/O error");
        }

        Ok(())
    }

    /// Read `count` sectors into `buf`
    pub fn read(&mut self, mut sector: u64, mut count: u32, buf: &mut [u8]) -> Result<(), &'static str> {
        if buf.len() < count as usize * SECTOR_SIZE {
            return Err("buffer too small");
        }

        let mut out = buf.as_mut_ptr();
        while count > 0 {
            let chunk = count.min(MAX_CHUNK_SECTORS);
            self.do_io(VIRTIO_BLK_T_IN, sector, chunk, None)?;
            unsafe {
                core::ptr::copy_nonoverlapping(
                    self.data as *const u8,
                    out,
                    chunk as usize * SECTOR_SIZE,
                );
                out = out.add(chunk as usize * SECTOR_SIZE);
            }
            sector += chunk as u64;
            count -= chunk;
        }
        Ok(())
    }

    /// Write `count` sectors from `buf`
    pub fn write(&mut self, mut sector: u64, mut count: u32, buf: &[u8]) -> Result<(), &'static str> {
        if buf.len() < count as usize * SECTOR_SIZE {
            return Err("buffer too small");
        }

        let mut offset = 0usize;
        while count > 0 {
            let chunk = count.min(MAX_CHUNK_SECTORS);
            let bytes = chunk as usize * SECTOR_SIZE;
            self.do_io(VIRTIO_BLK_T_OUT, sector, chunk, Some(&buf[offset..offset + bytes]))?;
            offset += bytes;
            sector += chunk as u64;
            count -= chunk;
        }
        Ok(())
    }

    /// Flush the device write cache (header + status chain)
    pub fn flush(&mut self) -> Result<(), &'static str> {
        self.write_header(VIRTIO_BLK_T_FLUSH, 0);
        unsafe { core::ptr::write_volatile(self.status_byte as *mut u8, 0xFF) };

        let d0 = self.queue.alloc_desc().ok_or("no free descriptors")?;
        let d1 = match self.queue.alloc_desc() {
            Some(d) => d,
            None => {
                self.queue.free_desc(d0);
                return Err("no free descriptors");
            }
        };

        unsafe {
            self.queue.set_desc(
                d0,
                self.req_header as u64,
                core::mem::size_of::<BlkReqHeader>() as u32,
                VIRTQ_DESC_F_NEXT,
                d1,
            );
            self.queue.set_desc(d1, self.status_byte as u64, 1, VIRTQ_DESC_F_WRITE, 0);
        }

        let result = self.submit_and_wait(d0);
        self.queue.free_chain(d0);
        result?;

        if unsafe { core::ptr::read_volatile(self.status_byte as *const u8) } != VIRTIO_BLK_S_OK {
            return Err("flush error");
        }
        Ok(())
    }

    fn ack_interrupt(&self) {
        self.transport.ack_interrupt();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// GLOBAL INSTANCE
// ═══════════════════════════════════════════════════════════════════════════════

static DRIVER: SpinLock<Option<VirtioBlk>> = SpinLock::new(None);

/// Find and initialize the block device. Leaves the device inactive (and the
/// rest of the system running) on failure.
pub fn init() {
    let transport = match unsafe { MmioTransport::scan(DEVICE_ID_BLOCK) } {
        Some(t) => t,
        None => {
            kprintln!("[BLK] No virtio-blk device found");
            return;
        }
    };

    kprintln!("[BLK] Found block device at {:#x}", transport.base());
    let irq = transport.irq();

    match unsafe {
        VirtioBlk::init(transport, map::BLK_VIRTQUEUE, map::BLK_REQUEST, map::BLK_DATA)
    } {
        Ok(drv) => {
            kprintln!("[BLK] Capacity: {} sectors", drv.capacity());
            *DRIVER.lock() = Some(drv);
            super::gic::register_handler(irq, &BLK_IRQ);
            super::gic::enable(irq);
        }
        Err(e) => kprintln!("[BLK] Init failed: {}", e),
    }
}

pub fn available() -> bool {
    DRIVER.lock().is_some()
}

pub fn capacity() -> u64 {
    DRIVER.lock().as_ref().map(|d| d.capacity()).unwrap_or(0)
}

pub fn read(sector: u64, count: u32, buf: &mut [u8]) -> Result<(), &'static str> {
    DRIVER.lock().as_mut().ok_or("no disk")?.read(sector, count, buf)
}

pub fn write(sector: u64, count: u32, buf: &[u8]) -> Result<(), &'static str> {
    DRIVER.lock().as_mut().ok_or("no disk")?.write(sector, count, buf)
}

pub fn flush() -> Result<(), &'static str> {
    DRIVER.lock().as_mut().ok_or("no disk")?.flush()
}

/// IRQ handler: acknowledge and return; completions are reaped by the
/// polling I/O path.
pub struct BlkIrq;

impl super::gic::DeviceHandler for BlkIrq {
    fn on_irq(&self, _irq: u32) {
        if let Some(drv) = DRIVER.lock().as_ref() {
            drv.ack_interrupt();
        }
    }
}

pub static BLK_IRQ: BlkIrq = BlkIrq;
