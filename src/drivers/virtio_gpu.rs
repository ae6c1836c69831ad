//! Virtio GPU Driver
//!
//! Single scanout over the control queue: create a 2D resource, attach the
//! linear framebuffer as backing, and push the whole surface on every
//! flush. SET_SCANOUT is deferred until the first flush so the display
//! never shows uninitialized pixels. Pixels are 0x00RRGGBB in host memory.

use crate::arch::SpinLock;
use crate::kprintln;

use super::map;
use super::virtio::{
    MmioTransport, VirtQueue, DEVICE_ID_GPU, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE,
};

const QUEUE_SIZE: u16 = 64;

// Control queue command types
const VIRTIO_GPU_CMD_GET_DISPLAY_INFO: u32 = 0x0100;
const VIRTIO_GPU_CMD_RESOURCE_CREATE_2D: u32 = 0x0101;
const VIRTIO_GPU_CMD_SET_SCANOUT: u32 = 0x0103;
const VIRTIO_GPU_CMD_RESOURCE_FLUSH: u32 = 0x0104;
const VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D: u32 = 0x0105;
const VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING: u32 = 0x0106;

const VIRTIO_GPU_RESP_OK_DISPLAY_INFO: u32 = 0x1101;

const VIRTIO_GPU_FORMAT_B8G8R8X8_UNORM: u32 = 2;

/// Our single scanout resource
const RESOURCE_ID: u32 = 1;

/// Fallback display size when GET_DISPLAY_INFO reports nothing usable
const DEFAULT_WIDTH: u32 = 720;
const DEFAULT_HEIGHT: u32 = 1280;

const CMD_TIMEOUT_SPINS: u32 = 5_000_000;

// ═══════════════════════════════════════════════════════════════════════════════
// COMMAND STRUCTURES (guest memory, native little-endian)
// ═══════════════════════════════════════════════════════════════════════════════

#[repr(C)]
#[derive(Clone, Copy)]
struct CtrlHeader {
    cmd_type: u32,
    flags: u32,
    fence_id: u64,
    ctx_id: u32,
    padding: u32,
}

impl CtrlHeader {
    fn new(cmd_type: u32) -> Self {
        CtrlHeader {
            cmd_type,
            flags: 0,
            fence_id: 0,
            ctx_id: 0,
            padding: 0,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct GpuRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct DisplayOne {
    r: GpuRect,
    enabled: u32,
    flags: u32,
}

#[repr(C)]
struct RespDisplayInfo {
    hdr: CtrlHeader,
    pmodes: [DisplayOne; 16],
}

#[repr(C)]
struct ResourceCreate2d {
    hdr: CtrlHeader,
    resource_id: u32,
    format: u32,
    width: u32,
    height: u32,
}

#[repr(C)]
struct SetScanout {
    hdr: CtrlHeader,
    r: GpuRect,
    scanout_id: u32,
    resource_id: u32,
}

#[repr(C)]
struct MemEntry {
    addr: u64,
    length: u32,
    padding: u32,
}

#[repr(C)]
struct AttachBacking {
    hdr: CtrlHeader,
    resource_id: u32,
    nr_entries: u32,
    entry: MemEntry,
}

#[repr(C)]
struct TransferToHost2d {
    hdr: CtrlHeader,
    r: GpuRect,
    offset: u64,
    resource_id: u32,
    padding: u32,
}

#[repr(C)]
struct ResourceFlush {
    hdr: CtrlHeader,
    r: GpuRect,
    resource_id: u32,
    padding: u32,
}

// ═══════════════════════════════════════════════════════════════════════════════
// DRIVER
// ═══════════════════════════════════════════════════════════════════════════════

pub struct VirtioGpu {
    transport: MmioTransport,
    queue: VirtQueue,
    /// Command buffer region
    cmd: usize,
    /// Response buffer region (one page past the commands)
    resp: usize,
    width: u32,
    height: u32,
    scanout_set: bool,
}

impl VirtioGpu {
    /// # Safety
    /// `queue_mem` and `cmd_mem` must be device-reachable regions owned by
    /// this driver; the framebuffer region must stay mapped for the life of
    /// the device.
    pub unsafe fn init(
        transport: MmioTransport,
        queue_mem: usize,
        cmd_mem: usize,
    ) -> Result<Self, &'static str> {
        transport.begin_init();
        let queue = transport.setup_queue(0, queue_mem, QUEUE_SIZE)?;
        transport.negotiate_features(0xFF);
        transport.finish_init()?;

        let mut gpu = VirtioGpu {
            transport,
            queue,
            cmd: cmd_mem,
            resp: cmd_mem + 0x1000,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            scanout_set: false,
        };

        gpu.get_display_info();
        gpu.create_resource()?;
        gpu.attach_backing()?;
        // SET_SCANOUT waits for the first flush

        Ok(gpu)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn framebuffer(&self) -> *mut u32 {
        map::FRAMEBUFFER as *mut u32
    }

    fn full_rect(&self) -> GpuRect {
        GpuRect {
            x: 0,
            y: 0,
            width: self.width,
            height: self.height,
        }
    }

    /// Submit one command + response chain and wait for completion
    fn send_command(&mut self, cmd_len: usize, resp_len: usize) -> Result<(), &'static str> {
        let d0 = self.queue.alloc_desc().ok_or("no free descriptors")?;
        let d1 = match self.queue.alloc_desc() {
            Some(d) => d,
            None => {
                self.queue.free_desc(d0);
                return Err("no free descriptors");
            }
        };

        unsafe {
            self.queue
                .set_desc(d0, self.cmd as u64, cmd_len as u32, VIRTQ_DESC_F_NEXT, d1);
            self.queue
                .set_desc(d1, self.resp as u64, resp_len as u32, VIRTQ_DESC_F_WRITE, 0);
        }

        self.queue.push_avail(d0);
        self.transport.notify(0);

        let mut timeout = CMD_TIMEOUT_SPINS;
        while !self.queue.has_used() {
            if timeout == 0 {
                self.transport.ack_interrupt();
                self.queue.free_chain(d0);
                return Err("gpu command timeout");
            }
            timeout -= 1;
            core::hint::spin_loop();
        }

        self.transport.ack_interrupt();
        self.queue.pop_used();
        self.queue.free_chain(d0);
        Ok(())
    }

    fn get_display_info(&mut self) {
        unsafe {
            core::ptr::write(
                self.cmd as *mut CtrlHeader,
                CtrlHeader::new(VIRTIO_GPU_CMD_GET_DISPLAY_INFO),
            );
        }

        if self
            .send_command(
                core::mem::size_of::<CtrlHeader>(),
                core::mem::size_of::<RespDisplayInfo>(),
            )
            .is_err()
        {
            return;
        }

        unsafe {
            let resp = &*(self.resp as *const RespDisplayInfo);
            if resp.hdr.cmd_type == VIRTIO_GPU_RESP_OK_DISPLAY_INFO && resp.pmodes[0].enabled != 0 {
                if resp.pmodes[0].r.width != 0 {
                    self.width = resp.pmodes[0].r.width;
                }
                if resp.pmodes[0].r.height != 0 {
                    self.height = resp.pmodes[0].r.height;
                }
            }
        }
    }

    fn create_resource(&mut self) -> Result<(), &'static str> {
        unsafe {
            core::ptr::write(
                self.cmd as *mut ResourceCreate2d,
                ResourceCreate2d {
                    hdr: CtrlHeader::new(VIRTIO_GPU_CMD_RESOURCE_CREATE_2D),
                    resource_id: RESOURCE_ID,
                    format: VIRTIO_GPU_FORMAT_B8G8R8X8_UNORM,
                    width: self.width,
                    height: self.height,
                },
            );
        }
        self.send_command(
            core::mem::size_of::<ResourceCreate2d>(),
            core::mem::size_of::<CtrlHeader>(),
        )
    }

    fn attach_backing(&mut self) -> Result<(), &'static str> {
        unsafe {
            core::ptr::write(
                self.cmd as *mut AttachBacking,
                AttachBacking {
                    hdr: CtrlHeader::new(VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING),
                    resource_id: RESOURCE_ID,
                    nr_entries: 1,
                    entry: MemEntry {
                        addr: map::FRAMEBUFFER as u64,
                        length: self.width * self.height * 4,
                        padding: 0,
                    },
                },
            );
        }
        self.send_command(
            core::mem::size_of::<AttachBacking>(),
            core::mem::size_of::<CtrlHeader>(),
        )
    }

    fn set_scanout(&mut self) -> Result<(), &'static str> {
        unsafe {
            core::ptr::write(
                self.cmd as *mut SetScanout,
                SetScanout {
                    hdr: CtrlHeader::new(VIRTIO_GPU_CMD_SET_SCANOUT),
                    r: self.full_rect(),
                    scanout_id: 0,
                    resource_id: RESOURCE_ID,
                },
            );
        }
        self.send_command(
            core::mem::size_of::<SetScanout>(),
            core::mem::size_of::<CtrlHeader>(),
        )
    }

    /// Push the full framebuffer to the host and flush the resource
    pub fn flush(&mut self) {
        if !self.scanout_set {
            if self.set_scanout().is_err() {
                return;
            }
            self.scanout_set = true;
        }

        unsafe {
            core::ptr::write(
                self.cmd as *mut TransferToHost2d,
                TransferToHost2d {
                    hdr: CtrlHeader::new(VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D),
                    r: self.full_rect(),
                    offset: 0,
                    resource_id: RESOURCE_ID,
                    padding: 0,
                },
            );
        }
        let _ = self.send_command(
            core::mem::size_of::<TransferToHost2d>(),
            core::mem::size_of::<CtrlHeader>(),
        );

        unsafe {
            core::ptr::write(
                self.cmd as *mut ResourceFlush,
                ResourceFlush {
                    hdr: CtrlHeader::new(VIRTIO_GPU_CMD_RESOURCE_FLUSH),
                    r: self.full_rect(),
                    resource_id: RESOURCE_ID,
                    padding: 0,
                },
            );
        }
        let _ = self.send_command(
            core::mem::size_of::<ResourceFlush>(),
            core::mem::size_of::<CtrlHeader>(),
        );
    }

    fn ack_interrupt(&self) {
        self.transport.ack_interrupt();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// GLOBAL INSTANCE
// ═══════════════════════════════════════════════════════════════════════════════

static DRIVER: SpinLock<Option<VirtioGpu>> = SpinLock::new(None);

/// Display dimensions, published once at init for lock-free readers
static DISPLAY_SIZE: spin::Once<(u32, u32)> = spin::Once::new();

pub fn init() {
    let transport = match unsafe { MmioTransport::scan(DEVICE_ID_GPU) } {
        Some(t) => t,
        None => {
            kprintln!("[GPU] No virtio-gpu device found");
            return;
        }
    };

    kprintln!("[GPU] Found display device at {:#x}", transport.base());
    let irq = transport.irq();

    match unsafe { VirtioGpu::init(transport, map::GPU_VIRTQUEUE, map::GPU_CMD_BUFFER) } {
        Ok(gpu) => {
            kprintln!("[GPU] Display: {}x{}", gpu.width(), gpu.height());
            DISPLAY_SIZE.call_once(|| (gpu.width(), gpu.height()));
            *DRIVER.lock() = Some(gpu);
            super::gic::register_handler(irq, &GPU_IRQ);
            super::gic::enable(irq);
        }
        Err(e) => kprintln!("[GPU] Init failed: {}", e),
    }
}

pub fn available() -> bool {
    DRIVER.lock().is_some()
}

pub fn width() -> u32 {
    DISPLAY_SIZE.get().map(|&(w, _)| w).unwrap_or(DEFAULT_WIDTH)
}

pub fn height() -> u32 {
    DISPLAY_SIZE.get().map(|&(_, h)| h).unwrap_or(DEFAULT_HEIGHT)
}

pub fn framebuffer() -> *mut u32 {
    map::FRAMEBUFFER as *mut u32
}

pub fn flush() {
    if let Some(gpu) = DRIVER.lock().as_mut() {
        gpu.flush();
    }
}

/// IRQ handler: acknowledge only
pub struct GpuIrq;

impl super::gic::DeviceHandler for GpuIrq {
    fn on_irq(&self, _irq: u32) {
        if let Some(gpu) = DRIVER.lock().as_ref() {
            gpu.ack_interrupt();
        }
    }
}

pub static GPU_IRQ: GpuIrq = GpuIrq;
