//! Hardware drivers for the QEMU `virt` machine

pub mod uart;
pub mod gic;
pub mod virtio;
pub mod virtio_blk;
pub mod virtio_net;
pub mod virtio_input;
pub mod virtio_gpu;

// Re-export commonly used items
pub use gic::{DeviceHandler, Gic};
pub use virtio::{MmioTransport, VirtQueue};

// ═══════════════════════════════════════════════════════════════════════════════
// QEMU VIRT MEMORY MAP
// ═══════════════════════════════════════════════════════════════════════════════

/// Fixed physical addresses for the `virt` machine and the DMA regions the
/// drivers park their rings and bounce buffers in. RAM starts at
/// 0x4000_0000; everything below 0x4800_0000 is ours.
pub mod map {
    /// PL011 debug UART data register
    pub const UART0_BASE: usize = 0x0900_0000;

    /// GIC distributor
    pub const GICD_BASE: usize = 0x0800_0000;
    /// GIC CPU interface
    pub const GICC_BASE: usize = 0x0801_0000;

    /// First virtio-mmio transport slot
    pub const VIRTIO_MMIO_BASE: usize = 0x0a00_0000;
    /// Size of one transport slot
    pub const VIRTIO_MMIO_STRIDE: usize = 0x200;
    /// Number of transport slots to scan
    pub const VIRTIO_MMIO_SLOTS: usize = 32;

    /// Linear framebuffer backing the GPU scanout resource
    pub const FRAMEBUFFER: usize = 0x4200_0000;

    /// GPU control virtqueue
    pub const GPU_VIRTQUEUE: usize = 0x4600_0000;
    /// GPU command/response buffers
    pub const GPU_CMD_BUFFER: usize = 0x4610_0000;

    /// Input device virtqueues (one 64 KiB stripe per device)
    pub const INPUT_VIRTQUEUE: usize = 0x4620_0000;
    /// Input event buffers (one stripe per device)
    pub const INPUT_BUFFERS: usize = 0x4630_0000;

    /// Network queues and packet buffers
    pub const NET_REGION: usize = 0x4700_0000;

    /// Block device virtqueue
    pub const BLK_VIRTQUEUE: usize = 0x4710_0000;
    /// Block request header + status byte
    pub const BLK_REQUEST: usize = 0x4711_0000;
    /// Block data bounce buffer (64 KiB = 128 sectors)
    pub const BLK_DATA: usize = 0x4712_0000;
}
