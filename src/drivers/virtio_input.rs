//! Virtio Input Driver
//!
//! Keyboard, mouse and multi-touch devices. Each device gets a 64-slot
//! event queue of 8-byte device-writable buffers, all pre-published at
//! init. The poll path drains the used ring, translates raw Linux-style
//! events through a [`TouchTracker`], and pushes typed events into the
//! system event ring. Interrupts only get acknowledged here.

use crate::arch::{self, SpinLock};
use crate::kernel::event::{
    EventProducer, EVENTS, TOUCH_DOWN, TOUCH_MOVE, TOUCH_SCROLL_DOWN, TOUCH_SCROLL_UP, TOUCH_UP,
};
use crate::kprintln;

use super::map;
use super::virtio::{MmioTransport, VirtQueue, DEVICE_ID_INPUT, VIRTQ_DESC_F_WRITE};

const MAX_INPUT_DEVICES: usize = 4;
const QUEUE_SIZE: u16 = 64;

/// Per-device stripe inside the fixed queue/buffer regions
const DEVICE_STRIDE: usize = 0x10000;

// ═══════════════════════════════════════════════════════════════════════════════
// LINUX INPUT EVENT CODES
// ═══════════════════════════════════════════════════════════════════════════════

pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;
pub const EV_REL: u16 = 0x02;
pub const EV_ABS: u16 = 0x03;

// Key codes (subset used by the UI)
pub const KEY_ESC: u16 = 1;
pub const KEY_BACKSPACE: u16 = 14;
pub const KEY_ENTER: u16 = 28;
pub const KEY_LEFTSHIFT: u16 = 42;
pub const KEY_RIGHTSHIFT: u16 = 54;
pub const KEY_SPACE: u16 = 57;
pub const KEY_UP: u16 = 103;
pub const KEY_DOWN: u16 = 108;

// Button codes
const BTN_TOOL_PEN: u16 = 0x140;
const BTN_TOOL_FINGER: u16 = 0x145;
const BTN_TOUCH: u16 = 0x14a;
const BTN_LEFT: u16 = 0x110;

// Relative axes
const REL_X: u16 = 0x00;
const REL_Y: u16 = 0x01;
const REL_WHEEL: u16 = 0x08;

// Absolute axes
const ABS_X: u16 = 0x00;
const ABS_Y: u16 = 0x01;
const ABS_MT_SLOT: u16 = 0x2f;
const ABS_MT_POSITION_X: u16 = 0x35;
const ABS_MT_POSITION_Y: u16 = 0x36;
const ABS_MT_TRACKING_ID: u16 = 0x39;

/// Nominal bounds for relative (mouse) motion
const REL_BOUND_X: i32 = 1080;
const REL_BOUND_Y: i32 = 2400;

/// Raw 8-byte virtio-input event, written by the device
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct RawInputEvent {
    pub ev_type: u16,
    pub code: u16,
    pub value: u32,
}

// ═══════════════════════════════════════════════════════════════════════════════
// TOUCH TRANSLATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Translates raw key/rel/abs/syn events into the typed event stream.
/// Position updates accumulate until the sync report; button and
/// tracking-id transitions fire immediately.
pub struct TouchTracker {
    x: i32,
    y: i32,
    slot: u16,
    tracking_id: i32,
    is_down: bool,
    /// Position data seen since the last sync report
    moved: bool,
}

impl TouchTracker {
    pub const fn new() -> Self {
        TouchTracker {
            x: 540,
            y: 1200,
            slot: 0,
            tracking_id: -1,
            is_down: false,
            moved: false,
        }
    }

    pub fn position(&self) -> (i32, i32) {
        (self.x, self.y)
    }

    pub fn is_down(&self) -> bool {
        self.is_down
    }

    pub fn process(&mut self, ev: RawInputEvent, events: &mut EventProducer) {
        match ev.ev_type {
            EV_KEY if ev.code < 0x100 => {
                events.push_key(ev.code, ev.value != 0);
            }
            EV_KEY => {
                if ev.code == BTN_LEFT
                    || ev.code == BTN_TOUCH
                    || ev.code == BTN_TOOL_FINGER
                    || ev.code == BTN_TOOL_PEN
                {
                    if ev.value != 0 {
                        self.is_down = true;
                        self.tracking_id = 0;
                        events.push_touch(self.slot, TOUCH_DOWN, self.x, self.y);
                    } else {
                        events.push_touch(self.slot, TOUCH_UP, self.x, self.y);
                        self.is_down = false;
                        self.tracking_id = -1;
                    }
                }
            }
            EV_REL => match ev.code {
                REL_X => {
                    self.x = (self.x + ev.value as i32).clamp(0, REL_BOUND_X);
                    self.moved = true;
                }
                REL_Y => {
                    self.y = (self.y + ev.value as i32).clamp(0, REL_BOUND_Y);
                    self.moved = true;
                }
                REL_WHEEL => {
                    let scroll = ev.value as i32;
                    if scroll > 0 {
                        events.push_touch(0, TOUCH_SCROLL_UP, 0, scroll);
                    } else if scroll < 0 {
                        events.push_touch(0, TOUCH_SCROLL_DOWN, 0, -scroll);
                    }
                }
                _ => {}
            },
            EV_ABS => match ev.code {
                ABS_X | ABS_MT_POSITION_X => {
                    self.x = ev.value as i32;
                    self.moved = true;
                }
                ABS_Y | ABS_MT_POSITION_Y => {
                    self.y = ev.value as i32;
                    self.moved = true;
                }
                ABS_MT_SLOT => {
                    self.slot = ev.value as u16;
                }
                ABS_MT_TRACKING_ID => {
                    if ev.value as i32 == -1 {
                        events.push_touch(self.slot, TOUCH_UP, self.x, self.y);
                        self.tracking_id = -1;
                        self.is_down = false;
                    } else {
                        self.tracking_id = ev.value as i32;
                        self.is_down = true;
                        events.push_touch(self.slot, TOUCH_DOWN, self.x, self.y);
                    }
                }
                _ => {}
            },
            EV_SYN if ev.code == 0 => {
                if self.moved && self.is_down {
                    events.push_touch(self.slot, TOUCH_MOVE, self.x, self.y);
                }
                self.moved = false;
            }
            _ => {}
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DEVICES
// ═══════════════════════════════════════════════════════════════════════════════

struct InputDevice {
    transport: MmioTransport,
    queue: VirtQueue,
    /// Base of this device's event buffer stripe
    events_mem: usize,
    queue_size: u16,
    is_keyboard: bool,
}

/// Query the EV_BITS bitmap size for an event type via config space:
/// one 32-bit write of `select | (subsel << 8)`, size comes back in byte 2.
fn query_ev_bits(transport: &MmioTransport, ev_type: u16) -> usize {
    const VIRTIO_INPUT_CFG_EV_BITS: u32 = 0x11;

    transport.config_write32(0, VIRTIO_INPUT_CFG_EV_BITS | ((ev_type as u32) << 8));
    arch::delay_cycles(1000);
    ((transport.config_read32(0) >> 16) & 0xFF) as usize
}

impl InputDevice {
    /// # Safety
    /// `queue_mem`/`events_mem` must be device-reachable stripes owned by
    /// this device.
    unsafe fn init(
        transport: MmioTransport,
        queue_mem: usize,
        events_mem: usize,
    ) -> Result<Self, &'static str> {
        transport.begin_init();

        let mut queue = transport.setup_queue(0, queue_mem, QUEUE_SIZE)?;
        let queue_size = queue.size();
        transport.negotiate_features(0);

        // Pre-publish every slot as an 8-byte device-writable event buffer
        for i in 0..queue_size {
            let addr = (events_mem + i as usize * core::mem::size_of::<RawInputEvent>()) as u64;
            queue.set_desc(
                i,
                addr,
                core::mem::size_of::<RawInputEvent>() as u32,
                VIRTQ_DESC_F_WRITE,
                0,
            );
            queue.push_avail(i);
        }
        transport.notify(0);

        transport.finish_init()?;
        transport.notify(0);

        // Classify by capability: absolute axes -> touch, relative -> mouse,
        // otherwise keyboard.
        let has_key = query_ev_bits(&transport, EV_KEY);
        let has_rel = query_ev_bits(&transport, EV_REL);
        let has_abs = query_ev_bits(&transport, EV_ABS);
        let is_keyboard = has_abs == 0 && has_rel == 0;

        kprintln!(
            "[INPUT] device at {:#x}: key={} rel={} abs={} -> {}",
            transport.base(),
            has_key,
            has_rel,
            has_abs,
            if is_keyboard {
                "keyboard"
            } else if has_abs > 0 {
                "touch"
            } else {
                "mouse"
            }
        );

        Ok(InputDevice {
            transport,
            queue,
            events_mem,
            queue_size,
            is_keyboard,
        })
    }

    fn read_event(&self, desc_idx: u16) -> RawInputEvent {
        unsafe {
            core::ptr::read_volatile(
                (self.events_mem + desc_idx as usize * core::mem::size_of::<RawInputEvent>())
                    as *const RawInputEvent,
            )
        }
    }

    fn poll(&mut self, tracker: &mut TouchTracker, events: &mut EventProducer) {
        while let Some((desc_idx, _len)) = self.queue.pop_used() {
            if desc_idx < self.queue_size {
                let ev = self.read_event(desc_idx);
                tracker.process(ev, events);
                // Recycle the slot
                self.queue.push_avail(desc_idx);
            }
        }
        self.transport.notify(0);
        self.transport.ack_interrupt();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MANAGER
// ═══════════════════════════════════════════════════════════════════════════════

pub struct InputManager {
    devices: [Option<InputDevice>; MAX_INPUT_DEVICES],
    tracker: TouchTracker,
    keyboard_available: bool,
    touch_available: bool,
}

impl InputManager {
    const fn new() -> Self {
        const NONE: Option<InputDevice> = None;
        InputManager {
            devices: [NONE; MAX_INPUT_DEVICES],
            tracker: TouchTracker::new(),
            keyboard_available: false,
            touch_available: false,
        }
    }
}

static MANAGER: SpinLock<InputManager> = SpinLock::new(InputManager::new());

/// Scan for virtio-input devices and bring each one up
pub fn init() {
    let mut mgr = MANAGER.lock();
    let mut count = 0;

    for slot in 0..map::VIRTIO_MMIO_SLOTS {
        if count >= MAX_INPUT_DEVICES {
            break;
        }
        let base = map::VIRTIO_MMIO_BASE + slot * map::VIRTIO_MMIO_STRIDE;
        let (id, transport) = match unsafe { MmioTransport::probe(base) } {
            Some(found) => found,
            None => continue,
        };
        if id != DEVICE_ID_INPUT {
            continue;
        }

        let queue_mem = map::INPUT_VIRTQUEUE + count * DEVICE_STRIDE;
        let events_mem = map::INPUT_BUFFERS + count * DEVICE_STRIDE;
        let irq = transport.irq();
        match unsafe { InputDevice::init(transport, queue_mem, events_mem) } {
            Ok(dev) => {
                if dev.is_keyboard {
                    mgr.keyboard_available = true;
                } else {
                    mgr.touch_available = true;
                }
                mgr.devices[count] = Some(dev);
                count += 1;
                super::gic::register_handler(irq, &INPUT_IRQ);
                super::gic::enable(irq);
            }
            Err(e) => kprintln!("[INPUT] Init failed: {}", e),
        }
    }

    kprintln!("[INPUT] {} input device(s)", count);
}

/// Drain all device queues into the event ring (called from the main loop)
pub fn poll() {
    let mut mgr = MANAGER.lock();
    let mut events = EVENTS.producer();

    let mgr = &mut *mgr;
    for dev in mgr.devices.iter_mut().flatten() {
        dev.poll(&mut mgr.tracker, &mut events);
    }
}

/// Current cursor position and contact state
pub fn touch_position() -> (i32, i32, bool) {
    let mgr = MANAGER.lock();
    let (x, y) = mgr.tracker.position();
    (x, y, mgr.tracker.is_down())
}

pub fn keyboard_available() -> bool {
    MANAGER.lock().keyboard_available
}

pub fn touch_available() -> bool {
    MANAGER.lock().touch_available
}

/// IRQ handler: acknowledge only; the poll path consumes the queues
pub struct InputIrq;

impl super::gic::DeviceHandler for InputIrq {
    fn on_irq(&self, _irq: u32) {
        let mgr = MANAGER.lock();
        for dev in mgr.devices.iter().flatten() {
            dev.transport.ack_interrupt();
        }
    }
}

pub static INPUT_IRQ: InputIrq = InputIrq;

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::event::{EventKind, EventRing};

    fn raw(ev_type: u16, code: u16, value: u32) -> RawInputEvent {
        RawInputEvent { ev_type, code, value }
    }

    #[test]
    fn test_key_events_pass_through() {
        let ring = EventRing::new();
        let (mut tx, mut rx) = ring.split();
        let mut tracker = TouchTracker::new();

        tracker.process(raw(EV_KEY, KEY_ENTER, 1), &mut tx);
        tracker.process(raw(EV_KEY, KEY_ENTER, 0), &mut tx);

        let press = rx.pop().unwrap();
        assert_eq!(press.kind, EventKind::Key);
        assert_eq!(press.code, KEY_ENTER);
        assert_eq!(press.sub, crate::kernel::event::KEY_PRESS);

        let release = rx.pop().unwrap();
        assert_eq!(release.sub, crate::kernel::event::KEY_RELEASE);
    }

    #[test]
    fn test_button_down_up_at_cached_position() {
        let ring = EventRing::new();
        let (mut tx, mut rx) = ring.split();
        let mut tracker = TouchTracker::new();

        tracker.process(raw(EV_ABS, ABS_X, 1000), &mut tx);
        tracker.process(raw(EV_ABS, ABS_Y, 2000), &mut tx);
        tracker.process(raw(EV_KEY, BTN_TOUCH, 1), &mut tx);

        let down = rx.pop().unwrap();
        assert_eq!(down.sub, TOUCH_DOWN);
        assert_eq!((down.x, down.y), (1000, 2000));
        assert!(tracker.is_down());

        tracker.process(raw(EV_KEY, BTN_TOUCH, 0), &mut tx);
        let up = rx.pop().unwrap();
        assert_eq!(up.sub, TOUCH_UP);
        assert!(!tracker.is_down());
    }

    #[test]
    fn test_motion_reported_on_sync_while_down() {
        let ring = EventRing::new();
        let (mut tx, mut rx) = ring.split();
        let mut tracker = TouchTracker::new();

        tracker.process(raw(EV_KEY, BTN_TOUCH, 1), &mut tx);
        let _ = rx.pop();

        // Absolute motion is deferred until the sync report
        tracker.process(raw(EV_ABS, ABS_MT_POSITION_X, 500), &mut tx);
        tracker.process(raw(EV_ABS, ABS_MT_POSITION_Y, 600), &mut tx);
        assert_eq!(rx.pop(), None);

        tracker.process(raw(EV_SYN, 0, 0), &mut tx);
        let mv = rx.pop().unwrap();
        assert_eq!(mv.sub, TOUCH_MOVE);
        assert_eq!((mv.x, mv.y), (500, 600));

        // Sync with no new motion stays quiet
        tracker.process(raw(EV_SYN, 0, 0), &mut tx);
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn test_relative_motion_clamps() {
        let ring = EventRing::new();
        let (mut tx, mut rx) = ring.split();
        let mut tracker = TouchTracker::new();

        tracker.process(raw(EV_KEY, BTN_LEFT, 1), &mut tx);
        let _ = rx.pop();

        tracker.process(raw(EV_REL, REL_X, (-10_000i32) as u32), &mut tx);
        tracker.process(raw(EV_REL, REL_Y, 100_000), &mut tx);
        tracker.process(raw(EV_SYN, 0, 0), &mut tx);

        let mv = rx.pop().unwrap();
        assert_eq!((mv.x, mv.y), (0, REL_BOUND_Y));
    }

    #[test]
    fn test_wheel_synthesizes_scroll() {
        let ring = EventRing::new();
        let (mut tx, mut rx) = ring.split();
        let mut tracker = TouchTracker::new();

        tracker.process(raw(EV_REL, REL_WHEEL, 2), &mut tx);
        tracker.process(raw(EV_REL, REL_WHEEL, (-3i32) as u32), &mut tx);

        let up = rx.pop().unwrap();
        assert_eq!(up.sub, TOUCH_SCROLL_UP);
        assert_eq!(up.y, 2);

        let down = rx.pop().unwrap();
        assert_eq!(down.sub, TOUCH_SCROLL_DOWN);
        assert_eq!(down.y, 3);
    }

    #[test]
    fn test_tracking_id_lift() {
        let ring = EventRing::new();
        let (mut tx, mut rx) = ring.split();
        let mut tracker = TouchTracker::new();

        tracker.process(raw(EV_ABS, ABS_MT_SLOT, 1), &mut tx);
        tracker.process(raw(EV_ABS, ABS_MT_TRACKING_ID, 42), &mut tx);
        let down = rx.pop().unwrap();
        assert_eq!(down.sub, TOUCH_DOWN);
        assert_eq!(down.code, 1);

        tracker.process(raw(EV_ABS, ABS_MT_TRACKING_ID, (-1i32) as u32), &mut tx);
        let up = rx.pop().unwrap();
        assert_eq!(up.sub, TOUCH_UP);
        assert!(!tracker.is_down());
    }
}
