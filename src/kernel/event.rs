//! Input Event Queue
//!
//! Lock-free single-producer single-consumer ring buffer. The virtio-input
//! driver pushes key and touch events (potentially from IRQ context); the
//! main loop pops them and feeds the active UI activity. The producer
//! publishes the element before the head index and the consumer reads the
//! element before advancing the tail, so the two sides never need a lock.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Queue size (must be a power of 2). One slot is sacrificed to tell
/// "full" from "empty", so 255 events are usable.
pub const EVENT_QUEUE_SIZE: usize = 256;
const EVENT_QUEUE_MASK: usize = EVENT_QUEUE_SIZE - 1;

// ═══════════════════════════════════════════════════════════════════════════════
// EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Key,
    Touch,
}

pub const KEY_RELEASE: u8 = 0;
pub const KEY_PRESS: u8 = 1;

pub const TOUCH_UP: u8 = 0;
pub const TOUCH_DOWN: u8 = 1;
pub const TOUCH_MOVE: u8 = 2;
pub const TOUCH_SCROLL_UP: u8 = 3;
pub const TOUCH_SCROLL_DOWN: u8 = 4;

/// One input event. Touch coordinates are in the device-reported space
/// (roughly 0..32767) and are scaled to screen pixels at consumption.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputEvent {
    pub kind: EventKind,
    pub sub: u8,
    /// Key code or touch slot id
    pub code: u16,
    pub x: i32,
    pub y: i32,
}

impl InputEvent {
    const EMPTY: InputEvent = InputEvent {
        kind: EventKind::Key,
        sub: 0,
        code: 0,
        x: 0,
        y: 0,
    };
}

// ═══════════════════════════════════════════════════════════════════════════════
// RING
// ═══════════════════════════════════════════════════════════════════════════════

/// SPSC event ring. Obtain the two endpoints with [`EventRing::split`]; only
/// one producer and one consumer may be live at a time.
pub struct EventRing {
    slots: [UnsafeCell<InputEvent>; EVENT_QUEUE_SIZE],
    /// Write index, owned by the producer
    head: AtomicUsize,
    /// Read index, owned by the consumer
    tail: AtomicUsize,
}

// SAFETY: head/tail are atomics; each slot is written only by the producer
// before the head publish and read only by the consumer after observing it.
unsafe impl Sync for EventRing {}

impl EventRing {
    pub const fn new() -> Self {
        const SLOT: UnsafeCell<InputEvent> = UnsafeCell::new(InputEvent::EMPTY);
        EventRing {
            slots: [SLOT; EVENT_QUEUE_SIZE],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// The two endpoints of the ring.
    pub fn split(&self) -> (EventProducer<'_>, EventConsumer<'_>) {
        (EventProducer { ring: self }, EventConsumer { ring: self })
    }

    pub fn producer(&self) -> EventProducer<'_> {
        EventProducer { ring: self }
    }

    pub fn consumer(&self) -> EventConsumer<'_> {
        EventConsumer { ring: self }
    }

    fn push(&self, event: InputEvent) -> Result<(), ()> {
        let head = self.head.load(Ordering::Relaxed);
        let next_head = (head + 1) & EVENT_QUEUE_MASK;

        if next_head == self.tail.load(Ordering::Acquire) {
            return Err(()); // Queue full, drop event
        }

        unsafe { *self.slots[head].get() = event };

        // Publish the element before the index
        self.head.store(next_head, Ordering::Release);
        Ok(())
    }

    fn pop(&self) -> Option<InputEvent> {
        let tail = self.tail.load(Ordering::Relaxed);

        if tail == self.head.load(Ordering::Acquire) {
            return None; // Queue empty
        }

        let event = unsafe { *self.slots[tail].get() };

        // Release the slot before advancing the index
        self.tail.store((tail + 1) & EVENT_QUEUE_MASK, Ordering::Release);
        Some(event)
    }

    fn count(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) & EVENT_QUEUE_MASK
    }
}

/// Producer endpoint, held by the input driver.
pub struct EventProducer<'a> {
    ring: &'a EventRing,
}

impl<'a> EventProducer<'a> {
    pub fn push(&mut self, event: InputEvent) -> Result<(), ()> {
        self.ring.push(event)
    }

    pub fn push_key(&mut self, keycode: u16, pressed: bool) {
        let _ = self.ring.push(InputEvent {
            kind: EventKind::Key,
            sub: if pressed { KEY_PRESS } else { KEY_RELEASE },
            code: keycode,
            x: 0,
            y: 0,
        });
    }

    pub fn push_touch(&mut self, slot: u16, sub: u8, x: i32, y: i32) {
        let _ = self.ring.push(InputEvent {
            kind: EventKind::Touch,
            sub,
            code: slot,
            x,
            y,
        });
    }
}

/// Consumer endpoint, held by the main loop.
pub struct EventConsumer<'a> {
    ring: &'a EventRing,
}

impl<'a> EventConsumer<'a> {
    pub fn pop(&mut self) -> Option<InputEvent> {
        self.ring.pop()
    }

    pub fn pending(&self) -> bool {
        self.ring.count() != 0
    }

    pub fn count(&self) -> usize {
        self.ring.count()
    }
}

/// The system-wide event queue shared between the virtio-input driver and
/// the main loop.
pub static EVENTS: EventRing = EventRing::new();

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_roundtrip() {
        let ring = EventRing::new();
        let (mut tx, mut rx) = ring.split();

        let ev = InputEvent {
            kind: EventKind::Touch,
            sub: TOUCH_DOWN,
            code: 3,
            x: 123,
            y: -456,
        };
        tx.push(ev).unwrap();
        assert_eq!(rx.pop(), Some(ev));
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn test_capacity_is_255() {
        let ring = EventRing::new();
        let (mut tx, rx) = ring.split();

        for i in 0..(EVENT_QUEUE_SIZE - 1) {
            tx.push(InputEvent {
                kind: EventKind::Key,
                sub: KEY_PRESS,
                code: i as u16,
                x: 0,
                y: 0,
            })
            .unwrap();
        }
        assert_eq!(rx.count(), EVENT_QUEUE_SIZE - 1);
    }

    #[test]
    fn test_push_on_full_drops_and_leaves_indices() {
        let ring = EventRing::new();
        let (mut tx, mut rx) = ring.split();

        for _ in 0..(EVENT_QUEUE_SIZE - 1) {
            tx.push(InputEvent::EMPTY).unwrap();
        }
        let count = rx.count();
        assert!(tx.push(InputEvent::EMPTY).is_err());
        assert_eq!(rx.count(), count);

        // Draining still yields exactly the accepted events
        let mut drained = 0;
        while rx.pop().is_some() {
            drained += 1;
        }
        assert_eq!(drained, EVENT_QUEUE_SIZE - 1);
    }

    #[test]
    fn test_wraparound() {
        let ring = EventRing::new();
        let (mut tx, mut rx) = ring.split();

        for round in 0..1000u32 {
            tx.push_key(round as u16, true);
            let ev = rx.pop().unwrap();
            assert_eq!(ev.code, round as u16);
            assert_eq!(ev.sub, KEY_PRESS);
        }
        assert!(!rx.pending());
    }

    #[test]
    fn test_helpers_fill_fields() {
        let ring = EventRing::new();
        let (mut tx, mut rx) = ring.split();

        tx.push_key(28, false);
        tx.push_touch(1, TOUCH_MOVE, 100, 200);

        let key = rx.pop().unwrap();
        assert_eq!(key.kind, EventKind::Key);
        assert_eq!(key.sub, KEY_RELEASE);
        assert_eq!(key.code, 28);

        let touch = rx.pop().unwrap();
        assert_eq!(touch.kind, EventKind::Touch);
        assert_eq!(touch.sub, TOUCH_MOVE);
        assert_eq!(touch.code, 1);
        assert_eq!(touch.x, 100);
        assert_eq!(touch.y, 200);
    }
}
