//! Soft keyboard overlay
//!
//! Four rows of ten keys plus a special row (shift, space, backspace,
//! enter), reserving the bottom of the screen while visible. Touches that
//! land on the keyboard are consumed so the underlying activity can skip
//! its own handling; the produced character is parked for pickup.

use crate::kernel::event::{TOUCH_DOWN, TOUCH_MOVE, TOUCH_UP};
use crate::visual::{Surface, blend};

use super::scale_touch;

const KEY_ROWS: usize = 4;
const KEY_COLS: usize = 10;
const KEY_HEIGHT: i32 = 45;
const KEY_SPACING: i32 = 4;
const KB_PADDING: i32 = 8;

// Colors
const KB_BG: u32 = 0x0020_2030;
const KEY_BG: u32 = 0x0040_4050;
const KEY_BG_PRESS: u32 = 0x0060_6080;
const KEY_TEXT: u32 = 0x00FF_FFFF;
const KEY_SPECIAL_BG: u32 = 0x0035_3545;

const KEYS_LOWER: [&str; KEY_ROWS] = ["1234567890", "qwertyuiop", "asdfghjkl;", "zxcvbnm,./"];
const KEYS_UPPER: [&str; KEY_ROWS] = ["!@#$%^&*()", "QWERTYUIOP", "ASDFGHJKL:", "ZXCVBNM<>?"];

/// Hit-test result for one touch position
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Key {
    Char { row: usize, col: usize },
    Shift,
    Space,
    Backspace,
    Enter,
}

pub struct SoftKeyboard {
    visible: bool,
    shift: bool,
    last_char: Option<char>,
    pressed: Option<Key>,
    touch_active: bool,

    scr_w: usize,
    scr_h: usize,
    kb_y: i32,
    kb_height: i32,
    key_width: i32,
}

impl SoftKeyboard {
    pub fn new(screen_w: usize, screen_h: usize) -> Self {
        // Four character rows plus the special row
        let kb_height = KEY_ROWS as i32 * KEY_HEIGHT
            + (KEY_ROWS as i32 + 1) * KEY_SPACING
            + KB_PADDING * 2
            + KEY_HEIGHT
            + KEY_SPACING;
        let key_width =
            (screen_w as i32 - KB_PADDING * 2 - (KEY_COLS as i32 + 1) * KEY_SPACING) / KEY_COLS as i32;

        SoftKeyboard {
            visible: false,
            shift: false,
            last_char: None,
            pressed: None,
            touch_active: false,
            scr_w: screen_w,
            scr_h: screen_h,
            kb_y: screen_h as i32 - kb_height,
            kb_height,
            key_width,
        }
    }

    pub fn show(&mut self) {
        self.visible = true;
    }

    pub fn hide(&mut self) {
        self.visible = false;
    }

    pub fn toggle(&mut self) {
        self.visible = !self.visible;
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Screen height the keyboard reserves when visible
    pub fn height(&self) -> i32 {
        if self.visible {
            self.kb_height
        } else {
            0
        }
    }

    /// The character produced by the last key release, if any
    pub fn take_char(&mut self) -> Option<char> {
        self.last_char.take()
    }

    /// Special-row geometry: (shift, space, backspace, enter) as (x, width)
    fn special_row(&self) -> [(i32, i32); 4] {
        let total_w = self.scr_w as i32 - KB_PADDING * 2;
        let shift_w = self.key_width + self.key_width / 2;
        let back_w = self.key_width + 10;
        let enter_w = self.key_width + self.key_width / 2;
        let space_w = total_w - shift_w - back_w - enter_w - 3 * KEY_SPACING;

        let shift_x = KB_PADDING;
        let space_x = shift_x + shift_w + KEY_SPACING;
        let back_x = space_x + space_w + KEY_SPACING;
        let enter_x = back_x + back_w + KEY_SPACING;

        [
            (shift_x, shift_w),
            (space_x, space_w),
            (back_x, back_w),
            (enter_x, enter_w),
        ]
    }

    fn key_at(&self, sx: i32, sy: i32) -> Option<Key> {
        if !self.visible || sy < self.kb_y || sy >= self.scr_h as i32 {
            return None;
        }

        let rel_y = sy - self.kb_y - KB_PADDING;
        let rel_x = sx - KB_PADDING;

        for row in 0..KEY_ROWS {
            let row_y = row as i32 * (KEY_HEIGHT + KEY_SPACING);
            if rel_y >= row_y && rel_y < row_y + KEY_HEIGHT {
                for col in 0..KEY_COLS {
                    let key_x = col as i32 * (self.key_width + KEY_SPACING);
                    if rel_x >= key_x && rel_x < key_x + self.key_width {
                        return Some(Key::Char { row, col });
                    }
                }
                return None;
            }
        }

        let special_y = KEY_ROWS as i32 * (KEY_HEIGHT + KEY_SPACING);
        if rel_y >= special_y && rel_y < special_y + KEY_HEIGHT {
            let keys = [Key::Shift, Key::Space, Key::Backspace, Key::Enter];
            for ((x, w), key) in self.special_row().iter().zip(keys) {
                if sx >= *x && sx < *x + *w {
                    return Some(key);
                }
            }
        }

        None
    }

    /// Route a touch event (raw device coordinates). Returns true when the
    /// keyboard consumed it.
    pub fn handle_touch(&mut self, sub: u8, x: i32, y: i32) -> bool {
        if !self.visible {
            return false;
        }

        let sx = scale_touch(x, self.scr_w);
        let sy = scale_touch(y, self.scr_h);

        if sy < self.kb_y {
            return false;
        }

        match sub {
            TOUCH_DOWN => {
                if let Some(key) = self.key_at(sx, sy) {
                    self.pressed = Some(key);
                    self.touch_active = true;
                }
                true
            }
            TOUCH_UP => {
                if self.touch_active {
                    match self.key_at(sx, sy) {
                        Some(Key::Shift) => self.shift = !self.shift,
                        Some(Key::Space) => self.last_char = Some(' '),
                        Some(Key::Backspace) => self.last_char = Some('\x08'),
                        Some(Key::Enter) => self.last_char = Some('\n'),
                        Some(Key::Char { row, col }) => {
                            let layout = if self.shift { &KEYS_UPPER } else { &KEYS_LOWER };
                            let c = layout[row].as_bytes()[col] as char;
                            self.last_char = Some(c);
                            // Shift auto-clears after one uppercase letter
                            if self.shift && c.is_ascii_uppercase() {
                                self.shift = false;
                            }
                        }
                        None => {}
                    }
                    self.pressed = None;
                    self.touch_active = false;
                }
                true
            }
            TOUCH_MOVE => self.touch_active || sy >= self.kb_y,
            _ => true,
        }
    }

    fn draw_key(&self, surface: &mut Surface, x: i32, y: i32, w: i32, bg: u32, pressed: bool, label: &str) {
        let color = if pressed { KEY_BG_PRESS } else { bg };
        let r = 6;

        surface.fill_rect_alpha(x + r, y, w - 2 * r, KEY_HEIGHT, color, 220);
        surface.fill_rect_alpha(x, y + r, w, KEY_HEIGHT - 2 * r, color, 220);
        // Corners: blend only the pixels the two body rectangles left bare
        for (cx, cy) in [
            (x + r, y + r),
            (x + w - r - 1, y + r),
            (x + r, y + KEY_HEIGHT - r - 1),
            (x + w - r - 1, y + KEY_HEIGHT - r - 1),
        ] {
            for py in cy - r..=cy + r {
                for px in cx - r..=cx + r {
                    let dx = px - cx;
                    let dy = py - cy;
                    let in_corner = (px < x + r || px >= x + w - r) && (py < y + r || py >= y + KEY_HEIGHT - r);
                    if in_corner && dx * dx + dy * dy <= r * r {
                        let bgpx = surface.get_pixel(px, py);
                        surface.pixel(px, py, blend(bgpx, color, 220));
                    }
                }
            }
        }

        let tx = x + (w - Surface::text_width(label)) / 2;
        let ty = y + (KEY_HEIGHT - Surface::line_height()) / 2;
        surface.draw_string(tx, ty, label, KEY_TEXT);
    }

    pub fn draw(&self, surface: &mut Surface) {
        if !self.visible {
            return;
        }

        surface.fill_rect_alpha(0, self.kb_y, self.scr_w as i32, self.kb_height, KB_BG, 230);
        surface.fill_rect(0, self.kb_y, self.scr_w as i32, 1, 0x0060_6070);

        let layout = if self.shift { &KEYS_UPPER } else { &KEYS_LOWER };
        let mut label = [0u8; 4];

        for (row, keys) in layout.iter().enumerate() {
            for (col, c) in keys.bytes().enumerate() {
                let kx = KB_PADDING + col as i32 * (self.key_width + KEY_SPACING);
                let ky = self.kb_y + KB_PADDING + row as i32 * (KEY_HEIGHT + KEY_SPACING);
                let pressed = self.pressed == Some(Key::Char { row, col });
                let label = {
                    label[0] = c;
                    core::str::from_utf8(&label[..1]).unwrap_or("?")
                };
                self.draw_key(surface, kx, ky, self.key_width, KEY_BG, pressed, label);
            }
        }

        let special_y = self.kb_y + KB_PADDING + KEY_ROWS as i32 * (KEY_HEIGHT + KEY_SPACING);
        let [(shift_x, shift_w), (space_x, space_w), (back_x, back_w), (enter_x, enter_w)] =
            self.special_row();

        self.draw_key(
            surface,
            shift_x,
            special_y,
            shift_w,
            if self.shift { KEY_BG_PRESS } else { KEY_SPECIAL_BG },
            self.pressed == Some(Key::Shift),
            if self.shift { "SHIFT" } else { "Shift" },
        );
        self.draw_key(
            surface,
            space_x,
            special_y,
            space_w,
            KEY_BG,
            self.pressed == Some(Key::Space),
            "Space",
        );
        self.draw_key(
            surface,
            back_x,
            special_y,
            back_w,
            KEY_SPECIAL_BG,
            self.pressed == Some(Key::Backspace),
            "Del",
        );
        self.draw_key(
            surface,
            enter_x,
            special_y,
            enter_w,
            KEY_SPECIAL_BG,
            self.pressed == Some(Key::Enter),
            "Go",
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    const W: usize = 720;
    const H: usize = 1280;

    /// Raw device coordinates landing on the center of a main-row key
    fn raw_for_key(kb: &SoftKeyboard, row: usize, col: usize) -> (i32, i32) {
        let sx = KB_PADDING + col as i32 * (kb.key_width + KEY_SPACING) + kb.key_width / 2;
        let sy = kb.kb_y + KB_PADDING + row as i32 * (KEY_HEIGHT + KEY_SPACING) + KEY_HEIGHT / 2;
        (sx * 32768 / W as i32 + 30, sy * 32768 / H as i32 + 12)
    }

    #[test]
    fn test_hidden_keyboard_consumes_nothing() {
        let mut kb = SoftKeyboard::new(W, H);
        assert!(!kb.handle_touch(TOUCH_DOWN, 1000, 30000));
        assert_eq!(kb.take_char(), None);
    }

    #[test]
    fn test_tap_produces_character() {
        let mut kb = SoftKeyboard::new(W, H);
        kb.show();

        let (x, y) = raw_for_key(&kb, 1, 0); // 'q'
        assert!(kb.handle_touch(TOUCH_DOWN, x, y));
        assert!(kb.handle_touch(TOUCH_UP, x, y));
        assert_eq!(kb.take_char(), Some('q'));
        // Char is one-shot
        assert_eq!(kb.take_char(), None);
    }

    #[test]
    fn test_shift_gives_one_uppercase() {
        let mut kb = SoftKeyboard::new(W, H);
        kb.show();

        let [(shift_x, shift_w), ..] = kb.special_row();
        let special_y = kb.kb_y + KB_PADDING + KEY_ROWS as i32 * (KEY_HEIGHT + KEY_SPACING);
        let sx = (shift_x + shift_w / 2) * 32768 / W as i32;
        let sy = (special_y + KEY_HEIGHT / 2) * 32768 / H as i32 + 12;

        kb.handle_touch(TOUCH_DOWN, sx, sy);
        kb.handle_touch(TOUCH_UP, sx, sy);
        assert!(kb.shift);

        let (x, y) = raw_for_key(&kb, 1, 0);
        kb.handle_touch(TOUCH_DOWN, x, y);
        kb.handle_touch(TOUCH_UP, x, y);
        assert_eq!(kb.take_char(), Some('Q'));
        // Auto-unshift after the uppercase letter
        assert!(!kb.shift);
    }

    #[test]
    fn test_touch_above_keyboard_not_consumed() {
        let mut kb = SoftKeyboard::new(W, H);
        kb.show();
        // Top of the screen
        assert!(!kb.handle_touch(TOUCH_DOWN, 16000, 100));
    }

    #[test]
    fn test_height_reserved_only_when_visible() {
        let mut kb = SoftKeyboard::new(W, H);
        assert_eq!(kb.height(), 0);
        kb.show();
        assert!(kb.height() > 0);
        kb.toggle();
        assert_eq!(kb.height(), 0);
    }
}
