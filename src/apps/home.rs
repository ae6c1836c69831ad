//! Home screen
//!
//! Animated logo over a translucent panel, and a bottom dock with circular
//! Terminal and Files icons. Icon activation follows the touch rule
//! "DOWN inside, UP inside", canceled by moving off the icon; Enter or
//! Space on a hardware keyboard opens the terminal.

use crate::fs::BlockDevice;
use crate::kernel::event::{
    EventConsumer, EventKind, InputEvent, KEY_PRESS, TOUCH_DOWN, TOUCH_MOVE, TOUCH_UP,
};
use crate::net::NetDevice;
use crate::system::System;
use crate::visual::Surface;

use super::{scale_touch, Activity};

// Colors for the dark purple/cyan theme
const HOME_TEXT: u32 = 0x00FF_FFFF;
const HOME_TEXT_DIM: u32 = 0x00CC_CCDD;
const ICON_BORDER: u32 = 0x00A0_70B0;
const HOME_BG: u32 = 0x001A_1A2E;

const ICON_SIZE: i32 = 50;
const BAR_HEIGHT: i32 = 80;

/// Logo color phase advances every this many update ticks
const ANIM_PERIOD: u32 = 100;

pub struct Home {
    screen_w: usize,
    screen_h: usize,

    terminal_icon_x: i32,
    files_icon_x: i32,
    icon_y: i32,

    terminal_pressed: bool,
    files_pressed: bool,
    terminal_touch_active: bool,
    files_touch_active: bool,

    needs_redraw: bool,
    anim_frame: u32,
    anim_tick: u32,
    internet_connected: bool,
}

impl Home {
    pub fn new(screen_w: usize, screen_h: usize) -> Self {
        let bar_y = screen_h as i32 - BAR_HEIGHT;

        let icon_spacing = 30;
        let total_width = ICON_SIZE * 2 + icon_spacing;
        let start_x = (screen_w as i32 - total_width) / 2;

        Home {
            screen_w,
            screen_h,
            terminal_icon_x: start_x,
            files_icon_x: start_x + ICON_SIZE + icon_spacing,
            icon_y: bar_y + (BAR_HEIGHT - ICON_SIZE) / 2 - 8,
            terminal_pressed: false,
            files_pressed: false,
            terminal_touch_active: false,
            files_touch_active: false,
            needs_redraw: true,
            anim_frame: 0,
            anim_tick: 0,
            internet_connected: false,
        }
    }

    /// One-shot flags read by the main loop
    pub fn terminal_pressed(&self) -> bool {
        self.terminal_pressed
    }

    pub fn files_pressed(&self) -> bool {
        self.files_pressed
    }

    pub fn clear_pressed(&mut self) {
        self.terminal_pressed = false;
        self.files_pressed = false;
    }

    /// Flip the "Connected to Internet" line on (after the HTTP probe)
    pub fn set_connected(&mut self) {
        self.internet_connected = true;
        self.needs_redraw = true;
    }

    /// Circular hit test against an icon at `icon_x`
    fn point_in_icon(&self, x: i32, y: i32, icon_x: i32) -> bool {
        let sx = scale_touch(x, self.screen_w);
        let sy = scale_touch(y, self.screen_h);

        let cx = icon_x + ICON_SIZE / 2;
        let cy = self.icon_y + ICON_SIZE / 2;
        let dx = sx - cx;
        let dy = sy - cy;
        let r = ICON_SIZE / 2;

        dx * dx + dy * dy <= r * r
    }

    fn handle_event(&mut self, ev: InputEvent) {
        match ev.kind {
            EventKind::Touch => match ev.sub {
                TOUCH_DOWN => {
                    if self.point_in_icon(ev.x, ev.y, self.terminal_icon_x) {
                        self.terminal_touch_active = true;
                        self.needs_redraw = true;
                    } else if self.point_in_icon(ev.x, ev.y, self.files_icon_x) {
                        self.files_touch_active = true;
                        self.needs_redraw = true;
                    }
                }
                TOUCH_UP => {
                    if self.terminal_touch_active
                        && self.point_in_icon(ev.x, ev.y, self.terminal_icon_x)
                    {
                        self.terminal_pressed = true;
                    }
                    if self.files_touch_active && self.point_in_icon(ev.x, ev.y, self.files_icon_x)
                    {
                        self.files_pressed = true;
                    }
                    self.terminal_touch_active = false;
                    self.files_touch_active = false;
                    self.needs_redraw = true;
                }
                TOUCH_MOVE => {
                    if self.terminal_touch_active
                        && !self.point_in_icon(ev.x, ev.y, self.terminal_icon_x)
                    {
                        self.terminal_touch_active = false;
                        self.needs_redraw = true;
                    }
                    if self.files_touch_active
                        && !self.point_in_icon(ev.x, ev.y, self.files_icon_x)
                    {
                        self.files_touch_active = false;
                        self.needs_redraw = true;
                    }
                }
                _ => {}
            },
            EventKind::Key => {
                if ev.sub == KEY_PRESS && (ev.code == 28 || ev.code == 57) {
                    // Enter or Space opens the terminal
                    self.terminal_pressed = true;
                }
            }
        }
    }

    fn draw_terminal_icon(&self, surface: &mut Surface, x: i32, pressed: bool) {
        let cx = x + ICON_SIZE / 2;
        let cy = self.icon_y + ICON_SIZE / 2;
        let r = ICON_SIZE / 2;

        let alpha = if pressed { 200 } else { 160 };
        let bg = if pressed { 0x0040_2060 } else { 0x0020_1030 };
        surface.fill_circle_alpha(cx, cy, r, bg, alpha);
        surface.circle_ring(cx, cy, r, 2, ICON_BORDER);
        surface.circle_ring(cx, cy - 2, r - 4, 1, 0x0080_6090);

        surface.draw_string(x + ICON_SIZE / 2 - 12, self.icon_y + ICON_SIZE / 2 - 6, ">_", HOME_TEXT);
    }

    fn draw_files_icon(&self, surface: &mut Surface, x: i32, pressed: bool) {
        let cx = x + ICON_SIZE / 2;
        let cy = self.icon_y + ICON_SIZE / 2;
        let r = ICON_SIZE / 2;

        let alpha = if pressed { 200 } else { 160 };
        let bg = if pressed { 0x0020_3060 } else { 0x0010_2040 };
        surface.fill_circle_alpha(cx, cy, r, bg, alpha);
        surface.circle_ring(cx, cy, r, 2, 0x0060_A0E0);
        surface.circle_ring(cx, cy - 2, r - 4, 1, 0x0060_8090);

        // Folder glyph: tab plus body
        let fx = cx - 10;
        let fy = cy - 6;
        surface.fill_rect(fx, fy, 8, 4, 0x00FF_D700);
        surface.fill_rect(fx, fy + 3, 20, 11, 0x00FF_D700);
    }

    /// Sweep-gradient logo at 4x glyph scale with glow and shadow layers
    fn draw_logo(&self, surface: &mut Surface, x: i32, y: i32, text: &str) {
        let phase = self.anim_frame.wrapping_mul(3);

        for (i, c) in text.chars().enumerate() {
            let char_pos = (phase as i32 + i as i32 * 8) % 200;

            let (mut r, mut g, mut b);
            if char_pos < 40 {
                let t = char_pos;
                r = 200 + t;
                g = 220 + t / 2;
                b = 255;
            } else if char_pos < 80 {
                let t = char_pos - 40;
                r = 240 - t * 3;
                g = 240 - t;
                b = 255;
            } else if char_pos < 120 {
                let t = char_pos - 80;
                r = 120 + t * 2;
                g = 200 - t * 2;
                b = 255;
            } else {
                let t = char_pos - 120;
                r = 200 + (t * 40) / 80;
                g = 120 + (t * 100) / 80;
                b = 255;
            }
            r = r.clamp(0, 255);
            g = g.clamp(0, 255);
            b = b.clamp(0, 255);

            let color = ((r as u32) << 16) | ((g as u32) << 8) | b as u32;
            let cx = x + i as i32 * 8 * 4;

            surface.draw_char_scaled(cx + 3, y + 3, c, 0x0040_0060, 4);
            surface.draw_char_scaled(cx + 2, y + 2, c, 0x0000_0000, 4);
            surface.draw_char_scaled(cx, y, c, color, 4);
        }
    }
}

impl Activity for Home {
    fn update<D: BlockDevice, N: NetDevice>(
        &mut self,
        events: &mut EventConsumer,
        _sys: &mut System<D, N>,
    ) -> bool {
        while let Some(ev) = events.pop() {
            self.handle_event(ev);
        }

        self.anim_tick += 1;
        if self.anim_tick >= ANIM_PERIOD {
            self.anim_tick = 0;
            self.anim_frame = self.anim_frame.wrapping_add(1);
            return true;
        }

        self.needs_redraw
    }

    fn draw(&mut self, surface: &mut Surface) {
        surface.clear(HOME_BG);

        let logo = "TinyOS";
        let logo_w = logo.len() as i32 * 8 * 4;
        let logo_h = 12 * 4;
        let logo_x = (self.screen_w as i32 - logo_w) / 2;
        let logo_y = (self.screen_h as i32 - logo_h) / 2 - 80;

        // Translucent panel behind logo and tagline
        let pad = 20;
        surface.rounded_rect_alpha(
            logo_x - pad,
            logo_y - pad,
            logo_w + pad * 2,
            logo_h + 12 + 30 + pad * 2,
            15,
            0x0000_0000,
            140,
        );

        self.draw_logo(surface, logo_x, logo_y, logo);

        let tagline = "A Tiny Touch OS";
        let tag_x = (self.screen_w as i32 - Surface::text_width(tagline)) / 2;
        surface.draw_string(tag_x, logo_y + logo_h + 12, tagline, HOME_TEXT_DIM);

        if self.internet_connected {
            let msg = "Connected to Internet";
            let msg_x = (self.screen_w as i32 - Surface::text_width(msg)) / 2;
            surface.draw_string(msg_x, logo_y + logo_h + 32, msg, 0x0000_FF88);
        }

        // Bottom dock
        let bar_y = self.screen_h as i32 - BAR_HEIGHT;
        surface.fill_rect_alpha(0, bar_y, self.screen_w as i32, BAR_HEIGHT, 0x0000_0000, 140);
        surface.fill_rect_alpha(0, bar_y, self.screen_w as i32, 1, 0x0080_8080, 80);

        self.draw_terminal_icon(surface, self.terminal_icon_x, self.terminal_touch_active);
        let term_label_x = self.terminal_icon_x + (ICON_SIZE - Surface::text_width("Terminal")) / 2;
        surface.draw_string(term_label_x, self.icon_y + ICON_SIZE + 2, "Terminal", HOME_TEXT_DIM);

        self.draw_files_icon(surface, self.files_icon_x, self.files_touch_active);
        let files_label_x = self.files_icon_x + (ICON_SIZE - Surface::text_width("Files")) / 2;
        surface.draw_string(files_label_x, self.icon_y + ICON_SIZE + 2, "Files", HOME_TEXT_DIM);

        self.needs_redraw = false;
    }

    fn should_close(&self) -> bool {
        false
    }

    fn clear_close(&mut self) {}
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{MemDisk, TinyFs};
    use crate::kernel::event::EventRing;
    use crate::net::{NetStack, TestDevice};

    const W: usize = 720;
    const H: usize = 1280;

    fn test_system() -> System<MemDisk, TestDevice> {
        let mut fs = TinyFs::new(MemDisk::new(256));
        fs.format().unwrap();
        System::new(fs, NetStack::new(), TestDevice::new(), 256)
    }

    /// Raw coordinates for the center of an icon
    fn icon_center_raw(home: &Home, icon_x: i32) -> (i32, i32) {
        let cx = icon_x + ICON_SIZE / 2;
        let cy = home.icon_y + ICON_SIZE / 2;
        (cx * 32768 / W as i32 + 20, cy * 32768 / H as i32 + 10)
    }

    #[test]
    fn test_down_up_inside_activates() {
        let mut home = Home::new(W, H);
        let mut sys = test_system();
        let ring = EventRing::new();
        let (mut tx, mut rx) = ring.split();

        let (x, y) = icon_center_raw(&home, home.terminal_icon_x);
        tx.push_touch(0, TOUCH_DOWN, x, y);
        tx.push_touch(0, TOUCH_UP, x, y);
        assert!(home.update(&mut rx, &mut sys));

        assert!(home.terminal_pressed());
        assert!(!home.files_pressed());
        home.clear_pressed();
        assert!(!home.terminal_pressed());
    }

    #[test]
    fn test_move_outside_cancels() {
        let mut home = Home::new(W, H);
        let mut sys = test_system();
        let ring = EventRing::new();
        let (mut tx, mut rx) = ring.split();

        let (x, y) = icon_center_raw(&home, home.terminal_icon_x);
        tx.push_touch(0, TOUCH_DOWN, x, y);
        tx.push_touch(0, TOUCH_MOVE, 100, 100); // far away
        tx.push_touch(0, TOUCH_UP, x, y);
        home.update(&mut rx, &mut sys);

        assert!(!home.terminal_pressed());
    }

    #[test]
    fn test_up_elsewhere_does_not_activate() {
        let mut home = Home::new(W, H);
        let mut sys = test_system();
        let ring = EventRing::new();
        let (mut tx, mut rx) = ring.split();

        let (x, y) = icon_center_raw(&home, home.files_icon_x);
        tx.push_touch(0, TOUCH_DOWN, x, y);
        tx.push_touch(0, TOUCH_UP, 100, 100);
        home.update(&mut rx, &mut sys);

        assert!(!home.files_pressed());
    }

    #[test]
    fn test_enter_key_opens_terminal() {
        let mut home = Home::new(W, H);
        let mut sys = test_system();
        let ring = EventRing::new();
        let (mut tx, mut rx) = ring.split();

        tx.push_key(28, true); // Enter
        home.update(&mut rx, &mut sys);
        assert!(home.terminal_pressed());
    }

    #[test]
    fn test_animation_requests_redraw_periodically() {
        let mut home = Home::new(W, H);
        let mut sys = test_system();
        let ring = EventRing::new();
        let (_tx, mut rx) = ring.split();

        // Swallow the initial redraw
        let mut pixels = alloc::vec![0u32; W * H];
        let mut surface = Surface::new(&mut pixels, W, H);
        home.draw(&mut surface);

        let mut redraws = 0;
        for _ in 0..(ANIM_PERIOD * 3) {
            if home.update(&mut rx, &mut sys) {
                redraws += 1;
                home.draw(&mut surface);
            }
        }
        assert_eq!(redraws, 3);
    }

    #[test]
    fn test_draw_renders_dock_and_logo() {
        let mut home = Home::new(W, H);
        let mut pixels = alloc::vec![0u32; W * H];
        let mut surface = Surface::new(&mut pixels, W, H);
        home.draw(&mut surface);

        // Folder gold is somewhere in the dock area
        assert!(pixels.iter().any(|&p| p == 0x00FF_D700));
        // The background fill took
        assert_eq!(pixels[0], HOME_BG);
    }
}
