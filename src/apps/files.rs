//! File manager activity
//!
//! Lists the root directory with icon/name/size rows. Single tap selects,
//! a second tap opens the viewer, and the title bar carries create (+),
//! delete (X), edit and save buttons depending on the mode. Edit mode
//! takes soft- and hardware-keyboard input with a movable cursor; save
//! persists through `WRITE|CREATE|TRUNC`.

use core::fmt::Write;

use crate::fs::tinyfs::{self, DirEntry};
use crate::fs::BlockDevice;
use crate::kernel::event::{
    EventConsumer, EventKind, KEY_PRESS, TOUCH_DOWN, TOUCH_UP,
};
use crate::net::NetDevice;
use crate::system::System;
use crate::visual::Surface;

use super::{keycode_to_char, scale_touch, Activity, SoftKeyboard};

const TITLE_BAR_HEIGHT: i32 = 40;
const FILE_ROW_HEIGHT: i32 = 50;
const FILE_PADDING: i32 = 10;
const MAX_LISTED: usize = 32;
const MAX_CONTENT: usize = 512;

// Blue theme
const COLOR_BG: u32 = 0x001A_1A2E;
const COLOR_TITLE_BG: u32 = 0x0016_213E;
const COLOR_TITLE_TEXT: u32 = 0x0000_D4FF;
const COLOR_FILE_BG: u32 = 0x0020_2040;
const COLOR_FILE_BG_SEL: u32 = 0x0030_4060;
const COLOR_FILE_TEXT: u32 = 0x00FF_FFFF;
const COLOR_FILE_SIZE: u32 = 0x0088_8888;
const COLOR_FOLDER: u32 = 0x00FF_D700;
const COLOR_FILE: u32 = 0x0000_D4FF;
const COLOR_EMPTY: u32 = 0x0066_6666;
const COLOR_BTN: u32 = 0x0030_3050;
const COLOR_BTN_PRESS: u32 = 0x0050_5080;
const COLOR_ERROR: u32 = 0x00FF_4444;

/// What the manager is showing
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Mode {
    List,
    View,
    Edit,
}

pub struct FileManager {
    screen_w: usize,
    screen_h: usize,

    mode: Mode,
    want_close: bool,
    needs_redraw: bool,

    files: [DirEntry; MAX_LISTED],
    file_count: usize,
    scroll_offset: usize,
    /// Row highlighted for delete/open
    selected: Option<usize>,
    /// Row under the current touch
    touch_file_idx: Option<usize>,

    back_btn_pressed: bool,
    add_btn_pressed: bool,
    del_btn_pressed: bool,
    edit_btn_pressed: bool,
    save_btn_pressed: bool,

    view_filename: heapless::String<24>,
    content: heapless::Vec<u8, MAX_CONTENT>,
    edit_cursor: usize,

    status: heapless::String<64>,
    status_error: bool,

    new_file_counter: u32,
    shift_held: bool,

    pub(crate) keyboard: SoftKeyboard,
}

impl FileManager {
    pub fn new<D: BlockDevice, N: NetDevice>(
        screen_w: usize,
        screen_h: usize,
        sys: &mut System<D, N>,
    ) -> Self {
        let mut fm = FileManager {
            screen_w,
            screen_h,
            mode: Mode::List,
            want_close: false,
            needs_redraw: true,
            files: [DirEntry::EMPTY; MAX_LISTED],
            file_count: 0,
            scroll_offset: 0,
            selected: None,
            touch_file_idx: None,
            back_btn_pressed: false,
            add_btn_pressed: false,
            del_btn_pressed: false,
            edit_btn_pressed: false,
            save_btn_pressed: false,
            view_filename: heapless::String::new(),
            content: heapless::Vec::new(),
            edit_cursor: 0,
            status: heapless::String::new(),
            status_error: false,
            new_file_counter: 1,
            shift_held: false,
            keyboard: SoftKeyboard::new(screen_w, screen_h),
        };
        fm.refresh(sys);
        fm
    }

    fn set_status(&mut self, msg: &str, error: bool) {
        self.status.clear();
        let _ = self.status.push_str(msg);
        self.status_error = error;
    }

    fn refresh<D: BlockDevice, N: NetDevice>(&mut self, sys: &mut System<D, N>) {
        self.file_count = 0;
        if sys.fs.mounted() {
            if let Ok(count) = sys.fs.readdir(&mut self.files) {
                self.file_count = count;
            }
        }
        self.selected = None;
        self.scroll_offset = 0;
    }

    fn view_file<D: BlockDevice, N: NetDevice>(&mut self, sys: &mut System<D, N>, idx: usize) {
        if idx >= self.file_count {
            return;
        }
        let entry = self.files[idx];
        if entry.is_dir() {
            return;
        }

        let fd = match sys.fs.open(entry.name_str(), tinyfs::O_READ) {
            Ok(fd) => fd,
            Err(_) => {
                self.set_status("Error", true);
                return;
            }
        };

        let mut buf = [0u8; MAX_CONTENT];
        let len = sys.fs.read(fd, &mut buf).unwrap_or(0);
        let _ = sys.fs.close(fd);

        self.content.clear();
        let _ = self.content.extend_from_slice(&buf[..len]);

        self.view_filename.clear();
        let _ = self.view_filename.push_str(entry.name_str());

        self.mode = Mode::View;
        self.status.clear();
    }

    fn delete_file<D: BlockDevice, N: NetDevice>(&mut self, sys: &mut System<D, N>, idx: usize) {
        if idx >= self.file_count {
            return;
        }
        let name = self.files[idx];
        if sys.fs.remove(name.name_str()).is_ok() {
            self.set_status("Deleted", false);
            self.selected = None;
            self.refresh(sys);
        } else {
            self.set_status("Error", true);
        }
    }

    /// Create `newN.txt` with a line of placeholder content
    fn create_file<D: BlockDevice, N: NetDevice>(&mut self, sys: &mut System<D, N>) {
        if !sys.fs.mounted() {
            self.set_status("No FS", true);
            return;
        }

        let mut name: heapless::String<16> = heapless::String::new();
        let _ = write!(name, "new{}.txt", self.new_file_counter);
        self.new_file_counter += 1;

        match sys.fs.open(name.as_str(), tinyfs::O_WRITE | tinyfs::O_CREATE) {
            Ok(fd) => {
                let _ = sys.fs.write(fd, b"New file\n");
                let _ = sys.fs.close(fd);
                self.set_status("Created", false);
                self.refresh(sys);
            }
            Err(_) => self.set_status("Error", true),
        }
    }

    fn save_file<D: BlockDevice, N: NetDevice>(&mut self, sys: &mut System<D, N>) {
        if self.mode != Mode::Edit {
            return;
        }

        let name = self.view_filename.clone();
        match sys.fs.open(
            name.as_str(),
            tinyfs::O_WRITE | tinyfs::O_CREATE | tinyfs::O_TRUNC,
        ) {
            Ok(fd) => {
                let _ = sys.fs.write(fd, &self.content);
                let _ = sys.fs.close(fd);
                self.set_status("Saved", false);
                self.mode = Mode::View;
                self.keyboard.hide();
            }
            Err(_) => self.set_status("Error", true),
        }
    }

    // ── editing ──────────────────────────────────────────────────────────────

    fn insert_char(&mut self, c: char) {
        if !c.is_ascii() || self.content.len() >= MAX_CONTENT - 1 {
            return;
        }
        let _ = self.content.push(0);
        for i in (self.edit_cursor + 1..self.content.len()).rev() {
            self.content[i] = self.content[i - 1];
        }
        self.content[self.edit_cursor] = c as u8;
        self.edit_cursor += 1;
        self.needs_redraw = true;
    }

    fn backspace(&mut self) {
        if self.edit_cursor == 0 || self.content.is_empty() {
            return;
        }
        self.edit_cursor -= 1;
        for i in self.edit_cursor..self.content.len() - 1 {
            self.content[i] = self.content[i + 1];
        }
        self.content.pop();
        self.needs_redraw = true;
    }

    fn enter_edit_mode(&mut self) {
        self.mode = Mode::Edit;
        self.edit_cursor = self.content.len();
        self.keyboard.show();
        self.status.clear();
        self.needs_redraw = true;
    }

    fn cancel_edit(&mut self) {
        self.mode = Mode::View;
        self.keyboard.hide();
        self.status.clear();
        self.needs_redraw = true;
    }

    // ── input routing ────────────────────────────────────────────────────────

    fn handle_key<D: BlockDevice, N: NetDevice>(
        &mut self,
        sys: &mut System<D, N>,
        code: u16,
    ) {
        use crate::drivers::virtio_input as keys;

        if self.mode == Mode::Edit {
            match code {
                keys::KEY_ENTER => self.insert_char('\n'),
                keys::KEY_BACKSPACE => self.backspace(),
                keys::KEY_ESC => self.cancel_edit(),
                code => {
                    if let Some(c) = keycode_to_char(code, self.shift_held) {
                        self.insert_char(c);
                    }
                }
            }
            return;
        }

        if code == keys::KEY_ESC {
            match self.mode {
                Mode::View => {
                    self.mode = Mode::List;
                    self.status.clear();
                }
                _ => self.want_close = true,
            }
            self.needs_redraw = true;
        }
        let _ = sys;
    }

    fn handle_touch_down(&mut self, sx: i32, sy: i32) {
        let w = self.screen_w as i32;

        if sy < TITLE_BAR_HEIGHT {
            if sx < 50 {
                self.back_btn_pressed = true;
            } else if self.mode == Mode::List && sx >= w - 90 && sx < w - 58 {
                self.add_btn_pressed = true;
            } else if self.mode == Mode::List && self.selected.is_some() && sx >= w - 50 {
                self.del_btn_pressed = true;
            } else if self.mode == Mode::View && sx >= w - 50 {
                self.edit_btn_pressed = true;
            } else if self.mode == Mode::Edit && sx >= w - 50 {
                self.save_btn_pressed = true;
            }
        } else if self.mode == Mode::List && sy >= TITLE_BAR_HEIGHT + 5 && self.file_count > 0 {
            let row = ((sy - TITLE_BAR_HEIGHT - 5) / FILE_ROW_HEIGHT) as usize;
            let idx = row + self.scroll_offset;
            self.touch_file_idx = if idx < self.file_count { Some(idx) } else { None };
        }
        self.needs_redraw = true;
    }

    fn handle_touch_up<D: BlockDevice, N: NetDevice>(
        &mut self,
        sys: &mut System<D, N>,
        sx: i32,
        sy: i32,
    ) {
        let w = self.screen_w as i32;

        if self.back_btn_pressed && sy < TITLE_BAR_HEIGHT && sx < 50 {
            match self.mode {
                Mode::Edit => self.cancel_edit(),
                Mode::View => {
                    self.mode = Mode::List;
                    self.status.clear();
                }
                Mode::List => self.want_close = true,
            }
        } else if self.edit_btn_pressed && sy < TITLE_BAR_HEIGHT && sx >= w - 50 {
            self.enter_edit_mode();
        } else if self.save_btn_pressed && sy < TITLE_BAR_HEIGHT && sx >= w - 50 {
            self.save_file(sys);
        } else if self.add_btn_pressed && sy < TITLE_BAR_HEIGHT {
            self.create_file(sys);
        } else if self.del_btn_pressed && sy < TITLE_BAR_HEIGHT {
            if let Some(idx) = self.selected {
                self.delete_file(sys, idx);
            }
        } else if self.mode == Mode::List {
            if let Some(idx) = self.touch_file_idx {
                if self.selected == Some(idx) {
                    // Second tap on the selection opens the file
                    self.view_file(sys, idx);
                    self.selected = None;
                } else {
                    self.selected = Some(idx);
                }
            } else if sy > TITLE_BAR_HEIGHT {
                self.selected = None;
            }
        }

        self.back_btn_pressed = false;
        self.add_btn_pressed = false;
        self.del_btn_pressed = false;
        self.edit_btn_pressed = false;
        self.save_btn_pressed = false;
        self.touch_file_idx = None;
        self.needs_redraw = true;
    }

    // ── drawing ──────────────────────────────────────────────────────────────

    fn draw_circle_button(surface: &mut Surface, x: i32, color: u32) -> (i32, i32) {
        let cy = TITLE_BAR_HEIGHT / 2;
        let cx = x + 16;
        surface.fill_circle(cx, cy, 16, color);
        (cx, cy)
    }

    fn draw_title_bar(&self, surface: &mut Surface) {
        let w = self.screen_w as i32;
        surface.fill_rect(0, 0, w, TITLE_BAR_HEIGHT, COLOR_TITLE_BG);

        // Back button
        let btn = if self.back_btn_pressed { COLOR_BTN_PRESS } else { COLOR_BTN };
        let arrow = if self.back_btn_pressed { COLOR_TITLE_TEXT } else { 0x00FF_FFFF };
        let (bcx, bcy) = Self::draw_circle_button(surface, 10, btn);
        for i in 0..8 {
            surface.pixel(bcx - 3 + i, bcy - i, arrow);
            surface.pixel(bcx - 3 + i, bcy + i, arrow);
            surface.pixel(bcx - 2 + i, bcy - i, arrow);
            surface.pixel(bcx - 2 + i, bcy + i, arrow);
        }

        // Title
        let title = match self.mode {
            Mode::Edit => "Edit",
            Mode::View => self.view_filename.as_str(),
            Mode::List => "Files",
        };
        let tx = (w - Surface::text_width(title)) / 2;
        surface.draw_string(tx, (TITLE_BAR_HEIGHT - 12) / 2, title, COLOR_TITLE_TEXT);

        match self.mode {
            Mode::View => {
                // Edit (pencil) button
                let color = if self.edit_btn_pressed { COLOR_BTN_PRESS } else { COLOR_FILE };
                let (cx, cy) = Self::draw_circle_button(surface, w - 50, color);
                for i in -5..=5 {
                    surface.pixel(cx - i, cy + i, 0x00FF_FFFF);
                }
            }
            Mode::Edit => {
                // Save (checkmark) button
                let color = if self.save_btn_pressed { COLOR_BTN_PRESS } else { 0x0000_AA00 };
                let (cx, cy) = Self::draw_circle_button(surface, w - 50, color);
                for i in 0..4 {
                    surface.pixel(cx - 4 + i, cy + i, 0x00FF_FFFF);
                }
                for i in 0..6 {
                    surface.pixel(cx + i, cy + 3 - i, 0x00FF_FFFF);
                }
            }
            Mode::List => {
                // Add (+) button
                let color = if self.add_btn_pressed { COLOR_BTN_PRESS } else { COLOR_BTN };
                let (cx, cy) = Self::draw_circle_button(surface, w - 90, color);
                for i in -6..=6 {
                    surface.pixel(cx + i, cy, 0x00FF_FFFF);
                    surface.pixel(cx, cy + i, 0x00FF_FFFF);
                }

                // Delete (X), only with a selection
                if self.selected.is_some() {
                    let color = if self.del_btn_pressed { COLOR_BTN_PRESS } else { COLOR_ERROR };
                    let (cx, cy) = Self::draw_circle_button(surface, w - 50, color);
                    for i in -5..=5 {
                        surface.pixel(cx + i, cy + i, 0x00FF_FFFF);
                        surface.pixel(cx - i, cy + i, 0x00FF_FFFF);
                    }
                }
            }
        }

        surface.fill_rect(0, TITLE_BAR_HEIGHT - 1, w, 1, 0x0033_3344);
    }

    fn draw_file_icon(surface: &mut Surface, x: i32, y: i32, is_folder: bool, color: u32) {
        if is_folder {
            surface.fill_rect(x, y + 6, 24, 18, color);
            surface.fill_rect(x, y + 4, 10, 4, color);
        } else {
            surface.fill_rect(x + 2, y + 2, 18, 24, color);
            surface.fill_rect(x + 14, y + 2, 6, 6, COLOR_BG);
            for i in 0..6 {
                surface.pixel(x + 14 + i, y + 2 + i, color);
            }
        }
    }

    fn draw_file_list(&self, surface: &mut Surface) {
        let w = self.screen_w as i32;
        let visible = ((self.screen_h as i32 - TITLE_BAR_HEIGHT - 60) / FILE_ROW_HEIGHT) as usize;

        if self.file_count == 0 {
            let msg = "(no files)";
            let mx = (w - Surface::text_width(msg)) / 2;
            surface.draw_string(mx, self.screen_h as i32 / 2 - 12, msg, COLOR_FILE);
            return;
        }

        let mut y = TITLE_BAR_HEIGHT + 5;
        for i in 0..visible {
            let idx = i + self.scroll_offset;
            if idx >= self.file_count {
                break;
            }
            let f = &self.files[idx];

            let bg = if Some(idx) == self.selected || Some(idx) == self.touch_file_idx {
                COLOR_FILE_BG_SEL
            } else {
                COLOR_FILE_BG
            };
            surface.fill_rect(FILE_PADDING, y, w - FILE_PADDING * 2, FILE_ROW_HEIGHT - 4, bg);

            let icon_color = if f.is_dir() { COLOR_FOLDER } else { COLOR_FILE };
            Self::draw_file_icon(surface, FILE_PADDING + 8, y + 8, f.is_dir(), icon_color);

            surface.draw_string(FILE_PADDING + 45, y + 8, f.name_str(), COLOR_FILE_TEXT);

            let mut size: heapless::String<16> = heapless::String::new();
            if f.size < 1024 {
                let _ = write!(size, "{} B", f.size);
            } else {
                let _ = write!(size, "{} KB", f.size / 1024);
            }
            surface.draw_string(FILE_PADDING + 45, y + 28, size.as_str(), COLOR_FILE_SIZE);

            y += FILE_ROW_HEIGHT;
        }

        // Scrollbar thumb
        if self.file_count > visible {
            let total_h = self.screen_h as i32 - TITLE_BAR_HEIGHT - 60;
            let thumb_h = ((visible as i32) * total_h / self.file_count as i32).max(20);
            let thumb_y = TITLE_BAR_HEIGHT
                + 5
                + (self.scroll_offset as i32 * (total_h - thumb_h))
                    / (self.file_count - visible) as i32;
            surface.fill_rect(w - 6, thumb_y, 4, thumb_h, 0x0044_4466);
        }
    }

    fn draw_viewer(&self, surface: &mut Surface) {
        let x = FILE_PADDING;
        let mut y = TITLE_BAR_HEIGHT + 10;
        let max_chars = ((self.screen_w as i32 - FILE_PADDING * 2) / 8) as usize;
        let max_y = if self.mode == Mode::Edit && self.keyboard.is_visible() {
            self.screen_h as i32 - self.keyboard.height() - 40
        } else {
            self.screen_h as i32 - 40
        };

        if self.content.is_empty() && self.mode != Mode::Edit {
            surface.draw_string(x, y, "(empty file)", COLOR_EMPTY);
            return;
        }

        let mut line: heapless::String<80> = heapless::String::new();
        let mut line_start = 0usize;
        let mut cursor_pos: Option<(i32, i32)> = None;

        for i in 0..=self.content.len() {
            if self.mode == Mode::Edit && i == self.edit_cursor {
                cursor_pos = Some((x + ((i - line_start) as i32) * 8, y));
            }

            let at_end = i == self.content.len();
            let c = if at_end { b'\n' } else { self.content[i] };

            if c == b'\n' || i - line_start >= max_chars {
                surface.draw_string(x, y, line.as_str(), COLOR_FILE_TEXT);
                line.clear();
                y += 14;
                if y >= max_y {
                    break;
                }
                if c == b'\n' {
                    line_start = i + 1;
                } else {
                    // Wrapped mid-line; this character opens the next row
                    line_start = i;
                    if !at_end {
                        let printable = if (32..127).contains(&c) { c as char } else { '.' };
                        let _ = line.push(printable);
                    }
                }
            } else {
                let printable = if (32..127).contains(&c) { c as char } else { '.' };
                let _ = line.push(printable);
            }
        }

        if let Some((cx, cy)) = cursor_pos {
            surface.fill_rect(cx, cy, 2, 12, COLOR_TITLE_TEXT);
        }
    }

    fn draw_status_bar(&self, surface: &mut Surface) {
        let y = self.screen_h as i32 - 30;
        surface.fill_rect(0, y, self.screen_w as i32, 30, COLOR_TITLE_BG);

        if !self.status.is_empty() {
            let color = if self.status_error { COLOR_ERROR } else { COLOR_FILE_SIZE };
            surface.draw_string(FILE_PADDING, y + 8, self.status.as_str(), color);
        } else if self.mode == Mode::List && self.file_count > 0 {
            surface.draw_string(FILE_PADDING, y + 8, "Tap file to view", COLOR_FILE_SIZE);
        }
    }
}

impl Activity for FileManager {
    fn update<D: BlockDevice, N: NetDevice>(
        &mut self,
        events: &mut EventConsumer,
        sys: &mut System<D, N>,
    ) -> bool {
        // Soft keyboard characters while editing
        if self.mode == Mode::Edit {
            if let Some(c) = self.keyboard.take_char() {
                match c {
                    '\x08' => self.backspace(),
                    c => self.insert_char(c),
                }
            }
        }

        while let Some(ev) = events.pop() {
            match ev.kind {
                EventKind::Key => {
                    use crate::drivers::virtio_input as keys;
                    if ev.code == keys::KEY_LEFTSHIFT || ev.code == keys::KEY_RIGHTSHIFT {
                        self.shift_held = ev.sub == KEY_PRESS;
                        continue;
                    }
                    if ev.sub == KEY_PRESS {
                        self.handle_key(sys, ev.code);
                    }
                }
                EventKind::Touch => {
                    if self.mode == Mode::Edit
                        && self.keyboard.is_visible()
                        && self.keyboard.handle_touch(ev.sub, ev.x, ev.y)
                    {
                        self.needs_redraw = true;
                        continue;
                    }

                    let sx = scale_touch(ev.x, self.screen_w);
                    let sy = scale_touch(ev.y, self.screen_h);
                    match ev.sub {
                        TOUCH_DOWN => self.handle_touch_down(sx, sy),
                        TOUCH_UP => self.handle_touch_up(sys, sx, sy),
                        _ => {}
                    }
                }
            }
        }

        self.needs_redraw
    }

    fn draw(&mut self, surface: &mut Surface) {
        surface.clear(COLOR_BG);
        self.draw_title_bar(surface);

        match self.mode {
            Mode::List => self.draw_file_list(surface),
            Mode::View | Mode::Edit => self.draw_viewer(surface),
        }

        if self.mode == Mode::Edit && self.keyboard.is_visible() {
            self.keyboard.draw(surface);
        }

        self.draw_status_bar(surface);
        self.needs_redraw = false;
    }

    fn should_close(&self) -> bool {
        self.want_close
    }

    fn clear_close(&mut self) {
        self.want_close = false;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{MemDisk, TinyFs};
    use crate::net::{NetStack, TestDevice};

    fn sys_with_files(names: &[(&str, &[u8])]) -> System<MemDisk, TestDevice> {
        let mut fs = TinyFs::new(MemDisk::new(256));
        fs.format().unwrap();
        for (name, content) in names {
            let fd = fs.open(name, tinyfs::O_WRITE | tinyfs::O_CREATE).unwrap();
            fs.write(fd, content).unwrap();
            fs.close(fd).unwrap();
        }
        System::new(fs, NetStack::new(), TestDevice::new(), 256)
    }

    #[test]
    fn test_loads_file_list_on_init() {
        let mut sys = sys_with_files(&[("a.txt", b"aa"), ("b.txt", b"bb")]);
        let fm = FileManager::new(720, 1280, &mut sys);
        assert_eq!(fm.file_count, 2);
        assert_eq!(fm.mode, Mode::List);
    }

    #[test]
    fn test_view_loads_content() {
        let mut sys = sys_with_files(&[("doc.txt", b"file body")]);
        let mut fm = FileManager::new(720, 1280, &mut sys);

        fm.view_file(&mut sys, 0);
        assert_eq!(fm.mode, Mode::View);
        assert_eq!(fm.view_filename.as_str(), "doc.txt");
        assert_eq!(&fm.content[..], b"file body");
    }

    #[test]
    fn test_delete_updates_list_and_status() {
        let mut sys = sys_with_files(&[("x", b"1"), ("y", b"2")]);
        let mut fm = FileManager::new(720, 1280, &mut sys);

        fm.delete_file(&mut sys, 0);
        assert_eq!(fm.file_count, 1);
        assert_eq!(fm.status.as_str(), "Deleted");
        assert!(!fm.status_error);
    }

    #[test]
    fn test_create_names_sequentially() {
        let mut sys = sys_with_files(&[]);
        let mut fm = FileManager::new(720, 1280, &mut sys);

        fm.create_file(&mut sys);
        fm.create_file(&mut sys);
        assert_eq!(fm.file_count, 2);
        let names: alloc::vec::Vec<&str> =
            fm.files[..2].iter().map(|f| f.name_str()).collect();
        assert!(names.contains(&"new1.txt"));
        assert!(names.contains(&"new2.txt"));
        assert_eq!(fm.status.as_str(), "Created");
    }

    #[test]
    fn test_edit_insert_and_backspace() {
        let mut sys = sys_with_files(&[("e.txt", b"ab")]);
        let mut fm = FileManager::new(720, 1280, &mut sys);

        fm.view_file(&mut sys, 0);
        fm.enter_edit_mode();
        assert_eq!(fm.edit_cursor, 2);
        assert!(fm.keyboard.is_visible());

        fm.insert_char('c');
        fm.insert_char('\n');
        assert_eq!(&fm.content[..], b"abc\n");

        fm.backspace();
        assert_eq!(&fm.content[..], b"abc");

        // Cursor in the middle inserts there
        fm.edit_cursor = 1;
        fm.insert_char('X');
        assert_eq!(&fm.content[..], b"aXbc");
    }

    #[test]
    fn test_save_persists_and_leaves_edit() {
        let mut sys = sys_with_files(&[("s.txt", b"old")]);
        let mut fm = FileManager::new(720, 1280, &mut sys);

        fm.view_file(&mut sys, 0);
        fm.enter_edit_mode();
        fm.content.clear();
        let _ = fm.content.extend_from_slice(b"new contents");
        fm.save_file(&mut sys);

        assert_eq!(fm.mode, Mode::View);
        assert_eq!(fm.status.as_str(), "Saved");
        assert!(!fm.keyboard.is_visible());

        // Persisted through the filesystem
        let fd = sys.fs.open("s.txt", tinyfs::O_READ).unwrap();
        let mut buf = [0u8; 32];
        let n = sys.fs.read(fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"new contents");
    }

    #[test]
    fn test_escape_cancels_edit_without_saving() {
        let mut sys = sys_with_files(&[("c.txt", b"keep")]);
        let mut fm = FileManager::new(720, 1280, &mut sys);

        fm.view_file(&mut sys, 0);
        fm.enter_edit_mode();
        fm.insert_char('!');
        fm.handle_key(&mut sys, crate::drivers::virtio_input::KEY_ESC);
        assert_eq!(fm.mode, Mode::View);

        let fd = sys.fs.open("c.txt", tinyfs::O_READ).unwrap();
        let mut buf = [0u8; 32];
        let n = sys.fs.read(fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"keep");
    }

    #[test]
    fn test_second_tap_opens_selection() {
        let mut sys = sys_with_files(&[("t.txt", b"tap")]);
        let mut fm = FileManager::new(720, 1280, &mut sys);

        // First tap on row 0 selects
        fm.touch_file_idx = Some(0);
        fm.handle_touch_up(&mut sys, 100, TITLE_BAR_HEIGHT + 20);
        assert_eq!(fm.selected, Some(0));
        assert_eq!(fm.mode, Mode::List);

        // Second tap opens
        fm.touch_file_idx = Some(0);
        fm.handle_touch_up(&mut sys, 100, TITLE_BAR_HEIGHT + 20);
        assert_eq!(fm.mode, Mode::View);
        assert_eq!(fm.selected, None);
    }
}
