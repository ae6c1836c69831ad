//! Terminal activity
//!
//! A scrollable line-ring console with a built-in command set covering the
//! heap, CPU, filesystem and network client features. Input comes from the
//! hardware keyboard and the soft keyboard; output accumulates in a fixed
//! ring of history lines.

use core::fmt::Write;

use crate::fs::tinyfs::{self, DirEntry};
use crate::fs::BlockDevice;
use crate::kernel::event::{
    EventConsumer, EventKind, KEY_PRESS, TOUCH_DOWN, TOUCH_MOVE, TOUCH_SCROLL_DOWN,
    TOUCH_SCROLL_UP, TOUCH_UP,
};
use crate::kernel::memory;
use crate::net::http::{HttpRequest, HttpState, Method};
use crate::net::websocket::{WebSocket, WsState};
use crate::net::NetDevice;
use crate::system::System;
use crate::visual::Surface;
use crate::{arch, drivers};

use super::{keycode_to_char, scale_touch, Activity, SoftKeyboard};

const MAX_CMD_LEN: usize = 80;
const MAX_HISTORY: usize = 128;
const CHARS_PER_LINE: usize = 64;

const TITLE_BAR_HEIGHT: i32 = 40;

// Matrix theme defaults
const DEFAULT_BG: u32 = 0x0000_0000;
const DEFAULT_TEXT: u32 = 0x0000_FF00;
const DEFAULT_PROMPT: u32 = 0x0000_CC00;

const TITLE_BAR_BG: u32 = 0x001A_1A1A;
const TITLE_BAR_TEXT: u32 = 0x0000_FF00;
const BACK_BTN_COLOR: u32 = 0x0030_3030;

/// Vertical raw-coordinate travel that counts as one scroll step
const SCROLL_THRESHOLD: i32 = 1000;

type Line = heapless::String<CHARS_PER_LINE>;

pub struct Terminal {
    screen_w: usize,
    screen_h: usize,

    cmd_buffer: heapless::String<MAX_CMD_LEN>,

    history: [Line; MAX_HISTORY],
    history_head: usize,
    history_count: usize,

    /// Line under construction
    line: Line,

    scroll_offset: i32,
    max_visible_lines: i32,

    shift_held: bool,
    touch_start_y: i32,
    touch_scrolling: bool,
    back_btn_pressed: bool,

    needs_redraw: bool,
    want_close: bool,

    color_bg: u32,
    color_text: u32,
    color_prompt: u32,

    pub(crate) keyboard: SoftKeyboard,

    boot_counter: u64,

    http: Option<HttpRequest>,
    ws: Option<WebSocket>,
}

impl Terminal {
    pub fn new(screen_w: usize, screen_h: usize) -> Self {
        const EMPTY: Line = heapless::String::new();

        let mut term = Terminal {
            screen_w,
            screen_h,
            cmd_buffer: heapless::String::new(),
            history: [EMPTY; MAX_HISTORY],
            history_head: 0,
            history_count: 0,
            line: heapless::String::new(),
            scroll_offset: 0,
            max_visible_lines: 0,
            shift_held: false,
            touch_start_y: 0,
            touch_scrolling: false,
            back_btn_pressed: false,
            needs_redraw: true,
            want_close: false,
            color_bg: DEFAULT_BG,
            color_text: DEFAULT_TEXT,
            color_prompt: DEFAULT_PROMPT,
            keyboard: SoftKeyboard::new(screen_w, screen_h),
            boot_counter: arch::read_counter(),
            http: None,
            ws: None,
        };

        term.println("TinyOS Terminal v1.0");
        term.println("Tap screen to show keyboard");
        term.println("Type 'help' for commands");
        term.println("");
        term
    }

    // ── output ───────────────────────────────────────────────────────────────

    fn history_add(&mut self, text: &str) {
        let mut line = Line::new();
        for c in text.chars().take(CHARS_PER_LINE) {
            let _ = line.push(c);
        }
        self.history[self.history_head] = line;
        self.history_head = (self.history_head + 1) % MAX_HISTORY;
        if self.history_count < MAX_HISTORY {
            self.history_count += 1;
        }
    }

    fn print(&mut self, s: &str) {
        for c in s.chars() {
            if self.line.len() >= CHARS_PER_LINE {
                break;
            }
            let _ = self.line.push(c);
        }
    }

    fn flush_line(&mut self) {
        let mut line = Line::new();
        core::mem::swap(&mut line, &mut self.line);
        self.history_add(line.as_str());
        // New output snaps the view back to the bottom
        self.scroll_offset = 0;
        self.needs_redraw = true;
    }

    fn println(&mut self, s: &str) {
        self.print(s);
        self.flush_line();
    }

    /// Print multi-line text, capping total output
    fn print_text(&mut self, text: &str, cap: usize) {
        let mut written = 0;
        for c in text.chars() {
            if written >= cap {
                if !self.line.is_empty() {
                    self.flush_line();
                }
                self.println("...(truncated)");
                return;
            }
            match c {
                '\n' => self.flush_line(),
                '\r' => {}
                c if (c as u32) >= 32 => {
                    if self.line.len() >= CHARS_PER_LINE - 1 {
                        self.flush_line();
                    }
                    let _ = self.line.push(c);
                }
                _ => {}
            }
            written += 1;
        }
        if !self.line.is_empty() {
            self.flush_line();
        }
    }

    // ── scrolling ────────────────────────────────────────────────────────────

    fn scroll_up(&mut self, lines: i32) {
        let max_scroll = (self.history_count as i32 - self.max_visible_lines).max(0);
        self.scroll_offset = (self.scroll_offset + lines).min(max_scroll);
        self.needs_redraw = true;
    }

    fn scroll_down(&mut self, lines: i32) {
        self.scroll_offset = (self.scroll_offset - lines).max(0);
        self.needs_redraw = true;
    }

    // ── command dispatch ─────────────────────────────────────────────────────

    /// Echo the prompt line, tokenize and run. The public entry used by
    /// both the input path and tests.
    pub fn run_command<D: BlockDevice, N: NetDevice>(
        &mut self,
        line: &str,
        sys: &mut System<D, N>,
    ) {
        if line.is_empty() {
            return;
        }

        let mut prompt = Line::new();
        let _ = prompt.push_str("> ");
        for c in line.chars().take(CHARS_PER_LINE - 2) {
            let _ = prompt.push(c);
        }
        self.history_add(prompt.as_str());

        let mut owned: heapless::String<MAX_CMD_LEN> = heapless::String::new();
        if owned.push_str(line).is_err() {
            return;
        }
        let mut args: heapless::Vec<&str, 8> = heapless::Vec::new();
        for token in owned.split_whitespace() {
            if args.push(token).is_err() {
                break;
            }
        }
        if args.is_empty() {
            return;
        }

        match args[0] {
            "help" => self.cmd_help(),
            "close" | "exit" => {
                self.println("Returning to home...");
                self.want_close = true;
            }
            "clear" => {
                self.history_count = 0;
                self.history_head = 0;
                self.needs_redraw = true;
            }
            "echo" => self.cmd_echo(&args),
            "heap" => self.cmd_heap(),
            "mem" => self.cmd_mem(),
            "cpu" => self.cmd_cpu(),
            "uptime" => self.cmd_uptime(),
            "color" => self.cmd_color(&args),
            "calc" => self.cmd_calc(&args),
            "curl" => self.cmd_curl(&args, sys),
            "ws" => self.cmd_ws(&args, sys),
            "disk" => self.cmd_disk(sys),
            "ls" => self.cmd_ls(sys),
            "cat" => self.cmd_cat(&args, sys),
            "write" => self.cmd_write(&args, sys),
            "rm" => self.cmd_rm(&args, sys),
            "format" => self.cmd_format(sys),
            other => {
                let mut msg = Line::new();
                let _ = write!(msg, "Unknown command: {}", other);
                self.println(msg.as_str());
            }
        }
    }

    fn cmd_help(&mut self) {
        self.println("TinyOS Terminal Commands:");
        self.println(" help    - This help");
        self.println(" close   - Return to home");
        self.println(" clear   - Clear screen");
        self.println(" echo    - Echo text");
        self.println(" cpu     - CPU info");
        self.println(" mem     - Memory map");
        self.println(" heap    - Heap stats");
        self.println(" uptime  - Time since boot");
        self.println(" curl    - HTTP request");
        self.println(" ws      - WebSocket client");
        self.println(" color   - Change colors");
        self.println(" calc    - Calculator");
        self.println("Filesystem:");
        self.println(" disk    - Disk info");
        self.println(" ls      - List files");
        self.println(" cat     - Read file");
        self.println(" write   - Write file");
        self.println(" rm      - Delete file");
        self.println(" format  - Format disk");
    }

    fn cmd_echo(&mut self, args: &[&str]) {
        let mut out = Line::new();
        for (i, arg) in args.iter().skip(1).enumerate() {
            if i > 0 {
                let _ = out.push(' ');
            }
            let _ = out.push_str(arg);
        }
        self.println(out.as_str());
    }

    fn cmd_heap(&mut self) {
        self.println("Heap Statistics:");
        let mut l = Line::new();
        let _ = write!(l, "  Free: {} bytes", memory::free_bytes());
        self.println(l.as_str());
        l = Line::new();
        let _ = write!(l, "  Used: {} bytes", memory::used_bytes());
        self.println(l.as_str());
    }

    fn cmd_mem(&mut self) {
        self.println("Memory Map:");
        self.println("  Kernel:  0x40200000");
        let mut l = Line::new();
        let _ = write!(l, "  FB:      {:#x}", drivers::map::FRAMEBUFFER);
        self.println(l.as_str());
        l = Line::new();
        let _ = write!(l, "  VirtIO:  {:#x}", drivers::map::GPU_VIRTQUEUE);
        self.println(l.as_str());
        l = Line::new();
        let _ = write!(l, "  Free:    {} bytes", memory::free_bytes());
        self.println(l.as_str());
    }

    fn cmd_cpu(&mut self) {
        self.println("CPU Information:");
        #[cfg(target_arch = "aarch64")]
        {
            let (midr, mpidr): (u64, u64);
            unsafe {
                core::arch::asm!("mrs {}, midr_el1", out(reg) midr, options(nostack));
                core::arch::asm!("mrs {}, mpidr_el1", out(reg) mpidr, options(nostack));
            }
            let mut l = Line::new();
            let _ = write!(l, "  MIDR_EL1:  {:#x}", midr);
            self.println(l.as_str());
            l = Line::new();
            let _ = write!(l, "  MPIDR_EL1: {:#x}", mpidr);
            self.println(l.as_str());
            let implementer = (midr >> 24) & 0xFF;
            self.println(match implementer {
                0x41 => "  Implementer: ARM",
                0x51 => "  Implementer: Qualcomm",
                _ => "  Implementer: Unknown",
            });
        }
        #[cfg(not(target_arch = "aarch64"))]
        self.println("  Not available on this target");
    }

    fn cmd_uptime(&mut self) {
        let now = arch::read_counter();
        let freq = arch::counter_freq();
        let secs = if freq > 0 {
            (now - self.boot_counter) / freq
        } else {
            0
        };
        let mins = secs / 60;
        let hours = mins / 60;

        let mut l = Line::new();
        if hours > 0 {
            let _ = write!(l, "  Uptime: {}h {}m {}s", hours, mins % 60, secs % 60);
        } else {
            let _ = write!(l, "  Uptime: {}m {}s", mins % 60, secs % 60);
        }
        self.println(l.as_str());
    }

    fn parse_color(s: &str) -> u32 {
        let hex = s.trim_start_matches("0x").trim_start_matches("0X");
        u32::from_str_radix(hex, 16).unwrap_or(0)
    }

    fn cmd_color(&mut self, args: &[&str]) {
        if args.len() < 2 {
            self.println("Usage: color <preset>|<bg> [text]");
            self.println("Presets: dark, light, matrix,");
            self.println("         ocean, fire, cyber");
            return;
        }
        match args[1] {
            "dark" => {
                self.color_bg = 0x0000_0044;
                self.color_text = 0x00FF_FFFF;
                self.color_prompt = 0x0000_FF00;
            }
            "light" => {
                self.color_bg = 0x00E0_E0E0;
                self.color_text = 0x0000_0000;
                self.color_prompt = 0x0000_6600;
            }
            "matrix" => {
                self.color_bg = 0x0000_0000;
                self.color_text = 0x0000_FF00;
                self.color_prompt = 0x0000_AA00;
            }
            "ocean" => {
                self.color_bg = 0x0000_1133;
                self.color_text = 0x0066_CCFF;
                self.color_prompt = 0x0000_FFFF;
            }
            "fire" => {
                self.color_bg = 0x0022_0000;
                self.color_text = 0x00FF_6600;
                self.color_prompt = 0x00FF_FF00;
            }
            "cyber" => {
                self.color_bg = 0x0011_0022;
                self.color_text = 0x00FF_00FF;
                self.color_prompt = 0x0000_FFFF;
            }
            custom => {
                self.color_bg = Self::parse_color(custom);
                if args.len() >= 3 {
                    self.color_text = Self::parse_color(args[2]);
                }
                if args.len() >= 4 {
                    self.color_prompt = Self::parse_color(args[3]);
                }
            }
        }
        self.needs_redraw = true;
        self.println("Colors updated!");
    }

    fn cmd_calc(&mut self, args: &[&str]) {
        if args.len() < 4 {
            self.println("Usage: calc <n1> <op> <n2>");
            self.println("  ops: + - * / %");
            return;
        }
        let a: i64 = args[1].parse().unwrap_or(0);
        let b: i64 = args[3].parse().unwrap_or(0);

        let result = match args[2] {
            "+" => a.wrapping_add(b),
            "-" => a.wrapping_sub(b),
            "*" => a.wrapping_mul(b),
            "/" => {
                if b == 0 {
                    self.println("  Error: div by 0");
                    return;
                }
                a / b
            }
            "%" => {
                if b == 0 {
                    self.println("  Error: div by 0");
                    return;
                }
                a % b
            }
            _ => {
                self.println("  Unknown operator");
                return;
            }
        };

        let mut l = Line::new();
        let _ = write!(l, "  = {}", result);
        self.println(l.as_str());
    }

    // ── network commands ─────────────────────────────────────────────────────

    fn cmd_curl<D: BlockDevice, N: NetDevice>(&mut self, args: &[&str], sys: &mut System<D, N>) {
        if args.len() < 2 {
            self.println("Usage: curl <url>");
            self.println("  curl http://example.com/");
            return;
        }
        if self.http.is_some() {
            self.println("Request already in progress");
            return;
        }

        let mut l = Line::new();
        let _ = write!(l, "Fetching {}", args[1]);
        self.println(l.as_str());

        match HttpRequest::start(&mut sys.net, &mut sys.netdev, Method::Get, args[1], &[]) {
            Ok(req) => self.http = Some(req),
            Err(_) => self.println("Failed to start request"),
        }
    }

    fn cmd_ws<D: BlockDevice, N: NetDevice>(&mut self, args: &[&str], sys: &mut System<D, N>) {
        if args.len() < 2 {
            self.println("Usage: ws <cmd> [args]");
            self.println("  ws connect <url>");
            self.println("  ws send <message>");
            self.println("  ws ping");
            self.println("  ws close");
            self.println("  ws status");
            return;
        }

        match args[1] {
            "connect" => {
                if args.len() < 3 {
                    self.println("Usage: ws connect <url>");
                    return;
                }
                if self.ws.is_some() {
                    self.println("Already connected. Use 'ws close' first.");
                    return;
                }
                let mut l = Line::new();
                let _ = write!(l, "Connecting to {}", args[2]);
                self.println(l.as_str());

                match WebSocket::connect(&mut sys.net, &mut sys.netdev, args[2]) {
                    Ok(ws) => {
                        self.ws = Some(ws);
                        self.println("Connection started...");
                        self.println("Use 'ws status' to check");
                    }
                    Err(_) => self.println("Connect failed!"),
                }
            }
            "send" => {
                if args.len() < 3 {
                    self.println("Usage: ws send <message>");
                    return;
                }
                let mut msg: heapless::String<128> = heapless::String::new();
                for (i, part) in args.iter().skip(2).enumerate() {
                    if i > 0 {
                        let _ = msg.push(' ');
                    }
                    let _ = msg.push_str(part);
                }

                let ok = match self.ws.as_mut() {
                    Some(ws) if ws.state() == WsState::Open => ws
                        .send_text(&mut sys.net, &mut sys.netdev, msg.as_str())
                        .is_ok(),
                    _ => {
                        self.println("Not connected!");
                        return;
                    }
                };
                if ok {
                    let mut l = Line::new();
                    let _ = write!(l, "Sent: {}", msg);
                    self.println(l.as_str());
                } else {
                    self.println("Send failed!");
                }
            }
            "ping" => {
                match self.ws.as_mut() {
                    Some(ws) if ws.state() == WsState::Open => {
                        let _ = ws.send_ping(&mut sys.net, &mut sys.netdev);
                        self.println("Ping sent");
                    }
                    _ => self.println("Not connected!"),
                }
            }
            "close" => {
                if let Some(mut ws) = self.ws.take() {
                    ws.close(&mut sys.net, &mut sys.netdev);
                    self.println("Connection closed");
                } else {
                    self.println("Not connected");
                }
            }
            "status" | "poll" => {
                let (state, message) = match self.ws.as_mut() {
                    Some(ws) => {
                        let state = ws.state();
                        let mut buf = [0u8; 256];
                        let len = ws.take_message(&mut buf);
                        let mut msg: heapless::String<256> = heapless::String::new();
                        if len > 0 {
                            if let Ok(text) = core::str::from_utf8(&buf[..len]) {
                                let _ = msg.push_str(text);
                            }
                        }
                        (Some(state), msg)
                    }
                    None => (None, heapless::String::new()),
                };

                match state {
                    None => self.println("State: Not connected"),
                    Some(WsState::Closed) => self.println("State: Closed"),
                    Some(WsState::Connecting) => self.println("State: Connecting"),
                    Some(WsState::Open) => self.println("State: Open"),
                    Some(WsState::Closing) => self.println("State: Closing"),
                }
                if !message.is_empty() {
                    self.println("Received:");
                    let mut msg = heapless::String::<256>::new();
                    let _ = msg.push_str(message.as_str());
                    self.print_text(msg.as_str(), 256);
                }
            }
            other => {
                let mut l = Line::new();
                let _ = write!(l, "Unknown ws command: {}", other);
                self.println(l.as_str());
            }
        }
    }

    // ── filesystem commands ──────────────────────────────────────────────────

    fn cmd_disk<D: BlockDevice, N: NetDevice>(&mut self, sys: &mut System<D, N>) {
        if sys.disk_sectors == 0 {
            self.println("No disk detected");
            return;
        }

        self.println("Disk Information:");
        let mut l = Line::new();
        let _ = write!(l, "  Capacity: {} sectors", sys.disk_sectors);
        self.println(l.as_str());
        l = Line::new();
        let _ = write!(l, "  Size: {} MB", sys.disk_sectors * 512 / (1024 * 1024));
        self.println(l.as_str());

        if sys.fs.mounted() {
            if let Ok(stats) = sys.fs.stats() {
                self.println("  Filesystem: TinyFS");
                l = Line::new();
                let _ = write!(l, "  Clusters: {}/{} free", stats.free_clusters, stats.total_clusters);
                self.println(l.as_str());
                l = Line::new();
                let _ = write!(l, "  Files: {}", stats.file_count);
                self.println(l.as_str());
            }
        } else {
            self.println("  Filesystem: Not formatted");
            self.println("  Use 'format' to create TinyFS");
        }
    }

    fn cmd_ls<D: BlockDevice, N: NetDevice>(&mut self, sys: &mut System<D, N>) {
        if !sys.fs.mounted() {
            self.println("Filesystem not mounted");
            self.println("Use 'format' to format disk");
            return;
        }

        let mut entries = [DirEntry::EMPTY; 32];
        let count = match sys.fs.readdir(&mut entries) {
            Ok(count) => count,
            Err(_) => {
                self.println("Error reading directory");
                return;
            }
        };

        if count == 0 {
            self.println("(empty)");
            return;
        }

        self.println("Files:");
        for entry in entries.iter().take(count) {
            let mut l = Line::new();
            let _ = write!(l, "  {}  {} bytes", entry.name_str(), entry.size);
            self.println(l.as_str());
        }
        let mut l = Line::new();
        let _ = write!(l, "Total: {} file(s)", count);
        self.println(l.as_str());
    }

    fn cmd_cat<D: BlockDevice, N: NetDevice>(&mut self, args: &[&str], sys: &mut System<D, N>) {
        if args.len() < 2 {
            self.println("Usage: cat <filename>");
            return;
        }
        if !sys.fs.mounted() {
            self.println("Filesystem not mounted");
            return;
        }

        let fd = match sys.fs.open(args[1], tinyfs::O_READ) {
            Ok(fd) => fd,
            Err(_) => {
                let mut l = Line::new();
                let _ = write!(l, "Cannot open: {}", args[1]);
                self.println(l.as_str());
                return;
            }
        };

        let size = sys.fs.size(fd).unwrap_or(0);
        let mut l = Line::new();
        let _ = write!(l, "[{} bytes]", size);
        self.println(l.as_str());

        let mut total = 0;
        let mut buf = [0u8; 128];
        loop {
            let len = match sys.fs.read(fd, &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(len) => len,
            };
            if let Ok(text) = core::str::from_utf8(&buf[..len]) {
                self.print_text(text, 1024);
            }
            total += len;
            if total > 1024 {
                self.println("...(truncated)");
                break;
            }
        }

        let _ = sys.fs.close(fd);
    }

    fn cmd_write<D: BlockDevice, N: NetDevice>(&mut self, args: &[&str], sys: &mut System<D, N>) {
        if args.len() < 3 {
            self.println("Usage: write <file> <text>");
            return;
        }
        if !sys.fs.mounted() {
            self.println("Filesystem not mounted");
            return;
        }

        let fd = match sys
            .fs
            .open(args[1], tinyfs::O_WRITE | tinyfs::O_CREATE | tinyfs::O_TRUNC)
        {
            Ok(fd) => fd,
            Err(_) => {
                let mut l = Line::new();
                let _ = write!(l, "Cannot create: {}", args[1]);
                self.println(l.as_str());
                return;
            }
        };

        let mut content: heapless::String<256> = heapless::String::new();
        for (i, part) in args.iter().skip(2).enumerate() {
            if i > 0 {
                let _ = content.push(' ');
            }
            let _ = content.push_str(part);
        }
        let _ = content.push('\n');

        let written = sys.fs.write(fd, content.as_bytes());
        let _ = sys.fs.close(fd);

        match written {
            Ok(n) => {
                let mut l = Line::new();
                let _ = write!(l, "Wrote {} bytes to {}", n, args[1]);
                self.println(l.as_str());
            }
            Err(_) => self.println("Write failed!"),
        }
    }

    fn cmd_rm<D: BlockDevice, N: NetDevice>(&mut self, args: &[&str], sys: &mut System<D, N>) {
        if args.len() < 2 {
            self.println("Usage: rm <filename>");
            return;
        }
        if !sys.fs.mounted() {
            self.println("Filesystem not mounted");
            return;
        }

        let mut l = Line::new();
        if sys.fs.remove(args[1]).is_ok() {
            let _ = write!(l, "Deleted: {}", args[1]);
        } else {
            let _ = write!(l, "Cannot delete: {}", args[1]);
        }
        self.println(l.as_str());
    }

    fn cmd_format<D: BlockDevice, N: NetDevice>(&mut self, sys: &mut System<D, N>) {
        if sys.disk_sectors == 0 {
            self.println("No disk available");
            return;
        }

        self.println("Formatting disk...");
        if sys.fs.format().is_ok() {
            self.println("Disk formatted successfully!");
            if let Ok(stats) = sys.fs.stats() {
                let mut l = Line::new();
                let _ = write!(l, "  {} clusters ({} KB)", stats.total_clusters, stats.total_clusters * 2);
                self.println(l.as_str());
            }
        } else {
            self.println("Format failed!");
        }
    }

    // ── background polling ───────────────────────────────────────────────────

    /// Poll active HTTP/WebSocket work; called every main-loop tick
    pub fn tick<D: BlockDevice, N: NetDevice>(&mut self, sys: &mut System<D, N>) {
        if let Some(mut req) = self.http.take() {
            match req.poll(&mut sys.net, &mut sys.netdev) {
                HttpState::Done => {
                    let mut l = Line::new();
                    let _ = write!(
                        l,
                        "HTTP {} ({} bytes)",
                        req.response.status_code,
                        req.response.body.len()
                    );
                    self.println(l.as_str());
                    let body_len = req.response.body.len();
                    {
                        // Body text is printed from a stack copy so the
                        // request can be dropped first.
                        let mut text: heapless::String<512> = heapless::String::new();
                        let _ = text.push_str(
                            core::str::from_utf8(&req.response.body[..body_len.min(500)])
                                .unwrap_or(""),
                        );
                        req.close(&mut sys.net, &mut sys.netdev);
                        self.print_text(text.as_str(), 512);
                    }
                    if body_len > 500 {
                        self.println("...");
                    }
                    self.needs_redraw = true;
                }
                HttpState::Error => {
                    self.println("HTTP request failed");
                    req.close(&mut sys.net, &mut sys.netdev);
                    self.needs_redraw = true;
                }
                _ => self.http = Some(req),
            }
        }

        if let Some(ws) = self.ws.as_mut() {
            ws.poll(&mut sys.net, &mut sys.netdev);
        }
    }

    fn submit_command<D: BlockDevice, N: NetDevice>(&mut self, sys: &mut System<D, N>) {
        let mut cmd: heapless::String<MAX_CMD_LEN> = heapless::String::new();
        core::mem::swap(&mut cmd, &mut self.cmd_buffer);
        self.run_command(cmd.as_str(), sys);
        self.scroll_offset = 0;
        self.needs_redraw = true;
    }

    fn input_char(&mut self, c: char) {
        match c {
            '\x08' => {
                let _ = self.cmd_buffer.pop();
            }
            c if (c as u32) >= 32 => {
                if self.cmd_buffer.len() < MAX_CMD_LEN - 1 {
                    let _ = self.cmd_buffer.push(c);
                }
            }
            _ => {}
        }
        self.needs_redraw = true;
    }
}

impl Activity for Terminal {
    fn update<D: BlockDevice, N: NetDevice>(
        &mut self,
        events: &mut EventConsumer,
        sys: &mut System<D, N>,
    ) -> bool {
        // Soft keyboard character from the previous touch
        if let Some(c) = self.keyboard.take_char() {
            if c == '\n' {
                self.submit_command(sys);
            } else {
                self.input_char(c);
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
                    if ev.sub != KEY_PRESS {
                        continue;
                    }

                    match ev.code {
                        keys::KEY_UP => self.scroll_up(1),
                        keys::KEY_DOWN => self.scroll_down(1),
                        keys::KEY_ENTER => self.submit_command(sys),
                        keys::KEY_BACKSPACE => self.input_char('\x08'),
                        code => {
                            if let Some(c) = keycode_to_char(code, self.shift_held) {
                                if c == '\n' {
                                    self.submit_command(sys);
                                } else {
                                    self.input_char(c);
                                }
                            }
                        }
                    }
                }
                EventKind::Touch => {
                    // The keyboard gets first claim on every touch
                    if self.keyboard.handle_touch(ev.sub, ev.x, ev.y) {
                        self.needs_redraw = true;
                        continue;
                    }

                    let sx = scale_touch(ev.x, self.screen_w);
                    let sy = scale_touch(ev.y, self.screen_h);

                    match ev.sub {
                        TOUCH_DOWN => {
                            self.touch_start_y = ev.y;
                            self.touch_scrolling = false;
                            self.back_btn_pressed = sy < TITLE_BAR_HEIGHT && sx < 50;
                            self.needs_redraw = true;
                        }
                        TOUCH_MOVE => {
                            let dy = self.touch_start_y - ev.y;
                            if dy > SCROLL_THRESHOLD {
                                self.scroll_down(1);
                                self.touch_start_y = ev.y;
                                self.touch_scrolling = true;
                                self.back_btn_pressed = false;
                            } else if dy < -SCROLL_THRESHOLD {
                                self.scroll_up(1);
                                self.touch_start_y = ev.y;
                                self.touch_scrolling = true;
                                self.back_btn_pressed = false;
                            }
                            self.needs_redraw = true;
                        }
                        TOUCH_UP => {
                            if !self.touch_scrolling {
                                if self.back_btn_pressed && sy < TITLE_BAR_HEIGHT && sx < 50 {
                                    self.want_close = true;
                                } else if sy >= TITLE_BAR_HEIGHT {
                                    // Tapping the body toggles the keyboard
                                    self.keyboard.toggle();
                                }
                            }
                            self.back_btn_pressed = false;
                            self.touch_scrolling = false;
                            self.needs_redraw = true;
                        }
                        TOUCH_SCROLL_UP => self.scroll_up(ev.y.max(1)),
                        TOUCH_SCROLL_DOWN => self.scroll_down(ev.y.max(1)),
                        _ => {}
                    }
                }
            }
        }

        self.needs_redraw
    }

    fn draw(&mut self, surface: &mut Surface) {
        surface.clear(self.color_bg);

        // Title bar with circular back button
        surface.fill_rect(0, 0, self.screen_w as i32, TITLE_BAR_HEIGHT, TITLE_BAR_BG);
        let btn_color = if self.back_btn_pressed { 0x0050_5050 } else { BACK_BTN_COLOR };
        let arrow_color = if self.back_btn_pressed { 0x0000_FF00 } else { 0x00FF_FFFF };
        let btn_cy = TITLE_BAR_HEIGHT / 2;
        surface.fill_circle(26, btn_cy, 16, btn_color);
        for i in 0..8 {
            surface.pixel(23 + i, btn_cy - i, arrow_color);
            surface.pixel(23 + i, btn_cy + i, arrow_color);
            surface.pixel(24 + i, btn_cy - i, arrow_color);
            surface.pixel(24 + i, btn_cy + i, arrow_color);
        }
        let title_x = (self.screen_w as i32 - Surface::text_width("Terminal")) / 2;
        surface.draw_string(title_x, (TITLE_BAR_HEIGHT - 12) / 2, "Terminal", TITLE_BAR_TEXT);
        surface.fill_rect(0, TITLE_BAR_HEIGHT - 1, self.screen_w as i32, 1, 0x0033_3333);

        // Visible history window, leaving room for keyboard and prompt
        let kb_h = self.keyboard.height();
        let line_height = Surface::line_height() + 2;
        let available = self.screen_h as i32 - kb_h - TITLE_BAR_HEIGHT;
        self.max_visible_lines = (available - line_height - 20) / line_height;

        let end_line = self.history_count as i32 - self.scroll_offset;
        let start_line = (end_line - self.max_visible_lines).max(0);

        let mut y = TITLE_BAR_HEIGHT + 10;
        for i in start_line..end_line {
            let idx = (self.history_head + MAX_HISTORY - self.history_count + i as usize)
                % MAX_HISTORY;
            surface.draw_string(10, y, self.history[idx].as_str(), self.color_text);
            y += line_height;
        }

        if self.scroll_offset > 0 {
            let mut marker = heapless::String::<16>::new();
            let _ = write!(marker, "[+{}]", self.scroll_offset);
            surface.draw_string(
                self.screen_w as i32 - 50,
                TITLE_BAR_HEIGHT + 10,
                marker.as_str(),
                0x0033_FF33,
            );
        }

        // Prompt with cursor
        let mut prompt: heapless::String<{ MAX_CMD_LEN + 4 }> = heapless::String::new();
        let _ = prompt.push_str("> ");
        let _ = prompt.push_str(self.cmd_buffer.as_str());
        let _ = prompt.push('_');
        let prompt_y = self.screen_h as i32 - kb_h - line_height - 10;
        surface.draw_string(10, prompt_y, prompt.as_str(), self.color_prompt);

        self.keyboard.draw(surface);
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
    use crate::fs::MemDisk;
    use crate::fs::TinyFs;
    use crate::kernel::event::EventRing;
    use crate::net::{NetStack, TestDevice};

    fn term_and_sys() -> (Terminal, System<MemDisk, TestDevice>) {
        let mut fs = TinyFs::new(MemDisk::new(256));
        fs.format().unwrap();
        let sys = System::new(fs, NetStack::new(), TestDevice::new(), 256);
        (Terminal::new(720, 1280), sys)
    }

    fn last_lines(term: &Terminal, n: usize) -> alloc::vec::Vec<&str> {
        let mut out = alloc::vec::Vec::new();
        for i in 0..n.min(term.history_count) {
            let idx = (term.history_head + MAX_HISTORY - 1 - i) % MAX_HISTORY;
            out.push(term.history[idx].as_str());
        }
        out.reverse();
        out
    }

    fn last_line(term: &Terminal) -> &str {
        last_lines(term, 1)[0]
    }

    #[test]
    fn test_echo() {
        let (mut term, mut sys) = term_and_sys();
        term.run_command("echo hello world", &mut sys);
        assert_eq!(last_line(&term), "hello world");
    }

    #[test]
    fn test_prompt_echoed_into_history() {
        let (mut term, mut sys) = term_and_sys();
        term.run_command("echo hi", &mut sys);
        let lines = last_lines(&term, 2);
        assert_eq!(lines[0], "> echo hi");
        assert_eq!(lines[1], "hi");
    }

    #[test]
    fn test_unknown_command() {
        let (mut term, mut sys) = term_and_sys();
        term.run_command("frobnicate", &mut sys);
        assert_eq!(last_line(&term), "Unknown command: frobnicate");
    }

    #[test]
    fn test_close_sets_flag() {
        let (mut term, mut sys) = term_and_sys();
        assert!(!term.should_close());
        term.run_command("close", &mut sys);
        assert!(term.should_close());
        term.clear_close();
        assert!(!term.should_close());
    }

    #[test]
    fn test_clear_empties_history() {
        let (mut term, mut sys) = term_and_sys();
        term.run_command("echo something", &mut sys);
        term.run_command("clear", &mut sys);
        assert_eq!(term.history_count, 0);
    }

    #[test]
    fn test_calc() {
        let (mut term, mut sys) = term_and_sys();
        term.run_command("calc 6 * 7", &mut sys);
        assert_eq!(last_line(&term), "  = 42");
        term.run_command("calc 10 / 0", &mut sys);
        assert_eq!(last_line(&term), "  Error: div by 0");
        term.run_command("calc -5 + 3", &mut sys);
        assert_eq!(last_line(&term), "  = -2");
    }

    #[test]
    fn test_color_preset() {
        let (mut term, mut sys) = term_and_sys();
        term.run_command("color ocean", &mut sys);
        assert_eq!(term.color_bg, 0x0000_1133);
        assert_eq!(last_line(&term), "Colors updated!");
        term.run_command("color 0x112233 0x445566", &mut sys);
        assert_eq!(term.color_bg, 0x0011_2233);
        assert_eq!(term.color_text, 0x0044_5566);
    }

    #[test]
    fn test_file_workflow() {
        let (mut term, mut sys) = term_and_sys();

        term.run_command("write notes.txt remember the milk", &mut sys);
        assert_eq!(last_line(&term), "Wrote 18 bytes to notes.txt");

        term.run_command("ls", &mut sys);
        let lines = last_lines(&term, 3);
        assert!(lines.iter().any(|l| l.contains("notes.txt")));
        assert_eq!(*lines.last().unwrap(), "Total: 1 file(s)");

        term.run_command("cat notes.txt", &mut sys);
        let lines = last_lines(&term, 2);
        assert_eq!(lines[0], "[18 bytes]");
        assert_eq!(lines[1], "remember the milk");

        term.run_command("rm notes.txt", &mut sys);
        assert_eq!(last_line(&term), "Deleted: notes.txt");

        term.run_command("ls", &mut sys);
        assert_eq!(last_line(&term), "(empty)");
    }

    #[test]
    fn test_cat_missing_file() {
        let (mut term, mut sys) = term_and_sys();
        term.run_command("cat nothere", &mut sys);
        assert_eq!(last_line(&term), "Cannot open: nothere");
    }

    #[test]
    fn test_disk_reports_fs() {
        let (mut term, mut sys) = term_and_sys();
        term.run_command("disk", &mut sys);
        let lines = last_lines(&term, 6);
        assert!(lines.iter().any(|l| l.contains("TinyFS")));
        assert!(lines.iter().any(|l| l.contains("256 sectors")));
    }

    #[test]
    fn test_curl_rejects_https() {
        let (mut term, mut sys) = term_and_sys();
        sys.net.configure(
            crate::net::Ipv4Addr([10, 0, 2, 15]),
            crate::net::Ipv4Addr([255, 255, 255, 0]),
            crate::net::Ipv4Addr([10, 0, 2, 2]),
            crate::net::Ipv4Addr([10, 0, 2, 3]),
        );
        term.run_command("curl https://nope/", &mut sys);
        assert_eq!(last_line(&term), "Failed to start request");
    }

    #[test]
    fn test_keyboard_input_submits_command() {
        let (mut term, mut sys) = term_and_sys();
        let ring = EventRing::new();
        let (mut tx, mut rx) = ring.split();

        // "echo ok" typed on the hardware keyboard: e=18 c=46 h=35 o=24
        for code in [18u16, 46, 35, 24, 57, 24, 37] {
            tx.push_key(code, true);
            tx.push_key(code, false);
        }
        tx.push_key(crate::drivers::virtio_input::KEY_ENTER, true);

        term.update(&mut rx, &mut sys);
        assert_eq!(last_line(&term), "echo ok");
    }

    #[test]
    fn test_scroll_clamps() {
        let (mut term, mut sys) = term_and_sys();
        term.max_visible_lines = 5;
        for i in 0..20 {
            let mut l = Line::new();
            let _ = write!(l, "echo line{}", i);
            term.run_command(l.as_str(), &mut sys);
        }
        term.scroll_down(10);
        assert_eq!(term.scroll_offset, 0);
        term.scroll_up(10_000);
        assert_eq!(
            term.scroll_offset,
            term.history_count as i32 - term.max_visible_lines
        );
    }

    #[test]
    fn test_history_ring_wraps() {
        let (mut term, mut sys) = term_and_sys();
        for i in 0..(MAX_HISTORY + 40) {
            let mut l = Line::new();
            let _ = write!(l, "echo {}", i);
            term.run_command(l.as_str(), &mut sys);
        }
        assert_eq!(term.history_count, MAX_HISTORY);
        // The newest line is still the last echo
        let mut expect = Line::new();
        let _ = write!(expect, "{}", MAX_HISTORY + 39);
        assert_eq!(last_line(&term), expect.as_str());
    }
}
