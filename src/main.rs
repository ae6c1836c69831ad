//! ╔═══════════════════════════════════════════════════════════════════════════╗
//! ║                           TINYOS - MAIN                                   ║
//! ╚═══════════════════════════════════════════════════════════════════════════╝
//!
//! Kernel entry point and the cooperative main loop: poll input, advance the
//! network, drive the active UI activity, flush the framebuffer when dirty.

#![cfg_attr(target_arch = "aarch64", no_std)]
#![cfg_attr(target_arch = "aarch64", no_main)]

#[cfg(target_arch = "aarch64")]
mod kernel_entry {
    extern crate alloc;
    use alloc::boxed::Box;

    use tinyos::apps::{Activity, FileManager, Home, Terminal};
    use tinyos::drivers::virtio_net::SystemNet;
    use tinyos::fs::{SystemDisk, TinyFs};
    use tinyos::kernel::event::EVENTS;
    use tinyos::net::http::{HttpRequest, HttpState, Method};
    use tinyos::net::NetStack;
    use tinyos::system::System;
    use tinyos::visual::{cursor, Surface};
    use tinyos::{arch, drivers, kernel, kprintln};

    /// Which activity owns the screen
    enum Ui {
        Home,
        Terminal,
        Files,
    }

    /// Loop iterations before the first network init attempt (lets the GUI
    /// settle first)
    const NET_INIT_DELAY: u32 = 10_000;

    /// Entry from boot.S; never returns.
    #[no_mangle]
    pub extern "C" fn kernel_main() -> ! {
        kprintln!();
        kprintln!("*** TinyOS ***");

        kprintln!("[INIT] Interrupt controller...");
        drivers::gic::init();

        kprintln!("[INIT] Memory allocator...");
        unsafe { kernel::memory::init() };
        kprintln!("       Heap: {} bytes free", kernel::memory::free_bytes());

        // Display first so the home screen is up before storage and network
        kprintln!("[INIT] Display...");
        drivers::virtio_gpu::init();

        kprintln!("[INIT] Input devices...");
        drivers::virtio_input::init();

        let screen_w = drivers::virtio_gpu::width() as usize;
        let screen_h = drivers::virtio_gpu::height() as usize;
        let fb = drivers::virtio_gpu::framebuffer();
        let fb_len = screen_w * screen_h;

        let mut home = Box::new(Home::new(screen_w, screen_h));
        {
            let pixels = unsafe { core::slice::from_raw_parts_mut(fb, fb_len) };
            let mut surface = Surface::new(pixels, screen_w, screen_h);
            home.draw(&mut surface);
        }
        drivers::virtio_gpu::flush();

        kprintln!("[INIT] Block device...");
        drivers::virtio_blk::init();

        kprintln!("[INIT] Filesystem...");
        let mut fs = TinyFs::new(SystemDisk);
        if fs.mount().is_ok() && fs.mounted() {
            kprintln!("       Mounted TinyFS");
        } else {
            kprintln!("       Disk not formatted");
        }

        let mut sys = Box::new(System::new(
            fs,
            NetStack::new(),
            SystemNet,
            drivers::virtio_blk::capacity(),
        ));

        kprintln!("[INIT] Enabling interrupts...");
        arch::irq_enable();

        kprintln!("[BOOT] Entering main loop");

        let mut events = EVENTS.consumer();
        let mut ui = Ui::Home;
        let mut terminal: Option<Box<Terminal>> = None;
        let mut files: Option<Box<FileManager>> = None;

        let mut loop_count: u32 = 0;
        let mut net_tried = false;
        let mut probe_started = false;
        let mut ip_probe: Option<HttpRequest> = None;

        let mut last_cursor = (-1i32, -1i32);

        loop {
            loop_count = loop_count.wrapping_add(1);

            // (a) drain virtio-input into the event ring
            drivers::virtio_input::poll();

            // (b) network: defer init until the GUI is stable, then poll
            // every iteration
            if !net_tried && loop_count > NET_INIT_DELAY {
                kprintln!("[INIT] Network...");
                drivers::virtio_net::init();
                net_tried = true;
            }
            if net_tried {
                drivers::virtio_net::poll();
                sys.net.poll(&mut sys.netdev);
            }

            // One-shot external connectivity probe once DHCP lands
            if net_tried && sys.net.config.configured && !probe_started {
                probe_started = true;
                ip_probe = HttpRequest::start(
                    &mut sys.net,
                    &mut sys.netdev,
                    Method::Get,
                    "http://ifconfig.me/ip",
                    &[],
                )
                .ok();
            }
            if let Some(mut req) = ip_probe.take() {
                match req.poll(&mut sys.net, &mut sys.netdev) {
                    HttpState::Done => {
                        home.set_connected();
                        req.close(&mut sys.net, &mut sys.netdev);
                    }
                    HttpState::Error => req.close(&mut sys.net, &mut sys.netdev),
                    _ => ip_probe = Some(req),
                }
            }

            // Cursor follows the last touch position
            let (raw_x, raw_y, _down) = drivers::virtio_input::touch_position();
            let cursor_pos = (
                raw_x * screen_w as i32 / 32768,
                raw_y * screen_h as i32 / 32768,
            );
            let cursor_moved = cursor_pos != last_cursor;
            last_cursor = cursor_pos;

            let pixels = unsafe { core::slice::from_raw_parts_mut(fb, fb_len) };
            let mut surface = Surface::new(pixels, screen_w, screen_h);

            // (c) drive the active activity; (d) flush when dirty
            match ui {
                Ui::Home => {
                    if home.update(&mut events, &mut sys) || cursor_moved {
                        home.draw(&mut surface);
                        cursor::draw_cursor(&mut surface, cursor_pos.0, cursor_pos.1);
                        drivers::virtio_gpu::flush();
                    }

                    if home.terminal_pressed() {
                        home.clear_pressed();
                        let mut term = Box::new(Terminal::new(screen_w, screen_h));
                        term.draw(&mut surface);
                        cursor::draw_cursor(&mut surface, cursor_pos.0, cursor_pos.1);
                        drivers::virtio_gpu::flush();
                        terminal = Some(term);
                        ui = Ui::Terminal;
                    } else if home.files_pressed() {
                        home.clear_pressed();
                        let mut fm = Box::new(FileManager::new(screen_w, screen_h, &mut sys));
                        fm.draw(&mut surface);
                        cursor::draw_cursor(&mut surface, cursor_pos.0, cursor_pos.1);
                        drivers::virtio_gpu::flush();
                        files = Some(fm);
                        ui = Ui::Files;
                    }
                }
                Ui::Terminal => {
                    let mut closing = false;
                    if let Some(term) = terminal.as_mut() {
                        term.tick(&mut sys);

                        if term.update(&mut events, &mut sys) || cursor_moved {
                            term.draw(&mut surface);
                            cursor::draw_cursor(&mut surface, cursor_pos.0, cursor_pos.1);
                            drivers::virtio_gpu::flush();
                        }

                        if term.should_close() {
                            term.clear_close();
                            closing = true;
                        }
                    } else {
                        closing = true;
                    }

                    if closing {
                        terminal = None;
                        ui = Ui::Home;
                        *home = Home::new(screen_w, screen_h);
                        home.draw(&mut surface);
                        cursor::draw_cursor(&mut surface, cursor_pos.0, cursor_pos.1);
                        drivers::virtio_gpu::flush();
                    }
                }
                Ui::Files => {
                    let mut closing = false;
                    if let Some(fm) = files.as_mut() {
                        if fm.update(&mut events, &mut sys) || cursor_moved {
                            fm.draw(&mut surface);
                            cursor::draw_cursor(&mut surface, cursor_pos.0, cursor_pos.1);
                            drivers::virtio_gpu::flush();
                        }

                        if fm.should_close() {
                            fm.clear_close();
                            closing = true;
                        }
                    } else {
                        closing = true;
                    }

                    if closing {
                        files = None;
                        ui = Ui::Home;
                        *home = Home::new(screen_w, screen_h);
                        home.draw(&mut surface);
                        cursor::draw_cursor(&mut surface, cursor_pos.0, cursor_pos.1);
                        drivers::virtio_gpu::flush();
                    }
                }
            }

            // Keep the loop from spinning flat out
            arch::delay_cycles(10_000);
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        kprintln!();
        kprintln!("KERNEL PANIC");
        if let Some(location) = info.location() {
            kprintln!("Location: {}:{}", location.file(), location.line());
        }
        kprintln!("{}", info.message());
        loop {
            core::hint::spin_loop();
        }
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn main() {
    // The kernel binary only makes sense on the AArch64 target; the library
    // carries all testable logic.
}
