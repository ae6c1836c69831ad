//! Debug UART
//!
//! Single memory-mapped write register on the QEMU `virt` PL011. Used only
//! for boot tracing and driver diagnostics; there is no console input path.

use crate::arch::SpinLock;
use core::fmt::{self, Write};

use super::map::UART0_BASE;

struct Uart;

impl Uart {
    #[inline]
    fn putc(&self, c: u8) {
        #[cfg(target_arch = "aarch64")]
        unsafe {
            core::ptr::write_volatile(UART0_BASE as *mut u32, c as u32);
        }
        #[cfg(not(target_arch = "aarch64"))]
        let _ = c;
    }
}

impl Write for Uart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            self.putc(b);
        }
        Ok(())
    }
}

static WRITER: SpinLock<Uart> = SpinLock::new(Uart);

/// Back end of the `kprint!`/`kprintln!` macros.
pub fn print(args: fmt::Arguments) {
    let _ = WRITER.lock().write_fmt(args);
}
