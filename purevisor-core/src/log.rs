//! Hypervisor logging.
//!
//! Lock-free ring-buffer logging that works in a `no_std` environment. The
//! buffer is memory-resident so an external debugger or the management API
//! can fetch logs without hypervisor intervention; on x86_64 bare metal the
//! bytes are also mirrored to the legacy COM1 UART for early debugging.
//!
//! The `log!`/`log_warn!`/`log_error!` macros accept standard `format!`
//! syntax. The ring buffer is 64 KiB and overwrites old data when full.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

const LOG_BUF_SIZE: usize = 64 * 1024;

static mut LOG_BUFFER: [u8; LOG_BUF_SIZE] = [0; LOG_BUF_SIZE];
static WRITE_POS: AtomicUsize = AtomicUsize::new(0);

/// Whether bytes are mirrored to the UART. Off by default so hosted runs
/// never execute port I/O; the boot path turns it on.
static UART_MIRROR: AtomicBool = AtomicBool::new(false);

/// Legacy COM1 I/O port.
#[cfg(target_arch = "x86_64")]
const UART_BASE: u16 = 0x3F8;

#[inline(always)]
fn uart_write_byte(byte: u8) {
    #[cfg(target_arch = "x86_64")]
    if UART_MIRROR.load(Ordering::Relaxed) {
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") UART_BASE,
                in("al") byte,
                options(nomem, nostack, preserves_flags)
            );
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = byte;
}

/// Enable the UART mirror (called once serial is known to exist).
pub fn enable_uart() {
    UART_MIRROR.store(true, Ordering::Relaxed);
}

/// Internal writer implementing `core::fmt::Write`.
pub struct RingBufferWriter;

impl Write for RingBufferWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            write_byte(b);
        }
        Ok(())
    }
}

#[inline]
fn write_byte(b: u8) {
    let pos = WRITE_POS.fetch_add(1, Ordering::Relaxed) % LOG_BUF_SIZE;
    unsafe {
        let buf = &raw mut LOG_BUFFER;
        (*buf)[pos] = b;
    }
    uart_write_byte(b);
}

#[doc(hidden)]
pub fn write_record(level: &str, args: fmt::Arguments<'_>) {
    let mut w = RingBufferWriter;
    let _ = w.write_str(level);
    let _ = fmt::write(&mut w, args);
    let _ = w.write_str("\r\n");
}

/// Informational log line.
#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {
        $crate::log::write_record("[info] ", format_args!($($arg)*))
    };
}

/// Warning log line.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::log::write_record("[warn] ", format_args!($($arg)*))
    };
}

/// Error log line.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::log::write_record("[error] ", format_args!($($arg)*))
    };
}

/// Expose the log buffer for external tools (read-only).
pub fn buffer() -> &'static [u8; LOG_BUF_SIZE] {
    unsafe { &*(&raw const LOG_BUFFER) }
}
