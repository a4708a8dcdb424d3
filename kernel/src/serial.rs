//! Serial port driver for debug output
//!
//! COM1 UART 16550, used for early boot logging before the framebuffer
//! exists and for everything the kernel wants to say afterwards.

use core::fmt;
use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

/// Standard COM1 port address
const SERIAL_IO_PORT: u16 = 0x3F8;

lazy_static! {
    /// Global serial port instance protected by spinlock
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let mut serial_port = unsafe { SerialPort::new(SERIAL_IO_PORT) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

/// Initialize serial port (forces the lazy static)
pub fn init() {
    let _ = SERIAL1.lock();
}

#[cfg(not(test))]
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    use x86_64::instructions::interrupts;

    // Disable interrupts to prevent deadlock against IRQ-context logging
    interrupts::without_interrupts(|| {
        let _ = SERIAL1.lock().write_fmt(args);
    });
}

/// Test builds run on a host with no COM1 to poke; logging is dropped
#[cfg(test)]
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    let _ = args;
}

/// Print to serial port
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

/// Print to serial port with newline
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($fmt:expr) => ($crate::serial_print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::serial_print!(
        concat!($fmt, "\n"), $($arg)*
    ));
}
