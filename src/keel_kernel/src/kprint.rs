//! Formatted console output over the port's `putc`.
use core::fmt;

use crate::{Kernel, Port};

struct PortWriter<'a, P: Port> {
    port: &'a P,
}

impl<P: Port> fmt::Write for PortWriter<'_, P> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.port.putc(byte);
        }
        Ok(())
    }
}

impl<P: Port> Kernel<P> {
    /// Write formatted output byte-by-byte through the port. The critical
    /// section is held for the whole message so concurrent writers cannot
    /// interleave within a line.
    pub fn print(&self, args: fmt::Arguments<'_>) {
        let _guard = self.lock();
        let mut w = PortWriter { port: &self.port };
        let _ = fmt::write(&mut w, args);
    }
}

/// Print through a kernel: `kprint!(kernel, "...", args)`.
#[macro_export]
macro_rules! kprint {
    ($kernel:expr, $($arg:tt)*) => {
        $kernel.print(core::format_args!($($arg)*))
    };
}

/// Like [`kprint!`] with a trailing newline.
#[macro_export]
macro_rules! kprintln {
    ($kernel:expr) => {
        $kernel.print(core::format_args!("\n"))
    };
    ($kernel:expr, $fmt:expr) => {
        $kernel.print(core::format_args!(concat!($fmt, "\n")))
    };
    ($kernel:expr, $fmt:expr, $($arg:tt)*) => {
        $kernel.print(core::format_args!(concat!($fmt, "\n"), $($arg)*))
    };
}
