//! Byte-level transport to the MCom-03 UART.
//!
//! The protocol layer only needs raw reads and writes plus a way to drop stale
//! input, so everything above this module is written against the [`Port`]
//! trait:
//!
//! ```text
//! +-------------------------------+
//! |  flasher (erase/write/read)   |
//! +---------------+---------------+
//!                 |
//! +---------------v---------------+
//! |  protocol::console::Console   |
//! +---------------+---------------+
//!                 |
//! +---------------v---------------+
//! |          Port trait           |
//! +---------------+---------------+
//!                 |
//! +---------------v---------------+
//! |   NativePort (serialport)     |
//! +-------------------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use mcomflash::port::Port;
//!
//! fn example<P: Port>(port: &mut P) -> mcomflash::Result<()> {
//!     port.clear_input()?;
//!     port.write_all_bytes(b"\r")?;
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

#[cfg(test)]
pub(crate) mod mock;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Default UART speed of the BootROM monitor.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Default per-read timeout.
///
/// Bounds how long a single `read` may block, and so how precisely command
/// deadlines are honoured.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Where and how fast to talk to the board.
///
/// Framing is not configurable: the BootROM console always runs 8N1 without
/// flow control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Per-read timeout.
    pub timeout: Duration,
}

impl SerialConfig {
    /// Configuration for `port_name` at `baud_rate` with the default read timeout.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Set the per-read timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Byte transport used by the command channel.
///
/// `read` may return `Ok(0)` or an [`std::io::ErrorKind::TimedOut`] error when
/// no byte arrived within the per-read timeout; callers treat both as "no data
/// yet" and keep their own deadline.
pub trait Port: Read + Write + Send {
    /// Set the per-read timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current per-read timeout.
    fn timeout(&self) -> Duration;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Discard input that was received but not yet read.
    fn clear_input(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }
}

#[cfg(feature = "native")]
pub use native::NativePort;
