//! Wire-level building blocks shared by all flasher operations.

pub mod console;
pub mod crc;

// Re-export common types
pub use console::{Console, ConsoleConfig, Response};
pub use crc::{Crc16, crc16_xmodem};
