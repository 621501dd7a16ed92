//! # mcomflash
//!
//! A library for programming the SPI NOR flash of MCom-03 boards over the
//! debug UART.
//!
//! The SoC's BootROM exposes a small monitor on the UART. This crate uploads
//! the QSPI flasher into on-chip RAM through that monitor and then drives it
//! to:
//!
//! - select a QSPI controller and its supply voltage
//! - identify the flash chip by its JEDEC ID
//! - erase sectors
//! - write data in CRC-checked blocks with retransmission
//! - verify a range by CRC
//! - read flash contents back
//!
//! ## Features
//!
//! - `native` (default): serial port support via the `serialport` crate
//! - `serde`: serialization support for flash profiles
//!
//! ## Example
//!
//! ```rust,no_run
//! use mcomflash::{ConsoleConfig, GeometryOverride, QspiController, SerialConfig, Session};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut session = Session::open(
//!         &SerialConfig::new("/dev/ttyUSB0", 115_200),
//!         ConsoleConfig::default(),
//!     )?;
//!     session.bootstrap(&std::fs::read("qspi_flasher.hex")?, &mut |_, _, _| {})?;
//!     session.select_controller(QspiController::Qspi0, false)?;
//!     session.identify(&GeometryOverride::default())?;
//!
//!     let mut dump = std::fs::File::create("flash.bin")?;
//!     session.read_range(0, None, &mut dump, &mut |_, _, _| {})?;
//!     session.close()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chip;
pub mod error;
pub mod flasher;
pub mod port;
pub mod protocol;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    chip::{
        FlashPart, FlashProfile, FlashRegistry, Geometry, GeometryOverride, QspiController,
        format_size,
    },
    error::{Error, Result},
    flasher::{BootstrapOutcome, EraseRange, ProgramReport, Session, Stage, kib_per_sec},
    port::{Port, SerialConfig},
    protocol::{Console, ConsoleConfig, Crc16, Response, crc16_xmodem},
};
