//! Flasher session: bootstrap, identification and flash operations.
//!
//! Each protocol lives in its own submodule as free functions over a
//! [`Console`]; [`Session`] strings them together, remembers the selected
//! controller and the identified flash, and checks every request against the
//! flash geometry before anything is sent.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mcomflash::{ConsoleConfig, GeometryOverride, QspiController, SerialConfig, Session};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let serial = SerialConfig::new("/dev/ttyUSB0", 115_200);
//!     let mut session = Session::open(&serial, ConsoleConfig::default())?;
//!
//!     let flasher = std::fs::read("qspi_flasher.hex")?;
//!     session.bootstrap(&flasher, &mut |_, _, _| {})?;
//!     session.select_controller(QspiController::Qspi1, false)?;
//!     println!("{}", session.identify(&GeometryOverride::default())?);
//!
//!     let mut image = std::fs::File::open("image.bin")?;
//!     let report = session.program(0, &mut image, &mut |stage, current, total| {
//!         println!("{stage}: {current}/{total}");
//!     })?;
//!     println!("{:.1} KiB/s", report.write_throughput());
//!     Ok(())
//! }
//! ```

pub mod bootstrap;
pub mod erase;
pub mod identify;
pub mod read;
pub mod verify;
pub mod write;

pub use bootstrap::{BootstrapOutcome, FLASHER_ID};
pub use erase::EraseRange;

use {
    crate::{
        chip::{FlashProfile, FlashRegistry, Geometry, GeometryOverride, QspiController},
        error::{Error, Result},
        port::Port,
        protocol::console::Console,
    },
    log::debug,
    std::{
        fmt,
        io::{Read, Seek, SeekFrom, Write},
        time::{Duration, Instant},
    },
};

/// Long-running phase reported to progress callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Streaming the flasher image to the monitor.
    Upload,
    /// Erasing sectors; progress counts sectors.
    Erase,
    /// Writing blocks; progress counts bytes.
    Write,
    /// Waiting for the device checksum.
    Verify,
    /// Reading flash; progress counts bytes.
    Read,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Upload => "Uploading",
            Self::Erase => "Erasing",
            Self::Write => "Writing",
            Self::Verify => "Verifying",
            Self::Read => "Reading",
        };
        f.write_str(name)
    }
}

/// Progress callback: stage, current, total.
pub type Progress<'a> = &'a mut dyn FnMut(Stage, usize, usize);

/// Outcome of [`Session::program`].
#[derive(Debug, Clone)]
pub struct ProgramReport {
    /// Flash offset of the image.
    pub offset: u64,
    /// Image size in bytes.
    pub bytes: u64,
    /// Sectors erased ahead of the write.
    pub erased: EraseRange,
    /// Time spent erasing.
    pub erase_time: Duration,
    /// Time spent writing.
    pub write_time: Duration,
    /// Time spent verifying.
    pub verify_time: Duration,
}

impl ProgramReport {
    /// Wall time of all three phases.
    pub fn total_time(&self) -> Duration {
        self.erase_time + self.write_time + self.verify_time
    }

    /// Write speed in KiB/s.
    pub fn write_throughput(&self) -> f64 {
        kib_per_sec(self.bytes, self.write_time)
    }
}

/// Transfer rate in KiB/s; zero when no time elapsed.
pub fn kib_per_sec(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 / 1024.0 / secs
    } else {
        0.0
    }
}

/// Connection to a running (or about to be uploaded) QSPI flasher.
pub struct Session<P: Port> {
    console: Console<P>,
    registry: FlashRegistry,
    controller: Option<QspiController>,
    profile: Option<FlashProfile>,
}

impl<P: Port> Session<P> {
    /// Start a session over an open channel, using the built-in part table.
    pub fn new(console: Console<P>) -> Self {
        Self {
            console,
            registry: FlashRegistry::builtin(),
            controller: None,
            profile: None,
        }
    }

    /// Use a custom part table for identification.
    #[must_use]
    pub fn with_registry(mut self, registry: FlashRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// The command channel.
    pub fn console(&self) -> &Console<P> {
        &self.console
    }

    /// Mutable access to the command channel.
    pub fn console_mut(&mut self) -> &mut Console<P> {
        &mut self.console
    }

    /// Controller selected with [`Session::select_controller`].
    pub fn controller(&self) -> Option<QspiController> {
        self.controller
    }

    /// Flash found by [`Session::identify`].
    pub fn profile(&self) -> Option<&FlashProfile> {
        self.profile
            .as_ref()
    }

    /// Make sure the flasher runs, uploading `image` if needed.
    pub fn bootstrap(&mut self, image: &[u8], progress: Progress<'_>) -> Result<BootstrapOutcome> {
        bootstrap::bootstrap(&mut self.console, image, &mut |current, total| {
            progress(Stage::Upload, current, total);
        })
    }

    /// Select a QSPI controller. Any previously identified flash is forgotten,
    /// and so is the previous selection until the device confirms this one.
    pub fn select_controller(&mut self, controller: QspiController, voltage_1v8: bool) -> Result<()> {
        self.profile = None;
        self.controller = None;
        identify::select_controller(&mut self.console, controller, voltage_1v8)?;
        self.controller = Some(controller);
        Ok(())
    }

    /// Identify the flash on the selected controller.
    pub fn identify(&mut self, overrides: &GeometryOverride) -> Result<&FlashProfile> {
        let profile = identify::identify(&mut self.console, &self.registry, overrides)?;
        Ok(self
            .profile
            .insert(profile))
    }

    /// Geometry of the identified flash.
    pub fn geometry(&self) -> Result<Geometry> {
        self.profile
            .as_ref()
            .ok_or_else(|| Error::Precondition("flash has not been identified".to_string()))?
            .geometry()
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<Geometry> {
        let geometry = self.geometry()?;
        let total = u64::from(geometry.total_size);
        match offset.checked_add(len) {
            Some(end) if end <= total => Ok(geometry),
            _ => Err(Error::Precondition(format!(
                "range {offset:#x}..+{len:#x} exceeds flash size {total:#x}"
            ))),
        }
    }

    fn rest_of_flash(&self, offset: u64, len: Option<u64>) -> Result<u64> {
        match len {
            Some(len) => Ok(len),
            None => {
                let total = u64::from(
                    self.geometry()?
                        .total_size,
                );
                total
                    .checked_sub(offset)
                    .ok_or_else(|| {
                        Error::Precondition(format!(
                            "offset {offset:#x} is past the end of flash ({total:#x})"
                        ))
                    })
            },
        }
    }

    /// Erase `len` bytes at a sector-aligned `offset`, rounding up to whole
    /// sectors.
    pub fn erase(
        &mut self,
        offset: u64,
        len: u64,
        progress: Progress<'_>,
    ) -> Result<(EraseRange, Duration)> {
        let geometry = self.check_range(offset, len)?;
        let range = EraseRange::aligned(offset, len, geometry.sector_size)?;
        let start = Instant::now();
        erase::erase(&mut self.console, &range, &mut |current, total| {
            progress(Stage::Erase, current, total);
        })?;
        Ok((range, start.elapsed()))
    }

    /// Like [`Session::erase`]; `None` erases up to the end of flash.
    pub fn erase_range(
        &mut self,
        offset: u64,
        len: Option<u64>,
        progress: Progress<'_>,
    ) -> Result<(EraseRange, Duration)> {
        let len = self.rest_of_flash(offset, len)?;
        self.erase(offset, len, progress)
    }

    /// Write `len` bytes from `source` at `offset`. The range must already be
    /// erased.
    pub fn write<R: Read>(
        &mut self,
        offset: u64,
        source: R,
        len: u64,
        progress: Progress<'_>,
    ) -> Result<Duration> {
        let geometry = self.check_range(offset, len)?;
        let total = usize::try_from(len).unwrap_or(usize::MAX);
        let start = Instant::now();
        let written = write::write(
            &mut self.console,
            offset,
            source.take(len),
            geometry.page_size,
            total,
            &mut |current, total| progress(Stage::Write, current, total),
        )?;
        if written as u64 != len {
            return Err(Error::Precondition(format!(
                "source ended after {written} of {len} bytes"
            )));
        }
        Ok(start.elapsed())
    }

    /// Compare `len` bytes at `offset` with `source` by CRC.
    pub fn verify<R: Read>(&mut self, offset: u64, len: u64, source: R) -> Result<Duration> {
        self.check_range(offset, len)?;
        let start = Instant::now();
        verify::verify(&mut self.console, offset, len, source)?;
        Ok(start.elapsed())
    }

    /// Read flash into `sink`; `None` reads up to the end of flash.
    ///
    /// Returns the number of bytes read and the time taken.
    pub fn read_range<W: Write>(
        &mut self,
        offset: u64,
        len: Option<u64>,
        sink: &mut W,
        progress: Progress<'_>,
    ) -> Result<(u64, Duration)> {
        let len = self.rest_of_flash(offset, len)?;
        self.check_range(offset, len)?;
        let start = Instant::now();
        read::read(&mut self.console, offset, len, sink, &mut |current, total| {
            progress(Stage::Read, current, total);
        })?;
        Ok((len, start.elapsed()))
    }

    /// Erase, write and verify `source` at `offset`.
    ///
    /// The source is read twice: once for the write and once for the
    /// checksum. Nothing is erased when the image does not fit.
    pub fn program<R: Read + Seek>(
        &mut self,
        offset: u64,
        source: &mut R,
        progress: Progress<'_>,
    ) -> Result<ProgramReport> {
        let bytes = source.seek(SeekFrom::End(0))?;
        source.rewind()?;
        self.check_range(offset, bytes)?;

        let (erased, erase_time) = self.erase(offset, bytes, &mut *progress)?;
        debug!(
            "Erased {:#x} bytes in {:.2}s",
            erased.erased_len(),
            erase_time.as_secs_f64()
        );

        let write_time = self.write(offset, &mut *source, bytes, &mut *progress)?;
        debug!(
            "Wrote {bytes} bytes in {:.2}s ({:.1} KiB/s)",
            write_time.as_secs_f64(),
            kib_per_sec(bytes, write_time)
        );

        source.rewind()?;
        progress(Stage::Verify, 0, 1);
        let verify_time = self.verify(offset, bytes, &mut *source)?;
        progress(Stage::Verify, 1, 1);
        debug!("Verified in {:.2}s", verify_time.as_secs_f64());

        Ok(ProgramReport {
            offset,
            bytes,
            erased,
            erase_time,
            write_time,
            verify_time,
        })
    }

    /// End the session and release the port.
    pub fn close(self) -> Result<()> {
        self.console
            .into_port()
            .close()
    }
}

#[cfg(feature = "native")]
mod native_impl {
    use {
        super::Session,
        crate::{
            error::{Error, Result},
            port::{NativePort, Port, SerialConfig},
            protocol::console::{Console, ConsoleConfig},
        },
        log::{debug, warn},
        std::{thread, time::Duration},
    };

    const MAX_OPEN_PORT_ATTEMPTS: usize = 3;
    const OPEN_RETRY_DELAY: Duration = Duration::from_millis(500);

    impl Session<NativePort> {
        /// Open a serial port and start a session on it.
        pub fn open(serial: &SerialConfig, console: ConsoleConfig) -> Result<Self> {
            let mut last_error = None;

            for attempt in 1..=MAX_OPEN_PORT_ATTEMPTS {
                match NativePort::open(serial) {
                    Ok(port) => {
                        if attempt > 1 {
                            debug!("Port opened on attempt {attempt}");
                        }
                        debug!("Opened {} at {} baud", port.name(), port.baud_rate());
                        return Ok(Self::new(Console::new(port, console)));
                    },
                    Err(e) => {
                        warn!(
                            "Failed to open port {} (attempt {attempt}/{MAX_OPEN_PORT_ATTEMPTS}): {e}",
                            serial.port_name
                        );
                        last_error = Some(e);

                        if attempt < MAX_OPEN_PORT_ATTEMPTS {
                            thread::sleep(OPEN_RETRY_DELAY);
                        }
                    },
                }
            }

            Err(last_error.unwrap_or_else(|| {
                Error::Config(format!("cannot open {}", serial.port_name))
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::FlashPart;
    use crate::port::mock::{MockPort, command_line, init_logging, reply};
    use crate::protocol::{console::ConsoleConfig, crc::crc16_xmodem};
    use byteorder::{ByteOrder, LittleEndian};
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    const FLASH_SIZE: usize = 4 * 1024 * 1024;
    const SECTOR: usize = 64 * 1024;

    /// In-memory W25Q32 behind a QSPI flasher.
    #[derive(Clone)]
    struct SimFlash {
        memory: Arc<Mutex<Vec<u8>>>,
    }

    impl SimFlash {
        fn new() -> Self {
            Self {
                memory: Arc::new(Mutex::new(vec![0u8; FLASH_SIZE])),
            }
        }

        fn port(&self) -> MockPort {
            let memory = Arc::clone(&self.memory);
            let mut cursor: Option<usize> = None;
            let mut pending: Option<usize> = None;

            MockPort::new(move |written| {
                let mut memory = memory
                    .lock()
                    .unwrap();
                if let Some(at) = cursor {
                    if let Some(len) = pending.take() {
                        memory[at..at + len].copy_from_slice(written);
                        cursor = Some(at + len);
                        return b"R".to_vec();
                    }
                    let len = usize::from(LittleEndian::read_u16(&written[..2]));
                    if len == 0 {
                        cursor = None;
                        return b"#".to_vec();
                    }
                    pending = Some(len);
                    return Vec::new();
                }

                let line = command_line(written);
                let args: Vec<&str> = line
                    .split_whitespace()
                    .collect();
                let num = |s: &str| s.parse::<usize>().unwrap();
                match args.as_slice() {
                    [] => reply(&line, "QSPI Flasher\r\n"),
                    ["qspi", "1", "0"] => reply(&line, "Selected QSPI1\r\n"),
                    ["custom", "0x9f", "6"] => reply(&line, "ef 40 16 00 00 00\r\n"),
                    ["erase", at] => {
                        let at = num(*at);
                        memory[at..at + SECTOR].fill(0xFF);
                        reply(&line, "")
                    },
                    ["write", at, _page] => {
                        cursor = Some(num(*at));
                        reply(&line, "Ready\r\n")
                    },
                    ["readcrc", at, len] => {
                        let (at, len) = (num(*at), num(*len));
                        reply(&line, &format!("{:#x}\r\n", crc16_xmodem(&memory[at..at + len])))
                    },
                    ["read", at, len, "bin"] => {
                        let (at, len) = (num(*at), num(*len));
                        let mut out = reply(&line, "");
                        out.extend_from_slice(&memory[at..at + len]);
                        out.push(b'#');
                        out
                    },
                    _ => reply(&line, "Unknown command\r\n"),
                }
            })
        }
    }

    fn session(flash: &SimFlash) -> Session<MockPort> {
        init_logging();
        Session::new(Console::new(flash.port(), ConsoleConfig::default()))
    }

    fn identified(flash: &SimFlash) -> Session<MockPort> {
        let mut session = session(flash);
        session
            .bootstrap(&[], &mut |_, _, _| {})
            .unwrap();
        session
            .select_controller(QspiController::Qspi1, false)
            .unwrap();
        session
            .identify(&GeometryOverride::default())
            .unwrap();
        session
    }

    #[test]
    fn test_operations_require_identification() {
        let flash = SimFlash::new();
        let mut session = session(&flash);

        let err = session
            .erase(0, 0x100, &mut |_, _, _| {})
            .unwrap_err();

        assert!(matches!(err, Error::Precondition(_)));
        assert!(
            session
                .console()
                .port()
                .writes()
                .is_empty()
        );
    }

    #[test]
    fn test_identify_and_select() {
        let flash = SimFlash::new();
        let session = identified(&flash);

        assert_eq!(session.controller(), Some(QspiController::Qspi1));
        let profile = session
            .profile()
            .unwrap();
        assert_eq!(profile.name.as_deref(), Some("W25Q32"));
        assert_eq!(
            session
                .geometry()
                .unwrap()
                .total_size as usize,
            FLASH_SIZE
        );
    }

    #[test]
    fn test_program_then_read_back() {
        let flash = SimFlash::new();
        let mut session = identified(&flash);
        let image: Vec<u8> = (0..70_000u32)
            .map(|i| (i * 31 % 256) as u8)
            .collect();
        let mut stages = Vec::new();

        let report = session
            .program(0x10000, &mut Cursor::new(image.clone()), &mut |stage, _, _| {
                if stages.last() != Some(&stage) {
                    stages.push(stage);
                }
            })
            .unwrap();

        assert_eq!(report.bytes, 70_000);
        assert_eq!(report.erased.sector_count(), 2);
        assert!(report.erased.rounded());
        assert_eq!(stages, vec![Stage::Erase, Stage::Write, Stage::Verify]);

        let mut out = Vec::new();
        let (len, _) = session
            .read_range(0x10000, Some(70_000), &mut out, &mut |_, _, _| {})
            .unwrap();
        assert_eq!(len, 70_000);
        assert_eq!(out, image);
    }

    #[test]
    fn test_program_refuses_image_past_end() {
        let flash = SimFlash::new();
        let mut session = identified(&flash);
        let writes_before = session
            .console()
            .port()
            .writes()
            .len();

        let err = session
            .program(
                (FLASH_SIZE - SECTOR) as u64,
                &mut Cursor::new(vec![0u8; SECTOR + 1]),
                &mut |_, _, _| {},
            )
            .unwrap_err();

        assert!(matches!(err, Error::Precondition(_)));
        assert_eq!(
            session
                .console()
                .port()
                .writes()
                .len(),
            writes_before
        );
    }

    #[test]
    fn test_erase_rejects_misaligned_offset() {
        let flash = SimFlash::new();
        let mut session = identified(&flash);

        let err = session
            .erase(0x1000, 0x100, &mut |_, _, _| {})
            .unwrap_err();

        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn test_erase_range_defaults_to_rest_of_flash() {
        let flash = SimFlash::new();
        let mut session = identified(&flash);

        let (range, _) = session
            .erase_range((FLASH_SIZE - 2 * SECTOR) as u64, None, &mut |_, _, _| {})
            .unwrap();

        assert_eq!(range.sector_count(), 2);
        assert!(!range.rounded());
        let memory = flash
            .memory
            .lock()
            .unwrap();
        assert!(
            memory[FLASH_SIZE - 2 * SECTOR..]
                .iter()
                .all(|&b| b == 0xFF)
        );
        assert!(
            memory[..FLASH_SIZE - 2 * SECTOR]
                .iter()
                .all(|&b| b == 0)
        );
    }

    #[test]
    fn test_select_controller_forgets_profile() {
        let flash = SimFlash::new();
        let mut session = identified(&flash);

        let err = session
            .select_controller(QspiController::Qspi0, false)
            .unwrap_err();

        assert!(matches!(err, Error::Protocol(_)));
        assert!(
            session
                .profile()
                .is_none()
        );
        assert_eq!(session.controller(), None);
    }

    #[test]
    fn test_identify_with_custom_registry() {
        let flash = SimFlash::new();
        let mut registry = FlashRegistry::empty();
        registry.register(
            FlashPart::new(
                "W25Q32FV (4K sectors)",
                Geometry {
                    total_size: FLASH_SIZE as u32,
                    sector_size: 4 * 1024,
                    page_size: 256,
                },
                vec![0xEF, 0x40, 0x16],
            )
            .unwrap(),
        );
        let mut session = session(&flash).with_registry(registry);
        session
            .bootstrap(&[], &mut |_, _, _| {})
            .unwrap();
        session
            .select_controller(QspiController::Qspi1, false)
            .unwrap();

        let profile = session
            .identify(&GeometryOverride::default())
            .unwrap();

        assert_eq!(profile.name.as_deref(), Some("W25Q32FV (4K sectors)"));
        assert_eq!(
            session
                .geometry()
                .unwrap()
                .sector_size,
            4 * 1024
        );
    }

    #[test]
    fn test_kib_per_sec() {
        assert_eq!(kib_per_sec(2048, Duration::from_secs(2)), 1.0);
        assert_eq!(kib_per_sec(2048, Duration::ZERO), 0.0);
    }
}
