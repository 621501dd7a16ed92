//! Whole-range CRC verification.

use {
    crate::{
        error::{Error, Result},
        port::Port,
        protocol::{console::Console, crc::Crc16},
    },
    log::debug,
    std::{
        io::{self, Read},
        time::Duration,
    },
};

/// Fixed part of the `readcrc` deadline.
const READCRC_BASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for `readcrc` over `len` bytes: 5 s plus 1 s per 10 000 bytes.
pub fn readcrc_timeout(len: u64) -> Duration {
    READCRC_BASE_TIMEOUT + Duration::from_micros(len.saturating_mul(100))
}

/// Parse an integer literal with an optional `0x`, `0o` or `0b` prefix.
pub fn parse_int(text: &str) -> Option<u64> {
    let text = text.trim();
    let lower = text.to_ascii_lowercase();
    let (digits, radix) = if let Some(rest) = lower.strip_prefix("0x") {
        (rest, 16)
    } else if let Some(rest) = lower.strip_prefix("0o") {
        (rest, 8)
    } else if let Some(rest) = lower.strip_prefix("0b") {
        (rest, 2)
    } else {
        (lower.as_str(), 10)
    };
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, radix).ok()
}

/// Ask the flasher for the CRC of `len` bytes at `offset`.
pub fn read_crc<P: Port>(console: &mut Console<P>, offset: u64, len: u64) -> Result<u16> {
    let command = format!("readcrc {offset} {len}");
    let response = console.run_with_timeout(&command, readcrc_timeout(len))?;
    parse_int(&response)
        .and_then(|value| u16::try_from(value).ok())
        .ok_or_else(|| Error::Protocol(format!("unexpected readcrc response {response:?}")))
}

/// Check that the `len` bytes at `offset` match the first `len` bytes of
/// `source`.
///
/// Returns the matching CRC.
pub fn verify<P: Port, R: Read>(
    console: &mut Console<P>,
    offset: u64,
    len: u64,
    source: R,
) -> Result<u16> {
    let expected = checksum(source, len)?;
    let actual = read_crc(console, offset, len)?;
    debug!("CRC at {offset:#x}+{len:#x}: expected {expected:#06x}, read {actual:#06x}");
    if expected != actual {
        return Err(Error::CrcMismatch { expected, actual });
    }
    Ok(actual)
}

/// CRC of exactly `len` bytes of `source`.
fn checksum<R: Read>(source: R, len: u64) -> Result<u16> {
    let mut crc = Crc16::new();
    let mut limited = source.take(len);
    let mut buf = [0u8; 4096];
    loop {
        match limited.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => crc.update(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) => return Err(Error::Io(e)),
        }
    }
    if crc.len() as u64 != len {
        return Err(Error::Precondition(format!(
            "source holds {} bytes, {len} expected",
            crc.len()
        )));
    }
    Ok(crc.finalize())
}
