//! Block write with per-block CRC and bounded retransmission.
//!
//! After `write <offset> <page>` the flasher expects a stream of blocks, each
//! preceded by a 4-byte header:
//!
//! ```text
//! +--------+--------+----------------+
//! | len LE | crc LE | len bytes data |
//! +--------+--------+----------------+
//!   u16      u16
//! ```
//!
//! Each block is answered with a single character: `R` (stored, send the
//! next one) or `C` (corrupt, send it again). A block with `len == 0` ends
//! the stream and the flasher returns to its prompt.

use {
    crate::{
        error::{Error, Result},
        port::Port,
        protocol::{console::Console, crc::crc16_xmodem},
    },
    byteorder::{LittleEndian, WriteBytesExt},
    log::{debug, trace, warn},
    std::io::{self, Read},
};

/// Block accepted marker.
pub const READY_MARKER: &str = "R";

/// Block corrupt marker.
pub const CORRUPT_MARKER: &str = "C";

/// Transmissions of a single block before the write is abandoned.
pub const MAX_BLOCK_ATTEMPTS: usize = 3;

/// Marker printed when the flasher accepts a `write` command.
const WRITE_READY_MARKER: &str = "Ready";

/// Length and checksum sent ahead of each block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Payload length.
    pub len: u16,
    /// CRC-16 of the payload.
    pub crc: u16,
}

impl BlockHeader {
    /// Header describing `payload`.
    pub fn for_payload(payload: &[u8]) -> Result<Self> {
        let len = u16::try_from(payload.len()).map_err(|_| {
            Error::Precondition(format!("block of {} bytes is too large", payload.len()))
        })?;
        Ok(Self {
            len,
            crc: crc16_xmodem(payload),
        })
    }

    /// Wire encoding.
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(4);
        buf.write_u16::<LittleEndian>(self.len)?;
        buf.write_u16::<LittleEndian>(self.crc)?;
        Ok(buf)
    }
}

/// Size of the first block so that every following block is page aligned.
pub fn first_block_len(offset: u64, page_size: u32) -> usize {
    let page = u64::from(page_size);
    // Lossless: the result is at most `page_size`.
    (page - offset % page) as usize
}

/// Write everything `source` yields to flash at `offset`.
///
/// `total` is only used for progress reporting. Returns the number of bytes
/// written.
pub fn write<P: Port, R: Read>(
    console: &mut Console<P>,
    offset: u64,
    mut source: R,
    page_size: u32,
    total: usize,
    progress: &mut dyn FnMut(usize, usize),
) -> Result<usize> {
    if page_size == 0 || page_size > u32::from(u16::MAX) {
        return Err(Error::Precondition(format!("invalid page size {page_size}")));
    }

    let command = format!("write {offset} {page_size}");
    let response = console.run(&command)?;
    if !response.contains(WRITE_READY_MARKER) {
        return Err(Error::Protocol(format!(
            "flasher is not ready for write: {response:?}"
        )));
    }

    let mut written = 0usize;
    let mut block_len = first_block_len(offset, page_size);
    let mut block = vec![0u8; page_size as usize];
    progress(0, total);

    loop {
        let n = fill(&mut source, &mut block[..block_len])?;
        let payload = &block[..n];
        send_block(console, payload, written)?;
        if payload.is_empty() {
            break;
        }
        written += n;
        progress(written, total);
        block_len = page_size as usize;
    }

    console
        .wait_for_prompt()?
        .require("waiting for the flasher prompt after the last block")?;
    debug!("Wrote {written} bytes at {offset:#x}");
    Ok(written)
}

/// Send one block, retransmitting on a corrupt marker.
///
/// `position` is the block's offset within the source stream, used only for
/// diagnostics. A missing acknowledgement is fatal and does not consume an
/// attempt.
fn send_block<P: Port>(console: &mut Console<P>, payload: &[u8], position: usize) -> Result<()> {
    let header = BlockHeader::for_payload(payload)?.encode()?;
    if payload.is_empty() {
        trace!("Sending end-of-stream block");
        return console.write_raw(&header);
    }

    let timeout = console
        .config()
        .wait_timeout;
    for attempt in 1..=MAX_BLOCK_ATTEMPTS {
        trace!("Block at {position:#x}, {} bytes, attempt {attempt}", payload.len());
        console.write_raw(&header)?;
        console.write_raw(payload)?;

        let ack = console
            .wait_for(&[READY_MARKER, CORRUPT_MARKER], Some(timeout))?
            .require(format!("waiting for acknowledgement of block at {position:#x}"))?;
        if ack.ends_with(READY_MARKER) {
            return Ok(());
        }
        warn!(
            "Block at {position:#x} rejected ({ack:?}), attempt {attempt} of {MAX_BLOCK_ATTEMPTS}"
        );
    }

    Err(Error::CrcThresholdExceeded {
        offset: position,
        attempts: MAX_BLOCK_ATTEMPTS,
    })
}

/// Read until `buf` is full or the source is exhausted.
fn fill<R: Read>(source: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(filled)
}
