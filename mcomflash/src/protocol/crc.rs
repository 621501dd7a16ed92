//! CRC-16 used by the flasher for block and whole-range checks.
//!
//! Polynomial 0x1021, seed 0xFFFF, no reflection, no final XOR. The flasher
//! firmware calls it "XMODEM"; the catalogued name is CRC-16/IBM-3740.

use crc::{CRC_16_IBM_3740, Crc, Digest};

static FLASHER_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Seed value, also the checksum of an empty input.
pub const CRC16_INIT: u16 = 0xFFFF;

/// Compute the checksum of `data` in one go.
pub fn crc16_xmodem(data: &[u8]) -> u16 {
    FLASHER_CRC.checksum(data)
}

/// Incremental checksum for data that arrives in pieces.
pub struct Crc16 {
    digest: Digest<'static, u16>,
    len: usize,
}

impl Crc16 {
    /// Start a new checksum.
    pub fn new() -> Self {
        Self {
            digest: FLASHER_CRC.digest(),
            len: 0,
        }
    }

    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        self.digest
            .update(data);
        self.len += data.len();
    }

    /// Number of bytes fed so far.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no bytes were fed yet.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Finish and return the checksum.
    pub fn finalize(self) -> u16 {
        self.digest
            .finalize()
    }
}

impl Default for Crc16 {
    fn default() -> Self {
        Self::new()
    }
}
