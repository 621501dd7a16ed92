//! Sector erase.

use {
    crate::{
        error::{Error, Result},
        port::Port,
        protocol::console::Console,
    },
    log::debug,
    std::{fmt, time::Duration},
};

/// Deadline for a single sector erase.
pub const ERASE_TIMEOUT: Duration = Duration::from_secs(10);

/// Marker the flasher prints when an erase fails.
const ERROR_MARKER: &str = "Error";

/// Sectors covering a requested byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EraseRange {
    first_sector: u64,
    sector_count: u64,
    sector_size: u64,
    requested: u64,
}

impl EraseRange {
    /// Plan the erase of `[offset, offset + length)`.
    ///
    /// The start is rounded down and the end up to sector boundaries. Use
    /// [`EraseRange::aligned`] when the offset must already sit on a sector.
    pub fn covering(offset: u64, length: u64, sector_size: u32) -> Result<Self> {
        if sector_size == 0 {
            return Err(Error::Precondition("erase sector size is zero".to_string()));
        }
        let sector_size = u64::from(sector_size);
        let first_sector = offset / sector_size;
        let end_sector = offset
            .checked_add(length)
            .ok_or_else(|| Error::Precondition("erase range overflows".to_string()))?
            .div_ceil(sector_size);

        Ok(Self {
            first_sector,
            sector_count: end_sector.saturating_sub(first_sector),
            sector_size,
            requested: length,
        })
    }

    /// Like [`EraseRange::covering`], but refuses an offset that is not on a
    /// sector boundary.
    pub fn aligned(offset: u64, length: u64, sector_size: u32) -> Result<Self> {
        if sector_size != 0 && offset % u64::from(sector_size) != 0 {
            return Err(Error::Precondition(format!(
                "offset {offset:#x} is not aligned to the erase sector size {sector_size:#x}"
            )));
        }
        Self::covering(offset, length, sector_size)
    }

    /// Index of the first sector.
    pub fn first_sector(&self) -> u64 {
        self.first_sector
    }

    /// Number of sectors to erase.
    pub fn sector_count(&self) -> u64 {
        self.sector_count
    }

    /// Byte offset of the first sector.
    pub fn start(&self) -> u64 {
        self.first_sector * self.sector_size
    }

    /// Bytes requested by the caller.
    pub fn requested_len(&self) -> u64 {
        self.requested
    }

    /// Bytes that will actually be erased.
    pub fn erased_len(&self) -> u64 {
        self.sector_count * self.sector_size
    }

    /// Whether more bytes are erased than were requested.
    pub fn rounded(&self) -> bool {
        self.erased_len() != self.requested
    }

    /// Byte offsets of every sector, ascending.
    pub fn sector_offsets(&self) -> impl Iterator<Item = u64> + '_ {
        (self.first_sector..self.first_sector + self.sector_count).map(|s| s * self.sector_size)
    }
}

impl fmt::Display for EraseRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rounded() {
            write!(
                f,
                "Erasing {:#x} bytes, rounded to {:#x} bytes ({} sectors, starting from {})",
                self.requested,
                self.erased_len(),
                self.sector_count,
                self.first_sector
            )
        } else {
            write!(
                f,
                "Erasing {:#x} bytes ({} sectors, starting from {})",
                self.requested, self.sector_count, self.first_sector
            )
        }
    }
}

/// Erase one sector.
pub fn erase_sector<P: Port>(console: &mut Console<P>, offset: u64) -> Result<()> {
    debug!("Erasing sector at {offset:#x}");
    let command = format!("erase {offset}");
    let response = console
        .execute(&command, Some(ERASE_TIMEOUT), true)?
        .require(format!("erasing sector at {offset:#x}, flash is not ready"))?;
    if response.contains(ERROR_MARKER) {
        return Err(Error::Device(format!(
            "erase of sector at {offset:#x} failed: {}",
            response.trim()
        )));
    }
    Ok(())
}

/// Erase every sector of `range`, stopping at the first failure.
pub fn erase<P: Port>(
    console: &mut Console<P>,
    range: &EraseRange,
    progress: &mut dyn FnMut(usize, usize),
) -> Result<()> {
    debug!("{range}");
    let total = usize::try_from(range.sector_count()).unwrap_or(usize::MAX);
    progress(0, total);
    for (done, offset) in range
        .sector_offsets()
        .enumerate()
    {
        erase_sector(console, offset)?;
        progress(done + 1, total);
    }
    Ok(())
}
