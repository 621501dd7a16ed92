//! Flash part profiles and the known-part registry.
//!
//! A [`FlashProfile`] is built once per session from the JEDEC ID bytes read
//! off the chip: the [`FlashRegistry`] is searched for the first part whose ID
//! is a prefix of the received bytes, and caller-supplied
//! [`GeometryOverride`]s are merged on top field by field.

use crate::error::{Error, Result};
use std::fmt;

const KIB: u32 = 1024;
const MIB: u32 = 1024 * KIB;

/// Built-in parts, in lookup order.
const BUILTIN_PARTS: &[(&str, u32, u32, u32, &[u8])] = &[
    ("M25P32", 4 * MIB, 64 * KIB, 256, &[0x20, 0x20, 0x16, 0x10]),
    ("S25FL128S", 16 * MIB, 64 * KIB, 256, &[0x01, 0x20, 0x18, 0x4D, 0x01, 0x80]),
    ("S25FL256S", 32 * MIB, 64 * KIB, 256, &[0x01, 0x02, 0x19, 0x4D, 0x01, 0x80]),
    ("W25Q32", 4 * MIB, 64 * KIB, 256, &[0xEF, 0x40, 0x16]),
    ("W25Q128JV-IN/IQ/JQ", 16 * MIB, 64 * KIB, 256, &[0xEF, 0x40, 0x18]),
    ("W25Q128JV-IM/JM", 16 * MIB, 64 * KIB, 256, &[0xEF, 0x70, 0x18]),
    ("W25Q128FW", 16 * MIB, 64 * KIB, 256, &[0xEF, 0x60, 0x18]),
];

/// Fully known flash geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Geometry {
    /// Total capacity in bytes.
    pub total_size: u32,
    /// Erase granularity in bytes.
    pub sector_size: u32,
    /// Write granularity in bytes.
    pub page_size: u32,
}

impl Geometry {
    /// Check the geometry invariants.
    pub fn validate(&self) -> Result<()> {
        if !self
            .sector_size
            .is_power_of_two()
        {
            return Err(Error::Config(format!(
                "erase sector size {} is not a power of two",
                self.sector_size
            )));
        }
        if !self
            .page_size
            .is_power_of_two()
        {
            return Err(Error::Config(format!(
                "page size {} is not a power of two",
                self.page_size
            )));
        }
        if self.page_size > u32::from(u16::MAX) {
            return Err(Error::Config(format!(
                "page size {} does not fit a block header",
                self.page_size
            )));
        }
        if self.total_size == 0 || self.total_size % self.sector_size != 0 {
            return Err(Error::Config(format!(
                "flash size {} is not a whole number of {}-byte sectors",
                self.total_size, self.sector_size
            )));
        }
        Ok(())
    }
}

/// A known flash part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashPart {
    /// Part name.
    pub name: String,
    /// Geometry of the part.
    pub geometry: Geometry,
    /// JEDEC ID signature, matched as a prefix.
    pub id_bytes: Vec<u8>,
}

impl FlashPart {
    /// Create a part description, checking its invariants.
    pub fn new(name: impl Into<String>, geometry: Geometry, id_bytes: Vec<u8>) -> Result<Self> {
        geometry.validate()?;
        if !(3..=6).contains(&id_bytes.len()) {
            return Err(Error::Config(format!(
                "ID signature must be 3 to 6 bytes, got {}",
                id_bytes.len()
            )));
        }
        Ok(Self {
            name: name.into(),
            geometry,
            id_bytes,
        })
    }

    /// Whether `id` starts with this part's signature.
    pub fn matches(&self, id: &[u8]) -> bool {
        id.starts_with(&self.id_bytes)
    }
}

/// Caller-supplied geometry replacing detected values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeometryOverride {
    /// Total size override.
    pub total_size: Option<u32>,
    /// Erase sector size override.
    pub sector_size: Option<u32>,
    /// Page size override.
    pub page_size: Option<u32>,
}

impl GeometryOverride {
    /// Whether no field is overridden.
    pub fn is_empty(&self) -> bool {
        self.total_size
            .is_none()
            && self
                .sector_size
                .is_none()
            && self
                .page_size
                .is_none()
    }
}

/// Flash chip found on a QSPI controller.
///
/// `name` is `None` when the part is unknown and the overrides did not fill
/// in the whole geometry; such a profile is unresolved and every erase, write
/// and read must be refused.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlashProfile {
    /// Part name, `"custom"` variants when overridden.
    pub name: Option<String>,
    /// Total size in bytes.
    pub total_size: Option<u32>,
    /// Erase sector size in bytes.
    pub sector_size: Option<u32>,
    /// Page size in bytes.
    pub page_size: Option<u32>,
    /// Raw ID bytes read from the chip.
    pub id_bytes: Vec<u8>,
}

impl FlashProfile {
    /// Profile of an unrecognised chip.
    pub fn unknown(id_bytes: Vec<u8>) -> Self {
        Self {
            name: None,
            total_size: None,
            sector_size: None,
            page_size: None,
            id_bytes,
        }
    }

    fn from_part(part: &FlashPart, id_bytes: Vec<u8>) -> Self {
        Self {
            name: Some(
                part.name
                    .clone(),
            ),
            total_size: Some(
                part.geometry
                    .total_size,
            ),
            sector_size: Some(
                part.geometry
                    .sector_size,
            ),
            page_size: Some(
                part.geometry
                    .page_size,
            ),
            id_bytes,
        }
    }

    /// Whether the whole geometry is known.
    pub fn is_resolved(&self) -> bool {
        self.name
            .is_some()
            && self
                .geometry_fields()
                .is_some()
    }

    fn geometry_fields(&self) -> Option<Geometry> {
        Some(Geometry {
            total_size: self.total_size?,
            sector_size: self.sector_size?,
            page_size: self.page_size?,
        })
    }

    /// Geometry of a resolved profile.
    pub fn geometry(&self) -> Result<Geometry> {
        match self.geometry_fields() {
            Some(geometry) if self.is_resolved() => Ok(geometry),
            _ => Err(Error::Precondition(format!(
                "unknown SPI flash (ID: {}); specify flash size, erase sector and page size",
                format_id(&self.id_bytes)
            ))),
        }
    }

    /// Merge overrides into this profile.
    ///
    /// Each field takes the override when given, else the detected value. If
    /// the result still has a gap the profile is returned unchanged.
    pub fn with_overrides(self, overrides: &GeometryOverride) -> Result<Self> {
        if overrides.is_empty() {
            return Ok(self);
        }

        let merged = (
            overrides
                .total_size
                .or(self.total_size),
            overrides
                .sector_size
                .or(self.sector_size),
            overrides
                .page_size
                .or(self.page_size),
        );
        let (Some(total_size), Some(sector_size), Some(page_size)) = merged else {
            return Ok(self);
        };

        let geometry = Geometry {
            total_size,
            sector_size,
            page_size,
        };
        geometry.validate()?;

        let name = match &self.name {
            Some(base) => format!("custom (based on {base})"),
            None => "custom".to_string(),
        };
        Ok(Self {
            name: Some(name),
            total_size: Some(total_size),
            sector_size: Some(sector_size),
            page_size: Some(page_size),
            id_bytes: self.id_bytes,
        })
    }
}

impl fmt::Display for FlashProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.name, self.geometry_fields()) {
            (Some(name), Some(g)) => write!(
                f,
                "{name} (size: {}, erase sector: {}, page: {})",
                format_size(u64::from(g.total_size)),
                format_size(u64::from(g.sector_size)),
                format_size(u64::from(g.page_size))
            ),
            _ => write!(f, "unknown (ID: {})", format_id(&self.id_bytes)),
        }
    }
}

/// Ordered table of known parts.
#[derive(Debug, Clone)]
pub struct FlashRegistry {
    parts: Vec<FlashPart>,
}

impl FlashRegistry {
    /// Registry holding the built-in parts.
    pub fn builtin() -> Self {
        let parts = BUILTIN_PARTS
            .iter()
            .map(|&(name, total_size, sector_size, page_size, id)| FlashPart {
                name: name.to_string(),
                geometry: Geometry {
                    total_size,
                    sector_size,
                    page_size,
                },
                id_bytes: id.to_vec(),
            })
            .collect();
        Self { parts }
    }

    /// Registry with no parts at all.
    pub fn empty() -> Self {
        Self { parts: Vec::new() }
    }

    /// Parts in lookup order.
    pub fn parts(&self) -> &[FlashPart] {
        &self.parts
    }

    /// Add a part.
    ///
    /// The part is placed ahead of any entry whose signature is a prefix of
    /// its own, so a shorter signature never masks it.
    pub fn register(&mut self, part: FlashPart) {
        let position = self
            .parts
            .iter()
            .position(|p| p.matches(&part.id_bytes))
            .unwrap_or(
                self.parts
                    .len(),
            );
        self.parts
            .insert(position, part);
    }

    /// First part whose signature prefixes `id`.
    pub fn lookup(&self, id: &[u8]) -> Option<&FlashPart> {
        self.parts
            .iter()
            .find(|p| p.matches(id))
    }

    /// Build the session profile for `id`, merging `overrides`.
    pub fn resolve(&self, id: &[u8], overrides: &GeometryOverride) -> Result<FlashProfile> {
        let detected = match self.lookup(id) {
            Some(part) => FlashProfile::from_part(part, id.to_vec()),
            None => FlashProfile::unknown(id.to_vec()),
        };
        detected.with_overrides(overrides)
    }
}

impl Default for FlashRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// QSPI controller of the SoC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QspiController {
    /// QSPI0, boot flash, fixed 3.3 V.
    Qspi0,
    /// QSPI1, 3.3 V or 1.8 V.
    Qspi1,
}

impl QspiController {
    /// Controller index used on the wire.
    pub fn index(self) -> u8 {
        match self {
            Self::Qspi0 => 0,
            Self::Qspi1 => 1,
        }
    }

    /// Whether the controller can be switched to 1.8 V.
    pub fn supports_1v8(self) -> bool {
        matches!(self, Self::Qspi1)
    }

    /// Parse `qspi0`, `QSPI1`, `0`, `1`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name
            .to_lowercase()
            .as_str()
        {
            "qspi0" | "0" => Some(Self::Qspi0),
            "qspi1" | "1" => Some(Self::Qspi1),
            _ => None,
        }
    }
}

impl fmt::Display for QspiController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QSPI{}", self.index())
    }
}

/// Render a byte count with the largest binary unit that divides it exactly.
pub fn format_size(mut value: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut unit = 0;
    while value != 0 && value % 1024 == 0 && unit < UNITS.len() - 1 {
        value /= 1024;
        unit += 1;
    }
    format!("{value} {}", UNITS[unit])
}

/// Render ID bytes as `0xef, 0x40, 0x18`.
pub fn format_id(id: &[u8]) -> String {
    id.iter()
        .map(|b| format!("{b:#x}"))
        .collect::<Vec<_>>()
        .join(", ")
}
