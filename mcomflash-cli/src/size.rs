//! Size and offset arguments.
//!
//! Plain numbers may be decimal or carry a `0x`/`0o`/`0b` prefix. Decimal
//! numbers may be followed by a dd-style suffix: `K`/`KiB` = 1024,
//! `M`/`MiB` = 1024², `kB` = 1000, `MB` = 1000² (case-insensitive).

use mcomflash::flasher::verify::parse_int;

const SUFFIXES: &[(&str, u64)] = &[
    ("kib", 1024),
    ("mib", 1024 * 1024),
    ("kb", 1000),
    ("mb", 1000 * 1000),
    ("k", 1024),
    ("m", 1024 * 1024),
];

/// Parse a size such as `65536`, `0x10000`, `64K` or `4MB`.
pub fn parse_size(text: &str) -> Result<u64, String> {
    let trimmed = text.trim();
    let lower = trimmed.to_ascii_lowercase();
    let invalid = || format!("invalid size '{text}' (examples: 65536, 0x10000, 128K, 4M, 128kB, 4MB)");

    if !lower.starts_with("0x") && !lower.starts_with("0o") && !lower.starts_with("0b") {
        for &(suffix, factor) in SUFFIXES {
            if let Some(number) = lower.strip_suffix(suffix) {
                return number
                    .trim()
                    .parse::<u64>()
                    .ok()
                    .and_then(|n| n.checked_mul(factor))
                    .ok_or_else(invalid);
            }
        }
    }

    parse_int(&lower).ok_or_else(invalid)
}

/// Parse a size that must fit the 32-bit flash address space.
pub fn parse_size_u32(text: &str) -> Result<u32, String> {
    let value = parse_size(text)?;
    u32::try_from(value).map_err(|_| format!("size '{text}' is too large"))
}
