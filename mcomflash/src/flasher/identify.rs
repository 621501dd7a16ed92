//! Controller selection and flash identification.

use {
    crate::{
        chip::{FlashProfile, FlashRegistry, GeometryOverride, QspiController, format_id},
        error::{Error, Result},
        port::Port,
        protocol::console::Console,
    },
    log::debug,
};

/// Raw SPI transaction: opcode 0x9F (JEDEC READ ID), 6 response bytes.
pub const READ_ID_COMMAND: &str = "custom 0x9f 6";

/// Marker printed by `qspi` on success.
const SELECTED_MARKER: &str = "Selected";

/// Switch the flasher to `controller`, powering it at 1.8 V if requested.
pub fn select_controller<P: Port>(
    console: &mut Console<P>,
    controller: QspiController,
    voltage_1v8: bool,
) -> Result<()> {
    if voltage_1v8 && !controller.supports_1v8() {
        return Err(Error::Precondition(format!(
            "{controller} does not support 1.8 V"
        )));
    }

    let command = format!("qspi {} {}", controller.index(), u8::from(voltage_1v8));
    let response = console.run(&command)?;
    if !response.contains(SELECTED_MARKER) {
        return Err(Error::Protocol(format!(
            "failed to select {controller}: {response:?}"
        )));
    }
    debug!("Selected {controller} ({})", if voltage_1v8 { "1.8 V" } else { "3.3 V" });
    Ok(())
}

/// Read the raw device ID bytes.
pub fn read_id<P: Port>(console: &mut Console<P>) -> Result<Vec<u8>> {
    let response = console.run(READ_ID_COMMAND)?;
    parse_id_bytes(&response)
}

/// Parse a whitespace-separated list of hex bytes, `0x` prefix optional.
pub fn parse_id_bytes(text: &str) -> Result<Vec<u8>> {
    let bytes = text
        .split_whitespace()
        .map(|token| {
            let digits = token
                .strip_prefix("0x")
                .or_else(|| token.strip_prefix("0X"))
                .unwrap_or(token);
            u8::from_str_radix(digits, 16)
                .map_err(|_| Error::Protocol(format!("invalid ID byte {token:?} in {text:?}")))
        })
        .collect::<Result<Vec<u8>>>()?;

    if bytes.is_empty() {
        return Err(Error::Protocol(format!("no ID bytes in {text:?}")));
    }
    Ok(bytes)
}

/// Read the ID and resolve it against `registry` with `overrides` applied.
pub fn identify<P: Port>(
    console: &mut Console<P>,
    registry: &FlashRegistry,
    overrides: &GeometryOverride,
) -> Result<FlashProfile> {
    let id = read_id(console)?;
    debug!("Flash ID: {}", format_id(&id));

    let profile = registry.resolve(&id, overrides)?;
    debug!("Found SPI flash: {profile}");
    Ok(profile)
}
