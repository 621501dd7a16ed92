//! Command implementations.
//!
//! Every command starts from [`connect`], which brings the flasher up and
//! identifies the flash on the requested controller.

pub(crate) mod erase;
pub(crate) mod flash;
pub(crate) mod read;
pub(crate) mod trusted;

use anyhow::{Context, Result};
use console::style;
use mcomflash::chip::format_id;
use mcomflash::{
    BootstrapOutcome, ConsoleConfig, EraseRange, Error, NativePort, SerialConfig, Session,
};
use std::{fs, io, time::Duration};

use crate::progress::StageProgress;
use crate::{CliError, Settings, Target};

/// Open the port, start the flasher and identify the flash behind `target`.
pub(crate) fn connect(settings: &Settings, target: Target) -> Result<Session<NativePort>> {
    target.validate()?;

    let flasher_path = settings.flasher_image()?;
    let image = fs::read(&flasher_path)
        .with_context(|| format!("Failed to read flasher image {}", flasher_path.display()))?;

    settings.status(format!(
        "{} Using port {} at {} baud",
        style("🔌").cyan(),
        settings.port,
        settings.baud
    ));
    let serial = SerialConfig::new(&settings.port, settings.baud);
    let mut session = Session::open(&serial, ConsoleConfig::default()).map_err(|e| match e {
        Error::Serial(_) | Error::Io(_) => anyhow::Error::from(CliError::DeviceNotFound(format!(
            "Cannot open serial port {}: {e}",
            settings.port
        ))),
        other => other.into(),
    })?;
    if settings.show_traffic {
        session
            .console_mut()
            .set_echo(Some(Box::new(io::stderr())));
    }

    let mut progress = StageProgress::new(settings.show_progress);
    let outcome = session.bootstrap(&image, &mut |stage, current, total| {
        progress.update(stage, current, total);
    });
    progress.finish();
    match outcome? {
        BootstrapOutcome::AlreadyRunning => settings.status(format!(
            "{} Flasher is already running",
            style("✓").green()
        )),
        BootstrapOutcome::Uploaded => settings.status(format!(
            "{} Flasher uploaded from {}",
            style("✓").green(),
            flasher_path.display()
        )),
    }

    let controller = target.controller();
    session.select_controller(controller, target.voltage_1v8())?;

    let profile = session.identify(&settings.overrides)?;
    if !profile.is_resolved() {
        eprintln!(
            "{} Unknown SPI flash on {controller} (ID: {})",
            style("✗").red(),
            format_id(&profile.id_bytes)
        );
        eprintln!(
            "    {} Pass --flash-size, --flash-sector and --flash-page to use it anyway",
            style("•").dim()
        );
        return Err(CliError::Precondition(format!(
            "flash geometry on {controller} is unknown"
        ))
        .into());
    }
    settings.status(format!(
        "{} Found {profile} on {controller}",
        style("ℹ").blue()
    ));

    Ok(session)
}

/// Print one timing line of a summary.
pub(crate) fn print_timing(settings: &Settings, label: &str, elapsed: Duration, bytes: u64) {
    let rate = mcomflash::kib_per_sec(bytes, elapsed);
    settings.status(format!(
        "    {} {label:<6} {:>8.2} s ({rate:.1} KiB/s)",
        style("•").dim(),
        elapsed.as_secs_f64()
    ));
}

/// Past-tense summary of a finished erase, noting when it was rounded up.
pub(crate) fn erase_summary(range: &EraseRange) -> String {
    let mut summary = format!(
        "Erased {} sector(s) from {:#x} ({:#x} bytes)",
        range.sector_count(),
        range.start(),
        range.erased_len()
    );
    if range.rounded() {
        summary.push_str(&format!(
            ", rounded up from the requested {:#x} bytes",
            range.requested_len()
        ));
    }
    summary
}
