//! Flash command implementation.

use anyhow::{Context, Result};
use console::style;
use mcomflash::{NativePort, Session, format_size};
use std::fs::File;
use std::path::Path;

use super::{connect, erase_summary, print_timing};
use crate::progress::StageProgress;
use crate::{CliError, Settings, Target};

/// Flash command implementation.
pub(crate) fn cmd_flash(settings: &Settings, target: Target, image: &Path, offset: u64) -> Result<()> {
    target.validate()?;
    if !image.is_file() {
        return Err(CliError::Usage(format!("Image {} does not exist", image.display())).into());
    }

    let mut session = connect(settings, target)?;
    flash_file(settings, &mut session, image, offset)?;
    session.close()?;

    settings.status(format!("{} Flashing completed", style("✓").green()));
    Ok(())
}

/// Erase, write and verify one file at `offset` on an identified flash.
pub(crate) fn flash_file(
    settings: &Settings,
    session: &mut Session<NativePort>,
    image: &Path,
    offset: u64,
) -> Result<()> {
    let mut file =
        File::open(image).with_context(|| format!("Failed to open image {}", image.display()))?;
    let size = file
        .metadata()
        .with_context(|| format!("Failed to stat image {}", image.display()))?
        .len();

    let flash_size = u64::from(
        session
            .geometry()?
            .total_size,
    );
    if offset
        .checked_add(size)
        .is_none_or(|end| end > flash_size)
    {
        return Err(CliError::Precondition(format!(
            "{} ({}) at {offset:#x} doesn't fit to flash memory ({})",
            image.display(),
            format_size(size),
            format_size(flash_size)
        ))
        .into());
    }

    settings.status(format!(
        "{} Flashing {} ({size} bytes) at {offset:#x}",
        style("📦").cyan(),
        image.display()
    ));

    let mut progress = StageProgress::new(settings.show_progress);
    let result = session.program(offset, &mut file, &mut |stage, current, total| {
        progress.update(stage, current, total);
    });
    progress.finish();
    let report = result.with_context(|| format!("Failed to flash {}", image.display()))?;

    settings.status(format!("{} {}", style("✓").green(), erase_summary(&report.erased)));
    print_timing(settings, "Erase", report.erase_time, report.erased.erased_len());
    print_timing(settings, "Write", report.write_time, report.bytes);
    print_timing(settings, "Check", report.verify_time, report.bytes);
    print_timing(
        settings,
        "Total",
        report.total_time(),
        report.bytes,
    );
    Ok(())
}
