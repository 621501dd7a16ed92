//! Read command implementation.

use anyhow::{Context, Result};
use console::style;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use super::{connect, print_timing};
use crate::progress::StageProgress;
use crate::{Settings, Target};

/// Read command implementation.
pub(crate) fn cmd_read(
    settings: &Settings,
    target: Target,
    file: &Path,
    offset: u64,
    size: Option<u64>,
) -> Result<()> {
    target.validate()?;

    let mut session = connect(settings, target)?;

    let output =
        File::create(file).with_context(|| format!("Failed to create {}", file.display()))?;
    let mut sink = BufWriter::new(output);

    let mut progress = StageProgress::new(settings.show_progress);
    let result = session.read_range(offset, size, &mut sink, &mut |stage, current, total| {
        progress.update(stage, current, total);
    });
    progress.finish();
    let (bytes, elapsed) =
        result.with_context(|| format!("Failed to read flash into {}", file.display()))?;
    session.close()?;

    settings.status(format!(
        "{} Read {bytes} bytes from {offset:#x} into {}",
        style("✓").green(),
        file.display()
    ));
    print_timing(settings, "Read", elapsed, bytes);
    Ok(())
}
