//! Erase command implementation.

use anyhow::Result;
use console::style;

use super::{connect, erase_summary, print_timing};
use crate::progress::StageProgress;
use crate::{Settings, Target};

/// Erase command implementation.
pub(crate) fn cmd_erase(
    settings: &Settings,
    target: Target,
    offset: u64,
    size: Option<u64>,
) -> Result<()> {
    target.validate()?;

    let mut session = connect(settings, target)?;

    let mut progress = StageProgress::new(settings.show_progress);
    let result = session.erase_range(offset, size, &mut |stage, current, total| {
        progress.update(stage, current, total);
    });
    progress.finish();
    let (range, elapsed) = result?;
    session.close()?;

    settings.status(format!("{} {}", style("✓").green(), erase_summary(&range)));
    print_timing(settings, "Erase", elapsed, range.erased_len());
    Ok(())
}
