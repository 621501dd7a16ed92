//! Trusted-loader image sets (`flash-tl`, `flash-tl-dir`).

use anyhow::{Context, Result, bail};
use console::style;
use log::debug;
use mcomflash::QspiController;
use std::fs;
use std::path::{Path, PathBuf};

use super::{connect, flash::flash_file, print_timing};
use crate::progress::StageProgress;
use crate::{CliError, Settings, Target};

/// Offsets of the BootROM image, SBL-TL image and SBL-TL OTP image.
const TL_OFFSETS: [u64; 3] = [0x0, 0x20_0000, 0xA0_0000];

/// The trusted loader keeps its non-volatile settings in two pages here.
const TL_SETTINGS_OFFSET: u64 = 0xC1_0000;
const TL_SETTINGS_SIZE: u64 = 128 * 1024;

/// Placeholder that skips an image.
const SKIP_IMAGE: &str = "_";

/// `flash-tl` command implementation.
pub(crate) fn cmd_flash_tl(settings: &Settings, target: Target, images: [&PathBuf; 3]) -> Result<()> {
    if target.controller() != QspiController::Qspi0 {
        return Err(CliError::Usage(format!(
            "Unsupported QSPI controller for trusted loader images: {}",
            target.controller()
        ))
        .into());
    }
    target.validate()?;

    let patterns = images.map(|path| path.to_string_lossy().into_owned());
    let resolved = resolve_images(Path::new(""), &patterns)?;
    flash_images(settings, target, &resolved)
}

/// `flash-tl-dir` command implementation.
pub(crate) fn cmd_flash_tl_dir(
    settings: &Settings,
    target: Target,
    dir: &Path,
    patterns: &[String],
) -> Result<()> {
    target.validate()?;
    if !dir.is_dir() {
        return Err(
            CliError::Usage(format!("Path {} is not a valid directory", dir.display())).into(),
        );
    }
    if patterns.len() != TL_OFFSETS.len() {
        return Err(CliError::Usage(format!(
            "Wrong number of images is provided: expected {}, got {}",
            TL_OFFSETS.len(),
            patterns.len()
        ))
        .into());
    }

    let resolved = resolve_images(dir, patterns)?;
    flash_images(settings, target, &resolved)
}

/// Resolve every pattern up front so a missing image fails before any flashing.
fn resolve_images(dir: &Path, patterns: &[String]) -> Result<Vec<Option<PathBuf>>> {
    patterns
        .iter()
        .map(|pattern| {
            if pattern == SKIP_IMAGE {
                return Ok(None);
            }
            match find_image(dir, pattern)? {
                Some(path) => Ok(Some(path)),
                None => bail!("Wrong path to {pattern}"),
            }
        })
        .collect()
}

fn flash_images(settings: &Settings, target: Target, images: &[Option<PathBuf>]) -> Result<()> {
    let mut session = connect(settings, target)?;

    for (offset, image) in TL_OFFSETS
        .iter()
        .zip(images)
    {
        let Some(image) = image else {
            debug!("Skipping image at {offset:#x}");
            continue;
        };
        flash_file(settings, &mut session, image, *offset)?;
    }

    settings.status(format!(
        "{} Clearing trusted loader settings at {TL_SETTINGS_OFFSET:#x}",
        style("🧹").cyan()
    ));
    let mut progress = StageProgress::new(settings.show_progress);
    let result = session.erase(TL_SETTINGS_OFFSET, TL_SETTINGS_SIZE, &mut |stage, current, total| {
        progress.update(stage, current, total);
    });
    progress.finish();
    let (range, elapsed) = result.context("Failed to clear trusted loader settings")?;
    print_timing(settings, "Erase", elapsed, range.erased_len());

    session.close()?;
    settings.status(format!("{} Flashing completed", style("✓").green()));
    Ok(())
}

/// First file (in name order) matching `pattern` relative to `dir`.
///
/// Only the last path component may contain wildcards.
pub(crate) fn find_image(dir: &Path, pattern: &str) -> Result<Option<PathBuf>> {
    let candidate = dir.join(pattern);
    let Some(file_pattern) = candidate
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
    else {
        return Ok(None);
    };

    if !file_pattern.contains(['*', '?']) {
        return Ok(candidate
            .is_file()
            .then_some(candidate));
    }

    let parent = match candidate.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let entries = match fs::read_dir(&parent) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Cannot list {}: {e}", parent.display());
            return Ok(None);
        },
    };

    let mut matches = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to list {}", parent.display()))?;
        let name = entry
            .file_name()
            .to_string_lossy()
            .into_owned();
        // Like shell globs, wildcards do not match hidden files.
        if name.starts_with('.') && !file_pattern.starts_with('.') {
            continue;
        }
        if wildcard_match(&file_pattern, &name) && entry.path().is_file() {
            matches.push(entry.path());
        }
    }
    matches.sort();
    Ok(matches
        .into_iter()
        .next())
}

/// Match `name` against a pattern where `*` is any run and `?` any one character.
pub(crate) fn wildcard_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern
        .chars()
        .collect();
    let name: Vec<char> = name
        .chars()
        .collect();

    let (mut p, mut n) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while n < name.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, n));
                p += 1;
            },
            Some(&c) if c == '?' || c == name[n] => {
                p += 1;
                n += 1;
            },
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    n = matched + 1;
                    backtrack = Some((star, matched + 1));
                },
                None => return false,
            },
        }
    }
    pattern[p..]
        .iter()
        .all(|&c| c == '*')
}
