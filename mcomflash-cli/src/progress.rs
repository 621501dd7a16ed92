//! Progress bars driven by the library's stage callbacks.

use {
    indicatif::{ProgressBar, ProgressStyle},
    mcomflash::Stage,
};

const BYTES_TEMPLATE: &str =
    "{msg:>10} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({binary_bytes_per_sec}, {eta})";
const SECTORS_TEMPLATE: &str = "{msg:>10} [{bar:40.cyan/blue}] {pos}/{len} sectors ({eta})";
const STEP_TEMPLATE: &str = "{spinner:.green} {msg}";

/// One bar per stage; a new bar starts whenever the stage changes.
pub(crate) struct StageProgress {
    enabled: bool,
    stage: Option<Stage>,
    bar: ProgressBar,
}

impl StageProgress {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            stage: None,
            bar: ProgressBar::hidden(),
        }
    }

    pub(crate) fn update(&mut self, stage: Stage, current: usize, total: usize) {
        if self.stage != Some(stage) {
            self.bar
                .finish();
            self.bar = self.start(stage, total);
            self.stage = Some(stage);
        }
        self.bar
            .set_length(total as u64);
        self.bar
            .set_position(current as u64);
    }

    pub(crate) fn finish(&mut self) {
        self.bar
            .finish();
        self.stage = None;
    }

    fn start(&self, stage: Stage, total: usize) -> ProgressBar {
        if !self.enabled {
            return ProgressBar::hidden();
        }
        let template = match stage {
            Stage::Erase => SECTORS_TEMPLATE,
            Stage::Verify => STEP_TEMPLATE,
            Stage::Upload | Stage::Write | Stage::Read => BYTES_TEMPLATE,
        };
        let style = ProgressStyle::with_template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        let bar = ProgressBar::new(total as u64).with_style(style);
        bar.set_message(stage.to_string());
        bar
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_progress_tracks_stages() {
        let mut progress = StageProgress::new(false);
        progress.update(Stage::Erase, 0, 4);
        progress.update(Stage::Erase, 4, 4);
        assert_eq!(progress.bar.position(), 4);

        progress.update(Stage::Write, 100, 1000);
        assert_eq!(progress.stage, Some(Stage::Write));
        assert_eq!(progress.bar.length(), Some(1000));
        assert_eq!(progress.bar.position(), 100);

        progress.finish();
        assert_eq!(progress.stage, None);
    }
}
