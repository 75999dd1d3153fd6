//! Compact single-line progress output
//!
//! Hidden in debug mode, where the debug log carries the same events.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

#[derive(Clone)]
pub struct Progress {
    bar: ProgressBar,
    enabled: bool,
}

impl Progress {
    pub fn new(debug: bool) -> Self {
        let bar = ProgressBar::new(0);
        if debug {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        } else if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {prefix} - {msg}")
        {
            bar.set_style(style.progress_chars("█▓▒░  "));
        }
        Self {
            bar,
            enabled: !debug,
        }
    }

    /// Never drawn; used by tests and library callers
    pub fn hidden() -> Self {
        let bar = ProgressBar::hidden();
        Self { bar, enabled: false }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Start a new phase with `len` items
    pub fn start(&self, label: &str, len: u64) {
        self.bar.reset();
        self.bar.set_length(len);
        self.bar.set_prefix(label.to_string());
        self.bar.set_message(String::new());
    }

    pub fn tick(&self, item: &str) {
        self.bar.set_message(item.to_string());
        self.bar.inc(1);
    }

    pub fn finish(&self, msg: &str) {
        self.bar.finish_with_message(msg.to_string());
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }
}
