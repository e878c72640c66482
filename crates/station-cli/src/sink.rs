//! Console event sink: progress bar plus `tracing` log forwarding

use indicatif::{ProgressBar, ProgressStyle};
use station_uds::context::Level;
use station_uds::{EventSink, TracingSink};

pub struct ConsoleSink {
    bar: ProgressBar,
}

impl ConsoleSink {
    /// Sink with a visible progress bar
    pub fn with_progress() -> Self {
        let bar = ProgressBar::new(100);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}% {msg}")
            .map(|style| style.progress_chars("=>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        Self { bar }
    }

    /// Sink that only forwards logs (json output, quiet mode, streams)
    pub fn silent() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl EventSink for ConsoleSink {
    fn log(&self, level: Level, message: &str) {
        self.bar.suspend(|| TracingSink.log(level, message));
    }

    fn progress(&self, percent: u8, message: &str) {
        self.bar.set_position(u64::from(percent));
        self.bar.set_message(message.to_string());
    }
}
