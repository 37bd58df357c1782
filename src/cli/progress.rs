//! Terminal progress helpers.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// Spinner shown while a long-running phase works.
pub fn phase_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner
}
