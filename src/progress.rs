//! Progress tracking and display using indicatif
//!
//! Progress is observation only. Nothing in the pipeline reads these values
//! to decide what to do next.

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Creates progress bars for long-running phases when enabled
pub struct ProgressTracker {
    enabled: bool,
}

impl ProgressTracker {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Create a progress bar for a counted operation
    pub fn create_bar(&self, total: usize, operation: &str) -> Option<ProgressBar> {
        if !self.enabled || total == 0 {
            return None;
        }

        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▉▊▋▌▍▎▏ ")
        );
        pb.set_message(format!("{}...", operation));
        pb.enable_steady_tick(Duration::from_millis(100));

        debug!("Started progress tracking for: {}", operation);
        Some(pb)
    }

    /// Create a spinner for indeterminate operations
    pub fn create_spinner(&self, message: &str) -> Option<ProgressBar> {
        if !self.enabled {
            return None;
        }

        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(message.to_string());
        pb.enable_steady_tick(Duration::from_millis(80));
        Some(pb)
    }

    /// Counter for the layer conversion phase
    pub fn layer_progress(&self, total: usize) -> LayerProgress {
        LayerProgress::new(total, self.create_bar(total, "Converting layers"))
    }

    /// Finish progress with success message
    pub fn finish(pb: Option<ProgressBar>, message: &str) {
        if let Some(progress) = pb {
            progress.finish_with_message(message.to_string());
        }
    }

    /// Finish progress with error message
    pub fn abandon(pb: Option<ProgressBar>, message: &str) {
        if let Some(progress) = pb {
            progress.abandon_with_message(format!("❌ {}", message));
        }
    }
}

/// Shared count of completed layers.
///
/// Workers share it by reference; increments from concurrent workers are
/// atomic so no completion is lost.
#[derive(Clone)]
pub struct LayerProgress {
    completed: Arc<AtomicUsize>,
    total: usize,
    bar: Option<ProgressBar>,
}

impl LayerProgress {
    pub fn new(total: usize, bar: Option<ProgressBar>) -> Self {
        Self {
            completed: Arc::new(AtomicUsize::new(0)),
            total,
            bar,
        }
    }

    /// Counter with no attached display
    pub fn hidden(total: usize) -> Self {
        Self::new(total, None)
    }

    /// Record one finished layer and return the new count
    pub fn complete_one(&self) -> usize {
        let done = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
        match self.bar {
            Some(ref pb) => pb.inc(1),
            None => debug!("converted layer {} / {}", done, self.total),
        }
        done
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Close the attached bar, if any
    pub fn finish(&self, success: bool) {
        let Some(pb) = self.bar.clone() else {
            return;
        };
        if success {
            ProgressTracker::finish(Some(pb), "Layers converted");
            info!("Converted {} / {} layers", self.completed(), self.total);
        } else {
            ProgressTracker::abandon(Some(pb), "Layer conversion failed");
        }
    }
}
