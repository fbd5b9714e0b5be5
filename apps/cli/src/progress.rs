//! Progress bars driven by polling the task registry

use crate::output::{format_eta, format_speed};
use console::style;
use grabbit_types::{DownloadStatus, DownloadTask};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;

const BAR_TEMPLATE: &str =
    "{spinner:.green} {prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}";

/// One bar per task, updated from registry snapshots
pub struct DownloadProgress {
    multi: MultiProgress,
    bars: HashMap<String, ProgressBar>,
}

impl DownloadProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    fn bar_for(&mut self, task: &DownloadTask) -> ProgressBar {
        if let Some(pb) = self.bars.get(&task.id) {
            return pb.clone();
        }

        let pb = self.multi.add(ProgressBar::new(task.total_size.unwrap_or(0)));
        let bar_style = ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓▒░  ");
        pb.set_style(bar_style);
        pb.set_prefix(task.display_name.clone());

        self.bars.insert(task.id.clone(), pb.clone());
        pb
    }

    /// Apply the latest snapshot of the given tasks
    pub fn update(&mut self, tasks: &[DownloadTask]) {
        for task in tasks {
            let pb = self.bar_for(task);
            if pb.is_finished() {
                continue;
            }

            if let Some(total) = task.total_size {
                pb.set_length(total);
            }
            pb.set_position(task.downloaded);

            match task.status {
                DownloadStatus::Starting => pb.set_message(format!("{}", style("queued").dim())),
                DownloadStatus::Downloading => pb.set_message(format!(
                    "{} eta {}",
                    format_speed(task.speed),
                    format_eta(task.eta)
                )),
                DownloadStatus::Completed => pb.finish_with_message(format!(
                    "{} complete",
                    style("✓").green().bold()
                )),
                DownloadStatus::Duplicate => pb.abandon_with_message(format!(
                    "{} duplicate of a stored file",
                    style("=").yellow().bold()
                )),
                DownloadStatus::Failed => pb.abandon_with_message(format!(
                    "{} failed: {}",
                    style("✗").red().bold(),
                    task.error.as_deref().unwrap_or("unknown error")
                )),
                DownloadStatus::Cancelled => {
                    pb.abandon_with_message(format!("{} cancelled", style("○").dim()))
                }
            }
        }
    }
}

impl Default for DownloadProgress {
    fn default() -> Self {
        Self::new()
    }
}
