//! Multi-progress display for pool workers.

use std::sync::Arc;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::Mutex;

fn bar_style(template: &str, chars: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars(chars)
}

fn idle_style() -> ProgressStyle {
    bar_style("  {spinner:.dim} {wide_msg}", "━╸─")
}

/// A summary bar plus one line per worker showing what it is working on.
pub struct WorkerProgress {
    multi: MultiProgress,
    slots: Arc<Mutex<Vec<ProgressBar>>>,
    summary_bar: ProgressBar,
    label: String,
}

impl WorkerProgress {
    pub fn new(num_workers: usize, total: u64, label: &str) -> Self {
        let multi = MultiProgress::new();

        let summary_bar = multi.add(ProgressBar::new(total));
        summary_bar.set_style(bar_style(
            "{spinner:.green} {msg} [{bar:30.cyan/blue}] {pos}/{len} ({elapsed})",
            "█▓░",
        ));
        summary_bar.set_message(label.to_string());

        let mut slots = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let bar = multi.add(ProgressBar::new(0));
            bar.set_style(idle_style());
            bar.set_message("idle");
            slots.push(bar);
        }

        Self {
            multi,
            slots: Arc::new(Mutex::new(slots)),
            summary_bar,
            label: label.to_string(),
        }
    }

    /// Show `item` on the worker's line.
    pub async fn start_item(&self, worker_id: usize, item: &str) {
        let slots = self.slots.lock().await;
        if let Some(bar) = slots.get(worker_id) {
            bar.set_style(bar_style("  {spinner:.cyan} {wide_msg}", "━╸─"));
            bar.set_message(truncate_label(item, 60));
            bar.enable_steady_tick(Duration::from_millis(100));
        }
    }

    /// Show convergence progress on the worker's line.
    pub async fn update_count(&self, worker_id: usize, observed: u64, total: Option<u64>) {
        let slots = self.slots.lock().await;
        if let Some(bar) = slots.get(worker_id) {
            match total {
                Some(total) => {
                    bar.set_style(bar_style(
                        "  {spinner:.cyan} loading [{bar:25.cyan/blue}] {pos}/{len}",
                        "━╸─",
                    ));
                    bar.set_length(total);
                    bar.set_position(observed.min(total));
                }
                None => bar.set_message(format!("loading: {} items", observed)),
            }
        }
    }

    /// Return the worker's line to idle and count the item.
    pub async fn finish_item(&self, worker_id: usize) {
        let slots = self.slots.lock().await;
        if let Some(bar) = slots.get(worker_id) {
            bar.disable_steady_tick();
            bar.set_style(idle_style());
            bar.set_message("idle");
            bar.set_length(0);
            bar.set_position(0);
        }
        self.summary_bar.inc(1);
    }

    /// Count items that were skipped without being dispatched.
    pub fn skip(&self, count: usize) {
        self.summary_bar.inc(count as u64);
    }

    pub fn set_summary(&self, done: usize, failed: usize) {
        self.summary_bar.set_message(format!(
            "{} | done: {} | failed: {}",
            self.label, done, failed
        ));
    }

    /// Finish all progress bars and clear the display.
    pub async fn finish(&self) {
        let slots = self.slots.lock().await;
        for bar in slots.iter() {
            bar.finish_and_clear();
        }
        self.summary_bar.finish_and_clear();
    }

    /// Print a message without corrupting the bars.
    pub fn println(&self, message: &str) {
        let _ = self.multi.println(message);
    }
}

/// Truncate a label for display, keeping the end (the most specific part) visible.
fn truncate_label(label: &str, max_len: usize) -> String {
    let count = label.chars().count();
    if count <= max_len {
        return label.to_string();
    }
    let keep = max_len.saturating_sub(3);
    let tail: String = label.chars().skip(count - keep).collect();
    format!("...{}", tail)
}
