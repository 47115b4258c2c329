use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use crate::error::FetchError;

/// Callbacks the driver fires as it walks the catalog.
pub trait ProgressObserver {
    fn on_page_start(&mut self, _page: u32) {}
    fn on_page_complete(&mut self, _page: u32, _upserted: usize) {}
    fn on_retry(&mut self, _page: u32, _attempt: u32, _wait: Duration, _error: &FetchError) {}
}

/// Observer that ignores everything.
pub struct NoProgress;

impl ProgressObserver for NoProgress {}

/// Terminal progress bar, one tick per completed page.
pub struct BarProgress {
    pb: ProgressBar,
}

impl BarProgress {
    pub fn new(pages: u32) -> anyhow::Result<Self> {
        let pb = ProgressBar::new(pages as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("Fetching pages [{elapsed_precise}] {bar:40} {pos}/{len} page ({per_sec}, eta {eta}) {msg}")?
                .progress_chars("=> "),
        );
        Ok(Self { pb })
    }
}

impl ProgressObserver for BarProgress {
    fn on_page_start(&mut self, page: u32) {
        self.pb.set_message(format!("page {}", page));
    }

    fn on_page_complete(&mut self, _page: u32, upserted: usize) {
        self.pb.inc(1);
        self.pb.set_message(format!("+{} rows", upserted));
    }

    fn on_retry(&mut self, page: u32, attempt: u32, wait: Duration, error: &FetchError) {
        self.pb.println(format!(
            "{}. Retrying page {} after {:.1}s (attempt {})...",
            error,
            page,
            wait.as_secs_f64(),
            attempt + 1
        ));
    }
}

impl Drop for BarProgress {
    fn drop(&mut self) {
        self.pb.finish_and_clear();
    }
}
