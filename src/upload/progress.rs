//! Transfer progress accounting.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

/// Progress is reported once per bucket of this many percent.
pub const PROGRESS_STEP_PERCENT: u8 = 5;

/// Counts bytes handed to the HTTP body and reports 5 % steps.
///
/// Shared between the body stream and the uploader through an `Arc`, so all
/// state is atomic.
pub struct TransferProgress {
    total: u64,
    sent: AtomicU64,
    last_bucket: AtomicU8,
    bar: Option<ProgressBar>,
}

impl TransferProgress {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            sent: AtomicU64::new(0),
            last_bucket: AtomicU8::new(0),
            bar: None,
        }
    }

    /// Same as [`TransferProgress::new`] with a terminal progress bar attached.
    pub fn with_bar(total: u64, label: &str) -> Self {
        let bar = ProgressBar::new(total);
        let style = ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        bar.set_style(style);
        bar.set_message(label.to_string());

        Self {
            bar: Some(bar),
            ..Self::new(total)
        }
    }

    /// Record `n` more bytes. Returns the new percentage when a 5 % boundary was crossed.
    pub fn record(&self, n: u64) -> Option<u8> {
        let sent = self.sent.fetch_add(n, Ordering::Relaxed) + n;
        if let Some(bar) = &self.bar {
            bar.set_position(sent.min(self.total));
        }

        let bucket = self.bucket_for(sent);
        let previous = self.last_bucket.fetch_max(bucket, Ordering::Relaxed);
        if bucket > previous {
            let percent = bucket * PROGRESS_STEP_PERCENT;
            info!("Upload progress: {}% ({} / {} bytes)", percent, sent.min(self.total), self.total);
            Some(percent)
        } else {
            None
        }
    }

    fn bucket_for(&self, sent: u64) -> u8 {
        if self.total == 0 {
            return 100 / PROGRESS_STEP_PERCENT;
        }
        let percent = (sent.min(self.total) as u128 * 100 / self.total as u128) as u8;
        percent / PROGRESS_STEP_PERCENT
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn percent(&self) -> u8 {
        self.last_bucket.load(Ordering::Relaxed) * PROGRESS_STEP_PERCENT
    }

    /// Start over for a new attempt.
    pub fn reset(&self) {
        self.sent.store(0, Ordering::Relaxed);
        self.last_bucket.store(0, Ordering::Relaxed);
        if let Some(bar) = &self.bar {
            bar.reset();
        }
    }

    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}

impl fmt::Debug for TransferProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferProgress")
            .field("sent", &self.sent())
            .field("percent", &self.percent())
            .finish()
    }
}
