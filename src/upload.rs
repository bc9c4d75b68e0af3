//! Software image transfer with retry, keepalive and progress.

pub mod body;
pub mod keepalive;
pub mod progress;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use tracing::{debug, error, info, warn};

use crate::api::{ApplianceApi, SoftwareImage};
use crate::config::Credentials;
use crate::error::CcupError;
use keepalive::Keepalive;
use progress::TransferProgress;

pub const MAX_ATTEMPTS: u32 = 3;
pub const KEEPALIVE_THRESHOLD: u64 = 500 * 1024 * 1024;
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(300);
pub const BUFFERED_LIMIT: u64 = 8 * 1024 * 1024;
pub const CHUNK_SIZE: usize = 64 * 1024;
pub const STREAM_BUFFER: usize = 256 * 1024;

/// How the image bytes are fed into the multipart body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransferStrategy {
    /// Whole file in memory (small files only)
    Buffered,
    /// Async reader stream with a 256 KiB buffer
    Streamed,
    /// Fixed 64 KiB chunks
    Chunked,
}

impl TransferStrategy {
    /// Explicit preference wins; otherwise small files are buffered and the rest streamed.
    pub fn select(preference: Option<Self>, size: u64) -> Self {
        match preference {
            Some(strategy) => strategy,
            None if size <= BUFFERED_LIMIT => Self::Buffered,
            None => Self::Streamed,
        }
    }
}

impl fmt::Display for TransferStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Buffered => "buffered",
            Self::Streamed => "streamed",
            Self::Chunked => "chunked",
        };
        f.write_str(s)
    }
}

/// Retry and keepalive tuning.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub keepalive_threshold: u64,
    pub keepalive_period: Duration,
    pub commit_delay: Duration,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            backoff_base: Duration::from_secs(10),
            keepalive_threshold: KEEPALIVE_THRESHOLD,
            keepalive_period: KEEPALIVE_PERIOD,
            commit_delay: Duration::from_secs(5),
        }
    }
}

/// State of one upload across its attempts.
#[derive(Debug)]
pub struct UploadSession {
    pub path: PathBuf,
    pub size: u64,
    pub strategy: TransferStrategy,
    pub attempt: u32,
    pub keepalive_active: bool,
    progress: Arc<TransferProgress>,
}

impl UploadSession {
    pub fn bytes_transferred(&self) -> u64 {
        self.progress.sent()
    }

    pub fn last_percent(&self) -> u8 {
        self.progress.percent()
    }
}

/// Result of [`ResilientUploader::upload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Completed { attempts: u32 },
    /// Every attempt failed.
    Exhausted { attempts: u32, last_error: String },
    /// Hard failure that retrying cannot fix.
    Rejected { reason: String },
}

impl UploadOutcome {
    /// Convert into a phase result for the given node label.
    pub fn into_result(self, node: &str) -> Result<(), CcupError> {
        match self {
            Self::Completed { attempts } => {
                debug!("Upload to {} completed in {} attempt(s)", node, attempts);
                Ok(())
            }
            Self::Exhausted { attempts, last_error } => Err(CcupError::UploadFailed {
                node: node.to_string(),
                reason: format!("gave up after {attempts} attempts: {last_error}"),
            }),
            Self::Rejected { reason } => Err(CcupError::UploadFailed {
                node: node.to_string(),
                reason,
            }),
        }
    }
}

/// Uploads and commits a software image, absorbing transient failures.
pub struct ResilientUploader<A: ApplianceApi + ?Sized> {
    api: Arc<A>,
    policy: UploadPolicy,
    show_progress: bool,
}

impl<A: ApplianceApi + ?Sized + 'static> ResilientUploader<A> {
    pub fn new(api: Arc<A>, policy: UploadPolicy) -> Self {
        Self {
            api,
            policy,
            show_progress: false,
        }
    }

    /// Draw an indicatif bar while transferring.
    pub fn with_progress_bar(mut self, enabled: bool) -> Self {
        self.show_progress = enabled;
        self
    }

    /// Transfer `image` to `base_url` and commit it. Never returns an error.
    pub async fn upload(
        &self,
        base_url: &str,
        image: &SoftwareImage,
        preference: Option<TransferStrategy>,
        credentials: Option<&Credentials>,
    ) -> UploadOutcome {
        match tokio::fs::metadata(&image.path).await {
            Ok(meta) if meta.is_file() => {}
            _ => {
                let reason = CcupError::FileNotFound(image.path.clone()).to_string();
                error!("{}", reason);
                return UploadOutcome::Rejected { reason };
            }
        }

        let strategy = TransferStrategy::select(preference, image.size);
        let progress = Arc::new(if self.show_progress {
            TransferProgress::with_bar(image.size, &image.file_name())
        } else {
            TransferProgress::new(image.size)
        });
        let mut session = UploadSession {
            path: image.path.clone(),
            size: image.size,
            strategy,
            attempt: 0,
            keepalive_active: false,
            progress: progress.clone(),
        };

        info!(
            "Uploading {} ({} bytes) to {} using {} transfer",
            session.path.display(),
            session.size,
            base_url,
            session.strategy
        );

        let mut last_error = String::new();
        let mut transferred = false;

        while session.attempt < self.policy.max_attempts {
            session.attempt += 1;
            progress.reset();

            let keepalive = (image.size > self.policy.keepalive_threshold).then(|| {
                Keepalive::start(self.api.clone(), base_url.to_string(), self.policy.keepalive_period)
            });
            session.keepalive_active = keepalive.is_some();

            let result = self
                .api
                .send_software(base_url, image, strategy, progress.clone())
                .await;

            if let Some(keepalive) = keepalive {
                keepalive.stop().await;
            }
            session.keepalive_active = false;

            match result {
                Ok(()) => {
                    info!(
                        "Upload attempt {}/{} finished ({} bytes sent)",
                        session.attempt,
                        self.policy.max_attempts,
                        session.bytes_transferred()
                    );
                    transferred = true;
                    break;
                }
                // Expired sessions are retried after logging in again.
                Err(e) if !e.is_transient() && !matches!(e, CcupError::SessionExpired(_)) => {
                    progress.finish();
                    error!(
                        "Upload attempt {}/{} to {} refused: {}",
                        session.attempt, self.policy.max_attempts, base_url, e
                    );
                    return UploadOutcome::Rejected { reason: e.to_string() };
                }
                Err(e) => {
                    warn!(
                        "Upload attempt {}/{} failed at {}%: {}",
                        session.attempt,
                        self.policy.max_attempts,
                        session.last_percent(),
                        e
                    );
                    last_error = e.to_string();

                    if session.attempt < self.policy.max_attempts {
                        if let Some(credentials) = credentials {
                            self.reauthenticate(base_url, credentials).await;
                        }
                        let backoff = self.policy.backoff_base * session.attempt;
                        info!("Retrying upload in {}s", backoff.as_secs());
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        progress.finish();

        if !transferred {
            error!(
                "Upload of {} to {} failed after {} attempts",
                session.path.display(),
                base_url,
                session.attempt
            );
            return UploadOutcome::Exhausted {
                attempts: session.attempt,
                last_error,
            };
        }

        self.commit(base_url, credentials, session.attempt).await
    }

    async fn commit(&self, base_url: &str, credentials: Option<&Credentials>, attempts: u32) -> UploadOutcome {
        tokio::time::sleep(self.policy.commit_delay).await;
        info!("Committing software update on {}", base_url);

        let first = self.api.commit_software(base_url).await;
        let result = match (first, credentials) {
            (Err(CcupError::SessionExpired(_)), Some(credentials)) => {
                warn!("Session expired before commit, logging in again");
                self.reauthenticate(base_url, credentials).await;
                self.api.commit_software(base_url).await
            }
            (other, _) => other,
        };

        match result {
            Ok(()) => {
                info!("Software update committed on {}", base_url);
                UploadOutcome::Completed { attempts }
            }
            Err(e) => {
                error!("Commit rejected by {}: {}", base_url, e);
                UploadOutcome::Rejected {
                    reason: format!("commit failed: {e}"),
                }
            }
        }
    }

    async fn reauthenticate(&self, base_url: &str, credentials: &Credentials) {
        match self.api.login(base_url, credentials).await {
            Ok(true) => info!("Re-authenticated to {}", base_url),
            Ok(false) => warn!("Re-authentication to {} was rejected", base_url),
            Err(e) => warn!("Re-authentication to {} failed: {}", base_url, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::api::fake::FakeApi;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn image_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"image").unwrap();
        file
    }

    fn creds() -> Credentials {
        Credentials::new("admin", "secret")
    }

    #[test]
    fn test_strategy_selection() {
        assert_eq!(TransferStrategy::select(None, 1024), TransferStrategy::Buffered);
        assert_eq!(TransferStrategy::select(None, BUFFERED_LIMIT), TransferStrategy::Buffered);
        assert_eq!(TransferStrategy::select(None, BUFFERED_LIMIT + 1), TransferStrategy::Streamed);
        assert_eq!(
            TransferStrategy::select(Some(TransferStrategy::Chunked), 10),
            TransferStrategy::Chunked
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_upload_completes_without_keepalive() {
        let file = image_file();
        let api = Arc::new(FakeApi::default());
        let uploader = ResilientUploader::new(api.clone(), UploadPolicy::default());

        let outcome = uploader
            .upload("https://cc", &SoftwareImage::new(file.path(), 5), None, Some(&creds()))
            .await;

        assert_eq!(outcome, UploadOutcome::Completed { attempts: 1 });
        assert_eq!(api.send_calls(), 1);
        assert_eq!(api.commit_calls(), 1);
        assert_eq!(api.heartbeats(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_upload_keeps_session_alive_for_whole_transfer() {
        let file = image_file();
        let api = Arc::new(FakeApi::default().with_transfer_time(Duration::from_secs(3650)));
        let uploader = ResilientUploader::new(api.clone(), UploadPolicy::default());

        let outcome = uploader
            .upload("https://cc", &SoftwareImage::new(file.path(), 9 * GIB), None, None)
            .await;

        assert_eq!(outcome, UploadOutcome::Completed { attempts: 1 });
        // one beat per 300s of transfer
        assert_eq!(api.heartbeats(), 12);

        tokio::time::sleep(Duration::from_secs(1200)).await;
        assert_eq!(api.heartbeats(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_three_attempts() {
        let file = image_file();
        let api = Arc::new(FakeApi::default().with_send_failures(5));
        let uploader = ResilientUploader::new(api.clone(), UploadPolicy::default());

        let start = tokio::time::Instant::now();
        let outcome = uploader
            .upload("https://cc", &SoftwareImage::new(file.path(), 5), None, Some(&creds()))
            .await;

        match outcome {
            UploadOutcome::Exhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(api.send_calls(), 3);
        assert_eq!(api.commit_calls(), 0);
        // re-login between attempts only
        assert_eq!(api.login_calls().len(), 2);
        // 10s after the first failure, 20s after the second
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_upload_stops_keepalive_after_failed_attempts() {
        let file = image_file();
        let api = Arc::new(
            FakeApi::default()
                .with_transfer_time(Duration::from_secs(1000))
                .with_send_failures(3),
        );
        let uploader = ResilientUploader::new(api.clone(), UploadPolicy::default());

        let outcome = uploader
            .upload("https://cc", &SoftwareImage::new(file.path(), 9 * GIB), None, Some(&creds()))
            .await;

        match outcome {
            UploadOutcome::Exhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected outcome: {other:?}"),
        }
        // three beats per 1000s attempt, none during backoff
        assert_eq!(api.heartbeats(), 9);

        tokio::time::sleep(Duration::from_secs(1500)).await;
        assert_eq!(api.heartbeats(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_send_error_is_rejected_without_retry() {
        let file = image_file();
        let api = Arc::new(FakeApi::default().with_send_status(413));
        let uploader = ResilientUploader::new(api.clone(), UploadPolicy::default());

        let start = tokio::time::Instant::now();
        let outcome = uploader
            .upload("https://cc", &SoftwareImage::new(file.path(), 5), None, Some(&creds()))
            .await;

        match outcome {
            UploadOutcome::Rejected { reason } => assert!(reason.contains("HTTP 413"), "{reason}"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(api.send_calls(), 1);
        assert_eq!(api.commit_calls(), 0);
        assert!(api.login_calls().is_empty());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_second_attempt() {
        let file = image_file();
        let api = Arc::new(FakeApi::default().with_send_failures(1));
        let uploader = ResilientUploader::new(api.clone(), UploadPolicy::default());

        let outcome = uploader
            .upload("https://cc", &SoftwareImage::new(file.path(), 5), None, None)
            .await;

        assert_eq!(outcome, UploadOutcome::Completed { attempts: 2 });
        assert!(api.login_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_file_is_rejected_without_retry() {
        let api = Arc::new(FakeApi::default());
        let uploader = ResilientUploader::new(api.clone(), UploadPolicy::default());

        let outcome = uploader
            .upload("https://cc", &SoftwareImage::new("/nonexistent/cc.tar.gz", 5), None, None)
            .await;

        assert!(matches!(outcome, UploadOutcome::Rejected { .. }));
        assert_eq!(api.send_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_retried_once_after_session_expiry() {
        let file = image_file();
        let api = Arc::new(
            FakeApi::default().with_commit_results(vec![Err(CcupError::SessionExpired("commit".into()))]),
        );
        let uploader = ResilientUploader::new(api.clone(), UploadPolicy::default());

        let outcome = uploader
            .upload("https://cc", &SoftwareImage::new(file.path(), 5), None, Some(&creds()))
            .await;

        assert_eq!(outcome, UploadOutcome::Completed { attempts: 1 });
        assert_eq!(api.commit_calls(), 2);
        assert_eq!(api.login_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_refusal_is_rejected() {
        let file = image_file();
        let api = Arc::new(FakeApi::default().with_commit_results(vec![Err(CcupError::from_status(
            "software.commit",
            500,
            "install failed".into(),
        ))]));
        let uploader = ResilientUploader::new(api.clone(), UploadPolicy::default());

        let outcome = uploader
            .upload("https://cc", &SoftwareImage::new(file.path(), 5), None, Some(&creds()))
            .await;

        assert!(matches!(outcome, UploadOutcome::Rejected { .. }));
        assert_eq!(api.commit_calls(), 1);
    }

    #[test]
    fn test_outcome_into_result() {
        assert!(UploadOutcome::Completed { attempts: 1 }.into_result("secondary").is_ok());
        let err = UploadOutcome::Exhausted {
            attempts: 3,
            last_error: "reset".into(),
        }
        .into_result("secondary")
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Software upload failed on secondary: gave up after 3 attempts: reset"
        );
    }
}
