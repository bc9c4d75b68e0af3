//! Session heartbeat for long transfers.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::ApplianceApi;

/// Background task issuing a cheap status request every `period` so the
/// management session does not expire while a large image is in flight.
///
/// Stop it with [`Keepalive::stop`]; dropping the handle cancels the task
/// without waiting for it.
pub struct Keepalive {
    token: CancellationToken,
    handle: Option<JoinHandle<u32>>,
}

impl Keepalive {
    pub fn start<A>(api: Arc<A>, base_url: String, period: Duration) -> Self
    where
        A: ApplianceApi + ?Sized + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut beats = 0u32;

            loop {
                tokio::select! {
                    biased;
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        beats += 1;
                        match api.update_status(&base_url).await {
                            Ok(_) => debug!("Keepalive #{} sent to {}", beats, base_url),
                            Err(e) => warn!("Keepalive #{} to {} failed: {}", beats, base_url, e),
                        }
                    }
                }
            }

            beats
        });

        debug!("Keepalive started (every {}s)", period.as_secs());
        Self {
            token,
            handle: Some(handle),
        }
    }

    /// Cancel the heartbeat and wait for the task to finish. Returns the number of beats sent.
    pub async fn stop(mut self) -> u32 {
        self.token.cancel();
        let beats = match self.handle.take() {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                warn!("Keepalive task ended abnormally: {}", e);
                0
            }),
            None => 0,
        };
        debug!("Keepalive stopped after {} beats", beats);
        beats
    }
}

impl Drop for Keepalive {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
