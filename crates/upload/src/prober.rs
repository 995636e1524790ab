//! Instant-upload probe.

use std::time::Duration;

use pixdrop_protocol::{DestinationOptions, ProbeRequest, RemoteFile};
use tracing::{debug, warn};

use crate::api::UploadApi;

/// Asks the server whether content with a digest already exists.
///
/// The probe is an optimization only: errors and timeouts are misses.
#[derive(Debug, Clone)]
pub struct InstantProber {
    timeout: Duration,
}

impl InstantProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Returns the existing remote file on a hit.
    pub async fn probe(
        &self,
        api: &dyn UploadApi,
        file_digest: &str,
        size_bytes: u64,
        destination: &DestinationOptions,
    ) -> Option<RemoteFile> {
        let req = ProbeRequest {
            file_digest: file_digest.to_string(),
            size_bytes,
            destination: destination.clone(),
        };

        match tokio::time::timeout(self.timeout, api.probe_existing(&req)).await {
            Ok(Ok(Some(file))) => {
                debug!(digest = %file_digest, remote = %file.id, "instant upload hit");
                Some(file)
            }
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                warn!(digest = %file_digest, error = %e, "instant upload probe failed, uploading normally");
                None
            }
            Err(_) => {
                warn!(
                    digest = %file_digest,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "instant upload probe timed out, uploading normally"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::mock::{MockApi, remote_file};

    #[tokio::test]
    async fn hit_returns_remote_file() {
        let api = MockApi::new();
        api.set_probe_hit(remote_file("r-1"));
        let prober = InstantProber::new(Duration::from_secs(30));

        let hit = prober
            .probe(&api, "digest", 10, &DestinationOptions::default())
            .await;
        assert_eq!(hit.unwrap().id, "r-1");
        assert_eq!(api.probe_requests()[0].file_digest, "digest");
    }

    #[tokio::test]
    async fn miss_returns_none() {
        let api = MockApi::new();
        let prober = InstantProber::new(Duration::from_secs(30));
        assert!(
            prober
                .probe(&api, "digest", 10, &DestinationOptions::default())
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn error_is_a_miss() {
        let api = MockApi::new();
        api.set_probe_error(ApiError::Server {
            status: 500,
            body: "boom".into(),
        });
        let prober = InstantProber::new(Duration::from_secs(30));
        assert!(
            prober
                .probe(&api, "digest", 10, &DestinationOptions::default())
                .await
                .is_none()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_a_miss() {
        let api = MockApi::new();
        api.set_probe_hit(remote_file("late"));
        api.set_probe_delay(Duration::from_secs(60));
        let prober = InstantProber::new(Duration::from_secs(30));

        let started = tokio::time::Instant::now();
        let result = prober
            .probe(&api, "digest", 10, &DestinationOptions::default())
            .await;
        assert!(result.is_none());
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }
}
