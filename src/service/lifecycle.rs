use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ContainerRuntime, LifecycleError, ReadinessProbe, ServiceControl, ServiceHandle};

/// Per-probe timeout; the overall budget is the caller's readiness timeout
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// HTTP readiness probe against the service's docs endpoint
pub struct HttpReadinessProbe {
    client: reqwest::Client,
}

impl HttpReadinessProbe {
    /// # Errors
    /// Returns error if the HTTP client cannot be constructed
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .context("failed to build readiness probe client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ReadinessProbe for HttpReadinessProbe {
    async fn is_ready(&self, base_url: &str) -> bool {
        match self.client.get(format!("{base_url}/docs")).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("readiness probe failed: {}", e);
                false
            }
        }
    }
}

/// Start/poll/stop coordination for the backing transcription service
///
/// The whole start-and-poll sequence runs under one async lock, so concurrent
/// `ensure_ready` callers share a single underlying attempt and observe the
/// same final handle state.
pub struct ServiceLifecycle<R, P> {
    runtime: R,
    probe: P,
    handle: Mutex<ServiceHandle>,
    poll_interval: Duration,
}

impl<R: ContainerRuntime, P: ReadinessProbe> ServiceLifecycle<R, P> {
    #[must_use]
    pub fn new(runtime: R, probe: P, base_url: String, poll_interval: Duration) -> Self {
        Self {
            runtime,
            probe,
            handle: Mutex::new(ServiceHandle::stopped(base_url)),
            poll_interval,
        }
    }

    /// Current handle state, for observability
    pub async fn handle(&self) -> ServiceHandle {
        self.handle.lock().await.clone()
    }

    /// Tear the service down and reset the cached state
    ///
    /// # Errors
    /// `StopFailed` if the runtime refuses; callers log it and move on
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        let mut handle = self.handle.lock().await;
        self.runtime
            .stop()
            .await
            .map_err(|source| LifecycleError::StopFailed { source })?;
        handle.running = false;
        handle.ready = false;
        Ok(())
    }
}

#[async_trait]
impl<R: ContainerRuntime, P: ReadinessProbe> ServiceControl for ServiceLifecycle<R, P> {
    async fn ensure_ready(&self, timeout: Duration) -> Result<ServiceHandle, LifecycleError> {
        let mut handle = self.handle.lock().await;

        // Cached readiness: the fast path taken on every session after the first
        if handle.ready {
            return Ok(handle.clone());
        }

        if !handle.running {
            // Adopt a container someone else started before launching our own
            let already_running = self.runtime.is_running().await.unwrap_or(false);
            if already_running {
                debug!("adopting running service container");
            } else {
                self.runtime
                    .start()
                    .await
                    .map_err(|source| LifecycleError::Unavailable { source })?;
            }
            handle.running = true;
        }

        let deadline = Instant::now() + timeout;
        loop {
            if self.probe.is_ready(&handle.base_url).await {
                handle.ready = true;
                info!(base_url = %handle.base_url, "transcription service ready");
                return Ok(handle.clone());
            }
            if Instant::now() >= deadline {
                warn!(budget_secs = timeout.as_secs(), "service readiness budget elapsed");
                return Err(LifecycleError::Timeout { budget: timeout });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn invalidate(&self) {
        let mut handle = self.handle.lock().await;
        handle.ready = false;
        handle.running = false;
        debug!("service readiness invalidated");
    }
}

#[cfg(test)]
mod tests {
    use super::super::{MockContainerRuntime, MockReadinessProbe};
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn lifecycle(
        runtime: MockContainerRuntime,
        probe: MockReadinessProbe,
    ) -> ServiceLifecycle<MockContainerRuntime, MockReadinessProbe> {
        ServiceLifecycle::new(
            runtime,
            probe,
            "http://localhost:8001".to_owned(),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_ensure_ready_starts_and_polls() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_is_running().times(1).returning(|| Ok(false));
        runtime.expect_start().times(1).returning(|| Ok(()));

        let mut probe = MockReadinessProbe::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let probe_calls = Arc::clone(&calls);
        probe.expect_is_ready().returning(move |_| {
            // Not ready on the first probe, ready on the second
            probe_calls.fetch_add(1, Ordering::SeqCst) >= 1
        });

        let lifecycle = lifecycle(runtime, probe);
        let handle = lifecycle.ensure_ready(Duration::from_secs(1)).await.unwrap();

        assert!(handle.running);
        assert!(handle.ready);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_ensure_ready_adopts_running_container() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_is_running().times(1).returning(|| Ok(true));
        runtime.expect_start().times(0);

        let mut probe = MockReadinessProbe::new();
        probe.expect_is_ready().returning(|_| true);

        let lifecycle = lifecycle(runtime, probe);
        let handle = lifecycle.ensure_ready(Duration::from_secs(1)).await.unwrap();
        assert!(handle.ready);
    }

    #[tokio::test]
    async fn test_ensure_ready_times_out() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_is_running().returning(|| Ok(false));
        runtime.expect_start().returning(|| Ok(()));

        let mut probe = MockReadinessProbe::new();
        probe.expect_is_ready().returning(|_| false);

        let lifecycle = lifecycle(runtime, probe);
        let result = lifecycle.ensure_ready(Duration::from_millis(30)).await;

        assert!(matches!(result, Err(LifecycleError::Timeout { .. })));
        // The container start is not retried by the readiness path itself
        let handle = lifecycle.handle().await;
        assert!(handle.running);
        assert!(!handle.ready);
    }

    #[tokio::test]
    async fn test_ensure_ready_start_failure_is_unavailable() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_is_running().returning(|| Ok(false));
        runtime
            .expect_start()
            .returning(|| Err(anyhow::anyhow!("no such image")));

        let mut probe = MockReadinessProbe::new();
        probe.expect_is_ready().times(0);

        let lifecycle = lifecycle(runtime, probe);
        let result = lifecycle.ensure_ready(Duration::from_secs(1)).await;

        assert!(matches!(result, Err(LifecycleError::Unavailable { .. })));
        assert!(!lifecycle.handle().await.running);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_ensure_ready_is_single_flight() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_is_running().times(1).returning(|| Ok(false));
        // The core single-flight property: one start for two concurrent callers
        runtime.expect_start().times(1).returning(|| Ok(()));

        let mut probe = MockReadinessProbe::new();
        // Ready on the first probe; the second caller takes the cached path
        probe.expect_is_ready().times(1).returning(|_| true);

        let lifecycle = Arc::new(lifecycle(runtime, probe));
        let a = Arc::clone(&lifecycle);
        let b = Arc::clone(&lifecycle);

        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.ensure_ready(Duration::from_secs(1)).await }),
            tokio::spawn(async move { b.ensure_ready(Duration::from_secs(1)).await }),
        );

        let ha = ra.unwrap().unwrap();
        let hb = rb.unwrap().unwrap();
        // Both callers observe the same final handle state
        assert_eq!(ha, hb);
        assert!(ha.ready);
    }

    #[tokio::test]
    async fn test_invalidate_clears_cached_readiness() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_is_running().returning(|| Ok(true));
        let mut probe = MockReadinessProbe::new();
        probe.expect_is_ready().returning(|_| true);

        let lifecycle = lifecycle(runtime, probe);
        lifecycle.ensure_ready(Duration::from_secs(1)).await.unwrap();
        assert!(lifecycle.handle().await.ready);

        lifecycle.invalidate().await;
        let handle = lifecycle.handle().await;
        assert!(!handle.ready);
        assert!(!handle.running);
    }

    #[tokio::test]
    async fn test_stop_resets_flags() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_is_running().returning(|| Ok(true));
        runtime.expect_stop().times(1).returning(|| Ok(()));
        let mut probe = MockReadinessProbe::new();
        probe.expect_is_ready().returning(|_| true);

        let lifecycle = lifecycle(runtime, probe);
        lifecycle.ensure_ready(Duration::from_secs(1)).await.unwrap();

        lifecycle.stop().await.unwrap();
        let handle = lifecycle.handle().await;
        assert!(!handle.running);
        assert!(!handle.ready);
    }

    #[tokio::test]
    async fn test_stop_failure_is_stop_failed() {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_stop()
            .returning(|| Err(anyhow::anyhow!("daemon not responding")));
        let probe = MockReadinessProbe::new();

        let lifecycle = lifecycle(runtime, probe);
        let result = lifecycle.stop().await;
        assert!(matches!(result, Err(LifecycleError::StopFailed { .. })));
    }
}
