/// Docker-backed container runtime
pub mod docker;
/// Readiness polling and single-flight start
pub mod lifecycle;

pub use docker::DockerRuntime;
pub use lifecycle::{HttpReadinessProbe, ServiceLifecycle};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Shared view of the backing transcription service
///
/// Created in the stopped state at daemon start; mutated only under the
/// lifecycle lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    /// Container has been started (or adopted) this run
    pub running: bool,
    /// A health probe has succeeded since the last start/invalidate
    pub ready: bool,
    /// Base URL of the service API
    pub base_url: String,
}

impl ServiceHandle {
    #[must_use]
    pub const fn stopped(base_url: String) -> Self {
        Self {
            running: false,
            ready: false,
            base_url,
        }
    }
}

/// Errors from managing the backing service
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The service could not be started
    #[error("transcription service unavailable: {source}")]
    Unavailable {
        /// Underlying runtime error
        source: anyhow::Error,
    },

    /// The service did not become ready within the budget
    #[error("transcription service not ready within {budget:?}")]
    Timeout {
        /// Readiness budget that elapsed
        budget: Duration,
    },

    /// Teardown failed; logged, never blocks daemon shutdown
    #[error("failed to stop transcription service: {source}")]
    StopFailed {
        /// Underlying runtime error
        source: anyhow::Error,
    },
}

/// Host container runtime operations for the service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether the managed container is currently running
    async fn is_running(&self) -> anyhow::Result<bool>;

    /// Start a fresh container, replacing any stale one
    async fn start(&self) -> anyhow::Result<()>;

    /// Stop the managed container
    async fn stop(&self) -> anyhow::Result<()>;
}

/// Health probing against the service API
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// One bounded probe; false on any transport or status failure
    async fn is_ready(&self, base_url: &str) -> bool;
}

/// What the session pipeline needs from the service side
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServiceControl: Send + Sync {
    /// Start the service if needed and wait until it is ready
    ///
    /// # Errors
    /// `Unavailable` if the start fails, `Timeout` if the budget elapses
    async fn ensure_ready(&self, timeout: Duration) -> Result<ServiceHandle, LifecycleError>;

    /// Drop the cached readiness so the next session re-probes
    async fn invalidate(&self);
}
