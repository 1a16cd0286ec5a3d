//! Provider capability contract.
//!
//! Each platform driver implements [`VideoProvider`]. The core selects a
//! driver through the [`ProviderRegistry`] using `account.platform` and never
//! inspects the platform itself.

pub mod http;
pub mod registry;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{Account, AspectRatio, JobSpec};

pub use registry::ProviderRegistry;

/// Error reported by a provider call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Network trouble, rate limits, temporary outages.
    #[error("transient provider error: {0}")]
    Transient(String),
    /// Rejected prompt, banned content, unknown task and similar.
    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(msg) | Self::Permanent(msg) => msg,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if status.is_client_error() && status.as_u16() != 429 => {
                Self::Permanent(format!("HTTP {status}: {err}"))
            }
            _ => Self::Transient(err.to_string()),
        }
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(err: std::io::Error) -> Self {
        Self::Transient(format!("I/O error: {err}"))
    }
}

/// What the provider is asked to render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub duration_secs: u32,
    pub aspect_ratio: AspectRatio,
    /// `landscape`, `portrait` or `square`, for drivers that take a name
    /// rather than a ratio.
    pub orientation: String,
    /// Frames to render at 30 fps.
    pub n_frames: u32,
    pub image_ref: Option<String>,
}

impl From<&JobSpec> for GenerationRequest {
    fn from(spec: &JobSpec) -> Self {
        Self {
            prompt: spec.prompt.clone(),
            duration_secs: spec.duration_secs,
            aspect_ratio: spec.aspect_ratio,
            orientation: spec.aspect_ratio.orientation().to_string(),
            n_frames: spec.n_frames(),
            image_ref: spec.image_ref.clone(),
        }
    }
}

/// Accepted generation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationTicket {
    pub task_id: String,
}

/// Outcome of a status poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    NotReady {
        /// Provider-reported completion, 0..=100, when available.
        progress_pct: Option<u8>,
    },
    Ready {
        video_id: String,
        download_url: String,
    },
}

/// A fetched artifact on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedArtifact {
    pub path: PathBuf,
    pub bytes: u64,
}

/// Credit balance reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditsInfo {
    pub credits: i64,
    /// Seconds until the balance resets, if the provider says.
    pub reset_seconds: Option<u64>,
}

#[async_trait]
pub trait VideoProvider: Send + Sync {
    /// Platform name this provider serves; matches `Account::platform`.
    fn platform_id(&self) -> &str;

    /// Establish or refresh the session for `account`.
    async fn login(&self, account: &Account) -> Result<(), ProviderError>;

    async fn generate_video(
        &self,
        account: &Account,
        request: &GenerationRequest,
    ) -> Result<GenerationTicket, ProviderError>;

    async fn poll_status(
        &self,
        account: &Account,
        task_id: &str,
    ) -> Result<PollStatus, ProviderError>;

    /// Fetch `url` into `dest`.
    ///
    /// The default streams the URL over HTTP; drivers that need session
    /// cookies or a browser override it.
    async fn download_video(
        &self,
        _account: &Account,
        url: &str,
        dest: &Path,
    ) -> Result<DownloadedArtifact, ProviderError> {
        http::download_to_file(url, dest).await
    }

    async fn get_credits(&self, account: &Account) -> Result<CreditsInfo, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_classification() {
        assert!(ProviderError::transient("429").is_transient());
        assert!(!ProviderError::permanent("banned").is_transient());
        assert_eq!(ProviderError::permanent("banned").message(), "banned");

        let io: ProviderError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert!(io.is_transient());
    }

    #[test]
    fn test_generation_request_from_spec() {
        let spec = JobSpec::new("sora", "a red kite", 10, AspectRatio::Landscape)
            .with_image_ref("ref.png");
        let request = GenerationRequest::from(&spec);
        assert_eq!(request.prompt, "a red kite");
        assert_eq!(request.duration_secs, 10);
        assert_eq!(request.n_frames, 300);
        assert_eq!(request.orientation, "landscape");
        assert_eq!(request.image_ref.as_deref(), Some("ref.png"));
    }
}
