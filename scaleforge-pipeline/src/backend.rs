use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

/// How a backend run failed. The job queue retries `Transient` failures
/// with backoff; `Fatal` failures are terminal for the job.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{0}")]
    Fatal(String),
    #[error("{0}")]
    Transient(String),
}

impl BackendError {
    pub fn fatal(msg: impl Into<String>) -> Self {
        BackendError::Fatal(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        BackendError::Transient(msg.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, BackendError::Fatal(_))
    }
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        BackendError::Transient(err.to_string())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UpscaleOptions {
    /// Target scale factor, 2 or 4.
    pub scale: u32,
    /// Tile side length for memory-bounded inference.
    pub tile: Option<usize>,
}

impl Default for UpscaleOptions {
    fn default() -> Self {
        Self {
            scale: 2,
            tile: None,
        }
    }
}

/// One way of producing an upscaled image. Implementations delegate the
/// actual work to an inference engine or an external process.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> String;

    async fn is_available(&self) -> bool;

    /// Upscale one image from `src` to `dst`.
    async fn upscale(
        &self,
        src: &Path,
        dst: &Path,
        opts: &UpscaleOptions,
    ) -> Result<(), BackendError>;
}
