use std::path::{Path, PathBuf};

use async_trait::async_trait;
use scaleforge_runtime::ncnn;
use tokio::process::Command;
use tracing::debug;

use crate::backend::{Backend, BackendError, UpscaleOptions};

/// Drives the external `realesrgan-ncnn-vulkan` executable. The binary owns
/// the GPU work; we only build its command line and interpret the exit
/// status.
pub struct NcnnBackend {
    binary: PathBuf,
    model: String,
}

impl NcnnBackend {
    /// `None` when the binary cannot be found.
    pub fn discover(model: impl Into<String>) -> Option<Self> {
        ncnn::ncnn_binary().map(|binary| Self {
            binary,
            model: model.into(),
        })
    }
}

#[async_trait]
impl Backend for NcnnBackend {
    fn name(&self) -> &'static str {
        "ncnn"
    }

    fn description(&self) -> String {
        format!("NCNN-Vulkan ({})", self.binary.display())
    }

    async fn is_available(&self) -> bool {
        ncnn::ncnn_available().await
    }

    async fn upscale(
        &self,
        src: &Path,
        dst: &Path,
        opts: &UpscaleOptions,
    ) -> Result<(), BackendError> {
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut command = Command::new(&self.binary);
        command
            .arg("-i")
            .arg(src)
            .arg("-o")
            .arg(dst)
            .arg("-s")
            .arg(opts.scale.to_string())
            .arg("-n")
            .arg(&self.model);
        if let Some(tile) = opts.tile {
            command.arg("-t").arg(tile.to_string());
        }

        debug!(binary = %self.binary.display(), src = %src.display(), "running ncnn backend");
        let output = command.output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() {
                stdout
            } else {
                stderr
            };
            return Err(BackendError::fatal(format!(
                "ncnn backend failed (code {}): {}",
                output.status.code().unwrap_or(-1),
                detail.trim()
            )));
        }

        Ok(())
    }
}
