use std::path::Path;

use async_trait::async_trait;
use image::imageops::FilterType;
use tokio::task;

use crate::backend::{Backend, BackendError, UpscaleOptions};

/// Pure-CPU Lanczos resampling. No model, no GPU, always available; the
/// fallback of last resort when neither inference backend can run.
pub struct ResizeBackend;

#[async_trait]
impl Backend for ResizeBackend {
    fn name(&self) -> &'static str {
        "resize"
    }

    fn description(&self) -> String {
        "Lanczos3 resampling (CPU, no model)".to_string()
    }

    async fn is_available(&self) -> bool {
        true
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

        let src = src.to_path_buf();
        let dst = dst.to_path_buf();
        let scale = opts.scale;
        task::spawn_blocking(move || -> Result<(), BackendError> {
            let image = image::open(&src)
                .map_err(|err| BackendError::fatal(format!("cannot decode {}: {err}", src.display())))?;
            let resized = image.resize_exact(
                image.width() * scale,
                image.height() * scale,
                FilterType::Lanczos3,
            );
            resized
                .save(&dst)
                .map_err(|err| BackendError::fatal(format!("cannot encode {}: {err}", dst.display())))?;
            Ok(())
        })
        .await
        .map_err(|err| BackendError::transient(err.to_string()))?
    }
}
