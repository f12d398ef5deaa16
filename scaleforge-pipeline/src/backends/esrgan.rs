use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use image::imageops::FilterType;
use scaleforge_ml::esrgan::Esrgan;
use scaleforge_ml::{device, device_kind};
use scaleforge_runtime::{ModelStore, StoreError};
use tokio::sync::OnceCell;
use tokio::task;
use tracing::info;

use crate::backend::{Backend, BackendError, UpscaleOptions};

/// Real-ESRGAN inference through candle. Weights come from the model store
/// on first use; the loaded network is shared across jobs.
pub struct EsrganBackend {
    store: Arc<ModelStore>,
    model_name: String,
    cpu: bool,
    model: OnceCell<Arc<Esrgan>>,
}

impl EsrganBackend {
    pub fn new(store: Arc<ModelStore>, model_name: impl Into<String>, cpu: bool) -> Self {
        Self {
            store,
            model_name: model_name.into(),
            cpu,
            model: OnceCell::new(),
        }
    }

    async fn model(&self) -> Result<Arc<Esrgan>, BackendError> {
        self.model
            .get_or_try_init(|| async {
                let entry = self
                    .store
                    .manifest()
                    .get(&self.model_name)
                    .map_err(|err| BackendError::fatal(err.to_string()))?;
                let arch = entry.arch.ok_or_else(|| {
                    BackendError::fatal(format!(
                        "model {} has no architecture parameters in the registry",
                        self.model_name
                    ))
                })?;

                let weights = self.store.ensure_model(&self.model_name).await.map_err(
                    |err| match err {
                        StoreError::Registry(_) => BackendError::fatal(err.to_string()),
                        _ => BackendError::transient(err.to_string()),
                    },
                )?;

                let cpu = self.cpu;
                info!(model = %self.model_name, device = %device_kind(cpu), "loading esrgan weights");
                let model = task::spawn_blocking(move || -> anyhow::Result<Esrgan> {
                    let device = device(cpu)?;
                    Esrgan::load(&weights, device, arch.num_feat, arch.num_block, arch.scale)
                })
                .await
                .map_err(|err| BackendError::transient(err.to_string()))?
                .map_err(|err| BackendError::fatal(err.to_string()))?;

                Ok(Arc::new(model))
            })
            .await
            .cloned()
    }
}

#[async_trait]
impl Backend for EsrganBackend {
    fn name(&self) -> &'static str {
        "esrgan"
    }

    fn description(&self) -> String {
        format!("Real-ESRGAN/candle ({}) - {}", device_kind(self.cpu), self.model_name)
    }

    async fn is_available(&self) -> bool {
        self.store
            .manifest()
            .get(&self.model_name)
            .map(|entry| entry.arch.is_some())
            .unwrap_or(false)
    }

    async fn upscale(
        &self,
        src: &Path,
        dst: &Path,
        opts: &UpscaleOptions,
    ) -> Result<(), BackendError> {
        let model = self.model().await?;
        if opts.scale != 2 && opts.scale != model.scale() {
            return Err(BackendError::fatal(format!(
                "unsupported scale x{} for model {}",
                opts.scale, self.model_name
            )));
        }

        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let src = src.to_path_buf();
        let dst = dst.to_path_buf();
        let opts = *opts;
        task::spawn_blocking(move || -> Result<(), BackendError> {
            let image = image::open(&src)
                .map_err(|err| BackendError::fatal(format!("cannot decode {}: {err}", src.display())))?;

            let upscaled = model
                .inference(&image, opts.tile)
                .map_err(|err| BackendError::fatal(err.to_string()))?;

            // Weights are native x4; smaller factors downsample the result.
            let result = if opts.scale < model.scale() {
                let factor = model.scale() / opts.scale;
                upscaled.resize_exact(
                    upscaled.width() / factor,
                    upscaled.height() / factor,
                    FilterType::Lanczos3,
                )
            } else {
                upscaled
            };

            result
                .save(&dst)
                .map_err(|err| BackendError::fatal(format!("cannot encode {}: {err}", dst.display())))?;
            Ok(())
        })
        .await
        .map_err(|err| BackendError::transient(err.to_string()))?
    }
}
