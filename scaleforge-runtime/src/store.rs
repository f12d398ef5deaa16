use std::path::{Path, PathBuf};

use scaleforge_core::download::{self, DownloadError};
use scaleforge_core::hash;
use thiserror::Error;
use tracing::{info, warn};

use crate::registry::{Manifest, ModelEntry, RegistryError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Checksum { expected: String, actual: String },
    #[error("all URLs failed for {name}: {last_error}")]
    Download { name: String, last_error: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// On-disk cache of model weight files, fed by the registry.
pub struct ModelStore {
    model_dir: PathBuf,
    manifest: Manifest,
}

impl ModelStore {
    pub fn new(model_dir: impl Into<PathBuf>, manifest: Manifest) -> Self {
        Self {
            model_dir: model_dir.into(),
            manifest,
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn path_for(&self, entry: &ModelEntry) -> PathBuf {
        self.model_dir.join(entry.filename())
    }

    /// Whether `name` is present on disk with a matching checksum.
    pub fn is_downloaded(&self, name: &str) -> Result<bool, StoreError> {
        let entry = self.manifest.get(name)?;
        let path = self.path_for(entry);
        if !path.is_file() {
            return Ok(false);
        }
        Ok(hash::sha256_file(&path)? == entry.sha256)
    }

    /// Return the verified local path for `name`, downloading if the file is
    /// missing or fails verification. Candidate URLs are tried in order; a
    /// checksum mismatch on the final candidate is reported as such rather
    /// than as a generic download failure.
    pub async fn ensure_model(&self, name: &str) -> Result<PathBuf, StoreError> {
        let entry = self.manifest.get(name)?;
        let dest = self.path_for(entry);

        if dest.is_file() && hash::sha256_file(&dest)? == entry.sha256 {
            return Ok(dest);
        }

        tokio::fs::create_dir_all(&self.model_dir).await?;

        let mut last_err: Option<DownloadError> = None;
        for url in entry.resolved_urls() {
            info!(model = name, url, "downloading model weights");
            match download::to_file(url, &dest, Some(&entry.sha256)).await {
                Ok(()) => return Ok(dest),
                Err(err) => {
                    warn!(model = name, url, error = %err, "model download failed");
                    last_err = Some(err);
                }
            }
        }

        match last_err {
            Some(DownloadError::Checksum {
                expected, actual, ..
            }) => Err(StoreError::Checksum { expected, actual }),
            Some(err) => Err(StoreError::Download {
                name: name.to_string(),
                last_error: err.to_string(),
            }),
            // get() above guarantees at least one URL
            None => Err(StoreError::Download {
                name: name.to_string(),
                last_error: "no candidate URLs".to_string(),
            }),
        }
    }
}
