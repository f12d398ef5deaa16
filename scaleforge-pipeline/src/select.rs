use std::path::Path;
use std::process::Command;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use scaleforge_runtime::ModelStore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend::Backend;
use crate::backends::{EsrganBackend, NcnnBackend, ResizeBackend};

/// Env vars that force a backend, checked in order.
const ENV_FORCE: [&str; 2] = ["FORCE_BACKEND", "SCALEFORGE_BACKEND"];

const CAPS_FILE: &str = "gpu_caps.json";
const DEFAULT_MAX_TILE: u32 = 512;
const DEFAULT_MAX_MEGAPIXELS: f64 = 64.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum BackendChoice {
    Esrgan,
    #[strum(to_string = "ncnn", serialize = "vulkan")]
    Ncnn,
    #[strum(to_string = "resize", serialize = "cpu")]
    Resize,
}

fn env_override() -> Option<BackendChoice> {
    for key in ENV_FORCE {
        if let Ok(value) = std::env::var(key)
            && !value.is_empty()
        {
            match BackendChoice::from_str(&value) {
                Ok(choice) => return Some(choice),
                Err(_) => warn!(%key, %value, "ignoring unknown backend override"),
            }
        }
    }
    None
}

/// Pick a backend: explicit override first (flag, then env), otherwise the
/// first available adapter in preference order. The resize fallback always
/// exists, so this only fails when an *override* names an unusable backend.
pub async fn select_backend(
    store: &Arc<ModelStore>,
    model: &str,
    force: Option<BackendChoice>,
    cpu: bool,
) -> anyhow::Result<Arc<dyn Backend>> {
    if let Some(choice) = force.or_else(env_override) {
        info!(backend = %choice, "backend forced by override");
        return build(store, model, choice, cpu);
    }

    let esrgan = EsrganBackend::new(Arc::clone(store), model, cpu);
    if esrgan.is_available().await {
        return Ok(Arc::new(esrgan));
    }

    if let Some(ncnn) = NcnnBackend::discover(model)
        && ncnn.is_available().await
    {
        info!("no candle-capable model entry, using NCNN-Vulkan binary");
        return Ok(Arc::new(ncnn));
    }

    warn!("no inference backend available, falling back to CPU resize");
    Ok(Arc::new(ResizeBackend))
}

fn build(
    store: &Arc<ModelStore>,
    model: &str,
    choice: BackendChoice,
    cpu: bool,
) -> anyhow::Result<Arc<dyn Backend>> {
    Ok(match choice {
        BackendChoice::Esrgan => Arc::new(EsrganBackend::new(Arc::clone(store), model, cpu)),
        BackendChoice::Ncnn => Arc::new(
            NcnnBackend::discover(model)
                .context("ncnn backend forced but realesrgan-ncnn-vulkan was not found")?,
        ),
        BackendChoice::Resize => Arc::new(ResizeBackend),
    })
}

/// What the machine can handle, cached so startup does not re-probe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GpuCaps {
    pub vendor: String,
    pub backend: String,
    pub max_tile_size: u32,
    pub max_megapixels: f64,
    pub detected_at: String,
}

pub fn caps_path(data_dir: &Path) -> std::path::PathBuf {
    data_dir.join(CAPS_FILE)
}

pub fn load_caps(data_dir: &Path) -> Option<GpuCaps> {
    let text = std::fs::read_to_string(caps_path(data_dir)).ok()?;
    match serde_json::from_str(&text) {
        Ok(caps) => Some(caps),
        Err(err) => {
            warn!(error = %err, "discarding unreadable GPU capability cache");
            None
        }
    }
}

pub fn save_caps(data_dir: &Path, caps: &GpuCaps) -> std::io::Result<()> {
    std::fs::create_dir_all(data_dir)?;
    std::fs::write(caps_path(data_dir), serde_json::to_string_pretty(caps)?)
}

/// Cached capabilities, probing (and re-caching) when absent or forced.
pub fn detect_caps(data_dir: &Path, backend_name: &str, force_probe: bool) -> GpuCaps {
    if !force_probe
        && let Some(caps) = load_caps(data_dir)
    {
        return caps;
    }

    let caps = GpuCaps {
        vendor: detect_gpu_vendor().to_string(),
        backend: backend_name.to_string(),
        max_tile_size: DEFAULT_MAX_TILE,
        max_megapixels: DEFAULT_MAX_MEGAPIXELS,
        detected_at: chrono::Utc::now().to_rfc3339(),
    };
    if let Err(err) = save_caps(data_dir, &caps) {
        warn!(error = %err, "failed to cache GPU capabilities");
    }
    caps
}

pub fn detect_gpu_vendor() -> &'static str {
    let succeeds = |cmd: &mut Command| {
        cmd.output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    };
    let stdout_of = |cmd: &mut Command| {
        cmd.output()
            .ok()
            .map(|output| String::from_utf8_lossy(&output.stdout).to_lowercase())
            .unwrap_or_default()
    };

    if succeeds(&mut Command::new("nvidia-smi")) {
        return "nvidia";
    }

    if cfg!(target_os = "linux") {
        let listing = stdout_of(&mut Command::new("lspci"));
        if listing.contains("amd") || listing.contains("ati") {
            return "amd";
        }
    } else if cfg!(target_os = "windows") {
        let listing = stdout_of(
            Command::new("wmic").args(["path", "win32_VideoController", "get", "name"]),
        );
        if listing.contains("nvidia") {
            return "nvidia";
        }
        if listing.contains("amd") {
            return "amd";
        }
    }

    "unknown"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn choice_accepts_aliases() {
        assert_eq!(BackendChoice::from_str("vulkan"), Ok(BackendChoice::Ncnn));
        assert_eq!(BackendChoice::from_str("NCNN"), Ok(BackendChoice::Ncnn));
        assert_eq!(BackendChoice::from_str("cpu"), Ok(BackendChoice::Resize));
        assert_eq!(BackendChoice::from_str("esrgan"), Ok(BackendChoice::Esrgan));
        assert!(BackendChoice::from_str("metal").is_err());
    }

    #[test]
    fn caps_cache_round_trips() {
        let dir = tempfile::tempdir().expect("temp dir");
        let caps = GpuCaps {
            vendor: "nvidia".into(),
            backend: "esrgan".into(),
            max_tile_size: 256,
            max_megapixels: 32.0,
            detected_at: "2026-01-01T00:00:00+00:00".into(),
        };
        save_caps(dir.path(), &caps).expect("save");
        assert_eq!(load_caps(dir.path()), Some(caps));
    }

    #[test]
    fn unreadable_cache_is_discarded() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::write(caps_path(dir.path()), b"{ nope").expect("write junk");
        assert_eq!(load_caps(dir.path()), None);
    }

    #[test]
    fn detect_prefers_cache_unless_probing_is_forced() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cached = GpuCaps {
            vendor: "cached-vendor".into(),
            backend: "esrgan".into(),
            max_tile_size: 128,
            max_megapixels: 16.0,
            detected_at: "2026-01-01T00:00:00+00:00".into(),
        };
        save_caps(dir.path(), &cached).expect("save");

        assert_eq!(detect_caps(dir.path(), "esrgan", false), cached);

        let fresh = detect_caps(dir.path(), "esrgan", true);
        assert_ne!(fresh.vendor, "cached-vendor");
        assert_eq!(fresh.max_tile_size, DEFAULT_MAX_TILE);
    }
}
