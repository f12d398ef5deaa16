use std::env;
use std::path::PathBuf;

use tokio::process::Command;

pub const NCNN_BINARY: &str = "realesrgan-ncnn-vulkan";
pub const NCNN_PATH_ENV: &str = "SCALEFORGE_NCNN_PATH";

/// Locate the external NCNN-Vulkan binary: explicit env override first,
/// then a `$PATH` search.
pub fn ncnn_binary() -> Option<PathBuf> {
    if let Some(path) = env::var_os(NCNN_PATH_ENV) {
        let path = PathBuf::from(path);
        return path.is_file().then_some(path);
    }

    let filename = if cfg!(target_os = "windows") {
        format!("{NCNN_BINARY}.exe")
    } else {
        NCNN_BINARY.to_string()
    };

    env::var_os("PATH").and_then(|paths| {
        env::split_paths(&paths)
            .map(|dir| dir.join(&filename))
            .find(|candidate| candidate.is_file())
    })
}

/// Whether the binary exists and responds to `-h`.
pub async fn ncnn_available() -> bool {
    let Some(binary) = ncnn_binary() else {
        return false;
    };
    matches!(
        Command::new(binary).arg("-h").output().await,
        Ok(output) if output.status.success()
    )
}
