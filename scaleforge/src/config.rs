use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

pub const CONFIG_ENV: &str = "SCALEFORGE_CONFIG";
pub const HOME_ENV: &str = "SCALEFORGE_HOME";
const CONFIG_FILENAME: &str = "scaleforge.toml";

/// Raw file contents: path values may carry `${APP_ROOT}` / `${USER_HOME}`
/// tokens and are expanded at load time. Unknown keys are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    database_path: Option<String>,
    log_dir: Option<String>,
    model_dir: Option<String>,
    output_dir: Option<String>,
    registry_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub app_root: PathBuf,
    pub database_path: PathBuf,
    pub log_dir: PathBuf,
    pub model_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Optional user manifest layered over the builtin registry.
    pub registry_path: PathBuf,
}

fn expand_path(raw: &str, app_root: &Path) -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let expanded = raw
        .replace("${APP_ROOT}", &app_root.to_string_lossy())
        .replace("${USER_HOME}", &home.to_string_lossy());
    PathBuf::from(expanded)
}

fn default_app_root() -> PathBuf {
    if let Some(root) = std::env::var_os(HOME_ENV) {
        return PathBuf::from(root);
    }
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("scaleforge")
}

impl Config {
    fn from_raw(raw: RawConfig, app_root: PathBuf) -> Self {
        let path = |value: Option<String>, fallback: &str| {
            expand_path(value.as_deref().unwrap_or(fallback), &app_root)
        };
        Config {
            database_path: path(raw.database_path, "${APP_ROOT}/scaleforge.db"),
            log_dir: path(raw.log_dir, "${APP_ROOT}/logs"),
            model_dir: path(raw.model_dir, "${APP_ROOT}/models"),
            output_dir: path(raw.output_dir, "${APP_ROOT}/outputs"),
            registry_path: path(raw.registry_path, "${APP_ROOT}/registry.json"),
            app_root,
        }
    }

    fn parse(text: &str, app_root: PathBuf) -> anyhow::Result<Self> {
        let raw: RawConfig = toml::from_str(text).context("failed to parse config file")?;
        Ok(Self::from_raw(raw, app_root))
    }

    /// Load configuration: the explicit path, `$SCALEFORGE_CONFIG`, or
    /// `./scaleforge.toml`; defaults when no file exists. Directories the
    /// rest of the app assumes are created here.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let candidate = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILENAME));

        let app_root = default_app_root();
        let config = if candidate.is_file() {
            let text = std::fs::read_to_string(&candidate)
                .with_context(|| format!("failed to read {}", candidate.display()))?;
            Self::parse(&text, app_root)?
        } else {
            Self::from_raw(RawConfig::default(), app_root)
        };

        config.create_dirs()?;
        Ok(config)
    }

    fn create_dirs(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("failed to create {}", self.log_dir.display()))?;
        std::fs::create_dir_all(&self.model_dir)
            .with_context(|| format!("failed to create {}", self.model_dir.display()))?;
        std::fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("failed to create {}", self.output_dir.display()))?;
        if let Some(parent) = self.database_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        Ok(())
    }
}
