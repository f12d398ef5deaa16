use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("expected an object with a `models` list or a bare list of entries")]
    Shape,
    #[error("invalid manifest:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),
    #[error("unknown model: {0}")]
    UnknownModel(String),
}

/// Architecture parameters the candle backend needs to instantiate the
/// network for an entry's weights.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct EsrganArch {
    pub num_feat: usize,
    pub num_block: usize,
    pub scale: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<EsrganArch>,
}

impl ModelEntry {
    pub fn resolved_urls(&self) -> Vec<&str> {
        match &self.urls {
            Some(urls) if !urls.is_empty() => urls.iter().map(String::as_str).collect(),
            _ => self.url.as_deref().into_iter().collect(),
        }
    }

    /// On-disk filename: explicit, or the last path segment of the first URL.
    pub fn filename(&self) -> &str {
        if let Some(name) = &self.filename {
            return name;
        }
        self.resolved_urls()
            .first()
            .and_then(|url| url.rsplit('/').next())
            .filter(|segment| !segment.is_empty())
            .unwrap_or(&self.name)
    }

    fn problems(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.name.is_empty() {
            errors.push("name must be non-empty".to_string());
        }
        if self.sha256.len() != 64 || !self.sha256.chars().all(|c| c.is_ascii_hexdigit()) {
            errors.push("sha256 must be 64 hex characters".to_string());
        }
        match &self.urls {
            Some(urls) if urls.is_empty() => {
                errors.push("urls must be non-empty if provided".to_string());
            }
            Some(_) => {}
            None if self.url.is_none() => {
                errors.push("must supply either `url` or non-empty `urls`".to_string());
            }
            None => {}
        }
        errors
    }
}

#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub models: Vec<ModelEntry>,
}

impl Manifest {
    /// Parse a manifest document. Both `{"models": [...]}` and a bare list
    /// are accepted. Entry-level problems accumulate per item index instead
    /// of failing on the first.
    pub fn parse(text: &str) -> Result<Self, RegistryError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let items = match value {
            serde_json::Value::Array(items) => items,
            serde_json::Value::Object(mut map) => match map.remove("models") {
                Some(serde_json::Value::Array(items)) => items,
                _ => return Err(RegistryError::Shape),
            },
            _ => return Err(RegistryError::Shape),
        };

        let mut models = Vec::with_capacity(items.len());
        let mut errors = Vec::new();
        for (idx, item) in items.into_iter().enumerate() {
            match serde_json::from_value::<ModelEntry>(item) {
                Ok(mut entry) => {
                    let problems = entry.problems();
                    if problems.is_empty() {
                        entry.sha256 = entry.sha256.to_ascii_lowercase();
                        models.push(entry);
                    } else {
                        errors.extend(problems.into_iter().map(|p| format!("item {idx}: {p}")));
                    }
                }
                Err(err) => errors.push(format!("item {idx}: {err}")),
            }
        }

        let mut seen = std::collections::HashSet::new();
        let mut dupes = std::collections::BTreeSet::new();
        for entry in &models {
            if !seen.insert(entry.name.as_str()) {
                dupes.insert(entry.name.clone());
            }
        }
        if !dupes.is_empty() {
            errors.push(format!(
                "duplicate names: {}",
                dupes.into_iter().collect::<Vec<_>>().join(", ")
            ));
        }

        if errors.is_empty() {
            Ok(Manifest { models })
        } else {
            Err(RegistryError::Invalid(errors))
        }
    }

    /// The manifest compiled into the binary.
    pub fn builtin() -> Self {
        Self::parse(include_str!("builtin.json")).expect("builtin manifest is valid")
    }

    /// Layer `user` entries over this manifest; same-named user entries win.
    pub fn merged_with(mut self, user: Manifest) -> Self {
        for entry in user.models {
            if let Some(existing) = self.models.iter_mut().find(|m| m.name == entry.name) {
                *existing = entry;
            } else {
                self.models.push(entry);
            }
        }
        self
    }

    pub fn get(&self, name: &str) -> Result<&ModelEntry, RegistryError> {
        self.models
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| RegistryError::UnknownModel(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.iter().map(|m| m.name.as_str())
    }
}
