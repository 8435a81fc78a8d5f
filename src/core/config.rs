use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::error::PipelineError;
use crate::services::budget::CostModel;
use crate::services::tts::coqui::CoquiConfig;
use crate::services::tts::openai::OpenAiTtsConfig;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub imaging: ImagingConfig,

    #[serde(default = "default_output")]
    pub output_folder: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            audio: AudioConfig::default(),
            imaging: ImagingConfig::default(),
            output_folder: default_output(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct BackendConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

/// Validated backend credentials.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub base_url: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AudioConfig {
    #[serde(default)]
    pub cost: CostModel,

    #[serde(default)]
    pub openai: OpenAiTtsConfig,
    #[serde(default)]
    pub coqui: CoquiConfig,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            cost: CostModel::default(),
            openai: OpenAiTtsConfig::default(),
            coqui: CoquiConfig::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImagingConfig {
    #[serde(default = "default_rembg_bin")]
    pub rembg_bin: String,
    /// rembg model name, e.g. `u2net` or `isnet-general-use`.
    pub model: Option<String>,
    #[serde(default = "default_max_side")]
    pub max_side: u32,
}

impl Default for ImagingConfig {
    fn default() -> Self {
        Self {
            rembg_bin: default_rembg_bin(),
            model: None,
            max_side: default_max_side(),
        }
    }
}

fn default_output() -> String {
    "output".to_string()
}
fn default_rembg_bin() -> String {
    "rembg".to_string()
}
fn default_max_side() -> u32 {
    512
}

impl Config {
    /// Reads `path` when it exists (defaults otherwise), then applies the
    /// environment on top.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_yaml_ng::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            log::debug!("{} not found, using defaults", path.display());
            Config::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = non_empty("PB_BASE_URL") {
            self.backend.base_url = v;
        }
        if let Some(v) = non_empty("PB_EMAIL") {
            self.backend.email = v;
        }
        if let Some(v) = non_empty("PB_PASSWORD") {
            self.backend.password = v;
        }
        if let Some(v) = non_empty("OPENAI_API_KEY") {
            self.audio.openai.api_key = Some(v);
        }
    }

    pub fn credentials(&self) -> Result<Credentials, PipelineError> {
        let b = &self.backend;
        let mut missing = Vec::new();
        if b.base_url.trim().is_empty() {
            missing.push("PB_BASE_URL");
        }
        if b.email.trim().is_empty() {
            missing.push("PB_EMAIL");
        }
        if b.password.is_empty() {
            missing.push("PB_PASSWORD");
        }
        if !missing.is_empty() {
            return Err(PipelineError::missing(format!(
                "{} (set them in .env, the environment or config.yml)",
                missing.join(", ")
            )));
        }
        Ok(Credentials {
            base_url: b.base_url.trim().trim_end_matches('/').to_string(),
            email: b.email.trim().to_string(),
            password: b.password.clone(),
        })
    }

    pub fn output_dir(&self, flag: Option<&Path>) -> PathBuf {
        flag.map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(&self.output_folder))
    }
}
