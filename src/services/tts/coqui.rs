use anyhow::{Context, Result};
use async_trait::async_trait;
use hf_hub::api::tokio::Api;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::fs;
use tokio::process::Command;

use super::{SynthesizedAudio, TtsClient};
use crate::core::error::PipelineError;
use crate::services::budget::CostModel;
use crate::utils::audio::AudioFormat;

pub const KSS_REPO: &str = "neurlang/coqui-vits-kss-korean";
pub const KSS_FILES: [&str; 2] = ["best_model.pth", "config.json"];
pub const XTTS_MODEL: &str = "tts_models/multilingual/multi-dataset/xtts_v2";

const SPEAKER_CANDIDATES: [&str; 2] = ["speaker_female.wav", "ko_kss.wav"];
const RENDER_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CoquiMode {
    #[default]
    Auto,
    Kss,
    Xtts,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CoquiConfig {
    #[serde(default = "default_bin")]
    pub bin: String,
    #[serde(default)]
    pub mode: CoquiMode,
    /// Where `tts-models --download` puts the KSS files.
    #[serde(default = "default_models_dir")]
    pub models_dir: String,
    pub kss_model: Option<String>,
    pub kss_config: Option<String>,
    pub speaker_wav: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_bin() -> String {
    "tts".to_string()
}
fn default_models_dir() -> String {
    "models".to_string()
}
fn default_language() -> String {
    "ko".to_string()
}

impl Default for CoquiConfig {
    fn default() -> Self {
        Self {
            bin: default_bin(),
            mode: CoquiMode::default(),
            models_dir: default_models_dir(),
            kss_model: None,
            kss_config: None,
            speaker_wav: None,
            language: default_language(),
        }
    }
}

/// Which local model the `tts` command will run.
#[derive(Debug, Clone, PartialEq)]
pub enum CoquiEngine {
    Kss { model: PathBuf, config: PathBuf },
    Xtts { speaker_wav: PathBuf },
}

/// What exists on disk, for `tts-models`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelStatus {
    pub kss_model: PathBuf,
    pub kss_config: PathBuf,
    pub kss_ready: bool,
    pub speaker_wav: Option<PathBuf>,
}

impl CoquiConfig {
    fn kss_paths(&self) -> (PathBuf, PathBuf) {
        let dir = Path::new(&self.models_dir);
        let model = self
            .kss_model
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| dir.join(KSS_FILES[0]));
        let config = self
            .kss_config
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| dir.join(KSS_FILES[1]));
        (model, config)
    }

    fn find_speaker(&self) -> Option<PathBuf> {
        if let Some(p) = &self.speaker_wav {
            let p = PathBuf::from(p);
            return p.exists().then_some(p);
        }
        SPEAKER_CANDIDATES
            .iter()
            .map(|name| Path::new(&self.models_dir).join(name))
            .find(|p| p.exists())
    }

    pub fn status(&self) -> ModelStatus {
        let (kss_model, kss_config) = self.kss_paths();
        ModelStatus {
            kss_ready: kss_model.exists() && kss_config.exists(),
            kss_model,
            kss_config,
            speaker_wav: self.find_speaker(),
        }
    }

    pub fn resolve(&self) -> Result<CoquiEngine, PipelineError> {
        let status = self.status();
        let kss = || CoquiEngine::Kss {
            model: status.kss_model.clone(),
            config: status.kss_config.clone(),
        };
        match self.mode {
            CoquiMode::Kss if status.kss_ready => Ok(kss()),
            CoquiMode::Kss => Err(PipelineError::missing(format!(
                "KSS model files {} and {} (run `tts-models --download`)",
                status.kss_model.display(),
                status.kss_config.display()
            ))),
            CoquiMode::Xtts => status
                .speaker_wav
                .map(|speaker_wav| CoquiEngine::Xtts { speaker_wav })
                .ok_or_else(|| PipelineError::missing("XTTS speaker reference WAV (coqui.speaker_wav)")),
            CoquiMode::Auto => {
                if status.kss_ready {
                    Ok(kss())
                } else if let Some(speaker_wav) = status.speaker_wav {
                    Ok(CoquiEngine::Xtts { speaker_wav })
                } else {
                    Err(PipelineError::missing(
                        "a local voice model: KSS files or an XTTS speaker WAV (run `tts-models`)",
                    ))
                }
            }
        }
    }
}

/// Lowers VITS sampling noise for a calmer read. Handles configs that nest
/// the arguments under `model` instead of `model_args`.
pub fn soften_vits_config(config: &mut Value) {
    let key = if config.get("model_args").is_some_and(Value::is_object) {
        "model_args"
    } else {
        "model"
    };
    let Some(args) = config.get_mut(key).and_then(Value::as_object_mut) else {
        return;
    };
    let noise = args.get("inference_noise_scale").and_then(Value::as_f64).unwrap_or(0.667);
    let noise_dp = args.get("inference_noise_scale_dp").and_then(Value::as_f64).unwrap_or(1.0);
    args.insert("inference_noise_scale".to_string(), Value::from(noise * 0.6));
    args.insert("inference_noise_scale_dp".to_string(), Value::from(noise_dp * 0.8));
}

/// Fetches the KSS model files into `models_dir`, skipping ones already there.
pub async fn download_kss_model(models_dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(models_dir).await?;
    let api = Api::new()?;
    let repo = api.model(KSS_REPO.to_string());

    let mut paths = Vec::new();
    for name in KSS_FILES {
        let target = models_dir.join(name);
        if target.exists() {
            info!("{} already present", target.display());
        } else {
            info!("Downloading {} from {}...", name, KSS_REPO);
            let cached = repo
                .get(name)
                .await
                .with_context(|| format!("Failed to download {}", name))?;
            fs::copy(&cached, &target)
                .await
                .with_context(|| format!("Failed to copy {} into {}", name, models_dir.display()))?;
        }
        paths.push(target);
    }
    Ok(paths)
}

pub struct CoquiTts {
    bin: String,
    language: String,
    engine: CoquiEngine,
}

impl CoquiTts {
    pub fn new(config: &CoquiConfig) -> Result<Self> {
        let engine = config.resolve()?;
        Ok(Self {
            bin: config.bin.clone(),
            language: config.language.clone(),
            engine,
        })
    }

    pub fn engine(&self) -> &CoquiEngine {
        &self.engine
    }

    async fn command_args(&self, text: &str, workdir: &Path, out: &Path) -> Result<Vec<String>> {
        let mut args = vec!["--text".to_string(), text.trim().to_string()];
        match &self.engine {
            CoquiEngine::Kss { model, config } => {
                let raw = fs::read_to_string(config)
                    .await
                    .with_context(|| format!("Failed to read {}", config.display()))?;
                let mut cfg: Value = serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to parse {}", config.display()))?;
                soften_vits_config(&mut cfg);
                let softened = workdir.join("config.json");
                fs::write(&softened, serde_json::to_string_pretty(&cfg)?).await?;

                args.extend([
                    "--model_path".to_string(),
                    model.display().to_string(),
                    "--config_path".to_string(),
                    softened.display().to_string(),
                ]);
            }
            CoquiEngine::Xtts { speaker_wav } => {
                args.extend([
                    "--model_name".to_string(),
                    XTTS_MODEL.to_string(),
                    "--speaker_wav".to_string(),
                    speaker_wav.display().to_string(),
                    "--language_idx".to_string(),
                    self.language.clone(),
                ]);
            }
        }
        args.extend(["--out_path".to_string(), out.display().to_string()]);
        Ok(args)
    }
}

#[async_trait]
impl TtsClient for CoquiTts {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio> {
        let workdir = tempfile::tempdir()?;
        let out = workdir.path().join("speech.wav");
        let args = self.command_args(text, workdir.path(), &out).await?;
        debug!("{} {}", self.bin, args[2..].join(" "));

        let fut = Command::new(&self.bin)
            .args(&args)
            .env("COQUI_TOS_AGREED", "1")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(RENDER_TIMEOUT, fut)
            .await
            .map_err(|_| PipelineError::tool(&self.bin, "timed out"))?
            .map_err(|e| PipelineError::tool(&self.bin, e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(3).collect();
            return Err(PipelineError::tool(
                &self.bin,
                format!("{}: {}", output.status, tail.into_iter().rev().collect::<Vec<_>>().join(" | ")),
            )
            .into());
        }

        let bytes = fs::read(&out)
            .await
            .map_err(|e| PipelineError::tool(&self.bin, format!("no output file: {}", e)))?;
        Ok(SynthesizedAudio {
            bytes,
            format: AudioFormat::Wav,
        })
    }

    fn name(&self) -> String {
        match &self.engine {
            CoquiEngine::Kss { .. } => "coqui (KSS)".to_string(),
            CoquiEngine::Xtts { .. } => "coqui (XTTS v2)".to_string(),
        }
    }

    fn cost_model(&self) -> CostModel {
        CostModel::free()
    }
}
