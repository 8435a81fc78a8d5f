use crate::core::config::Config;
use crate::core::voice::VoiceRole;
use crate::services::budget::CostModel;
use crate::utils::audio::AudioFormat;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::info;

pub mod coqui;
pub mod openai;

// --- Constants ---

pub const PROVIDER_OPENAI: &str = "openai";
pub const PROVIDER_COQUI: &str = "coqui";

pub const MALE_VOICE: &str = "nova";
pub const STORYTELLER_VOICE: &str = "fable";

/// Encoded audio as returned by an engine.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub bytes: Vec<u8>,
    pub format: AudioFormat,
}

#[async_trait]
pub trait TtsClient: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio>;

    /// Engine description for logs and reports.
    fn name(&self) -> String;

    fn cost_model(&self) -> CostModel;

    fn estimate_usd(&self, chars: usize) -> f64 {
        self.cost_model().estimate_usd(chars)
    }
}

/// Engine and voice each narrator role is produced with by default.
pub fn default_engine(role: VoiceRole) -> (&'static str, Option<&'static str>) {
    match role {
        VoiceRole::Male => (PROVIDER_OPENAI, Some(MALE_VOICE)),
        VoiceRole::Female => (PROVIDER_COQUI, None),
        VoiceRole::Storyteller => (PROVIDER_OPENAI, Some(STORYTELLER_VOICE)),
    }
}

pub fn create_tts_client(config: &Config, provider: &str, voice: Option<&str>) -> Result<Box<dyn TtsClient>> {
    info!("Initializing TTS Client for provider: {}", provider);
    match provider {
        PROVIDER_OPENAI => {
            let mut client = openai::OpenAiTts::new(config.audio.openai.clone(), config.audio.cost)?;
            if let Some(v) = voice {
                client = client.with_voice(v);
            }
            Ok(Box::new(client))
        }
        PROVIDER_COQUI => Ok(Box::new(coqui::CoquiTts::new(&config.audio.coqui)?)),
        _ => Err(anyhow!("Unknown TTS provider: {}", provider)),
    }
}

/// Client for one narrator role, honouring explicit overrides.
pub fn create_for_role(
    config: &Config,
    role: VoiceRole,
    provider: Option<&str>,
    voice: Option<&str>,
) -> Result<Box<dyn TtsClient>> {
    let (default_provider, default_voice) = default_engine(role);
    create_tts_client(config, provider.unwrap_or(default_provider), voice.or(default_voice))
}

/// Prices text without being able to speak it. Needs no credentials or
/// model files, so dry runs and read-only commands work anywhere.
pub struct EstimateOnly {
    label: String,
    cost: CostModel,
}

impl EstimateOnly {
    pub fn none() -> Self {
        Self {
            label: "none".to_string(),
            cost: CostModel::free(),
        }
    }
}

#[async_trait]
impl TtsClient for EstimateOnly {
    async fn synthesize(&self, _text: &str) -> Result<SynthesizedAudio> {
        Err(anyhow!("{} cannot synthesize audio", self.name()))
    }

    fn name(&self) -> String {
        self.label.clone()
    }

    fn cost_model(&self) -> CostModel {
        self.cost
    }
}

/// Same engine choice as [`create_for_role`], priced but never built.
pub fn estimator_for_role(
    config: &Config,
    role: VoiceRole,
    provider: Option<&str>,
    voice: Option<&str>,
) -> Result<EstimateOnly> {
    let (default_provider, default_voice) = default_engine(role);
    let provider = provider.unwrap_or(default_provider);
    let (label, cost) = match provider {
        PROVIDER_OPENAI => {
            let voice = voice.or(default_voice).unwrap_or(config.audio.openai.voice.as_str());
            (
                format!("openai ({}, {}) [dry run]", config.audio.openai.model, voice),
                config.audio.cost,
            )
        }
        PROVIDER_COQUI => ("coqui [dry run]".to_string(), CostModel::free()),
        _ => return Err(anyhow!("Unknown TTS provider: {}", provider)),
    };
    Ok(EstimateOnly { label, cost })
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_defaults() {
        assert_eq!(default_engine(VoiceRole::Male), (PROVIDER_OPENAI, Some("nova")));
        assert_eq!(default_engine(VoiceRole::Female).0, PROVIDER_COQUI);
        assert_eq!(default_engine(VoiceRole::Storyteller).1, Some("fable"));
    }

    #[test]
    fn test_unknown_provider() {
        let err = create_tts_client(&Config::default(), "espeak", None)
            .err()
            .expect("unknown provider");
        assert!(err.to_string().contains("espeak"));
    }

    #[tokio::test]
    async fn test_estimator_needs_no_api_key() -> Result<()> {
        let config = Config::default();
        assert!(config.audio.openai.api_key.is_none());
        assert!(create_for_role(&config, VoiceRole::Male, None, None).is_err());

        let male = estimator_for_role(&config, VoiceRole::Male, None, None)?;
        assert!(male.name().contains("nova"));
        assert!((male.estimate_usd(900) - 0.015).abs() < 1e-12);
        assert!(male.synthesize("안녕").await.is_err());

        let female = estimator_for_role(&config, VoiceRole::Female, None, None)?;
        assert_eq!(female.estimate_usd(900), 0.0);
        assert!(estimator_for_role(&config, VoiceRole::Male, Some("espeak"), None).is_err());
        Ok(())
    }

    #[test]
    fn test_openai_voice_override() -> Result<()> {
        let mut config = Config::default();
        config.audio.openai.api_key = Some("sk-test".to_string());
        let client = create_for_role(&config, VoiceRole::Storyteller, None, None)?;
        assert!(client.name().contains("fable"));
        let client = create_for_role(&config, VoiceRole::Storyteller, None, Some("onyx"))?;
        assert!(client.name().contains("onyx"));
        Ok(())
    }
}
