use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{SynthesizedAudio, TtsClient};
use crate::core::error::{excerpt, PipelineError};
use crate::services::budget::CostModel;
use crate::utils::audio::AudioFormat;
use crate::utils::text::truncate_chars;

pub const MAX_INPUT_CHARS: usize = 4096;
pub const INSTRUCTED_MODEL: &str = "gpt-4o-mini-tts";

pub const VOICES: [&str; 10] = [
    "alloy", "ash", "ballad", "coral", "echo", "fable", "nova", "onyx", "sage", "shimmer",
];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAiTtsConfig {
    /// Usually supplied through `OPENAI_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_instructions")]
    pub instructions: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_model() -> String {
    INSTRUCTED_MODEL.to_string()
}
fn default_voice() -> String {
    "nova".to_string()
}
fn default_instructions() -> String {
    "Speak in a warm, gentle storytelling voice for children. Friendly and engaging, not formal."
        .to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

impl Default for OpenAiTtsConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_model(),
            voice: default_voice(),
            instructions: default_instructions(),
            base_url: default_base_url(),
        }
    }
}

#[derive(Serialize, Debug, PartialEq)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: String,
    voice: &'a str,
    response_format: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<&'a str>,
}

pub struct OpenAiTts {
    config: OpenAiTtsConfig,
    api_key: String,
    cost: CostModel,
    client: Client,
}

impl OpenAiTts {
    pub fn new(config: OpenAiTtsConfig, cost: CostModel) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| PipelineError::missing("OPENAI_API_KEY"))?;
        if !VOICES.contains(&config.voice.as_str()) {
            log::warn!("Voice '{}' is not in the known voice list", config.voice);
        }
        Ok(Self {
            config,
            api_key,
            cost,
            client: Client::new(),
        })
    }

    pub fn with_voice(mut self, voice: &str) -> Self {
        self.config.voice = voice.to_string();
        self
    }

    pub fn voice(&self) -> &str {
        &self.config.voice
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn request<'a>(&'a self, text: &str) -> SpeechRequest<'a> {
        SpeechRequest {
            model: &self.config.model,
            input: truncate_chars(text, MAX_INPUT_CHARS),
            voice: &self.config.voice,
            response_format: "mp3",
            instructions: (self.config.model == INSTRUCTED_MODEL && !self.config.instructions.is_empty())
                .then_some(self.config.instructions.as_str()),
        }
    }
}

#[async_trait]
impl TtsClient for OpenAiTts {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio> {
        let url = format!("{}/audio/speech", self.config.base_url.trim_end_matches('/'));
        let body = self.request(text);
        debug!("POST {} ({} chars, voice {})", url, body.input.chars().count(), body.voice);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("Failed to send speech request")?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(PipelineError::Http {
                method: "POST",
                url,
                status,
                body: excerpt(&text),
            }
            .into());
        }

        let bytes = resp.bytes().await.context("Failed to read speech audio")?;
        Ok(SynthesizedAudio {
            bytes: bytes.to_vec(),
            format: AudioFormat::Mp3,
        })
    }

    fn name(&self) -> String {
        format!("openai ({}, {})", self.config.model, self.config.voice)
    }

    fn cost_model(&self) -> CostModel {
        self.cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(model: &str) -> Result<OpenAiTts> {
        let config = OpenAiTtsConfig {
            api_key: Some("sk-test".to_string()),
            model: model.to_string(),
            ..Default::default()
        };
        OpenAiTts::new(config, CostModel::default())
    }

    #[test]
    fn test_missing_key_is_config_error() {
        let err = OpenAiTts::new(OpenAiTtsConfig::default(), CostModel::default())
            .err()
            .expect("key required");
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MissingConfig(_))
        ));
    }

    #[test]
    fn test_instructions_only_for_instructed_model() -> Result<()> {
        let tts = client(INSTRUCTED_MODEL)?;
        let req = serde_json::to_value(tts.request("안녕"))?;
        assert_eq!(req["response_format"], "mp3");
        assert_eq!(req["voice"], "nova");
        assert!(req["instructions"].as_str().is_some_and(|s| s.contains("storytelling")));

        let tts = client("tts-1")?.with_voice("fable");
        let req = serde_json::to_value(tts.request("안녕"))?;
        assert!(req.get("instructions").is_none());
        assert_eq!(req["voice"], "fable");
        Ok(())
    }

    #[test]
    fn test_input_is_capped() -> Result<()> {
        let tts = client(INSTRUCTED_MODEL)?;
        let long = "가".repeat(MAX_INPUT_CHARS + 50);
        assert_eq!(tts.request(&long).input.chars().count(), MAX_INPUT_CHARS);
        Ok(())
    }
}
