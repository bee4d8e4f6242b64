use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};

use super::gemini::{Content, DEFAULT_GEMINI_ENDPOINT, Part, summarize_error_body};
use super::provider::{
    BoxFuture, DecodePayloadSnafu, HttpRequestSnafu, MissingApiKeySnafu, ProviderConfig,
    ProviderError, ProviderResult,
};

pub const DEFAULT_SPEECH_MODEL: &str = "gemini-2.5-flash-preview-tts";
pub const DEFAULT_SPEECH_VOICE: &str = "Kore";
pub const SPEECH_SAMPLE_RATE: u32 = 24_000;

/// Raw little-endian 16-bit PCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedAudio {
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl SynthesizedAudio {
    pub fn mono_24khz(pcm: Vec<u8>) -> Self {
        Self {
            pcm,
            sample_rate: SPEECH_SAMPLE_RATE,
            channels: 1,
        }
    }

    pub fn duration_secs(&self) -> f64 {
        let bytes_per_second = self.sample_rate as f64 * self.channels as f64 * 2.0;
        if bytes_per_second == 0.0 {
            return 0.0;
        }
        self.pcm.len() as f64 / bytes_per_second
    }
}

/// Text-to-speech. Failures are reported as `None`, never as errors.
pub trait SpeechSynthesizer: Send + Sync {
    fn synthesize<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Option<SynthesizedAudio>>;
}

pub struct GeminiSpeech {
    config: ProviderConfig,
    model: String,
    voice: String,
    client: reqwest::Client,
}

impl GeminiSpeech {
    pub fn new(
        config: ProviderConfig,
        model: impl Into<String>,
        voice: impl Into<String>,
    ) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "speech-new",
                provider_id: config.provider_id.clone(),
            }
        );

        let client = reqwest::Client::builder()
            .build()
            .context(HttpRequestSnafu {
                stage: "speech-build-client",
            })?;

        let model = model.into();
        let voice = voice.into();
        Ok(Self {
            config,
            model: if model.trim().is_empty() {
                DEFAULT_SPEECH_MODEL.to_string()
            } else {
                model
            },
            voice: if voice.trim().is_empty() {
                DEFAULT_SPEECH_VOICE.to_string()
            } else {
                voice
            },
            client,
        })
    }

    fn build_body<'a>(&'a self, text: &'a str) -> SpeechRequest<'a> {
        SpeechRequest {
            contents: vec![Content {
                role: None,
                parts: vec![Part::Text { text }],
            }],
            generation_config: SpeechGenerationConfig {
                response_modalities: ["AUDIO"],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: &self.voice,
                        },
                    },
                },
            },
        }
    }

    async fn request_audio(&self, text: &str) -> ProviderResult<Option<String>> {
        let endpoint = self.config.endpoint.trim_end_matches('/');
        let endpoint = if endpoint.is_empty() {
            DEFAULT_GEMINI_ENDPOINT
        } else {
            endpoint
        };
        let url = format!("{endpoint}/models/{}:generateContent", self.model);

        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", self.config.api_key.as_str())
            .json(&self.build_body(text))
            .send()
            .await
            .context(HttpRequestSnafu {
                stage: "speech-send",
            })?;

        let status = response.status();
        let payload = response.text().await.context(HttpRequestSnafu {
            stage: "speech-read-body",
        })?;
        if !status.is_success() {
            return Err(ProviderError::ProviderStatus {
                stage: "speech-status",
                status: status.as_u16(),
                body: summarize_error_body(&payload),
            });
        }

        extract_audio(&payload)
    }
}

fn extract_audio(payload: &str) -> ProviderResult<Option<String>> {
    let response = serde_json::from_str::<SpeechResponse>(payload).context(DecodePayloadSnafu {
        stage: "speech-decode",
    })?;

    Ok(response
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .and_then(|content| content.parts.into_iter().next())
        .and_then(|part| part.inline_data)
        .map(|inline| inline.data)
        .filter(|data| !data.is_empty()))
}

impl SpeechSynthesizer for GeminiSpeech {
    fn synthesize<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Option<SynthesizedAudio>> {
        Box::pin(async move {
            if text.trim().is_empty() {
                return None;
            }

            let encoded = match self.request_audio(text).await {
                Ok(Some(encoded)) => encoded,
                Ok(None) => {
                    tracing::warn!(model = %self.model, "speech response carried no audio");
                    return None;
                }
                Err(error) => {
                    tracing::warn!(model = %self.model, error = %error, "speech synthesis failed");
                    return None;
                }
            };

            match STANDARD.decode(encoded.as_bytes()) {
                Ok(pcm) => Some(SynthesizedAudio::mono_24khz(pcm)),
                Err(error) => {
                    tracing::warn!(error = %error, "speech audio was not valid base64");
                    None
                }
            }
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: SpeechGenerationConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechGenerationConfig<'a> {
    response_modalities: [&'static str; 1],
    speech_config: SpeechConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig<'a> {
    voice_config: VoiceConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig<'a> {
    prebuilt_voice_config: PrebuiltVoiceConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig<'a> {
    voice_name: &'a str,
}

#[derive(Debug, Deserialize)]
struct SpeechResponse {
    #[serde(default)]
    candidates: Vec<SpeechCandidate>,
}

#[derive(Debug, Deserialize)]
struct SpeechCandidate {
    #[serde(default)]
    content: Option<SpeechContent>,
}

#[derive(Debug, Deserialize)]
struct SpeechContent {
    #[serde(default)]
    parts: Vec<SpeechPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpeechPart {
    #[serde(default)]
    inline_data: Option<SpeechInlineData>,
}

#[derive(Debug, Deserialize)]
struct SpeechInlineData {
    #[serde(default)]
    data: String,
}
