use futures::StreamExt;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};
use tokio::sync::oneshot;

use super::provider::{
    Citation, EmptyPromptSnafu, EventSender, HttpRequestSnafu, InvalidUtf8Snafu, LlmProvider,
    MissingApiKeySnafu, ModelChunk, ProviderConfig, ProviderError, ProviderResult,
    ProviderStreamHandle, ProviderWorker, StreamEvent, StreamFailure, StreamRequest, TurnRole,
    event_channel,
};
use super::sse::SseDataBuffer;

pub const GEMINI_PROVIDER_ID: &str = "gemini";
pub const DEFAULT_GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";

/// Streams `streamGenerateContent` over server-sent events, including
/// Google Search grounding metadata.
pub struct GeminiProvider {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "gemini-new",
                provider_id: config.provider_id.clone(),
            }
        );

        let client = reqwest::Client::builder()
            .build()
            .context(HttpRequestSnafu {
                stage: "gemini-build-client",
            })?;

        Ok(Self { config, client })
    }

    fn endpoint(config: &ProviderConfig) -> &str {
        let endpoint = config.endpoint.trim_end_matches('/');
        if endpoint.is_empty() {
            DEFAULT_GEMINI_ENDPOINT
        } else {
            endpoint
        }
    }

    fn build_body(request: &StreamRequest) -> GenerateContentRequest<'_> {
        let mut contents = request
            .history
            .iter()
            .filter(|turn| !turn.text.trim().is_empty())
            .map(|turn| Content {
                role: Some(match turn.role {
                    TurnRole::User => "user",
                    TurnRole::Model => "model",
                }),
                parts: vec![Part::Text { text: &turn.text }],
            })
            .collect::<Vec<_>>();

        // The image precedes the question so the model reads it as context for the text.
        let mut prompt_parts = Vec::with_capacity(2);
        if let Some(image) = &request.image {
            prompt_parts.push(Part::Inline {
                inline_data: InlineData {
                    mime_type: image.mime_type(),
                    data: image.base64_data(),
                },
            });
        }
        prompt_parts.push(Part::Text {
            text: &request.prompt,
        });
        contents.push(Content {
            role: Some("user"),
            parts: prompt_parts,
        });

        let system_instruction = request
            .preamble
            .as_deref()
            .filter(|preamble| !preamble.trim().is_empty())
            .map(|preamble| Content {
                role: None,
                parts: vec![Part::Text { text: preamble }],
            });

        let tools = if request.search_grounding {
            vec![Tool {
                google_search: EmptyObject {},
            }]
        } else {
            Vec::new()
        };

        let generation_config = (request.temperature.is_some() || request.max_tokens.is_some())
            .then_some(GenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            });

        GenerateContentRequest {
            contents,
            system_instruction,
            tools,
            generation_config,
        }
    }

    async fn open_stream(
        client: &reqwest::Client,
        config: &ProviderConfig,
        request: &StreamRequest,
    ) -> ProviderResult<reqwest::Response> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            Self::endpoint(config),
            request.model_id
        );

        let response = client
            .post(url)
            .header("x-goog-api-key", config.api_key.as_str())
            .json(&Self::build_body(request))
            .send()
            .await
            .context(HttpRequestSnafu {
                stage: "gemini-open-stream",
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            return Err(ProviderError::ProviderStatus {
                stage: "gemini-open-stream-status",
                status: status.as_u16(),
                body: summarize_error_body(&body),
            });
        }

        Ok(response)
    }

    /// Maps one SSE payload into a chunk; `Ok(None)` for payloads with nothing to show.
    fn decode_payload(payload: &str) -> ProviderResult<Option<ModelChunk>> {
        let response = serde_json::from_str::<GenerateContentResponse>(payload).context(
            super::provider::DecodePayloadSnafu {
                stage: "gemini-decode-chunk",
            },
        )?;

        if let Some(error) = response.error {
            return Err(ProviderError::ProviderReported {
                stage: "gemini-stream-error-payload",
                message: error.message,
            });
        }

        let Some(candidate) = response.candidates.into_iter().next() else {
            return Ok(None);
        };

        let text = candidate
            .content
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter(|part| !part.thought)
                    .filter_map(|part| part.text)
                    .collect::<String>()
            })
            .filter(|text| !text.is_empty());

        let citations = candidate
            .grounding_metadata
            .map(|metadata| {
                metadata
                    .grounding_chunks
                    .into_iter()
                    .map(|chunk| {
                        let web = chunk.web.unwrap_or_default();
                        Citation::new(web.uri.unwrap_or_default(), web.title.unwrap_or_default())
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let chunk = ModelChunk { text, citations };
        Ok((!chunk.is_empty()).then_some(chunk))
    }

    fn emit_error_event(event_tx: &EventSender, error: &ProviderError) {
        let _ = event_tx.send(StreamEvent::Error(StreamFailure::from(error)));
    }

    /// Forwards every buffered payload; returns false once the receiver is gone or a payload failed.
    fn forward_payloads(
        buffer: &mut SseDataBuffer,
        event_tx: &EventSender,
        finishing: bool,
    ) -> bool {
        loop {
            let next = if finishing {
                buffer.next_payload().or_else(|| buffer.finish())
            } else {
                buffer.next_payload()
            };
            let Some(next) = next else {
                return true;
            };

            let decoded = next
                .context(InvalidUtf8Snafu {
                    stage: "gemini-read-line",
                })
                .and_then(|payload| Self::decode_payload(&payload));

            match decoded {
                Ok(Some(chunk)) => {
                    if event_tx.send(StreamEvent::Chunk(chunk)).is_err() {
                        return false;
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(error = %error, "gemini stream emitted an unusable payload");
                    Self::emit_error_event(event_tx, &error);
                    return false;
                }
            }
        }
    }

    async fn run_stream_worker(
        client: reqwest::Client,
        config: ProviderConfig,
        request: StreamRequest,
        event_tx: EventSender,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let response = tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(model_id = %request.model_id, "gemini stream cancelled before opening");
                return;
            }
            opened = Self::open_stream(&client, &config, &request) => opened,
        };

        let response = match response {
            Ok(response) => response,
            Err(error) => {
                tracing::error!(
                    provider_id = %config.provider_id,
                    model_id = %request.model_id,
                    error = %error,
                    "failed to open provider stream"
                );
                Self::emit_error_event(&event_tx, &error);
                return;
            }
        };

        let mut bytes = response.bytes_stream();
        let mut buffer = SseDataBuffer::default();

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    tracing::debug!(model_id = %request.model_id, "gemini stream cancelled");
                    return;
                }
                next_bytes = bytes.next() => {
                    match next_bytes {
                        Some(Ok(chunk)) => {
                            buffer.push(&chunk);
                            if !Self::forward_payloads(&mut buffer, &event_tx, false) {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(error = %source, "gemini stream failed mid-response");
                            let error = ProviderError::HttpRequest {
                                stage: "gemini-stream-chunk",
                                source,
                            };
                            Self::emit_error_event(&event_tx, &error);
                            return;
                        }
                        None => break,
                    }
                }
            }
        }

        if Self::forward_payloads(&mut buffer, &event_tx, true) {
            let _ = event_tx.send(StreamEvent::Done);
        }
    }
}

impl LlmProvider for GeminiProvider {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        "Google Gemini"
    }

    fn default_model(&self) -> &str {
        DEFAULT_GEMINI_MODEL
    }

    fn supports_grounding(&self) -> bool {
        true
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.prompt.trim().is_empty(),
            EmptyPromptSnafu {
                stage: "gemini-stream-chat",
            }
        );

        let (event_tx, stream, cancel_rx) = event_channel();
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.client.clone(),
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}

pub(crate) fn summarize_error_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    serde_json::from_str::<ErrorEnvelope>(trimmed)
        .ok()
        .and_then(|envelope| envelope.error)
        .map(|error| error.message)
        .filter(|message| !message.trim().is_empty())
        .unwrap_or_else(|| trimmed.chars().take(512).collect())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize)]
pub(crate) struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) role: Option<&'static str>,
    pub(crate) parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub(crate) enum Part<'a> {
    Text {
        text: &'a str,
    },
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData<'a>,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InlineData<'a> {
    pub(crate) mime_type: &'a str,
    pub(crate) data: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Tool {
    google_search: EmptyObject,
}

#[derive(Debug, Serialize)]
struct EmptyObject {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Deserialize)]
struct GroundingChunk {
    #[serde(default)]
    web: Option<WebSource>,
}

#[derive(Debug, Default, Deserialize)]
struct WebSource {
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::ImageAttachment;
    use crate::provider::HistoryTurn;

    #[test]
    fn request_body_carries_history_image_and_grounding() {
        let image = ImageAttachment::from_bytes("image/png", b"png").expect("image");
        let request = StreamRequest::new(
            DEFAULT_GEMINI_MODEL,
            "Jurisdiction: Ohio\n\nUser Question: Is this lease valid?",
            vec![
                HistoryTurn::new(TurnRole::User, "hello"),
                HistoryTurn::new(TurnRole::Model, "hi there"),
                HistoryTurn::new(TurnRole::Model, "   "),
            ],
        )
        .with_image(Some(image))
        .with_preamble("be brief")
        .with_search_grounding(true);

        let body = serde_json::to_value(GeminiProvider::build_body(&request)).expect("json");

        assert_eq!(body["contents"].as_array().map(Vec::len), Some(3));
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][2]["parts"][0]["inlineData"]["mimeType"], "image/png");
        assert_eq!(
            body["contents"][2]["parts"][1]["text"],
            "Jurisdiction: Ohio\n\nUser Question: Is this lease valid?"
        );
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be brief");
        assert!(body["systemInstruction"].get("role").is_none());
        assert_eq!(body["tools"][0]["googleSearch"], serde_json::json!({}));
        assert!(body.get("generationConfig").is_none());
    }

    #[test]
    fn payload_text_and_grounding_are_decoded() {
        let payload = r#"{"candidates":[{"content":{"role":"model","parts":[
            {"text":"thinking","thought":true},{"text":"Tenants "},{"text":"may"}]},
            "groundingMetadata":{"groundingChunks":[
                {"web":{"uri":"https://law.example/a","title":"A"}},
                {"retrievedContext":{}},
                {"web":{"uri":"https://law.example/c"}}]}}]}"#;

        let chunk = GeminiProvider::decode_payload(payload)
            .expect("decode")
            .expect("chunk");

        assert_eq!(chunk.text.as_deref(), Some("Tenants may"));
        assert_eq!(
            chunk.citations,
            vec![
                Citation::new("https://law.example/a", "A"),
                Citation::new("", ""),
                Citation::new("https://law.example/c", ""),
            ]
        );
    }

    #[test]
    fn empty_candidates_produce_no_chunk() {
        assert_eq!(GeminiProvider::decode_payload(r#"{"candidates":[]}"#).expect("decode"), None);
        assert_eq!(
            GeminiProvider::decode_payload(r#"{"usageMetadata":{"totalTokenCount":4}}"#)
                .expect("decode"),
            None
        );
    }

    #[test]
    fn in_stream_error_payloads_fail_the_exchange() {
        let error = GeminiProvider::decode_payload(r#"{"error":{"code":429,"message":"quota"}}"#)
            .expect_err("error payload");
        assert!(matches!(error, ProviderError::ProviderReported { ref message, .. } if message == "quota"));

        let error = GeminiProvider::decode_payload("not json").expect_err("garbage");
        assert!(matches!(error, ProviderError::DecodePayload { .. }));
    }

    #[test]
    fn error_bodies_are_summarized() {
        assert_eq!(
            summarize_error_body(r#"{"error":{"code":400,"message":"API key not valid"}}"#),
            "API key not valid"
        );
        assert_eq!(summarize_error_body("  "), "<empty>");
        assert_eq!(summarize_error_body("Bad Gateway"), "Bad Gateway");
    }

    #[test]
    fn missing_api_key_is_rejected() {
        let result = GeminiProvider::new(ProviderConfig::new(GEMINI_PROVIDER_ID, " ", ""));
        assert!(matches!(result, Err(ProviderError::MissingApiKey { .. })));
    }

    #[test]
    fn blank_prompts_are_rejected_before_streaming() {
        let provider = GeminiProvider::new(ProviderConfig::new(GEMINI_PROVIDER_ID, "key", ""))
            .expect("provider");
        let result = provider.stream_chat(StreamRequest::new(DEFAULT_GEMINI_MODEL, "  ", vec![]));
        assert!(matches!(result, Err(ProviderError::EmptyPrompt { .. })));
    }
}
