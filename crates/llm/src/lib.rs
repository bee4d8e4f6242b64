pub mod attachment;
pub mod gemini;
pub mod provider;
pub mod rig_adapter;
pub mod speech;
mod sse;

use std::sync::Arc;

pub use attachment::{AttachmentError, AttachmentResult, ImageAttachment};
pub use gemini::{
    DEFAULT_GEMINI_ENDPOINT, DEFAULT_GEMINI_MODEL, GEMINI_PROVIDER_ID, GeminiProvider,
};
pub use provider::{
    BoxFuture, Citation, EventSender, FailureClass, HistoryTurn, LlmProvider, ModelChunk,
    ProviderConfig, ProviderError, ProviderEventStream, ProviderResult, ProviderStreamHandle,
    ProviderWorker, StreamEvent, StreamFailure, StreamRequest, TurnRole, event_channel,
};
pub use rig_adapter::{DEFAULT_OPENAI_MODEL, RIG_OPENAI_PROVIDER_ID, RigProviderAdapter};
pub use speech::{
    DEFAULT_SPEECH_MODEL, DEFAULT_SPEECH_VOICE, GeminiSpeech, SPEECH_SAMPLE_RATE, SpeechSynthesizer,
    SynthesizedAudio,
};

/// Builds the provider named by `config.provider_id`; an empty id selects Gemini.
pub fn create_provider(config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    match config.provider_id.as_str() {
        "" => {
            let config = ProviderConfig {
                provider_id: GEMINI_PROVIDER_ID.to_string(),
                ..config
            };
            Ok(Arc::new(GeminiProvider::new(config)?))
        }
        GEMINI_PROVIDER_ID => Ok(Arc::new(GeminiProvider::new(config)?)),
        RIG_OPENAI_PROVIDER_ID => Ok(Arc::new(RigProviderAdapter::new(config)?)),
        other => Err(ProviderError::UnsupportedProvider {
            stage: "create-provider",
            provider_id: other.to_string(),
        }),
    }
}
