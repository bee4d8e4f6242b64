use std::path::PathBuf;
use std::sync::Arc;

use lexi_llm::{
    GEMINI_PROVIDER_ID, GeminiSpeech, LlmProvider, ProviderError, SpeechSynthesizer,
    create_provider,
};
use lexi_storage::{KeyValueStore, SqliteKeyValueStore, StorageError};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::chat::{ChatHistory, ChatOrchestrator, ResponseStreamer};
use crate::services::{Capability, JurisdictionLocator, NominatimLocator};
use crate::settings::Settings;
use crate::voice::{AudioSink, Dictation, ReadAloud, SpeechRecognizer, WavFileSink};

#[derive(Debug, Snafu)]
pub enum AppError {
    #[snafu(display(
        "no API key configured on `{stage}`; set provider.api_key or GEMINI_API_KEY"
    ))]
    MissingApiKey { stage: &'static str },
    #[snafu(display("failed to create model provider on `{stage}`, {source}"))]
    CreateProvider {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("failed to open chat storage on `{stage}`, {source}"))]
    OpenStorage {
        stage: &'static str,
        source: StorageError,
    },
}

/// Command-line values that take precedence over the settings file.
#[derive(Debug, Clone, Default)]
pub struct AppOverrides {
    pub database: Option<PathBuf>,
    pub jurisdiction: Option<String>,
}

/// Optional services handed to the chat session.
pub struct Services {
    pub locator: Capability<Arc<dyn JurisdictionLocator>>,
    pub synthesizer: Capability<Arc<dyn SpeechSynthesizer>>,
    pub audio_sink: Arc<dyn AudioSink>,
    pub recognizer: Capability<Arc<dyn SpeechRecognizer>>,
}

/// One running chat session and the voice features around it.
pub struct LexiApp {
    settings: Arc<Settings>,
    chat: Arc<ChatOrchestrator>,
    read_aloud: Arc<ReadAloud>,
    dictation: Dictation,
}

impl LexiApp {
    pub async fn build(settings: Arc<Settings>, overrides: AppOverrides) -> Result<Self, AppError> {
        let provider_config = settings
            .provider
            .to_provider_config()
            .context(MissingApiKeySnafu {
                stage: "app-provider-config",
            })?;
        let provider = create_provider(provider_config.clone()).context(CreateProviderSnafu {
            stage: "app-create-provider",
        })?;

        let database_path = overrides
            .database
            .clone()
            .unwrap_or_else(|| settings.storage.database_path.clone());
        let store = SqliteKeyValueStore::open(&database_path.to_string_lossy())
            .await
            .context(OpenStorageSnafu {
                stage: "app-open-storage",
            })?;

        let locator: Capability<Arc<dyn JurisdictionLocator>> = if settings.location.enabled {
            match NominatimLocator::new(
                &settings.location.geocoder_endpoint,
                &settings.location.user_agent,
            ) {
                Ok(locator) => Capability::Available(Arc::new(locator)),
                Err(error) => {
                    tracing::warn!(error = %error, "jurisdiction lookup disabled");
                    Capability::unavailable(error.to_string())
                }
            }
        } else {
            Capability::unavailable("location lookup disabled in settings")
        };

        let synthesizer: Capability<Arc<dyn SpeechSynthesizer>> = if !settings.speech.enabled {
            Capability::unavailable("read-aloud disabled in settings")
        } else if provider_config.provider_id != GEMINI_PROVIDER_ID {
            Capability::unavailable("read-aloud requires the gemini provider")
        } else {
            match GeminiSpeech::new(
                provider_config,
                &settings.speech.model,
                &settings.speech.voice,
            ) {
                Ok(speech) => Capability::Available(Arc::new(speech)),
                Err(error) => {
                    tracing::warn!(error = %error, "read-aloud disabled");
                    Capability::unavailable(error.to_string())
                }
            }
        };

        let services = Services {
            locator,
            synthesizer,
            audio_sink: Arc::new(WavFileSink::new(settings.speech.output_dir.clone())),
            recognizer: Capability::unavailable(
                "speech recognition is not available in the terminal",
            ),
        };

        Ok(Self::with_components(settings, overrides, provider, Arc::new(store), services).await)
    }

    /// Assembles a session from already-built collaborators.
    pub async fn with_components(
        settings: Arc<Settings>,
        overrides: AppOverrides,
        provider: Arc<dyn LlmProvider>,
        store: Arc<dyn KeyValueStore>,
        services: Services,
    ) -> Self {
        let config = settings.chat.to_chat_config();
        let streamer = ResponseStreamer::new(
            provider,
            settings.provider.stream_options(&config.system_instruction),
        );
        let history = ChatHistory::with_keys(
            store,
            config.history_key.clone(),
            config.jurisdiction_key.clone(),
        );
        let chat = ChatOrchestrator::load(config, streamer, history, services.locator).await;

        if let Some(jurisdiction) = overrides.jurisdiction.as_deref() {
            chat.set_jurisdiction(jurisdiction).await;
        }

        tracing::info!(
            provider_id = %chat_provider_id(&chat),
            read_aloud = services.synthesizer.is_available(),
            dictation = services.recognizer.is_available(),
            "lexi session ready"
        );

        Self {
            read_aloud: Arc::new(ReadAloud::new(services.synthesizer, services.audio_sink)),
            dictation: Dictation::new(services.recognizer),
            settings,
            chat: Arc::new(chat),
        }
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn chat(&self) -> &Arc<ChatOrchestrator> {
        &self.chat
    }

    pub fn read_aloud(&self) -> &Arc<ReadAloud> {
        &self.read_aloud
    }

    pub fn dictation(&mut self) -> &mut Dictation {
        &mut self.dictation
    }
}

fn chat_provider_id(chat: &ChatOrchestrator) -> String {
    chat.streamer().provider().id().to_string()
}

#[cfg(test)]
mod tests {
    use lexi_storage::MemoryKeyValueStore;

    use super::*;
    use crate::chat::SendOutcome;
    use crate::chat::controller::tests::{Script, ScriptedProvider};

    fn services() -> Services {
        Services {
            locator: Capability::unavailable("test"),
            synthesizer: Capability::unavailable("test"),
            audio_sink: Arc::new(WavFileSink::new(std::env::temp_dir())),
            recognizer: Capability::unavailable("test"),
        }
    }

    #[tokio::test]
    async fn session_uses_settings_and_overrides() {
        let mut settings = Settings::default().normalized();
        settings.chat.welcome_message = "Welcome to Lexi.".to_string();
        let provider = ScriptedProvider::new([Script::text_reply(&["Answer."])]);
        let store = Arc::new(MemoryKeyValueStore::new());

        let mut app = LexiApp::with_components(
            Arc::new(settings),
            AppOverrides {
                database: None,
                jurisdiction: Some(" Oregon ".to_string()),
            },
            provider.clone(),
            store,
            services(),
        )
        .await;

        assert_eq!(app.chat().messages()[0].text, "Welcome to Lexi.");
        assert_eq!(app.chat().jurisdiction(), "Oregon");
        assert!(!app.read_aloud().is_available());
        assert!(!app.dictation().is_available());

        let outcome = app.chat().send("Is my lease valid?", None).await;
        assert!(matches!(outcome, SendOutcome::Completed { .. }));

        let request = &provider.requests()[0];
        assert_eq!(request.model_id, lexi_llm::DEFAULT_GEMINI_MODEL);
        assert!(request.preamble.is_some());
        assert!(request.prompt.starts_with("Jurisdiction: Oregon"));
    }
}
