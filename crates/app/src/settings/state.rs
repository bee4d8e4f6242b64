use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use lexi_llm::{
    DEFAULT_GEMINI_ENDPOINT, DEFAULT_GEMINI_MODEL, DEFAULT_OPENAI_MODEL, DEFAULT_SPEECH_MODEL,
    DEFAULT_SPEECH_VOICE, GEMINI_PROVIDER_ID, ProviderConfig, RIG_OPENAI_PROVIDER_ID,
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::chat::{
    ChatConfig, DEFAULT_HISTORY_KEY, DEFAULT_JURISDICTION_KEY, StreamOptions, SYSTEM_INSTRUCTION,
};
use crate::chat::orchestrator::{
    DEFAULT_IMAGE_ONLY_PROMPT, DEFAULT_QUICK_SUGGESTIONS, DEFAULT_WELCOME_MESSAGE,
};
use crate::services::DEFAULT_GEOCODER_ENDPOINT;

pub const DEFAULT_PROVIDER_ID: &str = GEMINI_PROVIDER_ID;
pub const DEFAULT_OPENAI_ENDPOINT: &str = "https://api.openai.com/v1";
pub const SETTINGS_DIRECTORY_NAME: &str = "lexi";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "lexi.sqlite3";
pub const ENV_PREFIX: &str = "LEXI_";
/// Checked in order when no API key is configured.
pub const API_KEY_ENV_VARS: [&str; 3] = ["GEMINI_API_KEY", "API_KEY", "OPENAI_API_KEY"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_true")]
    pub search_grounding: bool,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: String::new(),
            model: String::new(),
            search_grounding: true,
            temperature: None,
            max_tokens: None,
        }
    }
}

impl ProviderSettings {
    /// Configured key, else the first non-blank key from the process environment.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.resolve_api_key_with(|name| std::env::var(name).ok())
    }

    fn resolve_api_key_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
        let configured = self.api_key.trim();
        if !configured.is_empty() {
            return Some(configured.to_string());
        }

        API_KEY_ENV_VARS
            .iter()
            .filter_map(|name| lookup(*name))
            .map(|value| value.trim().to_string())
            .find(|value| !value.is_empty())
    }

    pub fn to_provider_config(&self) -> Option<ProviderConfig> {
        let api_key = self.resolved_api_key()?;
        Some(ProviderConfig::new(
            &self.provider_id,
            api_key,
            &self.endpoint,
        ))
    }

    pub fn stream_options(&self, system_instruction: &str) -> StreamOptions {
        let mut options = StreamOptions::new(self.model.clone());
        let instruction = system_instruction.trim();
        options.system_instruction = (!instruction.is_empty()).then(|| instruction.to_string());
        options.search_grounding = self.search_grounding;
        options.temperature = self.temperature;
        options.max_tokens = self.max_tokens;
        options
    }

    pub fn normalized(mut self) -> Self {
        self.provider_id = if self.provider_id.trim().is_empty() {
            default_provider_id()
        } else {
            self.provider_id.trim().to_ascii_lowercase()
        };
        self.api_key = self.api_key.trim().to_string();

        let is_openai = self.provider_id == RIG_OPENAI_PROVIDER_ID;
        self.endpoint = match self.endpoint.trim() {
            "" if is_openai => DEFAULT_OPENAI_ENDPOINT.to_string(),
            "" => DEFAULT_GEMINI_ENDPOINT.to_string(),
            endpoint => endpoint.to_string(),
        };
        self.model = match self.model.trim() {
            "" if is_openai => DEFAULT_OPENAI_MODEL.to_string(),
            "" => DEFAULT_GEMINI_MODEL.to_string(),
            model => model.to_string(),
        };
        self.temperature = self.temperature.filter(|value| value.is_finite() && *value >= 0.0);
        self.max_tokens = self.max_tokens.filter(|value| *value > 0);

        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeechSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub voice: String,
    #[serde(default = "default_audio_dir")]
    pub output_dir: PathBuf,
}

impl Default for SpeechSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            model: DEFAULT_SPEECH_MODEL.to_string(),
            voice: DEFAULT_SPEECH_VOICE.to_string(),
            output_dir: default_audio_dir(),
        }
    }
}

impl SpeechSettings {
    fn normalized(mut self) -> Self {
        self.model = non_blank_or(&self.model, DEFAULT_SPEECH_MODEL);
        self.voice = non_blank_or(&self.voice, DEFAULT_SPEECH_VOICE);
        if self.output_dir.as_os_str().is_empty() {
            self.output_dir = default_audio_dir();
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub geocoder_endpoint: String,
    #[serde(default)]
    pub user_agent: String,
}

impl Default for LocationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            geocoder_endpoint: DEFAULT_GEOCODER_ENDPOINT.to_string(),
            user_agent: default_user_agent(),
        }
    }
}

impl LocationSettings {
    fn normalized(mut self) -> Self {
        self.geocoder_endpoint = non_blank_or(&self.geocoder_endpoint, DEFAULT_GEOCODER_ENDPOINT);
        self.user_agent = non_blank_or(&self.user_agent, &default_user_agent());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default)]
    pub welcome_message: String,
    #[serde(default)]
    pub quick_suggestions: Vec<String>,
    #[serde(default)]
    pub image_only_prompt: String,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            welcome_message: DEFAULT_WELCOME_MESSAGE.to_string(),
            quick_suggestions: DEFAULT_QUICK_SUGGESTIONS
                .iter()
                .map(|chip| chip.to_string())
                .collect(),
            image_only_prompt: DEFAULT_IMAGE_ONLY_PROMPT.to_string(),
        }
    }
}

impl ChatSettings {
    fn normalized(mut self) -> Self {
        self.welcome_message = non_blank_or(&self.welcome_message, DEFAULT_WELCOME_MESSAGE);
        self.image_only_prompt = non_blank_or(&self.image_only_prompt, DEFAULT_IMAGE_ONLY_PROMPT);
        self.quick_suggestions = self
            .quick_suggestions
            .into_iter()
            .map(|chip| chip.trim().to_string())
            .filter(|chip| !chip.is_empty())
            .collect();
        self
    }

    pub fn to_chat_config(&self) -> ChatConfig {
        ChatConfig {
            welcome_message: self.welcome_message.clone(),
            quick_suggestions: self.quick_suggestions.clone(),
            image_only_prompt: self.image_only_prompt.clone(),
            system_instruction: SYSTEM_INSTRUCTION.to_string(),
            history_key: DEFAULT_HISTORY_KEY.to_string(),
            jurisdiction_key: DEFAULT_JURISDICTION_KEY.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub speech: SpeechSettings,
    #[serde(default)]
    pub location: LocationSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub chat: ChatSettings,
}

impl Settings {
    pub fn normalized(self) -> Self {
        Self {
            provider: self.provider.normalized(),
            speech: self.speech.normalized(),
            location: self.location.normalized(),
            storage: if self.storage.database_path.as_os_str().is_empty() {
                StorageSettings::default()
            } else {
                self.storage
            },
            chat: self.chat.normalized(),
        }
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<Settings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".lexi"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from(&config_path, Env::prefixed(ENV_PREFIX).split("__"));
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: Settings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from(path: &Path, env: Env) -> Settings {
        if !path.exists() {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }

        let figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Json::file(path))
            .merge(env);

        match figment.extract::<Settings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                Settings::default().normalized()
            }
        }
    }

    fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_provider_id() -> String {
    DEFAULT_PROVIDER_ID.to_string()
}

fn default_true() -> bool {
    true
}

fn default_user_agent() -> String {
    format!("lexi/{}", env!("CARGO_PKG_VERSION"))
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".lexi"))
}

fn default_database_path() -> PathBuf {
    default_data_dir().join(DATABASE_FILE_NAME)
}

fn default_audio_dir() -> PathBuf {
    default_data_dir().join("audio")
}

fn non_blank_or(value: &str, fallback: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    // A prefix no real environment sets, so tests never pick up the host's variables.
    fn isolated_env() -> Env {
        Env::prefixed("LEXI_SETTINGS_TEST_UNSET_").split("__")
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = SettingsStore::load_from(&dir.path().join("settings.json"), isolated_env());

        assert_eq!(settings, Settings::default().normalized());
        assert_eq!(settings.provider.provider_id, GEMINI_PROVIDER_ID);
        assert_eq!(settings.provider.model, DEFAULT_GEMINI_MODEL);
        assert!(settings.provider.search_grounding);
        assert_eq!(settings.chat.quick_suggestions.len(), 3);
    }

    #[test]
    fn partial_file_is_merged_over_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"provider":{"provider_id":" OpenAI ","model":"  "},"location":{"enabled":false}}"#,
        )
        .expect("write");

        let settings = SettingsStore::load_from(&path, isolated_env());

        assert_eq!(settings.provider.provider_id, RIG_OPENAI_PROVIDER_ID);
        assert_eq!(settings.provider.model, DEFAULT_OPENAI_MODEL);
        assert_eq!(settings.provider.endpoint, DEFAULT_OPENAI_ENDPOINT);
        assert!(!settings.location.enabled);
        assert!(settings.speech.enabled);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").expect("write");

        assert_eq!(
            SettingsStore::load_from(&path, isolated_env()),
            Settings::default().normalized()
        );
    }

    #[test]
    fn update_persists_normalized_settings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("settings.json");
        let store = SettingsStore {
            settings: Arc::new(ArcSwap::from_pointee(Settings::default().normalized())),
            config_path: path.clone(),
        };

        let mut settings = Settings::default();
        settings.provider.api_key = "  secret  ".to_string();
        settings.chat.quick_suggestions = vec![" Housing ".to_string(), " ".to_string()];
        store.update(settings).expect("update");

        assert_eq!(store.settings().provider.api_key, "secret");
        assert_eq!(store.settings().chat.quick_suggestions, vec!["Housing"]);
        assert!(!path.with_extension("json.tmp").exists());

        let reloaded = SettingsStore::load_from(&path, isolated_env());
        assert_eq!(reloaded, *store.settings());
    }

    #[test]
    fn api_key_falls_back_to_environment_in_order() {
        let env = HashMap::from([
            ("API_KEY", "generic"),
            ("OPENAI_API_KEY", "openai"),
            ("GEMINI_API_KEY", " "),
        ]);
        let lookup = |name: &str| env.get(name).map(|value| value.to_string());

        let mut provider = ProviderSettings::default();
        assert_eq!(provider.resolve_api_key_with(lookup).as_deref(), Some("generic"));

        provider.api_key = "configured".to_string();
        assert_eq!(
            provider.resolve_api_key_with(lookup).as_deref(),
            Some("configured")
        );

        provider.api_key.clear();
        assert_eq!(provider.resolve_api_key_with(|_| None), None);
    }

    #[test]
    fn provider_settings_map_to_stream_options() {
        let provider = ProviderSettings {
            temperature: Some(0.4),
            max_tokens: Some(0),
            ..ProviderSettings::default()
        }
        .normalized();

        let options = provider.stream_options("  be formal ");

        assert_eq!(options.model_id, DEFAULT_GEMINI_MODEL);
        assert_eq!(options.system_instruction.as_deref(), Some("be formal"));
        assert!(options.search_grounding);
        assert_eq!(options.temperature, Some(0.4));
        assert_eq!(options.max_tokens, None);
    }
}
