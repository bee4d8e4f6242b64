pub mod state;

pub use state::{
    ChatSettings, LocationSettings, ProviderSettings, Settings, SettingsError, SettingsStore,
    SpeechSettings, StorageSettings,
};
