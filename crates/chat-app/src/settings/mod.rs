pub mod state;

pub use state::{
    AttachmentSettings, GenerationSettings, PartialPolicy, ProviderSettings, ServerSettings,
    Settings, SettingsError, StorageSettings,
};
