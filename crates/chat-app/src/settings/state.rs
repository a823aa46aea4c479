use std::path::{Path, PathBuf};
use std::time::Duration;

use arbor_llm::{DEFAULT_OPENAI_MODEL, ProviderConfig};
use arbor_storage::OrphanPolicy;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const DEFAULT_PROVIDER_ID: &str = "openai";
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
pub const SETTINGS_DIRECTORY_NAME: &str = "arbor";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const CONFIG_PATH_ENV: &str = "ARBOR_CONFIG";
pub const ENV_PREFIX: &str = "ARBOR_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_address: String,
    pub port: u16,
    /// Zero lets actix pick one worker per core.
    pub workers: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8390,
            workers: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub database_path: String,
    pub blob_dir: PathBuf,
    pub orphan_policy: OrphanPolicy,
}

impl Default for StorageSettings {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            database_path: data_dir.join("arbor.db").display().to_string(),
            blob_dir: data_dir.join("blobs"),
            orphan_policy: OrphanPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub default_model: String,
    pub max_tokens: Option<u64>,
    pub preamble: Option<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            provider_id: DEFAULT_PROVIDER_ID.to_string(),
            api_key: String::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            default_model: DEFAULT_OPENAI_MODEL.to_string(),
            max_tokens: None,
            preamble: None,
        }
    }
}

impl ProviderSettings {
    pub fn to_provider_config(&self) -> ProviderConfig {
        ProviderConfig::new(
            &self.provider_id,
            &self.api_key,
            &self.endpoint,
            Some(self.default_model.clone()),
        )
    }
}

/// What happens to accumulated output when a generation errors or is aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartialPolicy {
    /// Store it as an assistant message flagged `partial`.
    #[default]
    Persist,
    Discard,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub partial_policy: PartialPolicy,
    pub idle_timeout_secs: u64,
    pub channel_capacity: usize,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            partial_policy: PartialPolicy::default(),
            idle_timeout_secs: 120,
            channel_capacity: 64,
        }
    }
}

impl GenerationSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentSettings {
    pub max_upload_bytes: usize,
}

impl Default for AttachmentSettings {
    fn default() -> Self {
        Self {
            max_upload_bytes: 20 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub provider: ProviderSettings,
    pub generation: GenerationSettings,
    pub attachments: AttachmentSettings,
}

impl Settings {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".arbor"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    /// Resolves the settings file from `ARBOR_CONFIG`, falling back to the config dir.
    pub fn config_path() -> PathBuf {
        std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .filter(|path| !path.as_os_str().is_empty())
            .unwrap_or_else(Self::default_config_path)
    }

    pub fn load() -> Result<Self, SettingsError> {
        Self::load_from(&Self::config_path())
    }

    /// Defaults, then the JSON file at `path` if it exists, then `ARBOR_*` variables.
    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "settings file not found, using defaults");
        }

        let figment = Self::figment(path).merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::extract(figment)
    }

    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default())).merge(Json::file(path))
    }

    pub fn extract(figment: Figment) -> Result<Self, SettingsError> {
        figment
            .extract::<Settings>()
            .map(Settings::normalized)
            .map_err(Box::new)
            .context(ExtractSnafu {
                stage: "extract-settings",
            })
    }

    pub fn normalized(mut self) -> Self {
        self.server.bind_address = non_empty_or(
            &self.server.bind_address,
            &ServerSettings::default().bind_address,
        );

        self.storage.database_path = non_empty_or(
            &self.storage.database_path,
            &StorageSettings::default().database_path,
        );
        if self.storage.blob_dir.as_os_str().is_empty() {
            self.storage.blob_dir = StorageSettings::default().blob_dir;
        }

        let provider = &mut self.provider;
        provider.provider_id = non_empty_or(&provider.provider_id, DEFAULT_PROVIDER_ID);
        provider.api_key = provider.api_key.trim().to_string();
        provider.endpoint = non_empty_or(&provider.endpoint, DEFAULT_ENDPOINT);
        provider.default_model = non_empty_or(&provider.default_model, DEFAULT_OPENAI_MODEL);
        provider.preamble = provider
            .preamble
            .take()
            .map(|preamble| preamble.trim().to_string())
            .filter(|preamble| !preamble.is_empty());
        provider.max_tokens = provider.max_tokens.filter(|max_tokens| *max_tokens > 0);

        self.generation.channel_capacity = self.generation.channel_capacity.max(1);
        self.generation.idle_timeout_secs = self.generation.idle_timeout_secs.max(1);
        self.attachments.max_upload_bytes = self.attachments.max_upload_bytes.max(1);

        self
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to load settings on `{stage}`: {source}"))]
    Extract {
        stage: &'static str,
        source: Box<figment::Error>,
    },
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".arbor"))
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}
