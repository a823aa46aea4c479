use arbor_llm::ProviderError;
use arbor_storage::StorageError;
use snafu::Snafu;

use crate::settings::SettingsError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("{source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("{source}"))]
    Provider {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("a generation for message '{message_id}' is already in flight"))]
    GenerationConflict {
        stage: &'static str,
        message_id: String,
    },
    #[snafu(display("{entity} '{id}' was not found"))]
    NotFound {
        stage: &'static str,
        entity: &'static str,
        id: String,
    },
    #[snafu(display("invalid request: {details}"))]
    InvalidRequest {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("upload of {size} bytes exceeds the {limit} byte limit"))]
    PayloadTooLarge {
        stage: &'static str,
        size: usize,
        limit: usize,
    },
    #[snafu(display("{source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("failed to bind http server to {address}: {source}"))]
    Bind {
        stage: &'static str,
        address: String,
        source: std::io::Error,
    },
    #[snafu(display("http server stopped with an error: {source}"))]
    Serve {
        stage: &'static str,
        source: std::io::Error,
    },
}

impl ChatError {
    /// The innermost stage that failed.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Storage { source, .. } => source.stage(),
            Self::Provider { source, .. } => source.stage(),
            Self::GenerationConflict { stage, .. }
            | Self::NotFound { stage, .. }
            | Self::InvalidRequest { stage, .. }
            | Self::PayloadTooLarge { stage, .. }
            | Self::Settings { stage, .. }
            | Self::Bind { stage, .. }
            | Self::Serve { stage, .. } => *stage,
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
