use std::sync::Arc;
use std::time::Duration;

mod provider;
mod rig_adapter;
mod scripted;

pub use provider::{
    LlmProvider, ProviderConfig, ProviderError, ProviderEventStream, ProviderMessage,
    ProviderResult, ProviderStreamHandle, ProviderWorker, Role, StreamEventMapped,
    StreamEventPayload, StreamRequest, StreamTarget,
};
pub use rig_adapter::{DEFAULT_OPENAI_MODEL, RIG_OPENAI_PROVIDER_ID, RigProviderAdapter};
pub use scripted::{SCRIPTED_MODEL, SCRIPTED_PROVIDER_ID, ScriptStep, ScriptedProvider};

const SCRIPTED_ECHO_DELAY: Duration = Duration::from_millis(40);

pub fn create_provider(mut config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "openai" | "rig-openai" => {
            config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
            Ok(Arc::new(RigProviderAdapter::new(config)?))
        }
        SCRIPTED_PROVIDER_ID => Ok(Arc::new(ScriptedProvider::echo(SCRIPTED_ECHO_DELAY))),
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-provider",
            provider_id: config.provider_id,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_provider_dispatches_on_id() {
        let scripted = create_provider(ProviderConfig::new("scripted", "", "", None)).unwrap();
        assert_eq!(scripted.id(), SCRIPTED_PROVIDER_ID);

        let openai = create_provider(ProviderConfig::new("", "sk-test", "", None)).unwrap();
        assert_eq!(openai.id(), RIG_OPENAI_PROVIDER_ID);

        assert!(matches!(
            create_provider(ProviderConfig::new("ollama", "", "", None)),
            Err(ProviderError::UnsupportedProvider { .. })
        ));
    }
}
