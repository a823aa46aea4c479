use std::process::ExitCode;

use arbor::error::{ChatError, ChatResult};
use arbor::settings::Settings;

#[actix_web::main]
async fn main() -> ExitCode {
    arbor::logging::init();

    match start().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(stage = error.stage(), error = %error, "arbor stopped");
            ExitCode::FAILURE
        }
    }
}

async fn start() -> ChatResult<()> {
    let settings = Settings::load().map_err(|source| ChatError::Settings {
        stage: "load-settings",
        source,
    })?;
    tracing::info!(
        database = %settings.storage.database_path,
        provider = %settings.provider.provider_id,
        "settings loaded"
    );
    arbor::run(settings).await
}
