pub mod chat;
pub mod error;
pub mod http;
pub mod logging;
pub mod settings;

use std::sync::Arc;

use actix_web::{App, HttpServer, web};
use arbor_llm::create_provider;
use arbor_storage::{SqliteStorage, StorageOptions};
use snafu::ResultExt;

use crate::chat::ChatService;
use crate::error::{BindSnafu, ChatResult, ProviderSnafu, ServeSnafu, StorageSnafu};
use crate::settings::Settings;

/// Opens storage, builds the provider and the chat service from `settings`.
pub async fn build_service(settings: &Settings) -> ChatResult<ChatService> {
    let options = StorageOptions::new(settings.storage.blob_dir.clone())
        .with_orphan_policy(settings.storage.orphan_policy);
    let storage = SqliteStorage::open(&settings.storage.database_path, options)
        .await
        .context(StorageSnafu {
            stage: "open-storage",
        })?;

    let provider_config = settings.provider.to_provider_config();
    let provider = create_provider(provider_config).context(ProviderSnafu {
        stage: "create-provider",
    })?;
    tracing::info!(
        provider = provider.id(),
        model = provider.default_model(),
        "provider ready"
    );

    Ok(ChatService::from_settings(
        Arc::new(storage),
        provider,
        settings,
    ))
}

/// Serves the HTTP API until the server is stopped.
pub async fn run(settings: Settings) -> ChatResult<()> {
    let service = web::Data::new(build_service(&settings).await?);
    let max_upload_bytes = settings.attachments.max_upload_bytes;
    let address = format!("{}:{}", settings.server.bind_address, settings.server.port);

    let mut server = HttpServer::new(move || {
        App::new().configure(http::app_config(service.clone(), max_upload_bytes))
    });
    if settings.server.workers > 0 {
        server = server.workers(settings.server.workers);
    }
    let server = server
        .bind((settings.server.bind_address.as_str(), settings.server.port))
        .context(BindSnafu {
            stage: "bind-http",
            address: address.clone(),
        })?;

    tracing::info!(address = %address, "arbor listening");
    server.run().await.context(ServeSnafu { stage: "serve-http" })
}
