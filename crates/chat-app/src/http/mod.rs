//! HTTP surface. Every handler is a thin adapter over [`ChatService`].

mod error;
pub mod handlers;
mod sse;

use actix_web::web;

use crate::chat::ChatService;

pub use sse::{GENERATION_HANDLE_HEADER, TRIGGER_MESSAGE_HEADER, sse_response};

/// Registers shared state and every route.
pub fn app_config(
    service: web::Data<ChatService>,
    max_upload_bytes: usize,
) -> impl FnOnce(&mut web::ServiceConfig) {
    move |cfg| {
        cfg.app_data(service)
            .app_data(web::PayloadConfig::new(max_upload_bytes))
            .route("/health", web::get().to(handlers::health))
            .service(
                web::scope("/conversations")
                    .route("", web::post().to(handlers::create_conversation))
                    .route("", web::get().to(handlers::list_conversations))
                    .route(
                        "/{conversation_id}/messages",
                        web::get().to(handlers::conversation_messages),
                    )
                    .route(
                        "/{conversation_id}/messages",
                        web::post().to(handlers::submit_message),
                    )
                    .route(
                        "/{conversation_id}/tree",
                        web::get().to(handlers::conversation_tree),
                    ),
            )
            .service(
                web::scope("/messages")
                    .route("/edit", web::post().to(handlers::edit_message))
                    .route(
                        "/{message_id}/regenerate",
                        web::post().to(handlers::regenerate_message),
                    )
                    .route(
                        "/{message_id}/children",
                        web::get().to(handlers::message_children),
                    )
                    .route(
                        "/{message_id}/attachments",
                        web::get().to(handlers::message_attachments),
                    )
                    .route("/{message_id}", web::patch().to(handlers::update_message))
                    .route("/{message_id}", web::delete().to(handlers::delete_message)),
            )
            .route("/generations/abort", web::post().to(handlers::abort_generation))
            .service(
                web::scope("/attachments")
                    .route("", web::post().to(handlers::upload_attachment))
                    .route("/link", web::post().to(handlers::link_attachment))
                    .route("/unlink", web::post().to(handlers::unlink_attachment)),
            );
    }
}
