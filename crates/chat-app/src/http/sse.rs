use std::convert::Infallible;

use actix_web::HttpResponse;
use actix_web::http::header;
use actix_web::web::Bytes;

use crate::chat::{GenerationStream, encode_frame};

pub const GENERATION_HANDLE_HEADER: &str = "x-generation-handle";
pub const TRIGGER_MESSAGE_HEADER: &str = "x-trigger-message";

/// Streams generation events as SSE frames in arrival order.
///
/// The body ends when the controller drops its sender after the terminal event.
pub fn sse_response(stream: GenerationStream) -> HttpResponse {
    let GenerationStream {
        handle_id,
        message_id,
        events,
    } = stream;

    let body = futures::stream::unfold(events, |mut events| async move {
        loop {
            let event = events.recv().await?;
            match encode_frame(&event) {
                Ok(frame) => return Some((Ok::<_, Infallible>(Bytes::from(frame)), events)),
                Err(error) => {
                    tracing::warn!(
                        event_type = event.event_type(),
                        error = %error,
                        "dropping generation event that failed to encode"
                    );
                }
            }
        }
    });

    HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "text/event-stream"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .insert_header((GENERATION_HANDLE_HEADER, handle_id.0.to_string()))
        .insert_header((TRIGGER_MESSAGE_HEADER, message_id.to_string()))
        .streaming(body)
}
