use actix_web::http::header;
use actix_web::web::{self, Bytes};
use actix_web::{HttpRequest, HttpResponse};
use arbor_storage::{AttachmentId, ConversationId, MessageId, MessagePatch};
use serde::Deserialize;
use serde_json::json;

use super::sse::sse_response;
use crate::chat::{ChatService, EditRequest, SubmitRequest, UploadRequest};
use crate::error::{ChatError, ChatResult};

type HandlerResult = Result<HttpResponse, ChatError>;

#[derive(Debug, Default, Deserialize)]
pub struct CreateConversationBody {
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    /// Comma separated message ids, root first.
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ModelQuery {
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EditBody {
    pub original_message_id: MessageId,
    pub new_content: String,
    #[serde(default)]
    pub removed_attachments: Vec<AttachmentId>,
    #[serde(default)]
    pub added_attachments: Vec<AttachmentId>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PatchBody {
    pub content: String,
    #[serde(default)]
    pub reasoning: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AbortBody {
    pub message_id: MessageId,
}

#[derive(Debug, Deserialize)]
pub struct LinkBody {
    pub message_id: MessageId,
    pub attachment_id: AttachmentId,
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub message_id: Option<MessageId>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub external_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AttachmentsQuery {
    #[serde(default)]
    pub include_content: bool,
}

pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

pub async fn create_conversation(
    service: web::Data<ChatService>,
    body: Option<web::Json<CreateConversationBody>>,
) -> HandlerResult {
    let body = body.map(web::Json::into_inner).unwrap_or_default();
    let conversation = service.create_conversation(body.title).await?;
    Ok(HttpResponse::Created().json(conversation))
}

pub async fn list_conversations(service: web::Data<ChatService>) -> HandlerResult {
    Ok(HttpResponse::Ok().json(service.list_conversations().await?))
}

pub async fn conversation_messages(
    service: web::Data<ChatService>,
    conversation_id: web::Path<ConversationId>,
    query: web::Query<PathQuery>,
) -> HandlerResult {
    let path = parse_path(query.path.as_deref())?;
    let resolved = service
        .resolve_path(conversation_id.into_inner(), path.as_deref())
        .await?;
    Ok(HttpResponse::Ok().json(resolved))
}

pub async fn conversation_tree(
    service: web::Data<ChatService>,
    conversation_id: web::Path<ConversationId>,
) -> HandlerResult {
    Ok(HttpResponse::Ok().json(service.tree(conversation_id.into_inner()).await?))
}

pub async fn submit_message(
    service: web::Data<ChatService>,
    conversation_id: web::Path<ConversationId>,
    body: web::Json<SubmitRequest>,
) -> HandlerResult {
    let stream = service
        .submit(conversation_id.into_inner(), body.into_inner())
        .await?;
    Ok(sse_response(stream))
}

pub async fn edit_message(
    service: web::Data<ChatService>,
    body: web::Json<EditBody>,
) -> HandlerResult {
    let body = body.into_inner();
    let request = EditRequest {
        original_message_id: body.original_message_id,
        new_content: body.new_content,
        removed_attachments: body.removed_attachments,
        added_attachments: body.added_attachments,
    };
    let stream = service.edit(request, body.model).await?;
    Ok(sse_response(stream))
}

pub async fn regenerate_message(
    service: web::Data<ChatService>,
    message_id: web::Path<MessageId>,
    query: web::Query<ModelQuery>,
) -> HandlerResult {
    let stream = service
        .regenerate(message_id.into_inner(), query.into_inner().model)
        .await?;
    Ok(sse_response(stream))
}

pub async fn update_message(
    service: web::Data<ChatService>,
    message_id: web::Path<MessageId>,
    body: web::Json<PatchBody>,
) -> HandlerResult {
    let body = body.into_inner();
    let message = service
        .update_message(
            message_id.into_inner(),
            MessagePatch {
                content: body.content,
                reasoning: body.reasoning,
            },
        )
        .await?;
    Ok(HttpResponse::Ok().json(message))
}

pub async fn delete_message(
    service: web::Data<ChatService>,
    message_id: web::Path<MessageId>,
) -> HandlerResult {
    let deleted = service.delete_message(message_id.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({ "deleted": deleted })))
}

pub async fn message_children(
    service: web::Data<ChatService>,
    message_id: web::Path<MessageId>,
) -> HandlerResult {
    let children = service.children(message_id.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({ "children": children })))
}

pub async fn abort_generation(
    service: web::Data<ChatService>,
    body: web::Json<AbortBody>,
) -> HttpResponse {
    let cancelled = service.abort(body.message_id);
    HttpResponse::Ok().json(json!({ "cancelled": cancelled }))
}

pub async fn upload_attachment(
    service: web::Data<ChatService>,
    request: HttpRequest,
    query: web::Query<UploadQuery>,
    body: Bytes,
) -> HandlerResult {
    let mime_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ChatError::InvalidRequest {
            stage: "upload-content-type",
            details: "missing Content-Type header".to_string(),
        })?
        .to_string();

    let query = query.into_inner();
    let upload = service
        .upload(UploadRequest {
            bytes: body.to_vec(),
            mime_type,
            message_id: query.message_id,
            width_px: query.width,
            height_px: query.height,
            external_url: query.external_url,
        })
        .await?;

    let response = if upload.deduplicated {
        HttpResponse::Ok().json(upload)
    } else {
        HttpResponse::Created().json(upload)
    };
    Ok(response)
}

pub async fn link_attachment(
    service: web::Data<ChatService>,
    body: web::Json<LinkBody>,
) -> HandlerResult {
    let linked = service
        .link_attachment(body.attachment_id, body.message_id)
        .await?;
    Ok(HttpResponse::Ok().json(json!({ "linked": linked })))
}

pub async fn unlink_attachment(
    service: web::Data<ChatService>,
    body: web::Json<LinkBody>,
) -> HandlerResult {
    let outcome = service
        .unlink_attachment(body.attachment_id, body.message_id)
        .await?;
    Ok(HttpResponse::Ok().json(outcome))
}

pub async fn message_attachments(
    service: web::Data<ChatService>,
    message_id: web::Path<MessageId>,
    query: web::Query<AttachmentsQuery>,
) -> HandlerResult {
    let attachments = service
        .attachments(message_id.into_inner(), query.include_content)
        .await?;
    Ok(HttpResponse::Ok().json(attachments))
}

fn parse_path(raw: Option<&str>) -> ChatResult<Option<Vec<MessageId>>> {
    let Some(raw) = raw else {
        return Ok(None);
    };

    raw.split(',')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            MessageId::parse(segment).map_err(|source| ChatError::Storage {
                stage: "parse-display-path",
                source,
            })
        })
        .collect::<ChatResult<Vec<_>>>()
        .map(Some)
}
