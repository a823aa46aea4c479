use std::sync::Arc;

use arbor_llm::LlmProvider;
use arbor_storage::{
    AttachmentId, AttachmentRecord, AttachmentUpload, ConversationId, ConversationRecord,
    MessageId, MessagePatch, MessageRecord, MessageRole, NewAttachment, NewConversation,
    NewMessage, Storage, StorageError, UnlinkOutcome,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt};

use super::branch::{EditBranchManager, EditRequest};
use super::controller::{GenerationController, GenerationRequest, GenerationStream};
use super::generation::GenerationRegistry;
use super::path::{PathResolver, ResolvedPath, TreeNode};
use crate::error::{
    ChatResult, InvalidRequestSnafu, NotFoundSnafu, PayloadTooLargeSnafu, StorageSnafu,
};
use crate::settings::Settings;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubmitRequest {
    pub content: String,
    #[serde(default)]
    pub parent_id: Option<MessageId>,
    #[serde(default)]
    pub attachments: Vec<AttachmentId>,
    #[serde(default)]
    pub model: Option<String>,
}

impl SubmitRequest {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_parent(mut self, parent_id: MessageId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<AttachmentId>) -> Self {
        self.attachments = attachments;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub message_id: Option<MessageId>,
    pub width_px: Option<u32>,
    pub height_px: Option<u32>,
    pub external_url: Option<String>,
}

impl UploadRequest {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
            message_id: None,
            width_px: None,
            height_px: None,
            external_url: None,
        }
    }
}

/// Attachment metadata, optionally with its bytes inlined as base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentPayload {
    #[serde(flatten)]
    pub attachment: AttachmentRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_base64: Option<String>,
}

/// Entry point for every chat operation; the HTTP layer is a thin shell over it.
#[derive(Clone)]
pub struct ChatService {
    storage: Arc<dyn Storage>,
    controller: GenerationController,
    branches: EditBranchManager,
    max_upload_bytes: usize,
}

impl ChatService {
    pub fn new(
        storage: Arc<dyn Storage>,
        controller: GenerationController,
        max_upload_bytes: usize,
    ) -> Self {
        Self {
            branches: EditBranchManager::new(storage.clone()),
            storage,
            controller,
            max_upload_bytes,
        }
    }

    pub fn from_settings(
        storage: Arc<dyn Storage>,
        provider: Arc<dyn LlmProvider>,
        settings: &Settings,
    ) -> Self {
        let controller = GenerationController::new(
            storage.clone(),
            provider,
            GenerationRegistry::new(),
            settings.generation.clone(),
        )
        .with_preamble(settings.provider.preamble.clone())
        .with_max_tokens(settings.provider.max_tokens);

        Self::new(storage, controller, settings.attachments.max_upload_bytes)
    }

    pub fn registry(&self) -> &GenerationRegistry {
        self.controller.registry()
    }

    pub async fn create_conversation(
        &self,
        title: impl Into<String>,
    ) -> ChatResult<ConversationRecord> {
        self.storage
            .create_conversation(NewConversation {
                title: title.into(),
            })
            .await
            .context(StorageSnafu {
                stage: "create-conversation",
            })
    }

    pub async fn list_conversations(&self) -> ChatResult<Vec<ConversationRecord>> {
        self.storage
            .list_conversations()
            .await
            .context(StorageSnafu {
                stage: "list-conversations",
            })
    }

    pub async fn resolve_path(
        &self,
        conversation_id: ConversationId,
        path: Option<&[MessageId]>,
    ) -> ChatResult<ResolvedPath> {
        let messages = self.conversation_messages(conversation_id).await?;
        Ok(PathResolver::new(&messages).resolve(path))
    }

    pub async fn tree(&self, conversation_id: ConversationId) -> ChatResult<TreeNode> {
        let messages = self.conversation_messages(conversation_id).await?;
        Ok(PathResolver::new(&messages).overview())
    }

    /// Persists a user message (and its attachment links) and starts the reply.
    pub async fn submit(
        &self,
        conversation_id: ConversationId,
        request: SubmitRequest,
    ) -> ChatResult<GenerationStream> {
        if request.content.trim().is_empty() {
            return InvalidRequestSnafu {
                stage: "submit-validate",
                details: "message content must not be empty",
            }
            .fail();
        }

        let user_message = self
            .storage
            .append_message_with_attachments(
                conversation_id,
                NewMessage::user(request.parent_id, request.content),
                request.attachments,
            )
            .await
            .context(StorageSnafu {
                stage: "submit-append-user",
            })?;

        self.start_generation(user_message, request.model).await
    }

    /// Forks the original user message and answers the new sibling.
    pub async fn edit(
        &self,
        request: EditRequest,
        model: Option<String>,
    ) -> ChatResult<GenerationStream> {
        self.require_user_message(request.original_message_id, "edit-load-original")
            .await?;
        let branch = self.branches.branch(request).await?;
        self.start_generation(branch.sibling, model).await
    }

    /// Adds another reply to an existing user message, next to earlier ones.
    pub async fn regenerate(
        &self,
        message_id: MessageId,
        model: Option<String>,
    ) -> ChatResult<GenerationStream> {
        let user_message = self
            .require_user_message(message_id, "regenerate-load-message")
            .await?;
        self.start_generation(user_message, model).await
    }

    pub fn abort(&self, message_id: MessageId) -> bool {
        self.controller.registry().abort(message_id)
    }

    pub async fn update_message(
        &self,
        message_id: MessageId,
        patch: MessagePatch,
    ) -> ChatResult<MessageRecord> {
        self.storage
            .update_message(message_id, patch)
            .await
            .context(StorageSnafu {
                stage: "update-message",
            })
    }

    pub async fn delete_message(&self, message_id: MessageId) -> ChatResult<bool> {
        self.storage
            .delete_message(message_id)
            .await
            .context(StorageSnafu {
                stage: "delete-message",
            })
    }

    pub async fn children(&self, message_id: MessageId) -> ChatResult<Vec<MessageId>> {
        self.storage
            .get_children(message_id)
            .await
            .context(StorageSnafu {
                stage: "message-children",
            })
    }

    pub async fn upload(&self, request: UploadRequest) -> ChatResult<AttachmentUpload> {
        let size = request.bytes.len();
        if size > self.max_upload_bytes {
            return PayloadTooLargeSnafu {
                stage: "upload-validate",
                size,
                limit: self.max_upload_bytes,
            }
            .fail();
        }
        if size == 0 {
            return InvalidRequestSnafu {
                stage: "upload-validate",
                details: "attachment body is empty",
            }
            .fail();
        }

        let mut input = NewAttachment::new(request.bytes, request.mime_type);
        input.width_px = request.width_px;
        input.height_px = request.height_px;
        input.external_url = request.external_url;
        input.message_id = request.message_id;

        self.storage
            .create_attachment(input)
            .await
            .context(StorageSnafu {
                stage: "upload-attachment",
            })
    }

    pub async fn link_attachment(
        &self,
        attachment_id: AttachmentId,
        message_id: MessageId,
    ) -> ChatResult<bool> {
        self.storage
            .link_to_message(attachment_id, message_id)
            .await
            .context(StorageSnafu {
                stage: "link-attachment",
            })
    }

    pub async fn unlink_attachment(
        &self,
        attachment_id: AttachmentId,
        message_id: MessageId,
    ) -> ChatResult<UnlinkOutcome> {
        self.storage
            .unlink_from_message(attachment_id, message_id)
            .await
            .context(StorageSnafu {
                stage: "unlink-attachment",
            })
    }

    /// Attachments in link order. With `include_content`, unreadable bytes drop that
    /// attachment from the payload instead of failing the request.
    pub async fn attachments(
        &self,
        message_id: MessageId,
        include_content: bool,
    ) -> ChatResult<Vec<AttachmentPayload>> {
        let attachments = self
            .storage
            .list_attachments_for_message(message_id)
            .await
            .context(StorageSnafu {
                stage: "list-message-attachments",
            })?;

        if !include_content {
            return Ok(attachments
                .into_iter()
                .map(|attachment| AttachmentPayload {
                    attachment,
                    content_base64: None,
                })
                .collect());
        }

        let mut payloads = Vec::with_capacity(attachments.len());
        for attachment in attachments {
            match self.storage.read_attachment_bytes(attachment.id).await {
                Ok(bytes) => payloads.push(AttachmentPayload {
                    content_base64: Some(STANDARD.encode(bytes)),
                    attachment,
                }),
                Err(error @ StorageError::AttachmentRead { .. }) => {
                    tracing::warn!(
                        message_id = %message_id,
                        attachment_id = %attachment.id,
                        stage = error.stage(),
                        error = %error,
                        "skipping attachment with unreadable content"
                    );
                }
                Err(error) => {
                    return Err(error).context(StorageSnafu {
                        stage: "read-attachment-bytes",
                    });
                }
            }
        }
        Ok(payloads)
    }

    async fn start_generation(
        &self,
        user_message: MessageRecord,
        model: Option<String>,
    ) -> ChatResult<GenerationStream> {
        let conversation_id = user_message.conversation_id;
        let messages = self.conversation_messages(conversation_id).await?;
        let history = PathResolver::new(&messages)
            .ancestry(user_message.id)
            .into_iter()
            .cloned()
            .collect();

        self.controller.start(GenerationRequest {
            conversation_id,
            user_message,
            history,
            model,
        })
    }

    async fn require_user_message(
        &self,
        message_id: MessageId,
        stage: &'static str,
    ) -> ChatResult<MessageRecord> {
        let message = self
            .storage
            .get_message(message_id)
            .await
            .context(StorageSnafu { stage })?
            .context(NotFoundSnafu {
                stage,
                entity: "message",
                id: message_id.to_string(),
            })?;

        if message.role != MessageRole::User {
            return InvalidRequestSnafu {
                stage,
                details: format!("message '{message_id}' is not a user message"),
            }
            .fail();
        }
        Ok(message)
    }

    async fn conversation_messages(
        &self,
        conversation_id: ConversationId,
    ) -> ChatResult<Vec<MessageRecord>> {
        self.storage
            .list_messages(conversation_id)
            .await
            .context(StorageSnafu {
                stage: "conversation-messages",
            })
    }
}
