use serde::{Deserialize, Serialize};

use super::ids::{AttachmentId, ConversationId, MessageId};

/// Default conversation title used when callers submit an empty one.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";

/// Storage-local message role, intentionally decoupled from provider-layer role enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub title: String,
    pub created_at_unix_ms: u64,
    pub updated_at_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConversation {
    pub title: String,
}

/// One node of the conversation tree.
///
/// `children_ids` is a denormalized copy of every message whose `parent_id` is this
/// message, kept in insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub parent_id: Option<MessageId>,
    pub children_ids: Vec<MessageId>,
    pub role: MessageRole,
    pub content: String,
    pub reasoning: Option<String>,
    pub model_name: Option<String>,
    pub partial: bool,
    pub created_at_unix_ms: u64,
    pub updated_at_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub parent_id: Option<MessageId>,
    pub role: MessageRole,
    pub content: String,
    pub reasoning: Option<String>,
    pub model_name: Option<String>,
    pub partial: bool,
}

impl NewMessage {
    pub fn user(parent_id: Option<MessageId>, content: impl Into<String>) -> Self {
        Self {
            parent_id,
            role: MessageRole::User,
            content: content.into(),
            reasoning: None,
            model_name: None,
            partial: false,
        }
    }

    pub fn assistant(parent_id: MessageId, content: impl Into<String>) -> Self {
        Self {
            parent_id: Some(parent_id),
            role: MessageRole::Assistant,
            content: content.into(),
            reasoning: None,
            model_name: None,
            partial: false,
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = Some(model_name.into());
        self
    }

    pub fn partial(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }
}

/// In-place correction of a message; never touches tree edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePatch {
    pub content: String,
    /// `None` keeps the stored reasoning.
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
}

impl AttachmentKind {
    pub fn from_mime_type(mime_type: &str) -> Option<Self> {
        let essence = mime_type.split(';').next().unwrap_or_default().trim();
        let lowered = essence.to_ascii_lowercase();
        if lowered.starts_with("image/") && lowered.len() > "image/".len() {
            Some(Self::Image)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Bytes live in the local content-addressed blob store.
    Inline,
    /// Bytes are hosted elsewhere; only the hash and URL are kept.
    External,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::External => "external",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub id: AttachmentId,
    pub kind: AttachmentKind,
    pub mime_type: String,
    pub storage_mode: StorageMode,
    pub external_url: Option<String>,
    pub content_hash: String,
    pub size_bytes: u64,
    pub width_px: Option<u32>,
    pub height_px: Option<u32>,
    pub created_at_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttachment {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub width_px: Option<u32>,
    pub height_px: Option<u32>,
    /// When set, the bytes are hashed for dedup but not copied into the blob store.
    pub external_url: Option<String>,
    /// Message to link immediately, in the same transaction as the insert.
    pub message_id: Option<MessageId>,
}

impl NewAttachment {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
            width_px: None,
            height_px: None,
            external_url: None,
            message_id: None,
        }
    }

    pub fn with_dimensions(mut self, width_px: u32, height_px: u32) -> Self {
        self.width_px = Some(width_px);
        self.height_px = Some(height_px);
        self
    }

    pub fn with_external_url(mut self, url: impl Into<String>) -> Self {
        self.external_url = Some(url.into());
        self
    }

    pub fn linked_to(mut self, message_id: MessageId) -> Self {
        self.message_id = Some(message_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentUpload {
    pub attachment: AttachmentRecord,
    /// True when an attachment with the same content hash already existed.
    pub deduplicated: bool,
    /// Whether a new link was created for `NewAttachment::message_id`.
    pub linked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UnlinkOutcome {
    pub unlinked: bool,
    /// The attachment row and blob were removed because no links remained.
    pub attachment_collected: bool,
}

/// What happens to an attachment once its last message link is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    #[default]
    Retain,
    Collect,
}
