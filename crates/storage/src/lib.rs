use std::future::Future;
use std::pin::Pin;

pub mod blob;
pub mod error;
pub mod ids;
pub mod sqlite;
pub mod types;

pub use blob::{BlobStore, StoredBlob};
pub use error::{StorageError, StorageResult};
pub use ids::{AttachmentId, ConversationId, MessageId};
pub use sqlite::{SqliteStorage, StorageOptions};
pub use types::{
    AttachmentKind, AttachmentRecord, AttachmentUpload, ConversationRecord,
    DEFAULT_CONVERSATION_TITLE, MessagePatch, MessageRecord, MessageRole, NewAttachment,
    NewConversation, NewMessage, OrphanPolicy, StorageMode, UnlinkOutcome,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait ConversationStore: Send + Sync {
    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>>;
    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>>;
    fn list_conversations(&self) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>>;
}

/// Parent-pointer tree with a cached children list per node.
///
/// Every mutation rewrites the affected `children_ids` in the same transaction as the
/// row change, so `children(M) == { C : C.parent_id == M }` is observable at all times.
pub trait MessageTreeStore: Send + Sync {
    /// Inserts a message and appends it to its parent's children.
    ///
    /// Fails with `ParentNotFound` before any write when the parent does not resolve
    /// inside `conversation_id`.
    fn append_message(
        &self,
        conversation_id: ConversationId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>>;
    /// Same as `append_message`, linking `attachment_ids` (in order) in the same transaction.
    fn append_message_with_attachments(
        &self,
        conversation_id: ConversationId,
        input: NewMessage,
        attachment_ids: Vec<AttachmentId>,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>>;
    fn get_message(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<Option<MessageRecord>>>;
    fn update_message(
        &self,
        message_id: MessageId,
        patch: MessagePatch,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>>;
    /// Removes the message and its whole subtree. Returns `false` for unknown ids.
    fn delete_message(&self, message_id: MessageId) -> BoxFuture<'_, StorageResult<bool>>;
    fn get_children(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageId>>>;
    /// All messages of the conversation ordered by creation time ascending.
    fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>>;
}

pub trait AttachmentStore: Send + Sync {
    /// Stores the bytes once per content hash and optionally links the result.
    fn create_attachment(
        &self,
        input: NewAttachment,
    ) -> BoxFuture<'_, StorageResult<AttachmentUpload>>;
    fn get_attachment(
        &self,
        attachment_id: AttachmentId,
    ) -> BoxFuture<'_, StorageResult<Option<AttachmentRecord>>>;
    /// Returns `false` when the pair was already linked.
    fn link_to_message(
        &self,
        attachment_id: AttachmentId,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<bool>>;
    fn unlink_from_message(
        &self,
        attachment_id: AttachmentId,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<UnlinkOutcome>>;
    fn list_attachments_for_message(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<Vec<AttachmentRecord>>>;
    fn count_attachment_links(
        &self,
        attachment_id: AttachmentId,
    ) -> BoxFuture<'_, StorageResult<u64>>;
    fn read_attachment_bytes(
        &self,
        attachment_id: AttachmentId,
    ) -> BoxFuture<'_, StorageResult<Vec<u8>>>;
    /// Removes every attachment without links, regardless of the configured policy.
    fn collect_orphans(&self) -> BoxFuture<'_, StorageResult<Vec<AttachmentId>>>;
}

pub trait Storage: ConversationStore + MessageTreeStore + AttachmentStore {}

impl<T> Storage for T where T: ConversationStore + MessageTreeStore + AttachmentStore {}
