use std::collections::HashSet;
use std::sync::Arc;

use arbor_storage::{AttachmentId, MessageId, MessageRecord, NewMessage, Storage};
use snafu::{OptionExt, ResultExt};

use crate::error::{ChatResult, InvalidRequestSnafu, NotFoundSnafu, StorageSnafu};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditRequest {
    pub original_message_id: MessageId,
    pub new_content: String,
    /// Attachments of the original that the new branch should not inherit.
    pub removed_attachments: Vec<AttachmentId>,
    pub added_attachments: Vec<AttachmentId>,
}

impl EditRequest {
    pub fn new(original_message_id: MessageId, new_content: impl Into<String>) -> Self {
        Self {
            original_message_id,
            new_content: new_content.into(),
            removed_attachments: Vec::new(),
            added_attachments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    pub original: MessageRecord,
    pub sibling: MessageRecord,
    pub attachment_ids: Vec<AttachmentId>,
}

/// Edits by forking: the new content becomes a sibling of the original and the
/// original subtree stays reachable.
#[derive(Clone)]
pub struct EditBranchManager {
    storage: Arc<dyn Storage>,
}

impl EditBranchManager {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn branch(&self, request: EditRequest) -> ChatResult<Branch> {
        let original = self
            .storage
            .get_message(request.original_message_id)
            .await
            .context(StorageSnafu {
                stage: "branch-load-original",
            })?
            .context(NotFoundSnafu {
                stage: "branch-load-original",
                entity: "message",
                id: request.original_message_id.to_string(),
            })?;

        if request.new_content.trim().is_empty() {
            return InvalidRequestSnafu {
                stage: "branch-validate",
                details: "edited content must not be empty",
            }
            .fail();
        }

        let inherited = self
            .storage
            .list_attachments_for_message(original.id)
            .await
            .context(StorageSnafu {
                stage: "branch-load-attachments",
            })?;
        let attachment_ids = carried_attachments(
            inherited.iter().map(|attachment| attachment.id),
            &request.removed_attachments,
            &request.added_attachments,
        );

        let input = NewMessage {
            parent_id: original.parent_id,
            role: original.role,
            content: request.new_content,
            reasoning: None,
            model_name: None,
            partial: false,
        };
        let sibling = self
            .storage
            .append_message_with_attachments(
                original.conversation_id,
                input,
                attachment_ids.clone(),
            )
            .await
            .context(StorageSnafu {
                stage: "branch-append-sibling",
            })?;

        tracing::info!(
            conversation_id = %original.conversation_id,
            original_id = %original.id,
            sibling_id = %sibling.id,
            attachments = attachment_ids.len(),
            "message branched"
        );

        Ok(Branch {
            original,
            sibling,
            attachment_ids,
        })
    }
}

/// Original links minus `removed`, then `added`, first occurrence wins.
fn carried_attachments(
    inherited: impl IntoIterator<Item = AttachmentId>,
    removed: &[AttachmentId],
    added: &[AttachmentId],
) -> Vec<AttachmentId> {
    let removed = removed.iter().copied().collect::<HashSet<_>>();
    let mut seen = HashSet::new();
    inherited
        .into_iter()
        .filter(|id| !removed.contains(id))
        .chain(added.iter().copied())
        .filter(|id| seen.insert(*id))
        .collect()
}
