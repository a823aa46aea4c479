use std::collections::HashSet;

use snafu::{OptionExt, ResultExt};
use sqlx::{FromRow, SqliteConnection};

use super::attachments::collect_if_orphaned;
use super::{
    DecodedMessage, MessageRow, SqliteStorage, children_from_parent_pointers, decode_children,
    encode_children, ensure_conversation_exists, i64_to_u64, message_row_to_record, scan_children,
    touch_conversation, unix_timestamp_millis,
};
use crate::error::{
    NotFoundSnafu, ParentNotFoundSnafu, SqliteQuerySnafu, StorageResult,
    TreeInvariantViolationSnafu,
};
use crate::ids::{AttachmentId, ConversationId, MessageId};
use crate::types::{MessagePatch, MessageRecord, NewMessage, OrphanPolicy};
use crate::{BoxFuture, MessageTreeStore};

macro_rules! select_messages {
    ($tail:literal) => {
        concat!(
            "SELECT id, conversation_id, parent_id, children_ids, role, content, reasoning, ",
            "model_name, partial, created_at, updated_at FROM messages ",
            $tail
        )
    };
}

const SUBTREE_IDS: &str = "WITH RECURSIVE subtree(id) AS (
    SELECT ?
    UNION
    SELECT messages.id FROM messages JOIN subtree ON messages.parent_id = subtree.id
)
SELECT messages.id, messages.conversation_id FROM messages JOIN subtree ON messages.id = subtree.id";

const SUBTREE_ATTACHMENTS: &str = "WITH RECURSIVE subtree(id) AS (
    SELECT ?
    UNION
    SELECT messages.id FROM messages JOIN subtree ON messages.parent_id = subtree.id
)
SELECT DISTINCT attachment_id FROM message_attachments WHERE message_id IN (SELECT id FROM subtree)";

const DELETE_SUBTREE: &str = "WITH RECURSIVE subtree(id) AS (
    SELECT ?
    UNION
    SELECT messages.id FROM messages JOIN subtree ON messages.parent_id = subtree.id
)
DELETE FROM messages WHERE id IN (SELECT id FROM subtree)";

#[derive(Debug, FromRow)]
struct ParentRow {
    conversation_id: String,
    children_ids: String,
}

#[derive(Debug, FromRow)]
struct SubtreeRow {
    id: String,
    conversation_id: String,
}

#[derive(Debug, FromRow)]
struct DeleteTargetRow {
    conversation_id: String,
    parent_id: Option<String>,
}

impl MessageTreeStore for SqliteStorage {
    fn append_message(
        &self,
        conversation_id: ConversationId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        self.append_message_with_attachments(conversation_id, input, Vec::new())
    }

    fn append_message_with_attachments(
        &self,
        conversation_id: ConversationId,
        input: NewMessage,
        attachment_ids: Vec<AttachmentId>,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let mut transaction = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "message-append-begin",
            })?;

            let record = insert_message(&mut transaction, conversation_id, input).await?;
            link_in_order(&mut transaction, record.id, &attachment_ids, record.created_at_unix_ms)
                .await?;

            transaction.commit().await.context(SqliteQuerySnafu {
                stage: "message-append-commit",
            })?;

            tracing::debug!(
                conversation_id = %conversation_id,
                message_id = %record.id,
                parent_id = ?record.parent_id,
                role = record.role.as_str(),
                attachments = attachment_ids.len(),
                "message appended"
            );
            Ok(record)
        })
    }

    fn get_message(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<Option<MessageRecord>>> {
        Box::pin(async move {
            let mut connection = self.pool.acquire().await.context(SqliteQuerySnafu {
                stage: "message-get-acquire",
            })?;
            load_message(&mut connection, message_id).await
        })
    }

    fn update_message(
        &self,
        message_id: MessageId,
        patch: MessagePatch,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let mut transaction = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "message-update-begin",
            })?;
            let now = unix_timestamp_millis();

            let result = sqlx::query(
                "UPDATE messages SET content = ?, reasoning = COALESCE(?, reasoning), updated_at = ? WHERE id = ?",
            )
            .bind(patch.content)
            .bind(patch.reasoning)
            .bind(now)
            .bind(message_id.to_string())
            .execute(&mut *transaction)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-update-apply",
            })?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "message-update-apply",
                    entity: "message",
                    id: message_id.to_string(),
                }
                .fail();
            }

            let record = load_message(&mut transaction, message_id)
                .await?
                .context(NotFoundSnafu {
                    stage: "message-update-reload",
                    entity: "message",
                    id: message_id.to_string(),
                })?;
            touch_conversation(
                &mut transaction,
                record.conversation_id,
                now,
                "message-update-touch-conversation",
            )
            .await?;

            transaction.commit().await.context(SqliteQuerySnafu {
                stage: "message-update-commit",
            })?;
            Ok(record)
        })
    }

    fn delete_message(&self, message_id: MessageId) -> BoxFuture<'_, StorageResult<bool>> {
        Box::pin(async move {
            let mut transaction = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "message-delete-begin",
            })?;

            let Some(target) = sqlx::query_as::<_, DeleteTargetRow>(
                "SELECT conversation_id, parent_id FROM messages WHERE id = ?",
            )
            .bind(message_id.to_string())
            .fetch_optional(&mut *transaction)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-delete-load-target",
            })?
            else {
                return Ok(false);
            };

            let subtree = sqlx::query_as::<_, SubtreeRow>(SUBTREE_IDS)
                .bind(message_id.to_string())
                .fetch_all(&mut *transaction)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-delete-load-subtree",
                })?;

            if let Some(stray) = subtree
                .iter()
                .find(|row| row.conversation_id != target.conversation_id)
            {
                return TreeInvariantViolationSnafu {
                    stage: "message-delete-load-subtree",
                    details: format!(
                        "message '{}' in subtree of '{message_id}' belongs to conversation '{}'",
                        stray.id, stray.conversation_id
                    ),
                }
                .fail();
            }

            if let Some(parent_raw) = target.parent_id.as_deref() {
                let parent_id = MessageId::parse(parent_raw)?;
                detach_from_parent(&mut transaction, parent_id, message_id).await?;
            }

            let attachment_candidates = if self.orphan_policy == OrphanPolicy::Collect {
                sqlx::query_scalar::<_, String>(SUBTREE_ATTACHMENTS)
                    .bind(message_id.to_string())
                    .fetch_all(&mut *transaction)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "message-delete-load-attachments",
                    })?
            } else {
                Vec::new()
            };

            let deleted = sqlx::query(DELETE_SUBTREE)
                .bind(message_id.to_string())
                .execute(&mut *transaction)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-delete-subtree",
                })?
                .rows_affected();

            if deleted != subtree.len() as u64 {
                return TreeInvariantViolationSnafu {
                    stage: "message-delete-subtree",
                    details: format!(
                        "expected to delete {} messages under '{message_id}', deleted {deleted}",
                        subtree.len()
                    ),
                }
                .fail();
            }

            let mut collected = Vec::new();
            for raw_id in attachment_candidates {
                let attachment_id = AttachmentId::parse(&raw_id)?;
                if let Some(attachment) = collect_if_orphaned(
                    &mut transaction,
                    attachment_id,
                    "message-delete-collect-attachment",
                )
                .await?
                {
                    collected.push(attachment);
                }
            }

            let conversation_id = ConversationId::parse(&target.conversation_id)?;
            touch_conversation(
                &mut transaction,
                conversation_id,
                unix_timestamp_millis(),
                "message-delete-touch-conversation",
            )
            .await?;

            transaction.commit().await.context(SqliteQuerySnafu {
                stage: "message-delete-commit",
            })?;

            self.remove_collected_blobs(&collected).await;

            tracing::debug!(
                conversation_id = %conversation_id,
                message_id = %message_id,
                deleted,
                collected_attachments = collected.len(),
                "message subtree deleted"
            );
            Ok(true)
        })
    }

    fn get_children(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageId>>> {
        Box::pin(async move {
            let mut transaction = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "message-children-begin",
            })?;

            let raw = sqlx::query_scalar::<_, String>(
                "SELECT children_ids FROM messages WHERE id = ?",
            )
            .bind(message_id.to_string())
            .fetch_optional(&mut *transaction)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-children-load",
            })?
            .context(NotFoundSnafu {
                stage: "message-children-load",
                entity: "message",
                id: message_id.to_string(),
            })?;

            if let Some(children) = decode_children(&raw) {
                return Ok(children);
            }

            let children =
                scan_children(&mut transaction, message_id, "message-children-scan").await?;
            tracing::warn!(
                message_id = %message_id,
                stage = "message-children-repair",
                children = children.len(),
                "malformed children cache rebuilt from parent pointers"
            );
            write_children(&mut transaction, message_id, &children, "message-children-repair")
                .await?;

            transaction.commit().await.context(SqliteQuerySnafu {
                stage: "message-children-commit",
            })?;
            Ok(children)
        })
    }

    fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let mut connection = self.pool.acquire().await.context(SqliteQuerySnafu {
                stage: "message-list-acquire",
            })?;
            ensure_conversation_exists(
                &mut connection,
                conversation_id,
                "message-list-conversation",
            )
            .await?;

            let rows = sqlx::query_as::<_, MessageRow>(select_messages!(
                "WHERE conversation_id = ? ORDER BY created_at ASC, id ASC"
            ))
            .bind(conversation_id.to_string())
            .fetch_all(&mut *connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-list-query",
            })?;

            let decoded = rows
                .into_iter()
                .map(message_row_to_record)
                .collect::<StorageResult<Vec<_>>>()?;

            let malformed = decoded
                .iter()
                .filter(|message| !message.children_cache_valid)
                .map(|message| message.record.id)
                .collect::<HashSet<_>>();
            let mut messages = decoded
                .into_iter()
                .map(|message| message.record)
                .collect::<Vec<_>>();

            if !malformed.is_empty() {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    stage = "message-list-children-fallback",
                    malformed = malformed.len(),
                    "children caches rebuilt in memory from parent pointers"
                );
                let mut rebuilt = children_from_parent_pointers(&messages);
                for message in &mut messages {
                    if malformed.contains(&message.id) {
                        message.children_ids = rebuilt.remove(&message.id).unwrap_or_default();
                    }
                }
            }

            Ok(messages)
        })
    }
}

/// Inserts one message and appends it to the parent's children cache.
///
/// Every check that can reject the insert runs before the first write.
async fn insert_message(
    connection: &mut SqliteConnection,
    conversation_id: ConversationId,
    input: NewMessage,
) -> StorageResult<MessageRecord> {
    ensure_conversation_exists(connection, conversation_id, "message-append-conversation").await?;

    let message_id = MessageId::new_v7();
    let parent_children = match input.parent_id {
        Some(parent_id) => {
            let parent = sqlx::query_as::<_, ParentRow>(
                "SELECT conversation_id, children_ids FROM messages WHERE id = ?",
            )
            .bind(parent_id.to_string())
            .fetch_optional(&mut *connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-load-parent",
            })?
            .filter(|parent| parent.conversation_id == conversation_id.to_string())
            .context(ParentNotFoundSnafu {
                stage: "message-append-load-parent",
                conversation_id: conversation_id.to_string(),
                parent_id: parent_id.to_string(),
            })?;

            let children = match decode_children(&parent.children_ids) {
                Some(children) => children,
                None => {
                    tracing::warn!(
                        message_id = %parent_id,
                        stage = "message-append-parent-cache",
                        "malformed parent children cache rebuilt before append"
                    );
                    scan_children(connection, parent_id, "message-append-parent-scan").await?
                }
            };

            if children.contains(&message_id) {
                return TreeInvariantViolationSnafu {
                    stage: "message-append-parent-cache",
                    details: format!(
                        "new message '{message_id}' already listed under parent '{parent_id}'"
                    ),
                }
                .fail();
            }
            Some((parent_id, children))
        }
        None => None,
    };

    let now = unix_timestamp_millis();
    sqlx::query(
        "INSERT INTO messages (
            id, conversation_id, parent_id, children_ids, role, content, reasoning,
            model_name, partial, created_at, updated_at
        ) VALUES (?, ?, ?, '[]', ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(message_id.to_string())
    .bind(conversation_id.to_string())
    .bind(input.parent_id.map(|parent_id| parent_id.to_string()))
    .bind(input.role.as_str())
    .bind(input.content.clone())
    .bind(input.reasoning.clone())
    .bind(input.model_name.clone())
    .bind(input.partial)
    .bind(now)
    .bind(now)
    .execute(&mut *connection)
    .await
    .context(SqliteQuerySnafu {
        stage: "message-append-insert",
    })?;

    if let Some((parent_id, mut children)) = parent_children {
        children.push(message_id);
        write_children(connection, parent_id, &children, "message-append-update-parent").await?;
    }

    touch_conversation(
        connection,
        conversation_id,
        now,
        "message-append-touch-conversation",
    )
    .await?;

    let timestamp = i64_to_u64(now, "message-append-timestamp")?;
    Ok(MessageRecord {
        id: message_id,
        conversation_id,
        parent_id: input.parent_id,
        children_ids: Vec::new(),
        role: input.role,
        content: input.content,
        reasoning: input.reasoning,
        model_name: input.model_name,
        partial: input.partial,
        created_at_unix_ms: timestamp,
        updated_at_unix_ms: timestamp,
    })
}

async fn link_in_order(
    connection: &mut SqliteConnection,
    message_id: MessageId,
    attachment_ids: &[AttachmentId],
    created_at_unix_ms: u64,
) -> StorageResult<()> {
    let mut seen = HashSet::with_capacity(attachment_ids.len());
    let created_at = created_at_unix_ms as i64;

    for (position, attachment_id) in attachment_ids
        .iter()
        .filter(|attachment_id| seen.insert(**attachment_id))
        .enumerate()
    {
        sqlx::query_scalar::<_, i64>("SELECT 1 FROM attachments WHERE id = ? LIMIT 1")
            .bind(attachment_id.to_string())
            .fetch_optional(&mut *connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-load-attachment",
            })?
            .context(NotFoundSnafu {
                stage: "message-append-load-attachment",
                entity: "attachment",
                id: attachment_id.to_string(),
            })?;

        sqlx::query(
            "INSERT INTO message_attachments (message_id, attachment_id, position, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(message_id.to_string())
        .bind(attachment_id.to_string())
        .bind(position as i64)
        .bind(created_at)
        .execute(&mut *connection)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-append-link-attachment",
        })?;
    }

    Ok(())
}

/// Removes `child_id` from the parent's cache. A well-formed cache that does not list
/// the child means the tree is already inconsistent, so the delete is refused.
async fn detach_from_parent(
    connection: &mut SqliteConnection,
    parent_id: MessageId,
    child_id: MessageId,
) -> StorageResult<()> {
    let raw = sqlx::query_scalar::<_, String>("SELECT children_ids FROM messages WHERE id = ?")
        .bind(parent_id.to_string())
        .fetch_optional(&mut *connection)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-delete-load-parent",
        })?
        .context(TreeInvariantViolationSnafu {
            stage: "message-delete-load-parent",
            details: format!("parent '{parent_id}' of '{child_id}' does not exist"),
        })?;

    let remaining = match decode_children(&raw) {
        Some(children) => {
            if !children.contains(&child_id) {
                return TreeInvariantViolationSnafu {
                    stage: "message-delete-detach",
                    details: format!("parent '{parent_id}' does not list child '{child_id}'"),
                }
                .fail();
            }
            children
                .into_iter()
                .filter(|candidate| *candidate != child_id)
                .collect::<Vec<_>>()
        }
        None => {
            tracing::warn!(
                message_id = %parent_id,
                stage = "message-delete-parent-cache",
                "malformed parent children cache rebuilt before delete"
            );
            scan_children(connection, parent_id, "message-delete-parent-scan")
                .await?
                .into_iter()
                .filter(|candidate| *candidate != child_id)
                .collect()
        }
    };

    write_children(connection, parent_id, &remaining, "message-delete-detach").await
}

async fn write_children(
    connection: &mut SqliteConnection,
    message_id: MessageId,
    children: &[MessageId],
    stage: &'static str,
) -> StorageResult<()> {
    let encoded = encode_children(message_id, children)?;
    let result = sqlx::query("UPDATE messages SET children_ids = ? WHERE id = ?")
        .bind(encoded)
        .bind(message_id.to_string())
        .execute(&mut *connection)
        .await
        .context(SqliteQuerySnafu { stage })?;

    if result.rows_affected() != 1 {
        return TreeInvariantViolationSnafu {
            stage,
            details: format!("children cache of '{message_id}' was not updated"),
        }
        .fail();
    }
    Ok(())
}

async fn load_message(
    connection: &mut SqliteConnection,
    message_id: MessageId,
) -> StorageResult<Option<MessageRecord>> {
    let row = sqlx::query_as::<_, MessageRow>(select_messages!("WHERE id = ?"))
        .bind(message_id.to_string())
        .fetch_optional(&mut *connection)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-get-query",
        })?;

    let Some(row) = row else {
        return Ok(None);
    };

    let DecodedMessage {
        mut record,
        children_cache_valid,
    } = message_row_to_record(row)?;
    if !children_cache_valid {
        tracing::warn!(
            message_id = %message_id,
            stage = "message-get-children-fallback",
            "malformed children cache, reading children from parent pointers"
        );
        record.children_ids = scan_children(connection, message_id, "message-get-scan").await?;
    }
    Ok(Some(record))
}
