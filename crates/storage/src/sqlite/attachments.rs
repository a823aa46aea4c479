use snafu::{OptionExt, ResultExt};
use sqlx::{FromRow, SqliteConnection};

use super::{
    SqliteStorage, ensure_message_exists, i64_to_u32, i64_to_u64, u64_to_i64,
    unix_timestamp_millis,
};
use crate::blob::{BlobStore, StoredBlob};
use crate::error::{
    AttachmentReadSnafu, BlobTaskSnafu, BlobWriteSnafu, InvariantViolationSnafu, NotFoundSnafu,
    SqliteQuerySnafu, StorageResult, UnsupportedAttachmentSnafu,
};
use crate::ids::{AttachmentId, MessageId};
use crate::types::{
    AttachmentKind, AttachmentRecord, AttachmentUpload, NewAttachment, OrphanPolicy, StorageMode,
    UnlinkOutcome,
};
use crate::{AttachmentStore, BoxFuture};

const SELECT_ATTACHMENT_BY_ID: &str = "SELECT id, kind, mime_type, storage_mode, external_url, content_hash, size_bytes, width_px, height_px, created_at
FROM attachments WHERE id = ?";

const SELECT_ATTACHMENT_BY_HASH: &str = "SELECT id, kind, mime_type, storage_mode, external_url, content_hash, size_bytes, width_px, height_px, created_at
FROM attachments WHERE content_hash = ?";

const SELECT_ATTACHMENTS_FOR_MESSAGE: &str = "SELECT a.id, a.kind, a.mime_type, a.storage_mode, a.external_url, a.content_hash, a.size_bytes, a.width_px, a.height_px, a.created_at
FROM message_attachments ma
JOIN attachments a ON a.id = ma.attachment_id
WHERE ma.message_id = ?
ORDER BY ma.position ASC, ma.created_at ASC";

// Positions continue after the highest existing one; the pair primary key makes relinking a no-op.
const INSERT_LINK_AT_END: &str = "INSERT OR IGNORE INTO message_attachments (message_id, attachment_id, position, created_at)
SELECT ?, ?, COALESCE(MAX(position) + 1, 0), ? FROM message_attachments WHERE message_id = ?";

#[derive(Debug, FromRow)]
struct AttachmentRow {
    id: String,
    kind: String,
    mime_type: String,
    storage_mode: String,
    external_url: Option<String>,
    content_hash: String,
    size_bytes: i64,
    width_px: Option<i64>,
    height_px: Option<i64>,
    created_at: i64,
}

#[derive(Debug, FromRow)]
struct CollectableRow {
    storage_mode: String,
    content_hash: String,
}

/// An attachment row removed because nothing linked to it anymore.
#[derive(Debug, Clone)]
pub(crate) struct CollectedAttachment {
    pub(crate) id: AttachmentId,
    /// Set for inline attachments whose blob must be removed after commit.
    pub(crate) inline_hash: Option<String>,
}

impl AttachmentStore for SqliteStorage {
    fn create_attachment(
        &self,
        input: NewAttachment,
    ) -> BoxFuture<'_, StorageResult<AttachmentUpload>> {
        Box::pin(async move {
            let kind = AttachmentKind::from_mime_type(&input.mime_type).context(
                UnsupportedAttachmentSnafu {
                    stage: "attachment-create-kind",
                    mime_type: input.mime_type.clone(),
                },
            )?;
            let storage_mode = if input.external_url.is_some() {
                StorageMode::External
            } else {
                StorageMode::Inline
            };
            let size_bytes = input.bytes.len() as u64;

            let written = match storage_mode {
                StorageMode::Inline => Some(self.store_blob(input.bytes.clone()).await?),
                StorageMode::External => None,
            };
            let content_hash = match &written {
                Some(blob) => blob.hash.clone(),
                None => BlobStore::compute_hash(&input.bytes),
            };

            let recorded = self
                .record_attachment(&input, kind, storage_mode, &content_hash, size_bytes)
                .await;
            let (attachment, inserted, linked) = match recorded {
                Ok(recorded) => recorded,
                Err(error) => {
                    if written.is_some_and(|blob| blob.is_new) {
                        self.remove_unreferenced_blob(&content_hash).await;
                    }
                    return Err(error);
                }
            };

            // A concurrent collection of the previous owner of this hash may have removed the
            // blob between the write above and the commit.
            if attachment.storage_mode == StorageMode::Inline
                && !self.blobs.exists(&attachment.content_hash)
            {
                self.store_blob(input.bytes).await?;
            }

            let deduplicated = inserted == 0;
            tracing::debug!(
                attachment_id = %attachment.id,
                content_hash = %attachment.content_hash,
                deduplicated,
                linked,
                "attachment stored"
            );
            Ok(AttachmentUpload {
                attachment,
                deduplicated,
                linked,
            })
        })
    }

    fn get_attachment(
        &self,
        attachment_id: AttachmentId,
    ) -> BoxFuture<'_, StorageResult<Option<AttachmentRecord>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, AttachmentRow>(SELECT_ATTACHMENT_BY_ID)
                .bind(attachment_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "attachment-get-query",
                })?;
            row.map(attachment_row_to_record).transpose()
        })
    }

    fn link_to_message(
        &self,
        attachment_id: AttachmentId,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<bool>> {
        Box::pin(async move {
            let mut transaction = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "attachment-link-begin",
            })?;
            ensure_attachment_exists(&mut transaction, attachment_id, "attachment-link-attachment")
                .await?;
            ensure_message_exists(&mut transaction, message_id, "attachment-link-message").await?;

            let linked = insert_link(
                &mut transaction,
                attachment_id,
                message_id,
                unix_timestamp_millis(),
            )
            .await?;

            transaction.commit().await.context(SqliteQuerySnafu {
                stage: "attachment-link-commit",
            })?;
            Ok(linked)
        })
    }

    fn unlink_from_message(
        &self,
        attachment_id: AttachmentId,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<UnlinkOutcome>> {
        Box::pin(async move {
            let mut transaction = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "attachment-unlink-begin",
            })?;

            let unlinked = sqlx::query(
                "DELETE FROM message_attachments WHERE message_id = ? AND attachment_id = ?",
            )
            .bind(message_id.to_string())
            .bind(attachment_id.to_string())
            .execute(&mut *transaction)
            .await
            .context(SqliteQuerySnafu {
                stage: "attachment-unlink-delete",
            })?
            .rows_affected()
                == 1;

            let collected = if unlinked && self.orphan_policy == OrphanPolicy::Collect {
                collect_if_orphaned(&mut transaction, attachment_id, "attachment-unlink-collect")
                    .await?
            } else {
                None
            };

            transaction.commit().await.context(SqliteQuerySnafu {
                stage: "attachment-unlink-commit",
            })?;

            let attachment_collected = match collected {
                Some(collected) => {
                    self.remove_collected_blobs(std::slice::from_ref(&collected))
                        .await;
                    true
                }
                None => false,
            };

            Ok(UnlinkOutcome {
                unlinked,
                attachment_collected,
            })
        })
    }

    fn list_attachments_for_message(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<Vec<AttachmentRecord>>> {
        Box::pin(async move {
            let mut connection = self.pool.acquire().await.context(SqliteQuerySnafu {
                stage: "attachment-list-acquire",
            })?;
            ensure_message_exists(&mut connection, message_id, "attachment-list-message").await?;

            let rows = sqlx::query_as::<_, AttachmentRow>(SELECT_ATTACHMENTS_FOR_MESSAGE)
                .bind(message_id.to_string())
                .fetch_all(&mut *connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "attachment-list-query",
                })?;
            rows.into_iter().map(attachment_row_to_record).collect()
        })
    }

    fn count_attachment_links(
        &self,
        attachment_id: AttachmentId,
    ) -> BoxFuture<'_, StorageResult<u64>> {
        Box::pin(async move {
            let mut connection = self.pool.acquire().await.context(SqliteQuerySnafu {
                stage: "attachment-count-acquire",
            })?;
            ensure_attachment_exists(&mut connection, attachment_id, "attachment-count-attachment")
                .await?;
            let count = link_count(&mut connection, attachment_id, "attachment-count-query").await?;
            i64_to_u64(count, "attachment-count-query")
        })
    }

    fn read_attachment_bytes(
        &self,
        attachment_id: AttachmentId,
    ) -> BoxFuture<'_, StorageResult<Vec<u8>>> {
        Box::pin(async move {
            let attachment = self
                .get_attachment(attachment_id)
                .await?
                .context(NotFoundSnafu {
                    stage: "attachment-read-load",
                    entity: "attachment",
                    id: attachment_id.to_string(),
                })?;

            if attachment.storage_mode == StorageMode::External {
                return AttachmentReadSnafu {
                    stage: "attachment-read-external",
                    attachment_id: attachment_id.to_string(),
                    details: format!(
                        "content is hosted at '{}'",
                        attachment.external_url.unwrap_or_default()
                    ),
                }
                .fail();
            }

            let blobs = self.blobs.clone();
            let hash = attachment.content_hash.clone();
            let bytes = tokio::task::spawn_blocking(move || blobs.get(&hash))
                .await
                .context(BlobTaskSnafu {
                    stage: "attachment-read-blob-task",
                })?
                .map_err(|error| {
                    AttachmentReadSnafu {
                        stage: "attachment-read-blob",
                        attachment_id: attachment_id.to_string(),
                        details: error.to_string(),
                    }
                    .build()
                })?;

            if BlobStore::compute_hash(&bytes) != attachment.content_hash {
                return AttachmentReadSnafu {
                    stage: "attachment-read-verify",
                    attachment_id: attachment_id.to_string(),
                    details: "stored bytes do not match the content hash".to_string(),
                }
                .fail();
            }
            Ok(bytes)
        })
    }

    fn collect_orphans(&self) -> BoxFuture<'_, StorageResult<Vec<AttachmentId>>> {
        Box::pin(async move {
            let mut transaction = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "attachment-collect-begin",
            })?;

            let candidates = sqlx::query_scalar::<_, String>(
                "SELECT id FROM attachments a
                 WHERE NOT EXISTS (SELECT 1 FROM message_attachments ma WHERE ma.attachment_id = a.id)
                 ORDER BY created_at ASC, id ASC",
            )
            .fetch_all(&mut *transaction)
            .await
            .context(SqliteQuerySnafu {
                stage: "attachment-collect-candidates",
            })?;

            let mut collected = Vec::with_capacity(candidates.len());
            for raw_id in candidates {
                let attachment_id = AttachmentId::parse(&raw_id)?;
                if let Some(attachment) = collect_if_orphaned(
                    &mut transaction,
                    attachment_id,
                    "attachment-collect-delete",
                )
                .await?
                {
                    collected.push(attachment);
                }
            }

            transaction.commit().await.context(SqliteQuerySnafu {
                stage: "attachment-collect-commit",
            })?;
            self.remove_collected_blobs(&collected).await;

            if !collected.is_empty() {
                tracing::info!(collected = collected.len(), "orphaned attachments collected");
            }
            Ok(collected.into_iter().map(|attachment| attachment.id).collect())
        })
    }
}

impl SqliteStorage {
    /// Inserts or reuses the row for `content_hash` and links it when asked, in one
    /// transaction. Returns the row, whether it was newly inserted and whether a link was added.
    async fn record_attachment(
        &self,
        input: &NewAttachment,
        kind: AttachmentKind,
        storage_mode: StorageMode,
        content_hash: &str,
        size_bytes: u64,
    ) -> StorageResult<(AttachmentRecord, u64, bool)> {
        let mut transaction = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "attachment-create-begin",
        })?;
        let now = unix_timestamp_millis();

        // The unique hash constraint decides the winner between concurrent uploads;
        // the loser reads back the winning row.
        let inserted = sqlx::query(
            "INSERT INTO attachments (
                id, kind, mime_type, storage_mode, external_url, content_hash,
                size_bytes, width_px, height_px, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(content_hash) DO NOTHING",
        )
        .bind(AttachmentId::new_v7().to_string())
        .bind(kind.as_str())
        .bind(input.mime_type.trim().to_ascii_lowercase())
        .bind(storage_mode.as_str())
        .bind(input.external_url.clone())
        .bind(content_hash)
        .bind(u64_to_i64(size_bytes, "attachment-create-size")?)
        .bind(input.width_px.map(i64::from))
        .bind(input.height_px.map(i64::from))
        .bind(now)
        .execute(&mut *transaction)
        .await
        .context(SqliteQuerySnafu {
            stage: "attachment-create-insert",
        })?
        .rows_affected();

        let mut row = sqlx::query_as::<_, AttachmentRow>(SELECT_ATTACHMENT_BY_HASH)
            .bind(content_hash)
            .fetch_optional(&mut *transaction)
            .await
            .context(SqliteQuerySnafu {
                stage: "attachment-create-reload",
            })?
            .context(InvariantViolationSnafu {
                stage: "attachment-create-reload",
                details: format!("attachment with hash '{content_hash}' vanished after insert"),
            })?;

        // Bytes uploaded inline make a previously external row readable locally.
        if storage_mode == StorageMode::Inline
            && storage_mode_from_sql(&row.storage_mode)? == StorageMode::External
        {
            sqlx::query(
                "UPDATE attachments SET storage_mode = ?, external_url = NULL WHERE id = ?",
            )
            .bind(StorageMode::Inline.as_str())
            .bind(row.id.as_str())
            .execute(&mut *transaction)
            .await
            .context(SqliteQuerySnafu {
                stage: "attachment-create-promote-inline",
            })?;
            tracing::debug!(attachment_id = %row.id, "external attachment promoted to inline");
            row.storage_mode = StorageMode::Inline.as_str().to_string();
            row.external_url = None;
        }
        let attachment = attachment_row_to_record(row)?;

        let linked = match input.message_id {
            Some(message_id) => {
                ensure_message_exists(&mut transaction, message_id, "attachment-create-message")
                    .await?;
                insert_link(&mut transaction, attachment.id, message_id, now).await?
            }
            None => false,
        };

        transaction.commit().await.context(SqliteQuerySnafu {
            stage: "attachment-create-commit",
        })?;
        Ok((attachment, inserted, linked))
    }

    /// Drops a blob written for an upload that failed to record, unless a row now owns it.
    async fn remove_unreferenced_blob(&self, content_hash: &str) {
        let owned = sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM attachments WHERE content_hash = ? AND storage_mode = ? LIMIT 1",
        )
        .bind(content_hash)
        .bind(StorageMode::Inline.as_str())
        .fetch_optional(&self.pool)
        .await;

        match owned {
            Ok(None) => self.delete_blobs(vec![content_hash.to_string()]).await,
            Ok(Some(_)) => {}
            Err(error) => {
                tracing::warn!(
                    content_hash = %content_hash,
                    stage = "attachment-create-cleanup",
                    error = %error,
                    "could not check blob ownership, leaving it on disk"
                );
            }
        }
    }

    async fn store_blob(&self, bytes: Vec<u8>) -> StorageResult<StoredBlob> {
        let blobs = self.blobs.clone();
        tokio::task::spawn_blocking(move || {
            blobs.store(&bytes).context(BlobWriteSnafu {
                stage: "attachment-blob-store",
                hash: BlobStore::compute_hash(&bytes),
            })
        })
        .await
        .context(BlobTaskSnafu {
            stage: "attachment-blob-store-task",
        })?
    }

    /// Deletes blobs of collected attachments. Runs after commit, so a failure only
    /// leaves an unreferenced file behind.
    pub(crate) async fn remove_collected_blobs(&self, collected: &[CollectedAttachment]) {
        let hashes = collected
            .iter()
            .filter_map(|attachment| attachment.inline_hash.clone())
            .collect::<Vec<_>>();
        self.delete_blobs(hashes).await;
    }

    async fn delete_blobs(&self, hashes: Vec<String>) {
        if hashes.is_empty() {
            return;
        }

        let blobs = self.blobs.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            hashes
                .into_iter()
                .filter_map(|hash| blobs.delete(&hash).err().map(|error| (hash, error)))
                .collect::<Vec<_>>()
        })
        .await;

        match outcome {
            Ok(failures) => {
                for (hash, error) in failures {
                    tracing::warn!(
                        content_hash = %hash,
                        stage = "attachment-blob-delete",
                        error = %error,
                        "failed to delete blob"
                    );
                }
            }
            Err(error) => {
                tracing::warn!(
                    stage = "attachment-blob-delete-task",
                    error = %error,
                    "blob deletion task failed"
                );
            }
        }
    }
}

/// Deletes the attachment row when no link references it anymore.
pub(crate) async fn collect_if_orphaned(
    connection: &mut SqliteConnection,
    attachment_id: AttachmentId,
    stage: &'static str,
) -> StorageResult<Option<CollectedAttachment>> {
    if link_count(connection, attachment_id, stage).await? > 0 {
        return Ok(None);
    }

    let Some(row) = sqlx::query_as::<_, CollectableRow>(
        "SELECT storage_mode, content_hash FROM attachments WHERE id = ?",
    )
    .bind(attachment_id.to_string())
    .fetch_optional(&mut *connection)
    .await
    .context(SqliteQuerySnafu { stage })?
    else {
        return Ok(None);
    };

    sqlx::query("DELETE FROM attachments WHERE id = ?")
        .bind(attachment_id.to_string())
        .execute(&mut *connection)
        .await
        .context(SqliteQuerySnafu { stage })?;

    tracing::debug!(attachment_id = %attachment_id, stage, "orphaned attachment removed");
    Ok(Some(CollectedAttachment {
        id: attachment_id,
        inline_hash: (storage_mode_from_sql(&row.storage_mode)? == StorageMode::Inline)
            .then_some(row.content_hash),
    }))
}

async fn insert_link(
    connection: &mut SqliteConnection,
    attachment_id: AttachmentId,
    message_id: MessageId,
    now: i64,
) -> StorageResult<bool> {
    let inserted = sqlx::query(INSERT_LINK_AT_END)
        .bind(message_id.to_string())
        .bind(attachment_id.to_string())
        .bind(now)
        .bind(message_id.to_string())
        .execute(&mut *connection)
        .await
        .context(SqliteQuerySnafu {
            stage: "attachment-link-insert",
        })?
        .rows_affected();
    Ok(inserted == 1)
}

async fn link_count(
    connection: &mut SqliteConnection,
    attachment_id: AttachmentId,
    stage: &'static str,
) -> StorageResult<i64> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM message_attachments WHERE attachment_id = ?",
    )
    .bind(attachment_id.to_string())
    .fetch_one(&mut *connection)
    .await
    .context(SqliteQuerySnafu { stage })
}

async fn ensure_attachment_exists(
    connection: &mut SqliteConnection,
    attachment_id: AttachmentId,
    stage: &'static str,
) -> StorageResult<()> {
    sqlx::query_scalar::<_, i64>("SELECT 1 FROM attachments WHERE id = ? LIMIT 1")
        .bind(attachment_id.to_string())
        .fetch_optional(&mut *connection)
        .await
        .context(SqliteQuerySnafu { stage })?
        .context(NotFoundSnafu {
            stage,
            entity: "attachment",
            id: attachment_id.to_string(),
        })?;
    Ok(())
}

fn attachment_row_to_record(row: AttachmentRow) -> StorageResult<AttachmentRecord> {
    let kind = match row.kind.as_str() {
        "image" => AttachmentKind::Image,
        other => {
            return InvariantViolationSnafu {
                stage: "attachment-kind-from-sql",
                details: format!("unknown attachment kind '{other}'"),
            }
            .fail();
        }
    };

    Ok(AttachmentRecord {
        id: AttachmentId::parse(&row.id)?,
        kind,
        mime_type: row.mime_type,
        storage_mode: storage_mode_from_sql(&row.storage_mode)?,
        external_url: row.external_url,
        content_hash: row.content_hash,
        size_bytes: i64_to_u64(row.size_bytes, "attachment-row-size")?,
        width_px: row
            .width_px
            .map(|value| i64_to_u32(value, "attachment-row-width"))
            .transpose()?,
        height_px: row
            .height_px
            .map(|value| i64_to_u32(value, "attachment-row-height"))
            .transpose()?,
        created_at_unix_ms: i64_to_u64(row.created_at, "attachment-row-created-at")?,
    })
}

fn storage_mode_from_sql(raw: &str) -> StorageResult<StorageMode> {
    match raw {
        "inline" => Ok(StorageMode::Inline),
        "external" => Ok(StorageMode::External),
        _ => InvariantViolationSnafu {
            stage: "attachment-storage-mode-from-sql",
            details: format!("unknown storage mode '{raw}'"),
        }
        .fail(),
    }
}
