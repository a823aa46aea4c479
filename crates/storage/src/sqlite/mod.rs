use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqliteConnection, SqlitePool};

mod attachments;
mod tree;

use super::blob::BlobStore;
use super::error::{
    ChildrenCacheEncodeSnafu, CreateSqliteDirectorySnafu, InvariantViolationSnafu, NotFoundSnafu,
    SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu,
    SqliteQuerySnafu, StorageError, StorageResult,
};
use super::ids::{ConversationId, MessageId};
use super::types::{
    ConversationRecord, DEFAULT_CONVERSATION_TITLE, MessageRecord, MessageRole, NewConversation,
    OrphanPolicy,
};
use super::{BoxFuture, ConversationStore};

#[derive(Debug, Clone)]
pub struct StorageOptions {
    pub blob_root: PathBuf,
    pub orphan_policy: OrphanPolicy,
}

impl StorageOptions {
    pub fn new(blob_root: impl Into<PathBuf>) -> Self {
        Self {
            blob_root: blob_root.into(),
            orphan_policy: OrphanPolicy::default(),
        }
    }

    pub fn with_orphan_policy(mut self, orphan_policy: OrphanPolicy) -> Self {
        self.orphan_policy = orphan_policy;
        self
    }
}

/// SQLite-backed implementation of every store trait.
///
/// The pool holds exactly one connection, so write transactions are serialized and a
/// reader can never observe a message row whose parent cache has not been updated yet.
/// Code inside a transaction must only use that transaction, never `self.pool`.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    blobs: BlobStore,
    orphan_policy: OrphanPolicy,
}

impl SqliteStorage {
    pub async fn open(database_location: &str, options: StorageOptions) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // A single long-lived connection also keeps `:memory:` databases alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::info!(
            database_url = %database_url,
            blob_root = %options.blob_root.display(),
            orphan_policy = ?options.orphan_policy,
            "sqlite storage opened"
        );

        Ok(Self {
            pool,
            blobs: BlobStore::new(options.blob_root),
            orphan_policy: options.orphan_policy,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn orphan_policy(&self) -> OrphanPolicy {
        self.orphan_policy
    }
}

impl ConversationStore for SqliteStorage {
    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let title = if input.title.trim().is_empty() {
                DEFAULT_CONVERSATION_TITLE.to_string()
            } else {
                input.title.trim().to_string()
            };
            let conversation_id = ConversationId::new_v7();
            let now = unix_timestamp_millis();

            sqlx::query(
                "INSERT INTO conversations (id, title, created_at, updated_at) VALUES (?, ?, ?, ?)",
            )
            .bind(conversation_id.to_string())
            .bind(title.clone())
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-create-insert",
            })?;

            Ok(ConversationRecord {
                id: conversation_id,
                title,
                created_at_unix_ms: i64_to_u64(now, "conversation-create-created-at")?,
                updated_at_unix_ms: i64_to_u64(now, "conversation-create-updated-at")?,
            })
        })
    }

    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, ConversationRow>(
                "SELECT id, title, created_at, updated_at FROM conversations WHERE id = ?",
            )
            .bind(conversation_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-get-query",
            })?;

            row.map(conversation_row_to_record).transpose()
        })
    }

    fn list_conversations(&self) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, ConversationRow>(
                "SELECT id, title, created_at, updated_at FROM conversations ORDER BY updated_at DESC, id DESC",
            )
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-list-query",
            })?;

            rows.into_iter().map(conversation_row_to_record).collect()
        })
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    title: String,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
pub(crate) struct MessageRow {
    id: String,
    conversation_id: String,
    parent_id: Option<String>,
    children_ids: String,
    role: String,
    content: String,
    reasoning: Option<String>,
    model_name: Option<String>,
    partial: bool,
    created_at: i64,
    updated_at: i64,
}

/// A message row whose children cache may have failed to decode.
pub(crate) struct DecodedMessage {
    pub(crate) record: MessageRecord,
    pub(crate) children_cache_valid: bool,
}

fn conversation_row_to_record(row: ConversationRow) -> StorageResult<ConversationRecord> {
    Ok(ConversationRecord {
        id: ConversationId::parse(&row.id)?,
        title: row.title,
        created_at_unix_ms: i64_to_u64(row.created_at, "conversation-row-created-at")?,
        updated_at_unix_ms: i64_to_u64(row.updated_at, "conversation-row-updated-at")?,
    })
}

pub(crate) fn message_row_to_record(row: MessageRow) -> StorageResult<DecodedMessage> {
    let decoded_children = decode_children(&row.children_ids);
    let children_cache_valid = decoded_children.is_some();

    Ok(DecodedMessage {
        record: MessageRecord {
            id: MessageId::parse(&row.id)?,
            conversation_id: ConversationId::parse(&row.conversation_id)?,
            parent_id: row.parent_id.as_deref().map(MessageId::parse).transpose()?,
            children_ids: decoded_children.unwrap_or_default(),
            role: role_from_sql(&row.role)?,
            content: row.content,
            reasoning: row.reasoning,
            model_name: row.model_name,
            partial: row.partial,
            created_at_unix_ms: i64_to_u64(row.created_at, "message-row-created-at")?,
            updated_at_unix_ms: i64_to_u64(row.updated_at, "message-row-updated-at")?,
        },
        children_cache_valid,
    })
}

/// Parses the JSON children cache. Unparseable text, invalid ids and duplicates all
/// count as a malformed cache.
pub(crate) fn decode_children(raw: &str) -> Option<Vec<MessageId>> {
    let raw_ids: Vec<String> = serde_json::from_str(raw).ok()?;
    let mut seen = HashSet::with_capacity(raw_ids.len());
    let mut ids = Vec::with_capacity(raw_ids.len());

    for raw_id in raw_ids {
        let id = MessageId::parse(&raw_id).ok()?;
        if !seen.insert(id) {
            return None;
        }
        ids.push(id);
    }

    Some(ids)
}

pub(crate) fn encode_children(
    message_id: MessageId,
    children: &[MessageId],
) -> StorageResult<String> {
    serde_json::to_string(children).context(ChildrenCacheEncodeSnafu {
        stage: "encode-children-cache",
        message_id: message_id.to_string(),
    })
}

/// Rebuilds every node's children from parent pointers, ordered by creation time.
pub(crate) fn children_from_parent_pointers(
    messages: &[MessageRecord],
) -> HashMap<MessageId, Vec<MessageId>> {
    let mut ordered = messages.iter().collect::<Vec<_>>();
    ordered.sort_by_key(|message| (message.created_at_unix_ms, message.id));

    let mut children: HashMap<MessageId, Vec<MessageId>> = HashMap::new();
    for message in ordered {
        if let Some(parent_id) = message.parent_id {
            children.entry(parent_id).or_default().push(message.id);
        }
    }
    children
}

pub(crate) async fn scan_children(
    connection: &mut SqliteConnection,
    message_id: MessageId,
    stage: &'static str,
) -> StorageResult<Vec<MessageId>> {
    let raw_ids = sqlx::query_scalar::<_, String>(
        "SELECT id FROM messages WHERE parent_id = ? ORDER BY created_at ASC, id ASC",
    )
    .bind(message_id.to_string())
    .fetch_all(&mut *connection)
    .await
    .context(SqliteQuerySnafu { stage })?;

    raw_ids.iter().map(|raw| MessageId::parse(raw)).collect()
}

pub(crate) async fn ensure_conversation_exists(
    connection: &mut SqliteConnection,
    conversation_id: ConversationId,
    stage: &'static str,
) -> StorageResult<()> {
    let existing = sqlx::query_scalar::<_, i64>("SELECT 1 FROM conversations WHERE id = ? LIMIT 1")
        .bind(conversation_id.to_string())
        .fetch_optional(&mut *connection)
        .await
        .context(SqliteQuerySnafu { stage })?;

    existing.context(NotFoundSnafu {
        stage,
        entity: "conversation",
        id: conversation_id.to_string(),
    })?;

    Ok(())
}

pub(crate) async fn ensure_message_exists(
    connection: &mut SqliteConnection,
    message_id: MessageId,
    stage: &'static str,
) -> StorageResult<()> {
    let existing = sqlx::query_scalar::<_, i64>("SELECT 1 FROM messages WHERE id = ? LIMIT 1")
        .bind(message_id.to_string())
        .fetch_optional(&mut *connection)
        .await
        .context(SqliteQuerySnafu { stage })?;

    existing.context(NotFoundSnafu {
        stage,
        entity: "message",
        id: message_id.to_string(),
    })?;

    Ok(())
}

pub(crate) async fn touch_conversation(
    connection: &mut SqliteConnection,
    conversation_id: ConversationId,
    now: i64,
    stage: &'static str,
) -> StorageResult<()> {
    sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(conversation_id.to_string())
        .execute(&mut *connection)
        .await
        .context(SqliteQuerySnafu { stage })?;
    Ok(())
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    match raw {
        "system" => Ok(MessageRole::System),
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        _ => InvariantViolationSnafu {
            stage: "message-role-from-sql",
            details: format!("unknown message role '{raw}'"),
        }
        .fail(),
    }
}

pub(crate) fn unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_millis() as i64)
}

pub(crate) fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

pub(crate) fn i64_to_u32(value: i64, stage: &'static str) -> StorageResult<u32> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("sqlite integer '{value}' cannot map to u32"),
        })
}

pub(crate) fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("u64 '{value}' cannot map to sqlite i64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
