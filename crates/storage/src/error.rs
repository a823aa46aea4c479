use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("storage entity '{entity}' with id '{id}' was not found"))]
    NotFound {
        stage: &'static str,
        entity: &'static str,
        id: String,
    },
    #[snafu(display("parent message '{parent_id}' does not exist in conversation '{conversation_id}'"))]
    ParentNotFound {
        stage: &'static str,
        conversation_id: String,
        parent_id: String,
    },
    #[snafu(display("storage id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
    #[snafu(display("message tree invariant violated: {details}"))]
    TreeInvariantViolation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("storage invariant violation: {details}"))]
    InvariantViolation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("attachment mime type '{mime_type}' is not supported"))]
    UnsupportedAttachment {
        stage: &'static str,
        mime_type: String,
    },
    #[snafu(display("bytes for attachment '{attachment_id}' are unavailable: {details}"))]
    AttachmentRead {
        stage: &'static str,
        attachment_id: String,
        details: String,
    },
    #[snafu(display("blob '{hash}' could not be written"))]
    BlobWrite {
        stage: &'static str,
        hash: String,
        source: std::io::Error,
    },
    #[snafu(display("blob store task failed to complete"))]
    BlobTask {
        stage: &'static str,
        source: tokio::task::JoinError,
    },
    #[snafu(display("failed to encode children cache for message '{message_id}'"))]
    ChildrenCacheEncode {
        stage: &'static str,
        message_id: String,
        source: serde_json::Error,
    },
    #[snafu(display("failed to create sqlite directory at {path}"))]
    CreateSqliteDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse sqlite connection URL '{database_url}'"))]
    SqliteConnectOptions {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to connect sqlite database '{database_url}'"))]
    SqliteConnect {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to configure sqlite pragma '{pragma}'"))]
    SqlitePragma {
        stage: &'static str,
        pragma: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("failed to run sqlite migrations"))]
    SqliteMigrate {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("sqlite query failed at {stage}: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
}

impl StorageError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::NotFound { stage, .. }
            | Self::ParentNotFound { stage, .. }
            | Self::InvalidId { stage, .. }
            | Self::TreeInvariantViolation { stage, .. }
            | Self::InvariantViolation { stage, .. }
            | Self::UnsupportedAttachment { stage, .. }
            | Self::AttachmentRead { stage, .. }
            | Self::BlobWrite { stage, .. }
            | Self::BlobTask { stage, .. }
            | Self::ChildrenCacheEncode { stage, .. }
            | Self::CreateSqliteDirectory { stage, .. }
            | Self::SqliteConnectOptions { stage, .. }
            | Self::SqliteConnect { stage, .. }
            | Self::SqlitePragma { stage, .. }
            | Self::SqliteMigrate { stage, .. }
            | Self::SqliteQuery { stage, .. } => *stage,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
