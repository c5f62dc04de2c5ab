use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("a session named '{name}' already exists"))]
    DuplicateName { stage: &'static str, name: String },
    #[snafu(display("session name must not be blank"))]
    EmptySessionName { stage: &'static str },
    #[snafu(display("session '{id}' does not exist"))]
    UnknownSession { stage: &'static str, id: String },
    #[snafu(display("storage id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: std::num::ParseIntError,
    },
    #[snafu(display("storage invariant violation: {details}"))]
    InvariantViolation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("failed to encode attachments for storage"))]
    EncodeAttachments {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to decode stored attachment list"))]
    DecodeAttachments {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("stored attachment '{name}' has invalid base64 data"))]
    DecodeAttachmentData {
        stage: &'static str,
        name: String,
        source: base64::DecodeError,
    },
    #[snafu(display("stored timestamp '{raw}' is not valid ISO-8601"))]
    InvalidTimestamp {
        stage: &'static str,
        raw: String,
        source: chrono::ParseError,
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
    #[snafu(display("failed to spawn sqlite worker thread"))]
    SqliteThreadSpawn {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to initialize sqlite worker runtime"))]
    SqliteRuntimeInit {
        stage: &'static str,
        source: std::io::Error,
    },
}

impl StorageError {
    /// True for validation failures the caller is expected to show to the user.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::DuplicateName { .. } | Self::UnknownSession { .. } | Self::EmptySessionName { .. }
        )
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
