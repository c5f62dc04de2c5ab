use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use snafu::{ResultExt, ensure};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{ConnectOptions, Connection, FromRow, SqliteConnection};

use super::attachment::{decode_attachments, encode_attachments};
use super::error::{
    CreateSqliteDirectorySnafu, DuplicateNameSnafu, EmptySessionNameSnafu,
    InvalidTimestampSnafu, InvariantViolationSnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu,
    SqliteMigrateSnafu, SqlitePragmaSnafu, SqliteQuerySnafu, SqliteRuntimeInitSnafu,
    SqliteThreadSpawnSnafu, StorageError, StorageResult, UnknownSessionSnafu,
};
use super::ids::{MessageId, SessionId};
use super::types::{MessageRecord, MessageRole, NewMessage, NewSession, SessionRecord, local_now};
use super::{MessageStore, SessionStore};

pub const DEFAULT_DATABASE_FILE_NAME: &str = "chat_history.db";

/// History store backed by one sqlite file.
///
/// Only the database URL is kept between calls: every operation opens its own
/// connection, runs one unit of work and drops it, so the file on disk is the
/// single source of truth.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    database_url: String,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure!(
            !is_in_memory_location(database_location),
            InvariantViolationSnafu {
                stage: "sqlite-open-validate-location",
                details: "in-memory databases do not survive per-call connections".to_string(),
            }
        );
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

        let mut connection = connect_options
            .connect()
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::migrate!("./migrations")
            .run_direct(&mut connection)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        connection.close().await.context(SqliteQuerySnafu {
            stage: "sqlite-open-close",
        })?;

        tracing::debug!(database_url = %database_url, "sqlite history store ready");
        Ok(Self { database_url })
    }

    /// Synchronous `open` for callers without a runtime of their own.
    pub fn open_blocking(database_location: &str) -> StorageResult<Self> {
        let database_location = database_location.to_string();
        run_on_worker("sqlite-open", async move {
            Self::open(&database_location).await
        })
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    fn run_db_call<T, F>(&self, stage: &'static str, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: Future<Output = StorageResult<T>> + Send + 'static,
    {
        run_on_worker(stage, op)
    }
}

fn run_on_worker<T, F>(stage: &'static str, op: F) -> StorageResult<T>
where
    T: Send + 'static,
    F: Future<Output = StorageResult<T>> + Send + 'static,
{
    // Store traits are sync, so each call executes on a dedicated worker thread
    // with its own current-thread runtime to avoid nested-runtime blocking panics.
    let worker = std::thread::Builder::new()
        .name(format!("sqlite-store-{stage}"))
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context(SqliteRuntimeInitSnafu {
                    stage: "sqlite-store-runtime-build",
                })?;
            runtime.block_on(op)
        })
        .context(SqliteThreadSpawnSnafu {
            stage: "sqlite-store-spawn-worker",
        })?;

    match worker.join() {
        Ok(result) => result,
        Err(_) => InvariantViolationSnafu {
            stage,
            details: "sqlite storage worker thread panicked".to_string(),
        }
        .fail(),
    }
}

impl SessionStore for SqliteStorage {
    fn create_session(&self, input: NewSession) -> StorageResult<SessionRecord> {
        let name = input.name.trim().to_string();
        ensure!(
            !name.is_empty(),
            EmptySessionNameSnafu {
                stage: "session-create-validate-name",
            }
        );

        let created_at = input.created_at.unwrap_or_else(local_now);
        let database_url = self.database_url.clone();
        self.run_db_call("session-create", async move {
            let mut connection =
                connect_store_connection(&database_url, "session-create-connect").await?;

            // The UNIQUE constraint on `name` is the authority; no read-then-write check.
            let inserted = sqlx::query(
                "INSERT INTO sessions (name, created_at, created_at_unix_ms) VALUES (?, ?, ?)",
            )
            .bind(name.clone())
            .bind(created_at.to_rfc3339())
            .bind(created_at.timestamp_millis())
            .execute(&mut connection)
            .await;

            let inserted = match inserted {
                Ok(inserted) => inserted,
                Err(source) if is_unique_violation(&source) => {
                    tracing::debug!(session_name = %name, "rejected duplicate session name");
                    return DuplicateNameSnafu {
                        stage: "session-create-duplicate",
                        name,
                    }
                    .fail();
                }
                Err(source) => {
                    return Err(StorageError::SqliteQuery {
                        stage: "session-create-insert",
                        source,
                    });
                }
            };

            let session_id = SessionId::new(inserted.last_insert_rowid());
            tracing::info!(session_id = %session_id, session_name = %name, "created session");

            Ok(SessionRecord {
                id: session_id,
                name,
                created_at,
            })
        })
    }

    fn list_sessions(&self) -> StorageResult<Vec<SessionRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("session-list", async move {
            let mut connection =
                connect_store_connection(&database_url, "session-list-connect").await?;
            let rows = sqlx::query_as::<_, SessionRow>(
                "SELECT id, name, created_at FROM sessions ORDER BY created_at_unix_ms DESC, id DESC",
            )
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "session-list-query",
            })?;

            rows.into_iter().map(session_row_to_record).collect()
        })
    }

    fn get_session(&self, session_id: SessionId) -> StorageResult<Option<SessionRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("session-get", async move {
            let mut connection =
                connect_store_connection(&database_url, "session-get-connect").await?;
            let row = sqlx::query_as::<_, SessionRow>(
                "SELECT id, name, created_at FROM sessions WHERE id = ?",
            )
            .bind(session_id.as_i64())
            .fetch_optional(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "session-get-query",
            })?;

            row.map(session_row_to_record).transpose()
        })
    }

    fn find_session_by_name(&self, name: &str) -> StorageResult<Option<SessionRecord>> {
        let name = name.trim().to_string();
        let database_url = self.database_url.clone();
        self.run_db_call("session-find-by-name", async move {
            let mut connection =
                connect_store_connection(&database_url, "session-find-by-name-connect").await?;
            let row = sqlx::query_as::<_, SessionRow>(
                "SELECT id, name, created_at FROM sessions WHERE name = ?",
            )
            .bind(name)
            .fetch_optional(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "session-find-by-name-query",
            })?;

            row.map(session_row_to_record).transpose()
        })
    }

    fn delete_all_sessions(&self) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        self.run_db_call("session-delete-all", async move {
            let mut connection =
                connect_store_connection(&database_url, "session-delete-all-connect").await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "session-delete-all-begin",
            })?;

            let deleted_messages = sqlx::query("DELETE FROM messages")
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "session-delete-all-messages",
                })?
                .rows_affected();
            let deleted_sessions = sqlx::query("DELETE FROM sessions")
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "session-delete-all-sessions",
                })?
                .rows_affected();

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "session-delete-all-commit",
            })?;

            tracing::info!(deleted_sessions, deleted_messages, "deleted all sessions");
            Ok(())
        })
    }
}

impl MessageStore for SqliteStorage {
    fn append_message(
        &self,
        session_id: SessionId,
        input: NewMessage,
    ) -> StorageResult<MessageRecord> {
        // Encode before touching the database so a bad payload never leaves a row behind.
        let message = PreparedMessage::new(input)?;
        let database_url = self.database_url.clone();
        self.run_db_call("message-append", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-append-connect").await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "message-append-begin",
            })?;

            ensure_session_exists(&mut tx, session_id).await?;
            let record = insert_message(&mut tx, session_id, message).await?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-append-commit",
            })?;
            Ok(record)
        })
    }

    fn append_exchange(
        &self,
        session_id: SessionId,
        user: NewMessage,
        assistant: NewMessage,
    ) -> StorageResult<(MessageRecord, MessageRecord)> {
        let user = PreparedMessage::new(user)?;
        let assistant = PreparedMessage::new(assistant)?;
        let database_url = self.database_url.clone();
        self.run_db_call("message-append-exchange", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-append-exchange-connect")
                    .await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "message-append-exchange-begin",
            })?;

            ensure_session_exists(&mut tx, session_id).await?;
            let user = insert_message(&mut tx, session_id, user).await?;
            let assistant = insert_message(&mut tx, session_id, assistant).await?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-append-exchange-commit",
            })?;
            Ok((user, assistant))
        })
    }

    fn fetch_history(&self, session_id: SessionId) -> StorageResult<Vec<MessageRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-fetch-history", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-fetch-history-connect").await?;
            // Row id, not timestamp: client clocks are not trusted to be monotonic.
            let rows = sqlx::query_as::<_, MessageRow>(
                "SELECT id, session_id, role, name, content, files, timestamp FROM messages WHERE session_id = ? ORDER BY id ASC",
            )
            .bind(session_id.as_i64())
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-fetch-history-query",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }
}

#[derive(Debug, FromRow)]
struct SessionRow {
    id: i64,
    name: String,
    created_at: String,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: i64,
    session_id: i64,
    role: String,
    name: String,
    content: String,
    files: Option<String>,
    timestamp: String,
}

fn session_row_to_record(row: SessionRow) -> StorageResult<SessionRecord> {
    Ok(SessionRecord {
        id: SessionId::new(row.id),
        name: row.name,
        created_at: parse_timestamp(&row.created_at, "session-row-created-at")?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::new(row.id),
        session_id: SessionId::new(row.session_id),
        role: role_from_sql(&row.role)?,
        name: row.name,
        content: row.content,
        files: decode_attachments(row.files.as_deref())?,
        timestamp: parse_timestamp(&row.timestamp, "message-row-timestamp")?,
    })
}

async fn connect_store_connection(
    database_url: &str,
    stage: &'static str,
) -> StorageResult<SqliteConnection> {
    let mut connection =
        SqliteConnection::connect(database_url)
            .await
            .context(SqliteConnectSnafu {
                stage,
                database_url: database_url.to_string(),
            })?;

    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-foreign-keys",
            pragma: "foreign_keys",
        })?;
    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-busy-timeout",
            pragma: "busy_timeout",
        })?;

    Ok(connection)
}

/// A message whose attachments are already encoded for the `files` column.
struct PreparedMessage {
    input: NewMessage,
    files_json: Option<String>,
    timestamp: DateTime<FixedOffset>,
}

impl PreparedMessage {
    fn new(input: NewMessage) -> StorageResult<Self> {
        Ok(Self {
            files_json: encode_attachments(&input.files)?,
            timestamp: input.timestamp.unwrap_or_else(local_now),
            input,
        })
    }
}

async fn ensure_session_exists(
    connection: &mut SqliteConnection,
    session_id: SessionId,
) -> StorageResult<()> {
    let exists = sqlx::query_scalar::<_, i64>("SELECT 1 FROM sessions WHERE id = ? LIMIT 1")
        .bind(session_id.as_i64())
        .fetch_optional(&mut *connection)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-append-session-exists",
        })?
        .is_some();
    ensure!(
        exists,
        UnknownSessionSnafu {
            stage: "message-append-missing-session",
            id: session_id.to_string(),
        }
    );
    Ok(())
}

async fn insert_message(
    connection: &mut SqliteConnection,
    session_id: SessionId,
    message: PreparedMessage,
) -> StorageResult<MessageRecord> {
    let PreparedMessage {
        input,
        files_json,
        timestamp,
    } = message;

    let inserted = sqlx::query(
        "INSERT INTO messages (session_id, role, name, content, files, timestamp) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(session_id.as_i64())
    .bind(input.role.as_str())
    .bind(input.name.clone())
    .bind(input.content.clone())
    .bind(files_json)
    .bind(timestamp.to_rfc3339())
    .execute(&mut *connection)
    .await;

    let inserted = match inserted {
        Ok(inserted) => inserted,
        // The foreign key backs up the existence check.
        Err(source) if is_foreign_key_violation(&source) => {
            return UnknownSessionSnafu {
                stage: "message-append-foreign-key",
                id: session_id.to_string(),
            }
            .fail();
        }
        Err(source) => {
            return Err(StorageError::SqliteQuery {
                stage: "message-append-insert",
                source,
            });
        }
    };

    let message_id = MessageId::new(inserted.last_insert_rowid());
    tracing::debug!(
        session_id = %session_id,
        message_id = %message_id,
        role = input.role.as_str(),
        attachment_count = input.files.len(),
        "appended message"
    );

    Ok(MessageRecord {
        id: message_id,
        session_id,
        role: input.role,
        name: input.name,
        content: input.content,
        files: input.files,
        timestamp,
    })
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .is_some_and(|database_error| database_error.is_unique_violation())
}

fn is_foreign_key_violation(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .is_some_and(|database_error| database_error.is_foreign_key_violation())
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    match raw {
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        _ => InvariantViolationSnafu {
            stage: "message-role-from-sql",
            details: format!("unknown message role '{raw}'"),
        }
        .fail(),
    }
}

fn parse_timestamp(raw: &str, stage: &'static str) -> StorageResult<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(raw).context(InvalidTimestampSnafu {
        stage,
        raw: raw.to_string(),
    })
}

fn is_in_memory_location(database_location: &str) -> bool {
    database_location == ":memory:" || database_location.contains(":memory:")
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") {
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

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tempfile::TempDir;

    use super::*;
    use crate::Attachment;

    fn open_temp() -> (TempDir, SqliteStorage) {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("nested").join(DEFAULT_DATABASE_FILE_NAME);
        let storage = SqliteStorage::open_blocking(path.to_str().unwrap()).unwrap();
        (directory, storage)
    }

    fn at(hour: u32, minute: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(7 * 3600)
            .unwrap()
            .with_ymd_and_hms(2025, 3, 14, hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn duplicate_session_name_is_rejected_by_constraint() {
        let (_directory, storage) = open_temp();
        storage
            .create_session(NewSession::new("Foo").created_at(at(9, 0)))
            .unwrap();

        let error = storage
            .create_session(NewSession::new("Foo").created_at(at(10, 0)))
            .unwrap_err();
        assert!(matches!(error, StorageError::DuplicateName { ref name, .. } if name == "Foo"));
        assert!(error.is_validation());

        let sessions = storage.list_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].name, "Foo");
    }

    #[test]
    fn blank_session_name_is_rejected() {
        let (_directory, storage) = open_temp();
        let error = storage.create_session(NewSession::new("   ")).unwrap_err();
        assert!(matches!(error, StorageError::EmptySessionName { .. }));
    }

    #[test]
    fn sessions_list_newest_first_by_instant() {
        let (_directory, storage) = open_temp();
        let utc = FixedOffset::east_opt(0).unwrap();
        // 08:00+07:00 is 01:00Z, earlier than 02:00Z even though its string sorts later.
        let early = storage
            .create_session(NewSession::new("early").created_at(at(8, 0)))
            .unwrap();
        let late = storage
            .create_session(
                NewSession::new("late")
                    .created_at(utc.with_ymd_and_hms(2025, 3, 14, 2, 0, 0).unwrap()),
            )
            .unwrap();

        let names = storage
            .list_sessions()
            .unwrap()
            .into_iter()
            .map(|session| (session.id, session.name))
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![(late.id, "late".to_string()), (early.id, "early".to_string())]
        );
    }

    #[test]
    fn empty_store_lists_nothing() {
        let (_directory, storage) = open_temp();
        assert!(storage.list_sessions().unwrap().is_empty());
        assert!(storage.fetch_history(SessionId::new(1)).unwrap().is_empty());
    }

    #[test]
    fn attachments_round_trip_byte_for_byte() {
        let (_directory, storage) = open_temp();
        let session = storage.create_session(NewSession::new("files")).unwrap();
        let every_byte = (0..=255_u8).rev().collect::<Vec<_>>();
        let files = vec![
            Attachment::from_upload("bytes.png", None, every_byte.clone()),
            Attachment::from_upload("empty.pdf", Some("application/pdf"), Vec::new()),
        ];

        storage
            .append_message(
                session.id,
                NewMessage::user("").with_files(files.clone()),
            )
            .unwrap();

        let history = storage.fetch_history(session.id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "");
        assert_eq!(history[0].files, files);
        assert_eq!(history[0].files[0].data, every_byte);
        assert_eq!(history[0].files[0].mime_type, "image/png");
        assert_eq!(history[0].files[1].name, "empty.pdf");
    }

    #[test]
    fn append_to_unknown_session_leaves_no_row() {
        let (_directory, storage) = open_temp();
        let missing = SessionId::new(404);

        let error = storage
            .append_message(missing, NewMessage::user("hello"))
            .unwrap_err();
        assert!(matches!(error, StorageError::UnknownSession { ref id, .. } if id == "404"));
        assert!(storage.fetch_history(missing).unwrap().is_empty());
    }

    #[test]
    fn exchange_stores_both_turns_in_order() {
        let (_directory, storage) = open_temp();
        let session = storage.create_session(NewSession::new("pair")).unwrap();

        let (user, assistant) = storage
            .append_exchange(
                session.id,
                NewMessage::user("question").with_timestamp(at(10, 0)),
                NewMessage::assistant("answer").with_timestamp(at(10, 0)),
            )
            .unwrap();
        assert!(user.id < assistant.id);

        let history = storage.fetch_history(session.id).unwrap();
        assert_eq!(history, vec![user, assistant]);
    }

    #[test]
    fn exchange_for_unknown_session_leaves_no_rows() {
        let (_directory, storage) = open_temp();
        let missing = SessionId::new(404);

        let error = storage
            .append_exchange(missing, NewMessage::user("q"), NewMessage::assistant("a"))
            .unwrap_err();
        assert!(matches!(error, StorageError::UnknownSession { .. }));
        assert!(storage.fetch_history(missing).unwrap().is_empty());
    }

    #[test]
    fn failed_assistant_insert_rolls_back_user_turn() {
        let (_directory, storage) = open_temp();
        let session = storage.create_session(NewSession::new("atomic")).unwrap();
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(async {
                let mut connection = SqliteConnection::connect(storage.database_url())
                    .await
                    .unwrap();
                sqlx::query(
                    "CREATE TRIGGER reject_assistant BEFORE INSERT ON messages \
                     WHEN NEW.role = 'assistant' BEGIN SELECT RAISE(ABORT, 'rejected'); END",
                )
                .execute(&mut connection)
                .await
                .unwrap();
            });

        let error = storage
            .append_exchange(session.id, NewMessage::user("q"), NewMessage::assistant("a"))
            .unwrap_err();
        assert!(matches!(error, StorageError::SqliteQuery { .. }));
        assert!(storage.fetch_history(session.id).unwrap().is_empty());
    }

    #[test]
    fn history_keeps_insertion_order_despite_timestamps() {
        let (_directory, storage) = open_temp();
        let session = storage.create_session(NewSession::new("order")).unwrap();

        for (content, timestamp) in [("m1", at(12, 0)), ("m2", at(11, 0)), ("m3", at(11, 0))] {
            storage
                .append_message(
                    session.id,
                    NewMessage::assistant(content).with_timestamp(timestamp),
                )
                .unwrap();
        }

        let history = storage.fetch_history(session.id).unwrap();
        let contents = history
            .iter()
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>();
        assert_eq!(contents, vec!["m1", "m2", "m3"]);
        assert!(history.windows(2).all(|pair| pair[0].id < pair[1].id));
        assert_eq!(history[0].timestamp, at(12, 0));
        assert_eq!(history[0].name, "AI Assistant");
        assert_eq!(history[0].role, MessageRole::Assistant);
    }

    #[test]
    fn histories_are_scoped_to_their_session() {
        let (_directory, storage) = open_temp();
        let first = storage.create_session(NewSession::new("first")).unwrap();
        let second = storage.create_session(NewSession::new("second")).unwrap();

        storage
            .append_message(first.id, NewMessage::user("one"))
            .unwrap();
        storage
            .append_message(second.id, NewMessage::user("two"))
            .unwrap();

        let history = storage.fetch_history(second.id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "two");
        assert_eq!(history[0].session_id, second.id);
    }

    #[test]
    fn delete_all_clears_sessions_and_messages() {
        let (_directory, storage) = open_temp();
        let session = storage.create_session(NewSession::new("doomed")).unwrap();
        storage
            .append_message(session.id, NewMessage::user("bye"))
            .unwrap();

        storage.delete_all_sessions().unwrap();

        assert!(storage.list_sessions().unwrap().is_empty());
        assert!(storage.fetch_history(session.id).unwrap().is_empty());
        assert!(storage.get_session(session.id).unwrap().is_none());

        // Ids are never reused after a wipe.
        let fresh = storage.create_session(NewSession::new("doomed")).unwrap();
        assert!(fresh.id > session.id);
    }

    #[test]
    fn state_survives_reopening_the_file() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join(DEFAULT_DATABASE_FILE_NAME);
        let location = path.to_str().unwrap();

        let session = {
            let storage = SqliteStorage::open_blocking(location).unwrap();
            let session = storage.create_session(NewSession::new("kept")).unwrap();
            storage
                .append_message(
                    session.id,
                    NewMessage::user("persisted").with_files(vec![Attachment::from_upload(
                        "photo.jpg",
                        None,
                        vec![0xff, 0xd8, 0xff],
                    )]),
                )
                .unwrap();
            session
        };

        let reopened = SqliteStorage::open_blocking(location).unwrap();
        let found = reopened.find_session_by_name(" kept ").unwrap().unwrap();
        assert_eq!(found.id, session.id);
        assert_eq!(found.created_at, session.created_at);

        let history = reopened.fetch_history(session.id).unwrap();
        assert_eq!(history[0].files[0].data, vec![0xff, 0xd8, 0xff]);
        assert_eq!(history[0].files[0].mime_type, "image/jpeg");
    }

    #[test]
    fn in_memory_location_is_refused() {
        let error = SqliteStorage::open_blocking(":memory:").unwrap_err();
        assert!(matches!(error, StorageError::InvariantViolation { .. }));
    }
}
