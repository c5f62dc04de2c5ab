use std::collections::HashSet;
use std::path::Path;

use clap::{Parser, ValueEnum};
use snafu::{OptionExt, ResultExt, Snafu};
use sqlx::{Connection, SqliteConnection};

use parley_storage::{
    Attachment, MessageStore, NewMessage, NewSession, SessionId, SessionStore, SqliteStorage,
    StorageError,
};

/// Exercises the sqlite history store against a scratch database file.
#[derive(Debug, Clone, Parser)]
#[command(name = "storage_qa_runner")]
struct RunnerArgs {
    #[arg(long, value_enum)]
    scenario: Scenario,
    /// Scratch database path; required by every scenario except `id_roundtrip`
    #[arg(long = "db")]
    db_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "snake_case")]
enum Scenario {
    IdRoundtrip,
    SchemaInit,
    FkViolation,
    DuplicateName,
    AttachmentRoundtrip,
    UnknownSession,
    HistoryOrder,
    DeleteAll,
    All,
}

impl Scenario {
    fn name(&self) -> &'static str {
        match self {
            Self::IdRoundtrip => "id_roundtrip",
            Self::SchemaInit => "schema_init",
            Self::FkViolation => "fk_violation",
            Self::DuplicateName => "duplicate_name",
            Self::AttachmentRoundtrip => "attachment_roundtrip",
            Self::UnknownSession => "unknown_session",
            Self::HistoryOrder => "history_order",
            Self::DeleteAll => "delete_all",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("storage validation failed: {source}"))]
    StorageValidation {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("missing required --db argument for scenario '{scenario}'"))]
    MissingDbPath {
        stage: &'static str,
        scenario: &'static str,
    },
    #[snafu(display("sqlite query failed: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
    #[snafu(display("file operation failed at '{path}': {source}"))]
    FileIo {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = RunnerArgs::parse();
    println!("scenario={}", args.scenario.name());
    if let Some(db_path) = args.db_path.as_deref() {
        println!("db_path={db_path}");
    }

    match args.scenario {
        Scenario::IdRoundtrip => run_id_roundtrip(),
        Scenario::SchemaInit => run_schema_init(require_db_path(&args, "schema_init")?).await,
        Scenario::FkViolation => run_fk_violation(require_db_path(&args, "fk_violation")?).await,
        Scenario::DuplicateName => {
            run_duplicate_name(require_db_path(&args, "duplicate_name")?).await
        }
        Scenario::AttachmentRoundtrip => {
            run_attachment_roundtrip(require_db_path(&args, "attachment_roundtrip")?).await
        }
        Scenario::UnknownSession => {
            run_unknown_session(require_db_path(&args, "unknown_session")?).await
        }
        Scenario::HistoryOrder => run_history_order(require_db_path(&args, "history_order")?).await,
        Scenario::DeleteAll => run_delete_all(require_db_path(&args, "delete_all")?).await,
        Scenario::All => run_all(args.db_path.as_deref()).await,
    }
}

fn run_id_roundtrip() -> RunnerResult<()> {
    let id = SessionId::new(42);
    let reparsed = SessionId::parse(&id.to_string()).context(StorageValidationSnafu {
        stage: "scenario-id-roundtrip-parse",
    })?;
    let invalid_rejected = SessionId::parse("not-a-row-id").is_err();

    println!("id_roundtrip={}", reparsed == id);
    println!("invalid_id_error={invalid_rejected}");
    if reparsed != id || !invalid_rejected {
        return ScenarioFailedSnafu {
            stage: "scenario-id-roundtrip-assert",
            scenario: "id_roundtrip",
            reason: "session id wrapper did not round-trip through text".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_all(db_path: Option<&str>) -> RunnerResult<()> {
    run_id_roundtrip()?;

    if let Some(path) = db_path {
        run_schema_init(path).await?;
        run_fk_violation(path).await?;
        run_duplicate_name(path).await?;
        run_attachment_roundtrip(path).await?;
        run_unknown_session(path).await?;
        run_history_order(path).await?;
        run_delete_all(path).await?;
    }

    println!("all_passed=true");
    Ok(())
}

async fn open_fresh(db_path: &str, stage: &'static str) -> RunnerResult<SqliteStorage> {
    reset_sqlite_files(db_path)?;
    SqliteStorage::open(db_path)
        .await
        .context(StorageValidationSnafu { stage })
}

async fn run_schema_init(db_path: &str) -> RunnerResult<()> {
    let storage = open_fresh(db_path, "scenario-schema-init-open").await?;
    let mut connection = SqliteConnection::connect(storage.database_url())
        .await
        .context(SqliteQuerySnafu {
            stage: "scenario-schema-init-connect",
        })?;

    let discovered_tables = sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('sessions', 'messages')",
    )
    .fetch_all(&mut connection)
    .await
    .context(SqliteQuerySnafu {
        stage: "scenario-schema-init-list-tables",
    })?;
    let available_tables: HashSet<String> = discovered_tables.into_iter().collect();
    let schema_ok = ["sessions", "messages"]
        .iter()
        .all(|table_name| available_tables.contains(*table_name));

    let journal_mode = sqlx::query_scalar::<_, String>("PRAGMA journal_mode;")
        .fetch_one(&mut connection)
        .await
        .context(SqliteQuerySnafu {
            stage: "scenario-schema-init-journal-mode",
        })?
        .to_lowercase();

    println!("schema_ok={schema_ok}");
    println!("journal_mode={journal_mode}");

    if !schema_ok {
        return ScenarioFailedSnafu {
            stage: "scenario-schema-init-assert-schema",
            scenario: "schema_init",
            reason: "expected migration tables are missing".to_string(),
        }
        .fail();
    }

    if journal_mode != "wal" {
        return ScenarioFailedSnafu {
            stage: "scenario-schema-init-assert-journal-mode",
            scenario: "schema_init",
            reason: format!("expected journal_mode=wal but was {journal_mode}"),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_fk_violation(db_path: &str) -> RunnerResult<()> {
    let storage = open_fresh(db_path, "scenario-fk-violation-open").await?;
    let mut connection = SqliteConnection::connect(storage.database_url())
        .await
        .context(SqliteQuerySnafu {
            stage: "scenario-fk-violation-connect",
        })?;
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(&mut connection)
        .await
        .context(SqliteQuerySnafu {
            stage: "scenario-fk-violation-pragma",
        })?;

    let insert_result = sqlx::query(
        "INSERT INTO messages (session_id, role, name, content, files, timestamp) VALUES (?, ?, ?, ?, NULL, ?)",
    )
    .bind(9_999_i64)
    .bind("user")
    .bind("User")
    .bind("orphan-row")
    .bind("2025-01-01T00:00:00+00:00")
    .execute(&mut connection)
    .await;

    let fk_violation_blocked = match insert_result {
        Ok(_) => false,
        Err(error) if is_foreign_key_violation(&error) => true,
        Err(error) => {
            return ScenarioFailedSnafu {
                stage: "scenario-fk-violation-insert",
                scenario: "fk_violation",
                reason: format!("unexpected sqlite error while testing FK guard: {error}"),
            }
            .fail();
        }
    };

    println!("fk_violation_blocked={fk_violation_blocked}");
    if !fk_violation_blocked {
        return ScenarioFailedSnafu {
            stage: "scenario-fk-violation-assert",
            scenario: "fk_violation",
            reason: "orphan message row was accepted".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_duplicate_name(db_path: &str) -> RunnerResult<()> {
    let storage = open_fresh(db_path, "scenario-duplicate-name-open").await?;
    storage
        .create_session(NewSession::new("Foo"))
        .context(StorageValidationSnafu {
            stage: "scenario-duplicate-name-first",
        })?;

    let duplicate_rejected = matches!(
        storage.create_session(NewSession::new("Foo")),
        Err(StorageError::DuplicateName { .. })
    );
    let listed = storage.list_sessions().context(StorageValidationSnafu {
        stage: "scenario-duplicate-name-list",
    })?;
    let foo_count = listed.iter().filter(|session| session.name == "Foo").count();

    println!("duplicate_rejected={duplicate_rejected}");
    println!("foo_count={foo_count}");
    if !duplicate_rejected || foo_count != 1 {
        return ScenarioFailedSnafu {
            stage: "scenario-duplicate-name-assert",
            scenario: "duplicate_name",
            reason: format!("duplicate_rejected={duplicate_rejected}, foo_count={foo_count}"),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_attachment_roundtrip(db_path: &str) -> RunnerResult<()> {
    let storage = open_fresh(db_path, "scenario-attachment-roundtrip-open").await?;
    let session = storage
        .create_session(NewSession::new("attachments"))
        .context(StorageValidationSnafu {
            stage: "scenario-attachment-roundtrip-session",
        })?;

    let payload = (0..4_096_u32)
        .map(|index| (index.wrapping_mul(31) % 256) as u8)
        .collect::<Vec<_>>();
    let original = Attachment::from_upload("fixture.pdf", None, payload);
    storage
        .append_message(
            session.id,
            NewMessage::user("see attached").with_files(vec![original.clone()]),
        )
        .context(StorageValidationSnafu {
            stage: "scenario-attachment-roundtrip-append",
        })?;

    let history = storage
        .fetch_history(session.id)
        .context(StorageValidationSnafu {
            stage: "scenario-attachment-roundtrip-fetch",
        })?;
    let restored = history.first().and_then(|message| message.files.first());
    let identical = restored == Some(&original);

    println!("attachment_identical={identical}");
    if !identical {
        return ScenarioFailedSnafu {
            stage: "scenario-attachment-roundtrip-assert",
            scenario: "attachment_roundtrip",
            reason: format!("restored attachment differs: {restored:?}"),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_unknown_session(db_path: &str) -> RunnerResult<()> {
    let storage = open_fresh(db_path, "scenario-unknown-session-open").await?;
    let missing = SessionId::new(12_345);

    let rejected = matches!(
        storage.append_message(missing, NewMessage::user("orphan")),
        Err(StorageError::UnknownSession { .. })
    );
    let leftover = storage
        .fetch_history(missing)
        .context(StorageValidationSnafu {
            stage: "scenario-unknown-session-fetch",
        })?
        .len();

    println!("unknown_session_rejected={rejected}");
    println!("leftover_rows={leftover}");
    if !rejected || leftover != 0 {
        return ScenarioFailedSnafu {
            stage: "scenario-unknown-session-assert",
            scenario: "unknown_session",
            reason: format!("rejected={rejected}, leftover_rows={leftover}"),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_history_order(db_path: &str) -> RunnerResult<()> {
    let storage = open_fresh(db_path, "scenario-history-order-open").await?;
    let session = storage
        .create_session(NewSession::new("ordering"))
        .context(StorageValidationSnafu {
            stage: "scenario-history-order-session",
        })?;

    // Timestamps deliberately run backwards.
    let stamps = [
        "2030-01-01T00:00:00+00:00",
        "2020-01-01T00:00:00+00:00",
        "2020-01-01T00:00:00+00:00",
    ];
    for (index, raw) in stamps.iter().enumerate() {
        let timestamp = chrono::DateTime::parse_from_rfc3339(raw).map_err(|error| {
            RunnerError::ScenarioFailed {
                stage: "scenario-history-order-fixture",
                scenario: "history_order",
                reason: error.to_string(),
            }
        })?;
        storage
            .append_message(
                session.id,
                NewMessage::user(format!("m{}", index + 1)).with_timestamp(timestamp),
            )
            .context(StorageValidationSnafu {
                stage: "scenario-history-order-append",
            })?;
    }

    let contents = storage
        .fetch_history(session.id)
        .context(StorageValidationSnafu {
            stage: "scenario-history-order-fetch",
        })?
        .into_iter()
        .map(|message| message.content)
        .collect::<Vec<_>>();
    let ordered = contents == ["m1", "m2", "m3"];

    println!("history_ordered={ordered}");
    if !ordered {
        return ScenarioFailedSnafu {
            stage: "scenario-history-order-assert",
            scenario: "history_order",
            reason: format!("unexpected order {contents:?}"),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_delete_all(db_path: &str) -> RunnerResult<()> {
    let storage = open_fresh(db_path, "scenario-delete-all-open").await?;
    let mut session_ids = Vec::new();
    for name in ["alpha", "beta"] {
        let session = storage
            .create_session(NewSession::new(name))
            .context(StorageValidationSnafu {
                stage: "scenario-delete-all-session",
            })?;
        storage
            .append_message(session.id, NewMessage::user(name))
            .context(StorageValidationSnafu {
                stage: "scenario-delete-all-append",
            })?;
        session_ids.push(session.id);
    }

    storage
        .delete_all_sessions()
        .context(StorageValidationSnafu {
            stage: "scenario-delete-all-apply",
        })?;

    let remaining_sessions = storage
        .list_sessions()
        .context(StorageValidationSnafu {
            stage: "scenario-delete-all-list",
        })?
        .len();
    let mut remaining_messages = 0;
    for session_id in session_ids {
        remaining_messages += storage
            .fetch_history(session_id)
            .context(StorageValidationSnafu {
                stage: "scenario-delete-all-fetch",
            })?
            .len();
    }

    println!("remaining_sessions={remaining_sessions}");
    println!("remaining_messages={remaining_messages}");
    if remaining_sessions != 0 || remaining_messages != 0 {
        return ScenarioFailedSnafu {
            stage: "scenario-delete-all-assert",
            scenario: "delete_all",
            reason: "rows survived delete_all_sessions".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

fn reset_sqlite_files(db_path: &str) -> RunnerResult<()> {
    for suffix in ["", "-wal", "-shm"] {
        let candidate = format!("{db_path}{suffix}");
        remove_file_if_exists(Path::new(&candidate), "reset-sqlite-files")?;
    }
    Ok(())
}

fn remove_file_if_exists(path: &Path, stage: &'static str) -> RunnerResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(RunnerError::FileIo {
            stage,
            path: path.display().to_string(),
            source,
        }),
    }
}

fn require_db_path<'a>(args: &'a RunnerArgs, scenario: &'static str) -> RunnerResult<&'a str> {
    args.db_path.as_deref().context(MissingDbPathSnafu {
        stage: "require-db-path",
        scenario,
    })
}

fn is_foreign_key_violation(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .is_some_and(|database_error| database_error.is_foreign_key_violation())
}
