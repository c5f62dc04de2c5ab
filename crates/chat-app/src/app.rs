use std::path::{Path, PathBuf};
use std::sync::Arc;

use parley_llm::{
    ChatProvider, ChatRequest, EventSink, FrameIssue, StreamedTurn, TurnOutcome, create_provider,
};
use parley_storage::{
    Attachment, MessageRecord, MessageStore, NewMessage, NewSession, SessionRecord, SessionStore,
    SqliteStorage, Storage, local_now,
};
use snafu::{OptionExt, ResultExt, ensure};

use super::error::{
    AppResult, EmptyInputSnafu, NoActiveSessionSnafu, ProviderSnafu, ProviderUnavailableSnafu,
    ReadAttachmentSnafu, SaveAttachmentSnafu, SessionNotFoundSnafu, StorageSnafu,
    UnsupportedFileTypeSnafu,
};
use super::settings::ChatSettings;

/// A file picked by the user, not yet validated or stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub name: String,
    pub mime_type: Option<String>,
    pub data: Vec<u8>,
}

impl Upload {
    pub fn new(name: impl Into<String>, mime_type: Option<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type,
            data,
        }
    }

    pub fn from_path(path: &Path) -> AppResult<Self> {
        let data = std::fs::read(path).context(ReadAttachmentSnafu {
            stage: "upload-read-file",
            path: path.to_path_buf(),
        })?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Ok(Self::new(name, None, data))
    }

    fn extension(&self) -> Option<String> {
        Path::new(&self.name)
            .extension()
            .and_then(|extension| extension.to_str())
            .map(str::to_ascii_lowercase)
    }
}

/// Both persisted halves of a completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReport {
    pub user: MessageRecord,
    pub assistant: MessageRecord,
    pub outcome: TurnOutcome,
    /// Frame problems reported while streaming, in arrival order.
    pub issues: Vec<FrameIssue>,
    pub saw_done: bool,
}

/// State of one chat front end: the store, the provider, the selected
/// session and its displayed transcript.
pub struct ChatApp {
    storage: Arc<dyn Storage>,
    provider: Option<Arc<dyn ChatProvider>>,
    accepted_file_types: Vec<String>,
    active_session: Option<SessionRecord>,
    transcript: Vec<MessageRecord>,
}

impl ChatApp {
    pub fn new(
        storage: Arc<dyn Storage>,
        provider: Option<Arc<dyn ChatProvider>>,
        accepted_file_types: Vec<String>,
    ) -> Self {
        Self {
            storage,
            provider,
            accepted_file_types,
            active_session: None,
            transcript: Vec::new(),
        }
    }

    /// Opens the configured database and, when an API key is set, the provider.
    pub fn from_settings(settings: &ChatSettings) -> AppResult<Self> {
        let database_path = settings.database_path();
        let storage = SqliteStorage::open_blocking(&database_path.to_string_lossy())
            .context(StorageSnafu {
                stage: "app-open-storage",
            })?;
        let provider = settings
            .to_provider_config()
            .map(create_provider)
            .transpose()
            .context(ProviderSnafu {
                stage: "app-create-provider",
            })?;
        if provider.is_none() {
            tracing::warn!("no API key configured; sending messages is disabled");
        }

        tracing::info!(database = %database_path.display(), model = %settings.model, "chat app ready");
        Ok(Self::new(
            Arc::new(storage),
            provider,
            settings.accepted_file_types.clone(),
        ))
    }

    pub fn active_session(&self) -> Option<&SessionRecord> {
        self.active_session.as_ref()
    }

    pub fn transcript(&self) -> &[MessageRecord] {
        &self.transcript
    }

    pub fn accepted_file_types(&self) -> &[String] {
        &self.accepted_file_types
    }

    pub fn model(&self) -> Option<&str> {
        self.provider.as_deref().map(|provider| provider.model())
    }

    pub fn sessions(&self) -> AppResult<Vec<SessionRecord>> {
        self.storage.list_sessions().context(StorageSnafu {
            stage: "app-list-sessions",
        })
    }

    /// Creates a session and makes it the active one.
    pub fn create_session(&mut self, name: &str) -> AppResult<&SessionRecord> {
        let session = self
            .storage
            .create_session(NewSession::new(name))
            .context(StorageSnafu {
                stage: "app-create-session",
            })?;

        self.transcript.clear();
        Ok(self.active_session.insert(session))
    }

    /// Switches to an existing session and reloads its history.
    pub fn select_session(&mut self, name: &str) -> AppResult<&SessionRecord> {
        let session = self
            .storage
            .find_session_by_name(name.trim())
            .context(StorageSnafu {
                stage: "app-find-session",
            })?
            .context(SessionNotFoundSnafu {
                stage: "app-select-session",
                name: name.trim().to_string(),
            })?;
        let history = self
            .storage
            .fetch_history(session.id)
            .context(StorageSnafu {
                stage: "app-load-history",
            })?;

        tracing::debug!(session_id = %session.id, messages = history.len(), "switched session");
        self.transcript = history;
        Ok(self.active_session.insert(session))
    }

    pub fn delete_all_sessions(&mut self) -> AppResult<()> {
        self.storage.delete_all_sessions().context(StorageSnafu {
            stage: "app-delete-all-sessions",
        })?;
        self.active_session = None;
        self.transcript.clear();
        Ok(())
    }

    /// Sends one user turn to the active session and records the reply.
    ///
    /// Both turns are persisted once the response stream opened, even when it
    /// carried error frames; partial assistant text is kept. When the request
    /// itself fails nothing is stored.
    pub fn submit(
        &mut self,
        text: &str,
        uploads: Vec<Upload>,
        on_event: &mut EventSink<'_>,
    ) -> AppResult<TurnReport> {
        ensure!(
            !text.trim().is_empty() || !uploads.is_empty(),
            EmptyInputSnafu {
                stage: "submit-validate-input",
            }
        );
        let session_id = self
            .active_session
            .as_ref()
            .map(|session| session.id)
            .context(NoActiveSessionSnafu {
                stage: "submit-active-session",
            })?;
        let attachments = self.accept_uploads(uploads)?;
        let provider = self.provider.clone().context(ProviderUnavailableSnafu {
            stage: "submit-provider",
        })?;

        let user_timestamp = local_now();
        let request = ChatRequest::single_user_turn(
            provider.model(),
            text,
            attachments.iter().map(|attachment| {
                (
                    attachment.name.as_str(),
                    attachment.mime_type.as_str(),
                    attachment.data.as_slice(),
                )
            }),
        );

        let turn = match provider.stream_chat(&request, on_event) {
            Ok(turn) => turn,
            Err(source) => {
                tracing::warn!(session_id = %session_id, error = %source, "chat request failed");
                return Err(source).context(ProviderSnafu {
                    stage: "submit-stream-chat",
                });
            }
        };
        let assistant_timestamp = local_now();

        let StreamedTurn {
            text: reply,
            outcome,
            issues,
            saw_done,
        } = turn;
        let (user, assistant) = self
            .storage
            .append_exchange(
                session_id,
                NewMessage::user(text)
                    .with_timestamp(user_timestamp)
                    .with_files(attachments),
                NewMessage::assistant(reply).with_timestamp(assistant_timestamp),
            )
            .context(StorageSnafu {
                stage: "submit-append-exchange",
            })?;

        if !issues.is_empty() {
            tracing::warn!(session_id = %session_id, issues = issues.len(), "reply stream reported problems");
        }
        self.transcript.push(user.clone());
        self.transcript.push(assistant.clone());

        Ok(TurnReport {
            user,
            assistant,
            outcome,
            issues,
            saw_done,
        })
    }

    fn accept_uploads(&self, uploads: Vec<Upload>) -> AppResult<Vec<Attachment>> {
        uploads
            .into_iter()
            .map(|upload| -> AppResult<Attachment> {
                let accepted = upload
                    .extension()
                    .is_some_and(|extension| self.accepted_file_types.contains(&extension));
                ensure!(
                    accepted,
                    UnsupportedFileTypeSnafu {
                        stage: "submit-validate-upload",
                        name: upload.name.clone(),
                        accepted: self.accepted_file_types.join(", "),
                    }
                );
                Ok(Attachment::from_upload(
                    upload.name,
                    upload.mime_type.as_deref(),
                    upload.data,
                ))
            })
            .collect()
    }
}

/// Writes every attachment of `messages` into `directory`, returning the
/// written paths. Names are reduced to their final path component.
pub fn save_attachments(messages: &[MessageRecord], directory: &Path) -> AppResult<Vec<PathBuf>> {
    std::fs::create_dir_all(directory).context(SaveAttachmentSnafu {
        stage: "save-attachments-create-dir",
        path: directory.to_path_buf(),
    })?;

    let mut written = Vec::new();
    for message in messages {
        for file in &message.files {
            let file_name = Path::new(&file.name)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("attachment-{}", message.id));
            let path = directory.join(format!("{}-{file_name}", message.id));
            std::fs::write(&path, &file.data).context(SaveAttachmentSnafu {
                stage: "save-attachments-write",
                path: path.clone(),
            })?;
            written.push(path);
        }
    }
    Ok(written)
}
