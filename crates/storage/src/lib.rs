pub mod attachment;
pub mod error;
pub mod ids;
pub mod sqlite;
pub mod types;

pub use attachment::{Attachment, PDF_MIME_TYPE, StoredAttachment, guess_mime_type};
pub use error::{StorageError, StorageResult};
pub use ids::{MessageId, SessionId};
pub use sqlite::SqliteStorage;
pub use types::{
    ASSISTANT_DISPLAY_NAME, MessageRecord, MessageRole, NewMessage, NewSession, SessionRecord,
    USER_DISPLAY_NAME, local_now,
};

pub trait SessionStore: Send + Sync {
    fn create_session(&self, input: NewSession) -> StorageResult<SessionRecord>;
    /// Most recently created first.
    fn list_sessions(&self) -> StorageResult<Vec<SessionRecord>>;
    fn get_session(&self, session_id: SessionId) -> StorageResult<Option<SessionRecord>>;
    fn find_session_by_name(&self, name: &str) -> StorageResult<Option<SessionRecord>>;
    fn delete_all_sessions(&self) -> StorageResult<()>;
}

pub trait MessageStore: Send + Sync {
    fn append_message(
        &self,
        session_id: SessionId,
        input: NewMessage,
    ) -> StorageResult<MessageRecord>;
    /// Stores a user turn and its reply in one transaction: both rows or neither.
    fn append_exchange(
        &self,
        session_id: SessionId,
        user: NewMessage,
        assistant: NewMessage,
    ) -> StorageResult<(MessageRecord, MessageRecord)>;
    /// Insertion order; unknown sessions yield an empty history.
    fn fetch_history(&self, session_id: SessionId) -> StorageResult<Vec<MessageRecord>>;
}

pub trait Storage: SessionStore + MessageStore {}

impl<T> Storage for T where T: SessionStore + MessageStore {}
