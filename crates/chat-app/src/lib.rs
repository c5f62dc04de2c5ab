pub mod app;
pub mod cli;
pub mod error;
pub mod render;
pub mod settings;

pub use app::{ChatApp, TurnReport, Upload, save_attachments};
pub use error::{AppError, AppResult};
pub use render::{AttachmentView, ErrorNotice, render_message, speaker_heading};
pub use settings::{ChatSettings, SettingsError};
