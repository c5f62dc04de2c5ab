use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized};
use parley_llm::ProviderConfig;
use parley_storage::sqlite::DEFAULT_DATABASE_FILE_NAME;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const DEFAULT_PROVIDER_ID: &str = "openrouter";
pub const DEFAULT_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "openai/gpt-4.1";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_ACCEPTED_FILE_TYPES: [&str; 4] = ["jpg", "jpeg", "png", "pdf"];
pub const SETTINGS_DIRECTORY_NAME: &str = "parley";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
/// Prefix of environment variables overriding any setting, e.g. `PARLEY_MODEL`.
pub const ENV_PREFIX: &str = "PARLEY_";
/// Conventional OpenRouter key variable, read as a fallback for `api_key`.
pub const API_KEY_ENV: &str = "OPEN_ROUTER_API_KEY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Falls back to `<data_dir>/parley/chat_history.db`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default = "default_accepted_file_types")]
    pub accepted_file_types: Vec<String>,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: default_endpoint(),
            model: default_model(),
            request_timeout_secs: default_request_timeout_secs(),
            database_path: None,
            accepted_file_types: default_accepted_file_types(),
        }
    }
}

impl ChatSettings {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parley"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn default_database_path() -> PathBuf {
        dirs::data_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parley"))
            .join(DEFAULT_DATABASE_FILE_NAME)
    }

    /// Layers defaults, the JSON settings file (when present) and environment
    /// overrides, in that order.
    pub fn load(config_path: Option<&Path>) -> SettingsResult<Self> {
        let config_path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_config_path);

        Self::figment(&config_path)
            .extract::<Self>()
            .map(Self::normalized)
            .context(ExtractSnafu {
                stage: "settings-extract",
                path: config_path,
            })
    }

    pub fn figment(config_path: &Path) -> Figment {
        if !config_path.exists() {
            tracing::info!(path = %config_path.display(), "settings file not found, using defaults");
        }

        Figment::from(Serialized::defaults(Self::default()))
            .merge(Json::file(config_path))
            .merge(Env::raw().only(&[API_KEY_ENV]).map(|_| "api_key".into()))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    pub fn normalized(mut self) -> Self {
        self.provider_id = non_blank_or(self.provider_id, default_provider_id);
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = non_blank_or(self.endpoint, default_endpoint);
        self.model = non_blank_or(self.model, default_model);
        if self.request_timeout_secs == 0 {
            self.request_timeout_secs = default_request_timeout_secs();
        }
        self.database_path = self
            .database_path
            .filter(|path| !path.as_os_str().is_empty());

        let mut accepted = Vec::new();
        for extension in &self.accepted_file_types {
            let extension = extension.trim().trim_start_matches('.').to_ascii_lowercase();
            if !extension.is_empty() && !accepted.contains(&extension) {
                accepted.push(extension);
            }
        }
        self.accepted_file_types = if accepted.is_empty() {
            default_accepted_file_types()
        } else {
            accepted
        };

        self
    }

    /// `None` until an API key is configured.
    pub fn to_provider_config(&self) -> Option<ProviderConfig> {
        if self.api_key.trim().is_empty() {
            return None;
        }

        Some(
            ProviderConfig::new(&self.provider_id, &self.api_key, &self.endpoint, &self.model)
                .with_request_timeout(self.request_timeout()),
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(Self::default_database_path)
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to load settings from {path:?} on `{stage}`: {source}"))]
    Extract {
        stage: &'static str,
        path: PathBuf,
        #[snafu(source(from(figment::Error, Box::new)))]
        source: Box<figment::Error>,
    },
}

pub type SettingsResult<T> = Result<T, SettingsError>;

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

fn default_provider_id() -> String {
    DEFAULT_PROVIDER_ID.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_accepted_file_types() -> Vec<String> {
    DEFAULT_ACCEPTED_FILE_TYPES
        .iter()
        .map(|extension| extension.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn defaults_apply_without_file_or_env() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            let settings = ChatSettings::load(Some(Path::new("missing.json"))).unwrap();
            assert_eq!(settings, ChatSettings::default());
            assert!(settings.to_provider_config().is_none());
            assert_eq!(settings.request_timeout(), Duration::from_secs(30));
            assert!(settings.database_path().ends_with("parley/chat_history.db"));
            Ok(())
        });
    }

    #[test]
    fn file_values_are_normalized() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                "settings.json",
                r#"{
                    "api_key": "  sk-file  ",
                    "model": "  ",
                    "endpoint": " http://localhost:8080/v1/chat/completions ",
                    "request_timeout_secs": 0,
                    "database_path": "db/history.db",
                    "accepted_file_types": [".PNG", "png", " pdf", ""]
                }"#,
            )?;

            let settings = ChatSettings::load(Some(Path::new("settings.json"))).unwrap();
            assert_eq!(settings.api_key, "sk-file");
            assert_eq!(settings.model, DEFAULT_MODEL);
            assert_eq!(settings.endpoint, "http://localhost:8080/v1/chat/completions");
            assert_eq!(settings.request_timeout_secs, DEFAULT_REQUEST_TIMEOUT_SECS);
            assert_eq!(settings.database_path(), PathBuf::from("db/history.db"));
            assert_eq!(settings.accepted_file_types, ["png", "pdf"]);
            Ok(())
        });
    }

    #[test]
    fn environment_overrides_file() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("settings.json", r#"{"model": "file/model", "api_key": "sk-file"}"#)?;
            jail.set_env("PARLEY_MODEL", "env/model");
            jail.set_env("PARLEY_REQUEST_TIMEOUT_SECS", "5");

            let settings = ChatSettings::load(Some(Path::new("settings.json"))).unwrap();
            assert_eq!(settings.model, "env/model");
            assert_eq!(settings.api_key, "sk-file");

            let config = settings.to_provider_config().unwrap();
            assert_eq!(config.model, "env/model");
            assert_eq!(config.request_timeout, Duration::from_secs(5));
            Ok(())
        });
    }

    #[test]
    fn openrouter_key_variable_is_a_fallback() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env(API_KEY_ENV, "sk-or");
            let settings = ChatSettings::load(Some(Path::new("none.json"))).unwrap();
            assert_eq!(settings.api_key, "sk-or");

            jail.set_env("PARLEY_API_KEY", "sk-parley");
            let settings = ChatSettings::load(Some(Path::new("none.json"))).unwrap();
            assert_eq!(settings.api_key, "sk-parley");
            Ok(())
        });
    }

    #[test]
    fn malformed_file_is_an_error() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("settings.json", "{ not json")?;
            let error = ChatSettings::load(Some(Path::new("settings.json"))).unwrap_err();
            assert!(matches!(error, SettingsError::Extract { .. }));
            Ok(())
        });
    }
}
