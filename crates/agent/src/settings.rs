use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:8000";
pub const DEFAULT_SESSION_ID: &str = "demo";
pub const DEFAULT_GREETING: &str =
    "Hi, I'm your field agent. Try asking: 'show me the base stations in Beijing'.";
pub const SETTINGS_DIRECTORY_NAME: &str = "workbench";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "WORKBENCH_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Sent with selection reports so the backend can correlate them.
    #[serde(default = "default_session_id")]
    pub session_id: String,
    #[serde(default = "default_greeting")]
    pub greeting: String,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            session_id: default_session_id(),
            greeting: default_greeting(),
            connect_timeout_secs: None,
        }
    }
}

impl Settings {
    pub fn normalized(mut self) -> Self {
        let api_base = self.api_base.trim().trim_end_matches('/');
        self.api_base = if api_base.is_empty() {
            default_api_base()
        } else {
            api_base.to_string()
        };
        self.session_id = non_blank_or(&self.session_id, default_session_id);
        self.greeting = non_blank_or(&self.greeting, default_greeting);
        self.connect_timeout_secs = self.connect_timeout_secs.filter(|secs| *secs > 0);
        self
    }

    /// Absolute URL of a backend path such as `/api/chat/stream`.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    /// Defaults, then the JSON file at `path`, then `WORKBENCH_*` variables.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }

        let settings = Self::figment(path)
            .extract::<Settings>()
            .context(ExtractSnafu {
                stage: "extract-settings",
                path: path.to_path_buf(),
            })?;
        Ok(settings.normalized())
    }
}

pub struct SettingsStore {
    settings: ArcSwap<Settings>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".workbench"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn open(config_path: PathBuf) -> Result<Self, SettingsError> {
        let settings = Settings::load_from(&config_path)?;
        Ok(Self::with_settings(config_path, settings))
    }

    /// Loads from `config_path`, falling back to defaults when the file is
    /// unreadable.
    pub fn open_or_default(config_path: PathBuf) -> Self {
        match Settings::load_from(&config_path) {
            Ok(settings) => Self::with_settings(config_path, settings),
            Err(error) => {
                tracing::warn!(error = %error, "failed to load settings, using defaults");
                Self::with_settings(config_path, Settings::default())
            }
        }
    }

    pub fn with_settings(config_path: PathBuf, settings: Settings) -> Self {
        Self {
            settings: ArcSwap::from_pointee(settings.normalized()),
            config_path,
        }
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub fn replace(&self, settings: Settings) {
        self.settings.store(Arc::new(settings.normalized()));
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to extract settings from {path:?} on `{stage}`: {source}"))]
    Extract {
        stage: &'static str,
        path: PathBuf,
        #[snafu(source(from(figment::Error, Box::new)))]
        source: Box<figment::Error>,
    },
}

fn non_blank_or(value: &str, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_session_id() -> String {
    DEFAULT_SESSION_ID.to_string()
}

fn default_greeting() -> String {
    DEFAULT_GREETING.to_string()
}
