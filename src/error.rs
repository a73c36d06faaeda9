//! Error handling for procman.
use thiserror::Error;

/// Defines all possible errors that can occur in the process manager.
#[derive(Debug, Error)]
pub enum ProcessManagerError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// Error parsing JSON configuration.
    #[error("Invalid JSON format: {0}")]
    ConfigJsonError(#[from] serde_json::Error),

    /// The configuration declares no applications.
    #[error("Configuration does not define any apps")]
    NoApps,

    /// An application entry failed validation.
    #[error("Invalid app at index {index}: {reason}")]
    InvalidApp {
        /// Position of the entry in the `apps` list.
        index: usize,
        /// What is wrong with it.
        reason: String,
    },

    /// Two applications share the same name.
    #[error("Duplicate app name '{0}'")]
    DuplicateApp(String),

    /// A `${VAR}` reference points at an unset environment variable.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// A duration value could not be parsed.
    #[error("Invalid duration '{0}'")]
    InvalidDuration(String),

    /// An `ignore_watch` entry could not be compiled.
    #[error("Invalid ignore pattern '{pattern}': {source}")]
    InvalidIgnorePattern {
        /// The offending pattern.
        pattern: String,
        /// The underlying regex error.
        #[source]
        source: regex::Error,
    },

    /// Lookup of an application that is not part of the configuration.
    #[error("Unknown app '{0}'")]
    UnknownApp(String),

    /// Error spawning an application process.
    #[error("Failed to start app '{app}': {source}")]
    AppStartError {
        /// The app that failed to start.
        app: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error stopping an application process.
    #[error("Failed to stop app '{app}': {source}")]
    AppStopError {
        /// The app that failed to stop.
        app: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// None of the configured apps could be launched.
    #[error("No app could be started: {apps:?}")]
    NothingStarted {
        /// Apps whose launch failed.
        apps: Vec<String>,
    },

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisonError(String),
}

impl<T> From<std::sync::PoisonError<T>> for ProcessManagerError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ProcessManagerError::MutexPoisonError(err.to_string())
    }
}
