use std::io;
use std::panic::Location;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, QleverError>;

/// How an error is reported at the dispatch boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or missing configuration. Fatal, one line.
    Configuration,
    /// A known operating condition that prevents the action. One line.
    Precondition,
    /// Anything else. Printed with the location it was raised at.
    Unexpected,
}

#[derive(Debug, Error)]
pub enum QleverError {
    #[error("cannot read Qleverfile {path}: {source}")]
    ConfigFile { path: PathBuf, source: io::Error },
    #[error("cannot parse Qleverfile: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Section [{0}] does not exist in Qleverfile")]
    MissingSection(String),
    #[error("Option {} is missing in section [{section}] of the Qleverfile", .option.to_uppercase())]
    MissingOption { section: String, option: String },
    #[error("Section [{0}] does not exist in Qleverfile")]
    UnknownSection(String),
    #[error("Option {} does not exist in section [{section}] in Qleverfile", .option.to_uppercase())]
    UnknownOption { section: String, option: String },
    #[error("Invalid log level: \"{0}\"")]
    InvalidLogLevel(String),
    #[error("Invalid value \"{value}\" for {section}.{option}: {reason}")]
    InvalidValue {
        section: String,
        option: String,
        value: String,
        reason: String,
    },
    #[error("Cannot interpolate {section}.{option}: {reason}")]
    Interpolation {
        section: String,
        option: String,
        reason: String,
    },
    #[error("Action \"{name}\" does not exist, available actions are: {}", .available.join(", "))]
    UnknownAction {
        name: String,
        available: Vec<&'static str>,
    },
    #[error("Invalid assignment \"{0}\", expected SECTION.OPTION=VALUE")]
    InvalidAssignment(String),
    #[error("{0}")]
    Precondition(String),
    #[error("command failed with status {status}: {command}")]
    CommandFailed { command: String, status: i32 },
    #[error("server on port {port} did not respond within {seconds}s, see {log}")]
    StartupTimeout {
        port: String,
        seconds: u64,
        log: String,
    },
    #[error("io error: {source}")]
    Io {
        source: io::Error,
        location: &'static Location<'static>,
    },
    #[error("http error: {source}")]
    Http {
        source: reqwest::Error,
        location: &'static Location<'static>,
    },
    #[error("regex error: {source}")]
    Regex {
        source: regex::Error,
        location: &'static Location<'static>,
    },
    #[error("glob error: {0}")]
    Glob(String),
}

impl QleverError {
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    pub fn missing_option(section: &str, option: &str) -> Self {
        Self::MissingOption {
            section: section.to_string(),
            option: option.to_string(),
        }
    }

    pub fn invalid_value(section: &str, option: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            section: section.to_string(),
            option: option.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            QleverError::ConfigFile { .. }
            | QleverError::Yaml(_)
            | QleverError::MissingSection(_)
            | QleverError::MissingOption { .. }
            | QleverError::UnknownSection(_)
            | QleverError::UnknownOption { .. }
            | QleverError::InvalidLogLevel(_)
            | QleverError::InvalidValue { .. }
            | QleverError::Interpolation { .. }
            | QleverError::UnknownAction { .. }
            | QleverError::InvalidAssignment(_) => ErrorKind::Configuration,
            QleverError::Precondition(_)
            | QleverError::CommandFailed { .. }
            | QleverError::StartupTimeout { .. } => ErrorKind::Precondition,
            QleverError::Io { .. }
            | QleverError::Http { .. }
            | QleverError::Regex { .. }
            | QleverError::Glob(_) => ErrorKind::Unexpected,
        }
    }

    /// Source location an unexpected error was converted at, if recorded.
    pub fn location(&self) -> Option<&'static Location<'static>> {
        match self {
            QleverError::Io { location, .. }
            | QleverError::Http { location, .. }
            | QleverError::Regex { location, .. } => Some(location),
            _ => None,
        }
    }
}

// `?` calls `From::from`, so `#[track_caller]` records the line of the `?`.
impl From<io::Error> for QleverError {
    #[track_caller]
    fn from(source: io::Error) -> Self {
        Self::Io {
            source,
            location: Location::caller(),
        }
    }
}

impl From<reqwest::Error> for QleverError {
    #[track_caller]
    fn from(source: reqwest::Error) -> Self {
        Self::Http {
            source,
            location: Location::caller(),
        }
    }
}

impl From<regex::Error> for QleverError {
    #[track_caller]
    fn from(source: regex::Error) -> Self {
        Self::Regex {
            source,
            location: Location::caller(),
        }
    }
}
