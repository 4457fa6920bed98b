use std::fmt;

/// A convenient result type wrapping [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub struct ConfigError {
    pub reason: String,
}

#[derive(Debug)]
pub struct LoadingError {
    pub entry: String,
    pub path: String,
}

#[derive(Debug)]
pub struct ConsistencyError {
    pub reason: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid terrain description: {}", self.reason)
    }
}

impl fmt::Display for LoadingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Failed to load terrain resource {}! Attempted path: {}",
            self.entry, self.path
        )
    }
}

impl fmt::Display for ConsistencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Terrain state is inconsistent: {}", self.reason)
    }
}

impl std::error::Error for ConfigError {}

impl std::error::Error for LoadingError {}

impl std::error::Error for ConsistencyError {}

#[derive(Debug)]
pub enum Error {
    Config(ConfigError),
    Loading(LoadingError),
    Consistency(ConsistencyError),
    Backend(String),
    Logging(String),
}

impl Error {
    pub fn config(reason: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            reason: reason.into(),
        })
    }

    pub fn loading(entry: impl Into<String>, path: impl Into<String>) -> Self {
        Error::Loading(LoadingError {
            entry: entry.into(),
            path: path.into(),
        })
    }

    pub fn consistency(reason: impl Into<String>) -> Self {
        Error::Consistency(ConsistencyError {
            reason: reason.into(),
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(err) => err.fmt(f),
            Error::Loading(err) => err.fmt(f),
            Error::Consistency(err) => err.fmt(f),
            Error::Backend(msg) => write!(f, "geometry backend error: {msg}"),
            Error::Logging(msg) => write!(f, "logging setup failed: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Config(err) => Some(err),
            Error::Loading(err) => Some(err),
            Error::Consistency(err) => Some(err),
            Error::Backend(_) | Error::Logging(_) => None,
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(value: image::ImageError) -> Self {
        Error::Loading(LoadingError {
            entry: "[UNKNOWN]".to_string(),
            path: value.to_string(),
        })
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Loading(LoadingError {
            entry: "IO Loading Error".to_string(),
            path: value.to_string(),
        })
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Config(ConfigError {
            reason: format!("JSON FILE: {value}"),
        })
    }
}
