use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid config field '{field}': {reason}")]
    Config { field: String, reason: String },
    #[error("backends must not be empty")]
    EmptyBackends,
    #[error("duplicate backend name '{0}'")]
    DuplicateBackendName(String),
    #[error("unknown algorithm '{0}'")]
    UnknownAlgorithm(String),
    #[error("unknown attack profile '{0}'")]
    UnknownProfile(String),
    #[error("unknown {kind} '{name}'")]
    UnknownExtension { kind: &'static str, name: String },
    #[error("safety limit exceeded for '{field}': requested {requested}, limit {limit}")]
    SafetyLimitExceeded {
        field: &'static str,
        requested: u64,
        limit: u64,
    },
    #[error("internal race detected: {0}")]
    InternalRace(String),
    #[error("worker pool failure: {0}")]
    Worker(String),
    #[error("{0}")]
    ConfigIo(String),
    #[error("{0}")]
    ConfigParse(String),
    #[error("unsupported config format '{0}'")]
    UnsupportedConfigFormat(String),
    #[error("{0}")]
    Cli(String),
}

impl Error {
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Config {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// True for errors raised while validating configuration, before any
    /// simulation state exists.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::Config { .. }
                | Error::EmptyBackends
                | Error::DuplicateBackendName(_)
                | Error::UnknownAlgorithm(_)
                | Error::UnknownProfile(_)
                | Error::UnknownExtension { .. }
                | Error::ConfigParse(_)
                | Error::UnsupportedConfigFormat(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
