use thiserror::Error;

#[derive(Debug, Error)]
pub enum KillchainError {
    #[error("control plane unavailable after {attempts} attempt(s): {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("cannot extract operation id for '{name}', response={response}")]
    OperationIdUnresolved { name: String, response: String },

    #[error("interrupted by termination signal")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid control-plane url '{0}'")]
    InvalidUrl(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl KillchainError {
    /// Errors that abort the whole run rather than a single job.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, KillchainError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, KillchainError>;
