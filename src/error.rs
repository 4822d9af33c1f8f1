pub type Result<T> = std::result::Result<T, UploadError>;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("authorization rejected during {stage}: {message}")]
    Auth { stage: Stage, message: String },

    #[error("{stage} failed for {file}: {message}")]
    Network {
        stage: Stage,
        file: String,
        message: String,
    },

    #[error("commit conflict for {path}: {message}")]
    Conflict { path: String, message: String },

    #[error("io error reading {file}: {source}")]
    Io {
        file: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cursor desync for {file}: session at {session_offset}, task at {task_offset}")]
    Desync {
        file: String,
        session_offset: u64,
        task_offset: u64,
    },

    #[error("chunk size must be between 1 byte and 150 MiB, got {size}")]
    InvalidChunkSize { size: u64 },

    #[error("upload cancelled")]
    Cancelled,
}

/// Remote call an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Start,
    Append,
    Finish,
    Account,
    TokenRefresh,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Start => write!(f, "session start"),
            Stage::Append => write!(f, "append"),
            Stage::Finish => write!(f, "session finish"),
            Stage::Account => write!(f, "account lookup"),
            Stage::TokenRefresh => write!(f, "token refresh"),
        }
    }
}

impl UploadError {
    pub fn is_auth(&self) -> bool {
        matches!(self, UploadError::Auth { .. })
    }

    /// Attaches the file being processed to errors raised before the file
    /// name was known at the call site.
    pub fn with_file(self, name: &str) -> Self {
        match self {
            UploadError::Network {
                stage,
                file,
                message,
            } if file.is_empty() => UploadError::Network {
                stage,
                file: name.to_string(),
                message,
            },
            other => other,
        }
    }
}
