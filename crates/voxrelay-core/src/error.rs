use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// A binary or model file the service needs at start-up is absent.
    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    /// A remote recognition/synthesis call failed or returned non-success.
    #[error("Upstream failure{}: {detail}", status.map(|s| format!(" ({s})")).unwrap_or_default())]
    UpstreamFailure { status: Option<u16>, detail: String },

    /// The synthesis process wrote something other than PCM to its output.
    #[error("Corrupted stream: {0}")]
    CorruptedStream(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    pub fn upstream(status: Option<u16>, detail: impl Into<String>) -> Self {
        Self::UpstreamFailure {
            status,
            detail: detail.into(),
        }
    }

    /// Stable label for log fields and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingDependency(_) => "missing_dependency",
            Self::UpstreamFailure { .. } => "upstream_failure",
            Self::CorruptedStream(_) => "corrupted_stream",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
