use axum::http::StatusCode;

/// 流会话操作的失败类型
///
/// "不存在"、"已停止" 这类状态不是错误, 由布尔值或健康报告表示。
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("invalid source url: {0}")]
    InvalidSource(String),

    #[error("transcoder unavailable: {binary}")]
    TranscoderUnavailable { binary: String, log_tail: String },

    #[error("insufficient system memory ({available_kb} KB available)")]
    InsufficientMemory { available_kb: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("manifest not ready after {waited_ms} ms")]
    ManifestTimeout { waited_ms: u64, log_tail: String },

    #[error("transcoder exited before producing a manifest")]
    ProcessExited { log_tail: String },
}

impl StreamError {
    /// 面向操作员的简短原因
    pub fn reason(&self) -> String {
        self.to_string()
    }

    pub fn log_tail(&self) -> &str {
        match self {
            StreamError::TranscoderUnavailable { log_tail, .. }
            | StreamError::ManifestTimeout { log_tail, .. }
            | StreamError::ProcessExited { log_tail } => log_tail,
            _ => "",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            StreamError::InvalidSource(_) => StatusCode::BAD_REQUEST,
            StreamError::TranscoderUnavailable { .. } | StreamError::InsufficientMemory { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            StreamError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            StreamError::ManifestTimeout { .. } | StreamError::ProcessExited { .. } => {
                StatusCode::BAD_GATEWAY
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
