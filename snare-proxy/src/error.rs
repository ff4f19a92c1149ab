use snare_net::TlsError;
use thiserror::Error;

use crate::intercept::InterceptError;
use crate::modify::BoxError;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy configuration error: {0}")]
    Config(String),
    #[error("proxy runtime error: {0}")]
    Runtime(String),
    #[error("proxy IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("proxy TLS error: {0}")]
    Tls(#[from] TlsError),
}

/// Failure raised by a pipeline stage.
#[derive(Debug, Error)]
pub enum ModifyError {
    #[error("exchange aborted by operator")]
    Aborted,
    #[error("exchange cancelled")]
    Cancelled,
    #[error("body error: {0}")]
    Body(BoxError),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("{0}")]
    Failed(String),
}

impl ModifyError {
    /// Aborted and cancelled exchanges end quietly rather than as errors.
    pub fn is_termination(&self) -> bool {
        matches!(self, ModifyError::Aborted | ModifyError::Cancelled)
    }
}

impl From<InterceptError> for ModifyError {
    fn from(err: InterceptError) -> Self {
        match err {
            InterceptError::Aborted => ModifyError::Aborted,
            InterceptError::Cancelled => ModifyError::Cancelled,
            other => ModifyError::Failed(other.to_string()),
        }
    }
}
