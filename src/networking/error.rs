use thiserror::Error;

/// Failures of the peer-group layer.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("no peer available")]
    Offline,
    #[error("peer call exceeded its time budget")]
    Timeout,
    #[error("peer {0} disconnected")]
    Disconnected(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("transaction propagated to {0} peers only")]
    InsufficientPropagation(usize),
}

impl From<NetworkError> for crate::error::CheckError {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::Timeout => crate::error::CheckError::Timeout,
            _ => crate::error::CheckError::Offline,
        }
    }
}
