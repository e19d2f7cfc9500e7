/// Typed error hierarchy for chat operations.
/// Classifies failures by what the client should do next: re-authenticate,
/// retry the submission, or give up.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ChatError {
    /// Malformed or unknown session token. The user must log in again.
    #[error("invalid session, log in again")]
    InvalidSession,

    #[error("not found: {0}")]
    NotFound(String),

    /// Durable-store operation failed. Unacknowledged records are safe to retry.
    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("capacity exhausted: {0}")]
    Capacity(String),

    /// Credential rejected at the connection boundary.
    #[error("authentication rejected: {0}")]
    Auth(String),
}

impl ChatError {
    /// Wire code surfaced in RPC error responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSession => "INVALID_SESSION",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Persistence(_) => "PERSISTENCE",
            Self::Capacity(_) => "CAPACITY",
            Self::Auth(_) => "AUTH",
        }
    }

    /// Whether the client must obtain a new session before retrying.
    pub fn requires_reauth(&self) -> bool {
        matches!(self, Self::InvalidSession | Self::Auth(_))
    }

    /// Whether retrying the same request later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Capacity(_))
    }
}
