use parley_core::errors::ChatError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("capacity exhausted: {0}")]
    Capacity(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("IO error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Boundary mapping into the client-facing taxonomy.
impl From<StoreError> for ChatError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => ChatError::NotFound(what),
            StoreError::Capacity(detail) => ChatError::Capacity(detail),
            other => ChatError::Persistence(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_chat_not_found() {
        let err: ChatError = StoreError::NotFound("session abc".into()).into();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[test]
    fn capacity_maps_to_chat_capacity() {
        let err: ChatError = StoreError::Capacity("session limit".into()).into();
        assert_eq!(err.code(), "CAPACITY");
    }

    #[test]
    fn database_maps_to_persistence() {
        let err: ChatError = StoreError::Database("locked".into()).into();
        assert_eq!(err.code(), "PERSISTENCE");
        assert!(err.is_retryable());
    }
}
