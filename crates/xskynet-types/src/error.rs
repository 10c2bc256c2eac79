use thiserror::Error;

/// Errors from event store operations.
///
/// Stores fail loudly: an append or list that cannot complete returns one of
/// these instead of dropping data.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("event log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("event serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("event store lock poisoned")]
    Lock,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "read-only",
        ));
        assert_eq!(err.to_string(), "event log I/O error: read-only");
        assert_eq!(StoreError::Lock.to_string(), "event store lock poisoned");
    }
}
