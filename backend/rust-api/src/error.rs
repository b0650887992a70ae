use std::error::Error;
use thiserror::Error;

/// Result alias for transactional store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Failure raised by a transactional store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A concurrent transaction won a write-write or read-write race.
    /// The whole transaction may be retried.
    #[error("serialization conflict: {0}")]
    Conflict(String),
    /// Any other backend failure.
    #[error("storage backend failure: {message}")]
    Backend {
        message: String,
        #[source]
        source: Option<Box<dyn Error + Send + Sync>>,
    },
    /// A stored row could not be decoded into a domain value.
    #[error("corrupted record in {collection}: {message}")]
    Corrupted {
        collection: &'static str,
        message: String,
    },
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        StoreError::Backend {
            message: message.into(),
            source: None,
        }
    }

    pub fn backend_with(message: impl Into<String>, source: impl Error + Send + Sync + 'static) -> Self {
        StoreError::Backend {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Errors surfaced by the duel use cases.
///
/// `BadRequest`, `Forbidden` and `NotFound` are domain outcomes and are never
/// retried. `Store` wraps backend failures; only its `Conflict` flavour is
/// retried by the transaction wrapper.
#[derive(Debug, Error)]
pub enum DuelError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DuelError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        DuelError::BadRequest(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        DuelError::Forbidden(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        DuelError::NotFound(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        DuelError::Internal(message.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, DuelError::Store(err) if err.is_conflict())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_store_conflicts_are_retryable() {
        assert!(DuelError::from(StoreError::Conflict("write skew".into())).is_conflict());
        assert!(!DuelError::from(StoreError::backend("socket closed")).is_conflict());
        assert!(!DuelError::forbidden("no active pair").is_conflict());
        assert!(!DuelError::internal("Too many transaction retries").is_conflict());
    }

    #[test]
    fn domain_errors_display_their_message_verbatim() {
        let err = DuelError::forbidden("All questions already answered");
        assert_eq!(err.to_string(), "All questions already answered");
    }
}
