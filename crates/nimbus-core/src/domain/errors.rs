//! Domain error types.

use thiserror::Error;

/// Errors raised by domain-level validation and state transitions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Item name is empty, contains a path separator, or uses a character
    /// the remote rejects.
    #[error("Invalid item name: {0}")]
    InvalidName(String),

    /// Identifier string failed validation.
    #[error("Invalid item id: {0}")]
    InvalidId(String),

    /// Hash string is not a plausible Base64 QuickXorHash value.
    #[error("Invalid content hash: {0}")]
    InvalidHash(String),

    /// Attempted an item-state transition the machine forbids.
    #[error("Invalid state transition from {from} to {to}")]
    InvalidState {
        /// The current state name.
        from: String,
        /// The attempted target state name.
        to: String,
    },

    /// A sibling with the same case-folded name already exists.
    #[error("Name collides with existing sibling: {0}")]
    SiblingCollision(String),

    /// Generic validation failure.
    #[error("Validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = DomainError::InvalidName("a/b".to_string());
        assert_eq!(err.to_string(), "Invalid item name: a/b");

        let err = DomainError::InvalidState {
            from: "Ghost".to_string(),
            to: "DirtyLocal".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition from Ghost to DirtyLocal"
        );

        let err = DomainError::SiblingCollision("Readme.md".to_string());
        assert_eq!(
            err.to_string(),
            "Name collides with existing sibling: Readme.md"
        );
    }

    #[test]
    fn test_equality_and_clone() {
        let err = DomainError::Validation("quota".to_string());
        assert_eq!(err, err.clone());
        assert_ne!(err, DomainError::Validation("other".to_string()));
    }
}
