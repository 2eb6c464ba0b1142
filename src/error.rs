//! Error types for blocksync.
//!
//! Duplicates are deliberately absent: re-adding an existing address is a
//! normal [`InsertOutcome`](crate::model::InsertOutcome), never an error.

use thiserror::Error;

/// Failure of the list storage layer.
///
/// The wrapped detail is meant for logs only; anything facing an untrusted
/// caller should render [`StoreError::public_message`] instead.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(#[from] rusqlite::Error),

    #[error("Store unavailable: connection lock poisoned")]
    Poisoned,

    #[error("Store unavailable: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn public_message(&self) -> &'static str {
        "storage temporarily unavailable"
    }
}

/// Rejections raised at the bulk normalizer boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("Invalid IP address or CIDR: {0}")]
    InvalidAddress(String),

    #[error("Range {token} expands to {hosts} hosts (limit {limit})")]
    RangeTooLarge { token: String, hosts: u128, limit: u64 },

    #[error("No valid IPs provided ({rejected} rejected)")]
    NoValidAddresses { rejected: usize },
}

/// Outcome of a write through the authority's import interface.
#[derive(Error, Debug)]
pub enum ImportError {
    #[error(transparent)]
    Validation(#[from] NormalizeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure to produce an export rendering.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to render export: {0}")]
    Render(String),
}

/// Top-level errors for the agent and CLI surfaces.
#[derive(Error, Debug)]
pub enum BlocksyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authority unreachable: {0}")]
    AuthorityUnreachable(String),

    #[error("Firewall error: {0}")]
    Firewall(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Unknown feed: {0}")]
    UnknownFeed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_public_message_hides_detail() {
        let err = StoreError::Unavailable(rusqlite::Error::InvalidQuery);
        assert!(err.to_string().contains("Store unavailable"));
        assert!(!err.public_message().contains("Query"));
    }

    #[test]
    fn test_no_valid_addresses_message() {
        let err = NormalizeError::NoValidAddresses { rejected: 2 };
        assert_eq!(err.to_string(), "No valid IPs provided (2 rejected)");
    }

    #[test]
    fn test_import_error_is_transparent() {
        let err: ImportError = NormalizeError::InvalidAddress("nope".into()).into();
        assert_eq!(err.to_string(), "Invalid IP address or CIDR: nope");
    }
}
