use thiserror::Error;

/// Structured classification of a ledger failure.
///
/// Callers branch on the kind, never on the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerErrorKind {
    /// The stream or entity does not exist on the ledger
    NotFound,
    /// The entity exists but is closed and accepts no further operations
    Closed,
    /// The payer cannot cover the claim right now
    InsufficientResources,
    /// Timeout, connection failure, overloaded node
    Transient,
    /// Any other definitive rejection (bad arguments, aborted operation)
    Rejected,
}

impl LedgerErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            LedgerErrorKind::NotFound => "NOT_FOUND",
            LedgerErrorKind::Closed => "CLOSED",
            LedgerErrorKind::InsufficientResources => "INSUFFICIENT_RESOURCES",
            LedgerErrorKind::Transient => "TRANSIENT",
            LedgerErrorKind::Rejected => "REJECTED",
        }
    }

    /// The ledger confirms the target is gone; local state can be pruned.
    #[inline]
    pub fn is_definitive_gone(&self) -> bool {
        matches!(self, LedgerErrorKind::NotFound | LedgerErrorKind::Closed)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{} ledger error: {message}", kind.code())]
pub struct LedgerError {
    pub kind: LedgerErrorKind,
    pub message: String,
}

impl LedgerError {
    pub fn new(kind: LedgerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(LedgerErrorKind::NotFound, message)
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(LedgerErrorKind::Closed, message)
    }

    pub fn insufficient(message: impl Into<String>) -> Self {
        Self::new(LedgerErrorKind::InsufficientResources, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(LedgerErrorKind::Transient, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(LedgerErrorKind::Rejected, message)
    }

    #[inline]
    pub fn is_retryable(&self) -> bool {
        self.kind == LedgerErrorKind::Transient
    }
}

impl From<reqwest::Error> for LedgerError {
    fn from(e: reqwest::Error) -> Self {
        // Anything below HTTP semantics (connect, timeout, body) is worth a retry
        if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
            LedgerError::transient(format!("HTTP request failed: {}", e))
        } else if let Some(status) = e.status()
            && status.is_server_error()
        {
            LedgerError::transient(format!("Ledger gateway returned {}", status))
        } else {
            LedgerError::rejected(format!("HTTP error: {}", e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes_and_gone() {
        assert_eq!(LedgerErrorKind::NotFound.code(), "NOT_FOUND");
        assert!(LedgerErrorKind::NotFound.is_definitive_gone());
        assert!(LedgerErrorKind::Closed.is_definitive_gone());
        assert!(!LedgerErrorKind::InsufficientResources.is_definitive_gone());
        assert!(!LedgerErrorKind::Transient.is_definitive_gone());
    }

    #[test]
    fn test_display_uses_code() {
        let e = LedgerError::insufficient("payer balance 3 < 10");
        assert_eq!(
            e.to_string(),
            "INSUFFICIENT_RESOURCES ledger error: payer balance 3 < 10"
        );
        assert!(!e.is_retryable());
        assert!(LedgerError::transient("timeout").is_retryable());
    }
}
