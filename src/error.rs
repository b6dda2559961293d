// Failures surfaced by request operations

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TicketError {
    /// A referenced request, shop, category, urgency or user does not exist
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    /// The caller may not perform this operation on this request
    #[error("operation not allowed: {0}")]
    NotAllowed(String),

    /// No caller identity could be resolved
    #[error("caller is not authenticated")]
    Unauthenticated,

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error(transparent)]
    Internal(#[from] eyre::Report),
}

impl TicketError {
    pub fn not_found(kind: &'static str, id: i64) -> Self {
        TicketError::NotFound { kind, id }
    }

    pub fn not_allowed(reason: impl Into<String>) -> Self {
        TicketError::NotAllowed(reason.into())
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        TicketError::Invalid(reason.into())
    }
}

impl From<rusqlite::Error> for TicketError {
    fn from(err: rusqlite::Error) -> Self {
        TicketError::Internal(err.into())
    }
}

pub type TicketResult<T> = std::result::Result<T, TicketError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            TicketError::not_found("urgency category", 9).to_string(),
            "urgency category 9 not found"
        );
        assert_eq!(
            TicketError::not_allowed("only closed requests can be restored").to_string(),
            "operation not allowed: only closed requests can be restored"
        );
    }

    #[test]
    fn test_internal_wraps_eyre() {
        let err: TicketError = eyre::eyre!("disk full").into();
        assert!(matches!(err, TicketError::Internal(_)));
        assert_eq!(err.to_string(), "disk full");
    }
}
