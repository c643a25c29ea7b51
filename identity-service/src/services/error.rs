use serde::Serialize;
use service_core::error::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Token expired")]
    Expired,

    #[error("Token invalid")]
    Invalid,

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type IdentityResult<T> = Result<T, IdentityError>;

/// Error kind reported to operators by configuration tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    NotFound,
    ConnectionError,
    CredentialError,
    ValidationError,
    ConflictError,
    Expired,
    Invalid,
    Internal,
}

impl IdentityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IdentityError::NotFound(_) => ErrorKind::NotFound,
            IdentityError::ProviderUnavailable(_) => ErrorKind::ConnectionError,
            IdentityError::Credential(_) => ErrorKind::CredentialError,
            IdentityError::Validation(_) => ErrorKind::ValidationError,
            IdentityError::Conflict(_) => ErrorKind::ConflictError,
            IdentityError::Expired => ErrorKind::Expired,
            IdentityError::Invalid => ErrorKind::Invalid,
            IdentityError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Transient failures a caller may retry once.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IdentityError::ProviderUnavailable(_))
    }

    /// Copy of this error for sharing one outcome with several waiters.
    /// Internal errors keep only their message.
    pub fn replicate(&self) -> Self {
        match self {
            IdentityError::NotFound(m) => IdentityError::NotFound(m.clone()),
            IdentityError::ProviderUnavailable(m) => IdentityError::ProviderUnavailable(m.clone()),
            IdentityError::Credential(m) => IdentityError::Credential(m.clone()),
            IdentityError::Validation(m) => IdentityError::Validation(m.clone()),
            IdentityError::Conflict(m) => IdentityError::Conflict(m.clone()),
            IdentityError::Expired => IdentityError::Expired,
            IdentityError::Invalid => IdentityError::Invalid,
            IdentityError::Internal(e) => IdentityError::Internal(anyhow::anyhow!("{:#}", e)),
        }
    }

    /// Collapse "no such identity" and "wrong secret" into one outward error
    /// so a login response cannot be used to enumerate identities.
    pub fn masked_for_login(self) -> Self {
        match self {
            IdentityError::NotFound(_) | IdentityError::Credential(_) => {
                IdentityError::Credential("invalid credentials".to_string())
            }
            other => other,
        }
    }
}

impl From<validator::ValidationErrors> for IdentityError {
    fn from(err: validator::ValidationErrors) -> Self {
        IdentityError::Validation(err.to_string())
    }
}

impl From<IdentityError> for AppError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::NotFound(e) => AppError::NotFound(anyhow::anyhow!(e)),
            IdentityError::ProviderUnavailable(e) => AppError::BadGateway(e),
            IdentityError::Credential(_) => {
                AppError::AuthError(anyhow::anyhow!("Invalid credentials"))
            }
            IdentityError::Validation(e) => AppError::BadRequest(anyhow::anyhow!(e)),
            IdentityError::Conflict(e) => AppError::Conflict(anyhow::anyhow!(e)),
            IdentityError::Expired => AppError::Unauthorized(anyhow::anyhow!("Token expired")),
            IdentityError::Invalid => AppError::Unauthorized(anyhow::anyhow!("Invalid token")),
            IdentityError::Internal(e) => AppError::InternalError(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_masking_hides_missing_identity() {
        let missing = IdentityError::NotFound("user jdoe".to_string()).masked_for_login();
        let wrong = IdentityError::Credential("bind failed".to_string()).masked_for_login();
        assert_eq!(missing.to_string(), wrong.to_string());

        let down = IdentityError::ProviderUnavailable("timeout".to_string()).masked_for_login();
        assert_eq!(down.kind(), ErrorKind::ConnectionError);
    }

    #[test]
    fn test_app_error_mapping() {
        let app: AppError = IdentityError::Credential("bind failed for cn=x".to_string()).into();
        assert!(matches!(app, AppError::AuthError(ref e) if e.to_string() == "Invalid credentials"));

        let app: AppError = IdentityError::Conflict("version".to_string()).into();
        assert!(matches!(app, AppError::Conflict(_)));
    }
}
