use std::time::Duration;
use thiserror::Error;

/// Failures of the vendor client and the poll cycle built on it.
#[derive(Debug, Error)]
pub enum EcobullesError {
    /// The server answered but refused the credentials (status other than 1).
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Non-200 answer from the server.
    #[error("Connection failed: HTTP status {0}")]
    ConnectionFailed(u16),

    /// Transport fault before any answer was received.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// An expected field was missing or had the wrong shape.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The bounded wait around a fetch elapsed.
    #[error("Fetch timed out after {0:?}")]
    FetchTimeout(Duration),
}

impl EcobullesError {
    pub(crate) fn missing(field: &str) -> Self {
        Self::MalformedResponse(format!("missing field `{field}`"))
    }
}

/// Error codes surfaced by the setup and options forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupErrorCode {
    CannotConnect,
    InvalidAuth,
    Unknown,
}

impl SetupErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SetupErrorCode::CannotConnect => "cannot_connect",
            SetupErrorCode::InvalidAuth => "invalid_auth",
            SetupErrorCode::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for SetupErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for SetupErrorCode {}

impl From<&EcobullesError> for SetupErrorCode {
    fn from(err: &EcobullesError) -> Self {
        match err {
            EcobullesError::AuthenticationFailed(_) => SetupErrorCode::InvalidAuth,
            EcobullesError::ConnectionFailed(_)
            | EcobullesError::Http(_)
            | EcobullesError::FetchTimeout(_) => SetupErrorCode::CannotConnect,
            EcobullesError::MalformedResponse(_) | EcobullesError::Json(_) => {
                SetupErrorCode::Unknown
            }
        }
    }
}

impl From<EcobullesError> for SetupErrorCode {
    fn from(err: EcobullesError) -> Self {
        SetupErrorCode::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_error_codes() {
        let auth = EcobullesError::AuthenticationFailed("status 0".into());
        assert_eq!(SetupErrorCode::from(&auth).as_str(), "invalid_auth");

        let conn = EcobullesError::ConnectionFailed(503);
        assert_eq!(SetupErrorCode::from(&conn).as_str(), "cannot_connect");

        let timeout = EcobullesError::FetchTimeout(Duration::from_secs(10));
        assert_eq!(SetupErrorCode::from(timeout), SetupErrorCode::CannotConnect);

        let malformed = EcobullesError::missing("data.boite");
        assert_eq!(SetupErrorCode::from(&malformed).to_string(), "unknown");
    }

    #[test]
    fn test_missing_field_message() {
        let err = EcobullesError::missing("data.userid");
        assert_eq!(
            err.to_string(),
            "Malformed response: missing field `data.userid`"
        );
    }
}
