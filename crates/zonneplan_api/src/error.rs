use reqwest::StatusCode;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The API rejected the bearer token.
    #[error("request was rejected as unauthorized")]
    Unauthorized,

    /// A token grant was refused. The stored credentials are no longer usable.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// No token has been stored yet.
    #[error("not logged in")]
    NoToken,

    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout
        } else {
            ApiError::Transport(e)
        }
    }
}

impl ApiError {
    /// The session must be re-established before any further request can succeed.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            ApiError::Unauthorized | ApiError::AuthFailed(_) | ApiError::NoToken
        )
    }

    /// A retry after some backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApiError::Timeout | ApiError::Transport(_) | ApiError::Status { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ApiError::Unauthorized.is_auth_failure());
        assert!(ApiError::AuthFailed("revoked".to_string()).is_auth_failure());
        assert!(!ApiError::Unauthorized.is_transient());

        let status = ApiError::Status {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        };
        assert!(status.is_transient());
        assert!(!status.is_auth_failure());
        assert!(ApiError::Timeout.is_transient());
    }

    #[test]
    fn test_display() {
        let err = ApiError::Status {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: "oops".to_string(),
        };
        insta::assert_snapshot!(err.to_string(), @"unexpected status 500 Internal Server Error: oops");
    }
}
