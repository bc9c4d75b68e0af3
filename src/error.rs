//! Custom error types for ccup.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while driving the appliance upgrade.
#[derive(Error, Debug)]
pub enum CcupError {
    #[error("[{0}] {1}")]
    Transport(String, String),

    #[error("[{0}] Empty response received")]
    EmptyResponse(String),

    #[error("[{0}] Failed to decode response: {1}")]
    Decode(String, String),

    #[error("[{endpoint}] HTTP {status}: {body}")]
    Http {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("[{0}] Management session expired")]
    SessionExpired(String),

    #[error("Authentication failed for {0}")]
    Authentication(String),

    #[error("Missing data: {0}")]
    MissingData(String),

    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Local I/O error: {0}")]
    LocalIo(String),

    #[error("Software update failed on {0}")]
    UpgradeFailed(String),

    #[error("Software upload failed on {node}: {reason}")]
    UploadFailed { node: String, reason: String },

    #[error("Operation cancelled by user")]
    UserCancelled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CcupError {
    /// Create a transport error from a reqwest error.
    /// Timeouts, connection failures and body decoding problems stay transient.
    pub fn http(component: &str, err: reqwest::Error) -> Self {
        let component = component.to_string();

        if err.is_decode() {
            return Self::Decode(component, err.to_string());
        }

        if let Some(status) = err.status() {
            return Self::from_status(&component, status.as_u16(), String::new());
        }

        let reason = if err.is_timeout() {
            format!("request timed out: {err}")
        } else if err.is_connect() {
            format!("connection failed: {err}")
        } else {
            err.to_string()
        };

        Self::Transport(component, reason)
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(endpoint: &str, status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::SessionExpired(endpoint.to_string()),
            _ => Self::Http {
                endpoint: endpoint.to_string(),
                status,
                body: truncate_body(&body),
            },
        }
    }

    /// Returns true if this error is transient and should be retried.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_, _) | Self::EmptyResponse(_) | Self::Decode(_, _)
        )
    }
}

/// Keep appliance error pages readable in a single log line.
fn truncate_body(body: &str) -> String {
    const LIMIT: usize = 200;
    let single_line = body.split_whitespace().collect::<Vec<_>>().join(" ");
    if single_line.chars().count() > LIMIT {
        let cut: String = single_line.chars().take(LIMIT).collect();
        format!("{cut}...")
    } else {
        single_line
    }
}

/// Result alias for appliance API calls.
pub type ApiResult<T> = std::result::Result<T, CcupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_authentication() {
        let err = CcupError::Authentication("primary (10.0.0.1)".to_string());
        assert_eq!(err.to_string(), "Authentication failed for primary (10.0.0.1)");
    }

    #[test]
    fn test_error_display_file_not_found() {
        let err = CcupError::FileNotFound(PathBuf::from("/tmp/missing.tar.gz"));
        assert_eq!(err.to_string(), "File not found: /tmp/missing.tar.gz");
    }

    #[test]
    fn test_from_status_auth_expiry() {
        let err = CcupError::from_status("software.commit", 401, String::new());
        assert!(matches!(err, CcupError::SessionExpired(_)));
        let err = CcupError::from_status("software.commit", 403, String::new());
        assert!(matches!(err, CcupError::SessionExpired(_)));
    }

    #[test]
    fn test_from_status_permanent() {
        let err = CcupError::from_status("ha.status", 500, "Internal\n  Server Error".to_string());
        assert_eq!(err.to_string(), "[ha.status] HTTP 500: Internal Server Error");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_truncate_body_long() {
        let body = "x".repeat(500);
        let truncated = truncate_body(&body);
        assert_eq!(truncated.len(), 203);
        assert!(truncated.ends_with("..."));
    }

    #[test]
    fn test_is_transient() {
        assert!(CcupError::Transport("x".into(), "reset".into()).is_transient());
        assert!(CcupError::EmptyResponse("x".into()).is_transient());
        assert!(CcupError::Decode("x".into(), "eof".into()).is_transient());
        assert!(!CcupError::SessionExpired("x".into()).is_transient());
        assert!(!CcupError::Authentication("x".into()).is_transient());
        assert!(!CcupError::UpgradeFailed("x".into()).is_transient());
        assert!(!CcupError::UserCancelled.is_transient());
    }

    #[test]
    fn test_error_display_user_cancelled() {
        let err = CcupError::UserCancelled;
        assert_eq!(err.to_string(), "Operation cancelled by user");
    }
}
