use thiserror::Error;

/// Failure of one of the session's collaborators (number source, validator,
/// attempt recorder, achievement source).
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server error: {status} - {message}")]
    Status { status: u16, message: String },
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

/// Errors that interrupt the user-visible flow of a session.
///
/// Everything not listed here (validator outages, failed mid-session
/// updates, a lost final write) is recovered from inside the session.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid session config: {0}")]
    InvalidConfig(String),
    #[error("could not start the session: {0}")]
    Initialization(#[source] ServiceError),
    #[error("could not generate numbers: {0}")]
    Generation(#[source] ServiceError),
}

impl SessionError {
    /// Generic, retryable message suitable for showing to a student.
    pub fn user_message(&self) -> &'static str {
        match self {
            SessionError::InvalidConfig(_) => "This exercise is not set up correctly.",
            SessionError::Initialization(_) => {
                "Could not start the exercise. Please try again."
            }
            SessionError::Generation(_) => "Could not prepare the numbers. Please try again.",
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_display() {
        let err = ServiceError::Status {
            status: 503,
            message: "down".into(),
        };
        assert_eq!(err.to_string(), "server error: 503 - down");
    }

    #[test]
    fn session_error_wraps_source() {
        let err = SessionError::Generation(ServiceError::Unavailable("offline".into()));
        assert_eq!(
            err.to_string(),
            "could not generate numbers: service unavailable: offline"
        );
        assert_eq!(
            err.user_message(),
            "Could not prepare the numbers. Please try again."
        );
    }
}
