use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("no match for '{target}' (synonyms: {synonyms:?})")]
    NoMatch { target: String, synonyms: Vec<String> },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// The browser or page is gone; the owning session must be re-created
    /// before the next operation.
    pub fn is_session_error(&self) -> bool {
        matches!(self, Error::Session(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_match_display_names_target() {
        let err = Error::NoMatch {
            target: "Guest Pay".to_string(),
            synonyms: vec!["pay as guest".to_string()],
        };
        let text = err.to_string();
        assert!(text.contains("Guest Pay"));
        assert!(text.contains("pay as guest"));
    }

    #[test]
    fn test_session_error_classification() {
        assert!(Error::Session("page closed".into()).is_session_error());
        assert!(!Error::Browser("eval failed".into()).is_session_error());
        assert!(!Error::Timeout("click".into()).is_session_error());
    }
}
