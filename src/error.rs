use thiserror::Error;

use crate::session::SessionId;

pub type Result<T> = std::result::Result<T, VisionError>;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("could not open frame source {source_name}: {reason}")]
    SourceOpen { source_name: String, reason: String },

    #[error("frame error: {0}")]
    Frame(String),

    #[error("detection error: {0}")]
    Detection(String),

    #[error("tracking error: {0}")]
    Tracking(String),

    #[error("{stage} stage failed: {reason}")]
    Stage { stage: &'static str, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    #[error("session {0} is closed")]
    SessionClosed(SessionId),
}

impl VisionError {
    /// Only a source that cannot be opened ends a session before it starts.
    /// Everything else degrades a single frame.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VisionError::SourceOpen { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_source_open_is_fatal() {
        let open = VisionError::SourceOpen {
            source_name: "match.mp4".into(),
            reason: "no such file".into(),
        };
        assert!(open.is_fatal());
        assert!(!VisionError::Detection("model crashed".into()).is_fatal());
        assert!(!VisionError::Stage { stage: "tracking", reason: "boom".into() }.is_fatal());
    }

    #[test]
    fn messages_name_the_failing_part() {
        let err = VisionError::Stage { stage: "team", reason: "no samples".into() };
        assert_eq!(err.to_string(), "team stage failed: no samples");
    }
}
