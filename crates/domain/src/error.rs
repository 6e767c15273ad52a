/// Shared error type used across all parley crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conversation {0} is completed; no further appends are accepted")]
    ClosedConversation(i64),

    #[error("turn mismatch: {0}")]
    TurnMismatch(String),

    #[error("no open turn")]
    NoOpenTurn,

    #[error("agent '{agent}' does not own the open turn (owner: '{owner}')")]
    WrongAgent { agent: String, owner: String },

    #[error("agent '{0}' is not a participant in this conversation")]
    AgentNotPermitted(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// Retryable provider/network failure inside agent or tool flows.
    #[error("transient: {0}")]
    Transient(String),

    /// Unrecoverable host-side condition.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database: {0}")]
    Db(String),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("config: {0}")]
    Config(String),
}

impl Error {
    /// Build a [`Error::Db`] from anything displayable. Keeps rusqlite out
    /// of this crate's dependency graph.
    pub fn db(e: impl std::fmt::Display) -> Self {
        Self::Db(e.to_string())
    }

    /// True when a caller may retry the operation as-is.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Short machine-readable kind used by wire protocols (JSON-RPC error
    /// data, bridge guidance mapping).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::ClosedConversation(_) => "conversation_closed",
            Self::TurnMismatch(_) => "turn_mismatch",
            Self::NoOpenTurn => "no_open_turn",
            Self::WrongAgent { .. } => "wrong_agent",
            Self::AgentNotPermitted(_) => "agent_not_permitted",
            Self::PreconditionFailed(_) => "precondition_failed",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::InvalidEvent(_) => "invalid_event",
            Self::Transient(_) => "transient",
            Self::Fatal(_) => "fatal",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Db(_) => "db",
            Self::Http(_) => "http",
            Self::Config(_) => "config",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_transient() {
        assert!(Error::Transient("x".into()).is_transient());
        assert!(!Error::NoOpenTurn.is_transient());
    }

    #[test]
    fn kind_is_stable() {
        assert_eq!(Error::ClosedConversation(3).kind(), "conversation_closed");
        assert_eq!(
            Error::WrongAgent {
                agent: "a".into(),
                owner: "b".into()
            }
            .kind(),
            "wrong_agent"
        );
    }
}
