//! Error types for the collaboration orchestrator

use crate::types::{AgentName, SessionId};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the orchestrator
#[derive(Debug, Error)]
pub enum Error {
    /// The complexity classifier could not produce a verdict
    #[error("Classifier unavailable: {0}")]
    ClassifierUnavailable(String),

    /// A single agent exceeded its individual timeout
    #[error("Agent {agent} timed out after {}ms", timeout.as_millis())]
    AgentTimeout {
        /// Agent that ran out of time
        agent: AgentName,
        /// Individual timeout that expired
        timeout: Duration,
    },

    /// A single agent failed to answer
    #[error("Agent error: {agent}: {message}")]
    Agent {
        /// Failing agent
        agent: AgentName,
        /// Error description
        message: String,
    },

    /// The whole fan-out group hit its deadline
    #[error("Group timeout: {0}")]
    GroupTimeout(String),

    /// The synthesis backend failed or returned nothing
    #[error("Synthesis error: {0}")]
    Synthesis(String),

    /// Every invited agent failed; nothing to synthesize
    #[error("No responses available: {0}")]
    NoResponsesAvailable(String),

    /// Unknown or already evicted session
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// The session has not finished within the caller's wait budget
    #[error("Timed out waiting for session {0}")]
    AwaitTimeout(SessionId),

    /// Attempted a backwards or mode-illegal status transition
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status
        from: String,
        /// Rejected target status
        to: String,
    },

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Live channel sink failure
    #[error("Live channel error: {0}")]
    LiveChannel(String),

    /// Error from the OpenRouter API
    #[error("OpenRouter API error: {0}")]
    OpenRouter(String),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an agent error
    pub fn agent(agent: impl Into<AgentName>, message: impl Into<String>) -> Self {
        Self::Agent {
            agent: agent.into(),
            message: message.into(),
        }
    }

    /// Create a classifier error
    pub fn classifier(msg: impl Into<String>) -> Self {
        Self::ClassifierUnavailable(msg.into())
    }

    /// Create a synthesis error
    pub fn synthesis(msg: impl Into<String>) -> Self {
        Self::Synthesis(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a live channel error
    pub fn live_channel(msg: impl Into<String>) -> Self {
        Self::LiveChannel(msg.into())
    }

    /// Create an OpenRouter error
    pub fn openrouter(msg: impl Into<String>) -> Self {
        Self::OpenRouter(msg.into())
    }

    /// Create an other error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether this error only degrades the quality of an outcome.
    ///
    /// Degradable errors come from collaborators (agents, classifier,
    /// synthesis backend, live channel) and are absorbed at the call site.
    /// Everything else reaches the caller.
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            Self::ClassifierUnavailable(_)
                | Self::AgentTimeout { .. }
                | Self::Agent { .. }
                | Self::Synthesis(_)
                | Self::LiveChannel(_)
                | Self::OpenRouter(_)
                | Self::Http(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_timeout_display() {
        let err = Error::AgentTimeout {
            agent: AgentName::new("LEGAL"),
            timeout: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "Agent LEGAL timed out after 1500ms");
    }

    #[test]
    fn test_degradable_classification() {
        assert!(Error::agent("FINANCIAL", "boom").is_degradable());
        assert!(Error::synthesis("empty").is_degradable());
        assert!(!Error::SessionNotFound(SessionId::new()).is_degradable());
        assert!(!Error::NoResponsesAvailable("all failed".into()).is_degradable());
    }
}
