//! Collaboration session state machine and result cell

use crate::error::{Error, Result};
use crate::orchestrator::classifier::ComplexityAnalysis;
use crate::types::{AgentName, ChannelId, SessionId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, not yet picked up
    Pending,
    /// Batch session being prepared
    InProgress,
    /// Live session waiting for the user's permission
    AwaitingConsent,
    /// Agents are answering
    Collaborating,
    /// Answers are being merged
    Synthesizing,
    /// Finished with a result
    Completed,
    /// Every invited agent failed
    Failed,
    /// The group deadline passed with nothing usable
    TimedOut,
}

impl SessionStatus {
    /// Position in the forward-only lifecycle
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::InProgress => 1,
            Self::AwaitingConsent => 2,
            Self::Collaborating => 3,
            Self::Synthesizing => 4,
            Self::Completed | Self::Failed | Self::TimedOut => 5,
        }
    }

    /// Whether the session has finished
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    /// Whether `self -> next` moves strictly forward
    pub fn can_advance_to(self, next: SessionStatus) -> bool {
        next.rank() > self.rank()
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::AwaitingConsent => "awaiting_consent",
            Self::Collaborating => "collaborating",
            Self::Synthesizing => "synthesizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        };
        f.write_str(name)
    }
}

/// End user's permission to collaborate (live mode)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consent {
    /// Not asked or not answered yet
    Unknown,
    /// User agreed
    Granted,
    /// User declined or never answered
    Declined,
}

/// Which entry adapter created the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Caller awaits the result cell
    Batch,
    /// Output is pushed into a live channel after consent
    Live,
}

/// How an agent's slot was filled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseOutcome {
    /// Real answer
    Answered,
    /// Individual or group timeout; text is a placeholder
    TimedOut,
    /// Agent errored; text is a placeholder
    Errored,
}

/// One agent's slot in the session's response map
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    /// Answer text or placeholder
    pub text: String,
    /// How the slot was filled
    pub outcome: ResponseOutcome,
    /// Time the agent took, when it finished
    pub elapsed_ms: Option<u64>,
}

impl AgentResponse {
    /// Real answer
    pub fn answered(text: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            text: text.into(),
            outcome: ResponseOutcome::Answered,
            elapsed_ms: Some(elapsed_ms),
        }
    }

    /// Placeholder for an agent that ran out of time
    pub fn timed_out(agent: &AgentName) -> Self {
        Self {
            text: format!(
                "The {} specialist took too long to respond, so their perspective is not included.",
                agent
            ),
            outcome: ResponseOutcome::TimedOut,
            elapsed_ms: None,
        }
    }

    /// Placeholder for an agent that failed
    pub fn errored(agent: &AgentName, error: impl fmt::Display) -> Self {
        Self {
            text: format!("The {} specialist was unable to respond ({}).", agent, error),
            outcome: ResponseOutcome::Errored,
            elapsed_ms: None,
        }
    }

    /// Whether this slot holds a real answer
    pub fn is_usable(&self) -> bool {
        self.outcome == ResponseOutcome::Answered
    }
}

/// Terminal value delivered through the result cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Final text
    Completed(String),
    /// Terminal error
    Failed {
        /// `Failed` or `TimedOut`
        status: SessionStatus,
        /// Error description
        reason: String,
    },
}

impl SessionOutcome {
    /// Convert into the caller-facing result
    pub fn into_result(self) -> Result<String> {
        match self {
            Self::Completed(text) => Ok(text),
            Self::Failed {
                status: SessionStatus::TimedOut,
                reason,
            } => Err(Error::GroupTimeout(reason)),
            Self::Failed { reason, .. } => Err(Error::NoResponsesAvailable(reason)),
        }
    }
}

/// Single-assignment, await-able slot for a session's outcome
#[derive(Debug)]
pub struct ResultCell {
    tx: watch::Sender<Option<SessionOutcome>>,
}

impl ResultCell {
    /// Create an empty cell
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Resolve the cell. Only the first call has any effect.
    pub fn resolve(&self, outcome: SessionOutcome) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }

    /// Current value, if resolved
    pub fn peek(&self) -> Option<SessionOutcome> {
        self.tx.borrow().clone()
    }

    /// Whether the cell has been resolved
    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Wait until the cell is resolved
    #[allow(clippy::let_and_return)]
    pub async fn wait(&self) -> SessionOutcome {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so the channel cannot close under us
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone().unwrap_or_else(closed_outcome),
            Err(_) => closed_outcome(),
        };
        // The watch guard must drop before `rx` does
        outcome
    }
}

fn closed_outcome() -> SessionOutcome {
    SessionOutcome::Failed {
        status: SessionStatus::Failed,
        reason: "result cell closed".to_string(),
    }
}

impl Default for ResultCell {
    fn default() -> Self {
        Self::new()
    }
}

/// One collaboration attempt for one query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationSession {
    /// Unique session identifier
    pub id: SessionId,
    /// Original user text
    pub query: String,
    /// Agent anchoring the answer
    pub primary_agent: AgentName,
    /// Additional invited agents, in invitation order
    pub supporting_agents: Vec<AgentName>,
    /// Conversation or call this session belongs to
    pub channel_id: Option<ChannelId>,
    /// Entry adapter that created the session
    pub mode: SessionMode,
    /// Lifecycle status
    pub status: SessionStatus,
    /// User permission (always granted in batch mode)
    pub consent: Consent,
    /// Answers keyed by agent
    pub responses: HashMap<AgentName, AgentResponse>,
    /// Final text, set only on `Completed`
    pub result: Option<String>,
    /// Last error, set only on `Failed`/`TimedOut`
    pub error: Option<String>,
    /// Classifier verdict that led to this session, if any
    pub analysis: Option<ComplexityAnalysis>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Terminal timestamp
    pub ended_at: Option<DateTime<Utc>>,
}

impl CollaborationSession {
    /// Create a pending session
    pub fn new(
        query: impl Into<String>,
        primary_agent: AgentName,
        supporting_agents: Vec<AgentName>,
        channel_id: Option<ChannelId>,
        mode: SessionMode,
    ) -> Self {
        Self {
            id: SessionId::new(),
            query: query.into(),
            primary_agent,
            supporting_agents,
            channel_id,
            mode,
            status: SessionStatus::Pending,
            consent: match mode {
                SessionMode::Batch => Consent::Granted,
                SessionMode::Live => Consent::Unknown,
            },
            responses: HashMap::new(),
            result: None,
            error: None,
            analysis: None,
            created_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Primary first, then supporting agents in invitation order
    pub fn invited(&self) -> Vec<AgentName> {
        std::iter::once(self.primary_agent.clone())
            .chain(self.supporting_agents.iter().cloned())
            .collect()
    }

    /// Move forward to `next`
    pub fn transition(&mut self, next: SessionStatus) -> Result<()> {
        let illegal = !self.status.can_advance_to(next)
            || (next == SessionStatus::AwaitingConsent && self.mode == SessionMode::Batch);
        if illegal {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Record an agent's slot. An existing answer is never overwritten.
    pub fn record_response(&mut self, agent: AgentName, response: AgentResponse) -> bool {
        if self.responses.contains_key(&agent) {
            return false;
        }
        self.responses.insert(agent, response);
        true
    }

    /// Number of real answers
    pub fn usable_responses(&self) -> usize {
        self.responses.values().filter(|r| r.is_usable()).count()
    }

    /// Wall-clock duration, up to now for unfinished sessions
    pub fn duration_ms(&self) -> u64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.created_at).num_milliseconds().max(0) as u64
    }
}

/// Read-only view of a session handed to callers
pub type SessionSnapshot = CollaborationSession;

struct SessionInner {
    state: RwLock<CollaborationSession>,
    result: ResultCell,
}

/// Shared handle to a session and its result cell
///
/// Terminal transitions and result-cell resolution happen together under
/// the session's write lock, so the cell is resolved iff the status is
/// terminal.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl SessionHandle {
    /// Wrap a session
    pub fn new(session: CollaborationSession) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                state: RwLock::new(session),
                result: ResultCell::new(),
            }),
        }
    }

    /// Session ID
    pub fn id(&self) -> SessionId {
        self.inner.state.read().id
    }

    /// Current status
    pub fn status(&self) -> SessionStatus {
        self.inner.state.read().status
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.state.read().clone()
    }

    /// Read the state under the lock
    pub fn read<R>(&self, f: impl FnOnce(&CollaborationSession) -> R) -> R {
        f(&self.inner.state.read())
    }

    /// Mutate non-terminal fields under the lock
    pub fn update<R>(&self, f: impl FnOnce(&mut CollaborationSession) -> R) -> R {
        f(&mut self.inner.state.write())
    }

    /// Move to a non-terminal status
    pub fn advance(&self, next: SessionStatus) -> Result<()> {
        debug_assert!(!next.is_terminal(), "use complete/fail for terminal states");
        self.inner.state.write().transition(next)
    }

    /// Finish successfully. A no-op if the session already finished.
    pub fn complete(&self, text: impl Into<String>) -> bool {
        let text = text.into();
        let mut state = self.inner.state.write();
        if state.status.is_terminal() || text.trim().is_empty() {
            return false;
        }
        if state.transition(SessionStatus::Completed).is_err() {
            return false;
        }
        state.result = Some(text.clone());
        self.inner.result.resolve(SessionOutcome::Completed(text))
    }

    /// Finish with an error (`Failed` or `TimedOut`). A no-op if already finished.
    pub fn fail(&self, status: SessionStatus, reason: impl Into<String>) -> bool {
        debug_assert!(matches!(status, SessionStatus::Failed | SessionStatus::TimedOut));
        let reason = reason.into();
        let mut state = self.inner.state.write();
        if state.status.is_terminal() || state.transition(status).is_err() {
            return false;
        }
        state.error = Some(reason.clone());
        self.inner.result.resolve(SessionOutcome::Failed { status, reason })
    }

    /// The session's result cell
    pub fn result_cell(&self) -> &ResultCell {
        &self.inner.result
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("SessionHandle")
            .field("id", &state.id)
            .field("status", &state.status)
            .field("resolved", &self.inner.result.is_resolved())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_session() -> CollaborationSession {
        CollaborationSession::new(
            "compare the legal and financial implications",
            AgentName::new("MODERATOR"),
            vec![AgentName::new("LEGAL"), AgentName::new("FINANCIAL")],
            None,
            SessionMode::Batch,
        )
    }

    #[test]
    fn test_transitions_are_forward_only() {
        let mut session = batch_session();
        session.transition(SessionStatus::InProgress).unwrap();
        session.transition(SessionStatus::Collaborating).unwrap();
        assert!(session.transition(SessionStatus::InProgress).is_err());
        assert!(session.transition(SessionStatus::Collaborating).is_err());
        session.transition(SessionStatus::Synthesizing).unwrap();
        session.transition(SessionStatus::Completed).unwrap();
        assert!(session.ended_at.is_some());
        assert!(session.transition(SessionStatus::Failed).is_err());
    }

    #[test]
    fn test_batch_never_awaits_consent() {
        let mut session = batch_session();
        assert_eq!(session.consent, Consent::Granted);
        assert!(session.transition(SessionStatus::AwaitingConsent).is_err());

        let mut live = CollaborationSession::new(
            "q",
            AgentName::new("MODERATOR"),
            vec![],
            Some(ChannelId::new("call-1")),
            SessionMode::Live,
        );
        assert_eq!(live.consent, Consent::Unknown);
        live.transition(SessionStatus::AwaitingConsent).unwrap();
    }

    #[test]
    fn test_recorded_answer_is_never_overwritten() {
        let mut session = batch_session();
        let legal = AgentName::new("LEGAL");
        assert!(session.record_response(legal.clone(), AgentResponse::answered("contract risk", 10)));
        assert!(!session.record_response(legal.clone(), AgentResponse::timed_out(&legal)));
        assert_eq!(session.responses[&legal].text, "contract risk");
        assert_eq!(session.usable_responses(), 1);
    }

    #[test]
    fn test_placeholders() {
        let agent = AgentName::new("FINANCIAL");
        let timed_out = AgentResponse::timed_out(&agent);
        assert!(timed_out.text.contains("took too long"));
        assert!(!timed_out.is_usable());
        let errored = AgentResponse::errored(&agent, "503");
        assert!(errored.text.contains("503"));
        assert_eq!(errored.outcome, ResponseOutcome::Errored);
    }

    #[tokio::test]
    async fn test_result_cell_first_resolution_wins() {
        let cell = ResultCell::new();
        assert!(cell.resolve(SessionOutcome::Completed("first".into())));
        assert!(!cell.resolve(SessionOutcome::Failed {
            status: SessionStatus::TimedOut,
            reason: "late timer".into(),
        }));
        assert_eq!(cell.wait().await, SessionOutcome::Completed("first".into()));
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_resolution() {
        let handle = SessionHandle::new(batch_session());
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.result_cell().wait().await })
        };
        tokio::task::yield_now().await;
        assert!(handle.complete("merged"));
        assert_eq!(waiter.await.unwrap(), SessionOutcome::Completed("merged".into()));
        assert_eq!(handle.status(), SessionStatus::Completed);
    }

    #[test]
    fn test_handle_terminal_is_idempotent() {
        let handle = SessionHandle::new(batch_session());
        assert!(!handle.complete("   "));
        assert!(handle.fail(SessionStatus::Failed, "all agents failed"));
        assert!(!handle.complete("too late"));
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.status, SessionStatus::Failed);
        assert!(snapshot.result.is_none());
        assert_eq!(snapshot.error.as_deref(), Some("all agents failed"));
        assert!(handle.result_cell().is_resolved());
    }

    #[test]
    fn test_outcome_into_result() {
        let err = SessionOutcome::Failed {
            status: SessionStatus::TimedOut,
            reason: "deadline".into(),
        }
        .into_result()
        .unwrap_err();
        assert!(matches!(err, Error::GroupTimeout(_)));
        assert_eq!(
            SessionOutcome::Completed("ok".into()).into_result().unwrap(),
            "ok"
        );
    }
}
