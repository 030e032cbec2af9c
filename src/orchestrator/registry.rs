//! Session registry: active sessions, retirement and statistics

use crate::orchestrator::session::{Consent, SessionHandle, SessionMode, SessionStatus};
use crate::types::{AgentName, SessionId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// Retired handles kept around so late `await_result` calls still see the outcome
const RETIRED_RING: usize = 256;

/// Entry of the completed-session history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedRecord {
    /// Session ID
    pub session_id: SessionId,
    /// Entry adapter
    pub mode: SessionMode,
    /// Final consent state
    pub consent: Consent,
    /// Agents that were actually run
    pub participants: Vec<AgentName>,
    /// Creation to completion
    pub duration_ms: u64,
    /// Completion timestamp
    pub ended_at: DateTime<Utc>,
}

/// Aggregate view over active and finished sessions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollaborationStatistics {
    /// Sessions currently in the registry
    pub active_sessions: usize,
    /// Active sessions by status
    pub active_by_status: BTreeMap<SessionStatus, usize>,
    /// Sessions that reached `Completed` (including declined ones)
    pub total_completed: u64,
    /// Sessions that reached `Failed`
    pub total_failed: u64,
    /// Sessions that reached `TimedOut`
    pub total_timed_out: u64,
    /// Live sessions completed without collaborating
    pub total_declined: u64,
    /// Records in the bounded history
    pub history_len: usize,
    /// Mean duration over the history
    pub average_duration_ms: f64,
    /// How often each agent took part, over the history
    pub agent_participation: BTreeMap<AgentName, u64>,
}

/// Owns every session from creation until retirement
pub struct SessionRegistry {
    active: DashMap<SessionId, SessionHandle>,
    retired: Mutex<VecDeque<SessionHandle>>,
    history: Mutex<VecDeque<CompletedRecord>>,
    history_limit: usize,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    declined: AtomicU64,
}

impl SessionRegistry {
    /// Create an empty registry keeping at most `history_limit` completed records
    pub fn new(history_limit: usize) -> Self {
        Self {
            active: DashMap::new(),
            retired: Mutex::new(VecDeque::new()),
            history: Mutex::new(VecDeque::new()),
            history_limit: history_limit.max(1),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            declined: AtomicU64::new(0),
        }
    }

    /// Insert a session and return its shared handle
    pub fn create(&self, handle: SessionHandle) -> SessionHandle {
        self.active.insert(handle.id(), handle.clone());
        handle
    }

    /// Active session by ID
    pub fn get(&self, id: &SessionId) -> Option<SessionHandle> {
        self.active.get(id).map(|entry| entry.value().clone())
    }

    /// Active or recently retired session by ID
    pub fn lookup(&self, id: &SessionId) -> Option<SessionHandle> {
        self.get(id).or_else(|| {
            self.retired
                .lock()
                .iter()
                .find(|handle| handle.id() == *id)
                .cloned()
        })
    }

    /// Number of active sessions
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Move a terminal session out of the active map.
    ///
    /// Returns `None` if the session is unknown or not yet terminal.
    pub fn retire(&self, id: &SessionId) -> Option<SessionHandle> {
        let (_, handle) = self.active.remove_if(id, |_, handle| handle.status().is_terminal())?;
        let session = handle.snapshot();

        match session.status {
            SessionStatus::Completed => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                if session.consent == Consent::Declined {
                    self.declined.fetch_add(1, Ordering::Relaxed);
                }
                let participants = session
                    .invited()
                    .into_iter()
                    .filter(|agent| session.responses.contains_key(agent))
                    .collect();
                let mut history = self.history.lock();
                if history.len() == self.history_limit {
                    history.pop_front();
                }
                history.push_back(CompletedRecord {
                    session_id: session.id,
                    mode: session.mode,
                    consent: session.consent,
                    participants,
                    duration_ms: session.duration_ms(),
                    ended_at: session.ended_at.unwrap_or_else(Utc::now),
                });
            }
            SessionStatus::TimedOut => {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut retired = self.retired.lock();
        if retired.len() == RETIRED_RING {
            retired.pop_front();
        }
        retired.push_back(handle.clone());

        tracing::debug!(session_id = %id, status = %session.status, "Session retired");
        Some(handle)
    }

    /// Completed-session history, oldest first
    pub fn history(&self) -> Vec<CompletedRecord> {
        self.history.lock().iter().cloned().collect()
    }

    /// Aggregate counts and participation table
    pub fn statistics(&self) -> CollaborationStatistics {
        let mut active_by_status = BTreeMap::new();
        for entry in self.active.iter() {
            *active_by_status.entry(entry.value().status()).or_insert(0) += 1;
        }

        let history = self.history.lock();
        let mut agent_participation = BTreeMap::new();
        for record in history.iter() {
            for agent in &record.participants {
                *agent_participation.entry(agent.clone()).or_insert(0) += 1;
            }
        }
        let average_duration_ms = if history.is_empty() {
            0.0
        } else {
            history.iter().map(|r| r.duration_ms as f64).sum::<f64>() / history.len() as f64
        };

        CollaborationStatistics {
            active_sessions: self.active.len(),
            active_by_status,
            total_completed: self.completed.load(Ordering::Relaxed),
            total_failed: self.failed.load(Ordering::Relaxed),
            total_timed_out: self.timed_out.load(Ordering::Relaxed),
            total_declined: self.declined.load(Ordering::Relaxed),
            history_len: history.len(),
            average_duration_ms,
            agent_participation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::session::{AgentResponse, CollaborationSession};

    fn handle(supporting: &[&str]) -> SessionHandle {
        SessionHandle::new(CollaborationSession::new(
            "q",
            AgentName::new("MODERATOR"),
            supporting.iter().map(|n| AgentName::new(*n)).collect(),
            None,
            SessionMode::Batch,
        ))
    }

    #[test]
    fn test_retire_requires_terminal_status() {
        let registry = SessionRegistry::new(10);
        let session = registry.create(handle(&["LEGAL"]));
        let id = session.id();

        assert!(registry.retire(&id).is_none());
        assert!(registry.get(&id).is_some());

        session.fail(SessionStatus::Failed, "every invited agent failed");
        assert!(registry.retire(&id).is_some());
        assert!(registry.get(&id).is_none());
        // Still reachable for late waiters
        assert!(registry.lookup(&id).is_some());
        assert!(registry.retire(&id).is_none());

        let stats = registry.statistics();
        assert_eq!(stats.total_failed, 1);
        assert_eq!(stats.history_len, 0);
    }

    #[test]
    fn test_history_is_bounded_and_counts_participation() {
        let registry = SessionRegistry::new(2);
        for _ in 0..3 {
            let session = registry.create(handle(&["LEGAL", "FINANCIAL"]));
            session.update(|s| {
                s.record_response(AgentName::new("MODERATOR"), AgentResponse::answered("m", 1));
                s.record_response(AgentName::new("LEGAL"), AgentResponse::answered("l", 1));
            });
            session.complete("merged");
            registry.retire(&session.id());
        }

        let stats = registry.statistics();
        assert_eq!(stats.total_completed, 3);
        assert_eq!(stats.history_len, 2);
        assert_eq!(stats.agent_participation[&AgentName::new("LEGAL")], 2);
        assert!(!stats.agent_participation.contains_key(&AgentName::new("FINANCIAL")));
        assert_eq!(stats.active_sessions, 0);
    }

    #[test]
    fn test_statistics_serialize() {
        let registry = SessionRegistry::new(5);
        let session = registry.create(handle(&[]));
        session.advance(SessionStatus::InProgress).unwrap();

        let json = serde_json::to_value(registry.statistics()).unwrap();
        assert_eq!(json["active_sessions"], 1);
        assert_eq!(json["active_by_status"]["in_progress"], 1);
    }
}
