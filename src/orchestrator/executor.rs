//! Fan-out executor: one concurrent unit per invited agent

use crate::agent::{AgentContext, AgentLookup, AgentRole};
use crate::config::CollaborationConfig;
use crate::error::Error;
use crate::orchestrator::session::{AgentResponse, SessionHandle};
use crate::types::AgentName;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::Instrument;

/// Summary of one fan-out run
#[derive(Debug, Clone)]
pub struct FanOutReport {
    /// Agents whose units were spawned or skipped, in invitation order
    pub invited: Vec<AgentName>,
    /// Number of real answers recorded
    pub answered: usize,
    /// Whether the group deadline fired before every unit finished
    pub group_timed_out: bool,
    /// Wall-clock time of the whole fan-out
    pub elapsed: Duration,
}

/// Runs invited agents concurrently under individual and group deadlines
#[derive(Debug, Clone)]
pub struct FanOutExecutor {
    agent_timeout: Duration,
    group_timeout: Duration,
}

impl FanOutExecutor {
    /// Create an executor with explicit deadlines
    pub fn new(agent_timeout: Duration, group_timeout: Duration) -> Self {
        Self {
            agent_timeout,
            group_timeout,
        }
    }

    /// Create an executor from the collaboration config
    pub fn from_config(config: &CollaborationConfig) -> Self {
        Self::new(config.agent_timeout, config.group_timeout)
    }

    /// Run every invited agent of `session`, recording each slot as it finishes.
    ///
    /// On return the response map holds exactly one entry per invited agent,
    /// either an answer or a placeholder. Units still running when the group
    /// deadline fires are aborted.
    pub async fn run(&self, session: &SessionHandle, agents: &dyn AgentLookup) -> FanOutReport {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.group_timeout;
        let (session_id, query, channel_id, invited) = session.read(|s| {
            (s.id, s.query.clone(), s.channel_id.clone(), s.invited())
        });

        let mut units = JoinSet::new();
        for (index, name) in invited.iter().enumerate() {
            let Some(worker) = agents.get(name) else {
                tracing::warn!(agent = %name, "Invited agent is not registered");
                session.update(|s| s.record_response(name.clone(), AgentResponse::errored(name, "agent not registered")));
                continue;
            };
            let context = AgentContext {
                session_id,
                role: if index == 0 {
                    AgentRole::Primary
                } else {
                    AgentRole::Supporting
                },
                channel_id: channel_id.clone(),
                invited: invited.clone(),
            };
            let name = name.clone();
            let query = query.clone();
            let timeout = self.agent_timeout;

            units.spawn(
                async move {
                    let unit_start = Instant::now();
                    let response = match tokio::time::timeout(timeout, worker.answer(&query, &context, None)).await {
                        Ok(Ok(text)) if !text.trim().is_empty() => {
                            AgentResponse::answered(text, unit_start.elapsed().as_millis() as u64)
                        }
                        Ok(Ok(_)) => {
                            tracing::warn!(agent = %name, "Agent returned an empty answer");
                            AgentResponse::errored(&name, "empty answer")
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(agent = %name, error = %e, "Agent failed");
                            AgentResponse::errored(&name, e)
                        }
                        Err(_) => {
                            let e = Error::AgentTimeout {
                                agent: name.clone(),
                                timeout,
                            };
                            tracing::warn!(agent = %name, error = %e, "Agent unit cancelled");
                            AgentResponse::timed_out(&name)
                        }
                    };
                    (name, response)
                }
                .in_current_span(),
            );
        }

        let mut group_timed_out = false;
        loop {
            match tokio::time::timeout_at(deadline, units.join_next()).await {
                Ok(Some(Ok((name, response)))) => {
                    tracing::debug!(agent = %name, outcome = ?response.outcome, "Agent unit finished");
                    session.update(|s| s.record_response(name, response));
                }
                Ok(Some(Err(e))) => {
                    // Panicked unit; its slot is filled below
                    tracing::error!(error = %e, "Agent unit aborted");
                }
                Ok(None) => break,
                Err(_) => {
                    group_timed_out = true;
                    tracing::warn!(
                        pending = units.len(),
                        timeout_ms = self.group_timeout.as_millis() as u64,
                        "Group deadline passed; cancelling remaining agents"
                    );
                    units.abort_all();
                    break;
                }
            }
        }

        let answered = session.update(|s| {
            for name in &invited {
                if !s.responses.contains_key(name) {
                    let placeholder = if group_timed_out {
                        AgentResponse::timed_out(name)
                    } else {
                        AgentResponse::errored(name, "unit aborted")
                    };
                    s.record_response(name.clone(), placeholder);
                }
            }
            s.usable_responses()
        });

        FanOutReport {
            invited,
            answered,
            group_timed_out,
            elapsed: started.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentRegistry, WorkerAgent};
    use crate::error::Result;
    use crate::llm_client::TokenSink;
    use crate::orchestrator::session::{CollaborationSession, ResponseOutcome, SessionMode};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Scripted {
        name: AgentName,
        delay: Duration,
        reply: std::result::Result<&'static str, &'static str>,
    }

    #[async_trait]
    impl WorkerAgent for Scripted {
        fn name(&self) -> &AgentName {
            &self.name
        }

        async fn answer(&self, _query: &str, _context: &AgentContext, _sink: Option<TokenSink>) -> Result<String> {
            tokio::time::sleep(self.delay).await;
            match self.reply {
                Ok(text) => Ok(text.to_string()),
                Err(message) => Err(Error::agent(&self.name, message)),
            }
        }
    }

    fn scripted(name: &str, delay_ms: u64, reply: std::result::Result<&'static str, &'static str>) -> Arc<dyn WorkerAgent> {
        Arc::new(Scripted {
            name: AgentName::new(name),
            delay: Duration::from_millis(delay_ms),
            reply,
        })
    }

    fn session(supporting: &[&str]) -> SessionHandle {
        SessionHandle::new(CollaborationSession::new(
            "compare the legal and financial implications",
            AgentName::new("MODERATOR"),
            supporting.iter().map(|n| AgentName::new(*n)).collect(),
            None,
            SessionMode::Batch,
        ))
    }

    #[tokio::test]
    async fn test_slow_agent_gets_placeholder() {
        let agents = AgentRegistry::new()
            .with_agent(scripted("MODERATOR", 5, Ok("overview")))
            .with_agent(scripted("LEGAL", 5, Ok("contract risk")))
            .with_agent(scripted("FINANCIAL", 2_000, Ok("never seen")));
        let handle = session(&["LEGAL", "FINANCIAL"]);

        let report = FanOutExecutor::new(Duration::from_millis(100), Duration::from_secs(5))
            .run(&handle, &agents)
            .await;

        assert_eq!(report.answered, 2);
        assert!(!report.group_timed_out);
        let snapshot = handle.snapshot();
        let financial = &snapshot.responses[&AgentName::new("FINANCIAL")];
        assert_eq!(financial.outcome, ResponseOutcome::TimedOut);
        assert!(financial.text.contains("took too long"));
        assert_eq!(snapshot.responses[&AgentName::new("LEGAL")].text, "contract risk");
    }

    #[tokio::test]
    async fn test_group_deadline_fills_every_key() {
        let agents = AgentRegistry::new()
            .with_agent(scripted("MODERATOR", 5, Ok("overview")))
            .with_agent(scripted("LEGAL", 1_000, Ok("late")))
            .with_agent(scripted("FINANCIAL", 1_000, Ok("late")));
        let handle = session(&["LEGAL", "FINANCIAL"]);

        let report = FanOutExecutor::new(Duration::from_secs(5), Duration::from_millis(100))
            .run(&handle, &agents)
            .await;

        assert!(report.group_timed_out);
        assert!(report.elapsed < Duration::from_millis(900));
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.responses.len(), 3);
        assert_eq!(snapshot.usable_responses(), 1);
    }

    #[tokio::test]
    async fn test_errors_and_unknown_agents_are_absorbed() {
        let agents = AgentRegistry::new()
            .with_agent(scripted("MODERATOR", 1, Err("503 from upstream")))
            .with_agent(scripted("LEGAL", 1, Ok("contract risk")));
        let handle = session(&["LEGAL", "GHOST"]);

        let report = FanOutExecutor::new(Duration::from_secs(1), Duration::from_secs(2))
            .run(&handle, &agents)
            .await;

        assert_eq!(report.answered, 1);
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.responses[&AgentName::new("MODERATOR")].outcome, ResponseOutcome::Errored);
        assert!(snapshot.responses[&AgentName::new("GHOST")].text.contains("not registered"));
    }
}
