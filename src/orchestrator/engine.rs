//! Orchestrator facade: batch and live entry adapters over one pipeline

use crate::agent::AgentLookup;
use crate::channel::{LiveChannel, StatusNotifier};
use crate::config::CollaborationConfig;
use crate::error::{Error, Result};
use crate::llm_client::SynthesisBackend;
use crate::orchestrator::classifier::{classify_or_direct, ComplexityClassifier, KeywordClassifier};
use crate::orchestrator::consent::{self, ConsentDecision, ConsentGate, DeclineReason, ReplyClassifier, ReplyOutcome};
use crate::orchestrator::executor::FanOutExecutor;
use crate::orchestrator::registry::{CollaborationStatistics, SessionRegistry};
use crate::orchestrator::session::{
    CollaborationSession, Consent, SessionHandle, SessionMode, SessionSnapshot, SessionStatus,
};
use crate::orchestrator::synthesis::{Synthesis, SynthesisMethod, Synthesizer};
use crate::tracing_ext::session_span;
use crate::types::{AgentName, ChannelId, SessionId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::Instrument;

/// Pushed when collaboration starts, before any agent has answered
pub const HOLD_MESSAGE: &str = "Please hold for a moment while I consult with our specialists.";

/// Pushed before the synthesized answer
pub const FRAMING_MESSAGE: &str = "After consulting with our specialists, here's what we found: ";

/// Pushed when no specialist could answer
pub const FALLBACK_MESSAGE: &str =
    "I'm sorry, our specialists couldn't be reached right now. Let me answer as best I can myself.";

/// Result text of a live session whose consent was declined
pub const DIRECT_ANSWER_NOTICE: &str = "Collaboration declined; the question will be answered directly.";

/// Builder for [`Orchestrator`]
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: Option<CollaborationConfig>,
    agents: Option<Arc<dyn AgentLookup>>,
    backend: Option<Arc<dyn SynthesisBackend>>,
    classifier: Option<Arc<dyn ComplexityClassifier>>,
    reply_classifier: Option<Arc<dyn ReplyClassifier>>,
    channel: Option<Arc<dyn LiveChannel>>,
    notifier: Option<Arc<dyn StatusNotifier>>,
}

impl OrchestratorBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the collaboration config (defaults otherwise)
    pub fn config(mut self, config: CollaborationConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the worker agent lookup
    pub fn agents(mut self, agents: Arc<dyn AgentLookup>) -> Self {
        self.agents = Some(agents);
        self
    }

    /// Set the synthesis backend
    pub fn backend(mut self, backend: Arc<dyn SynthesisBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the complexity classifier (keyword heuristic otherwise)
    pub fn classifier(mut self, classifier: Arc<dyn ComplexityClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Set the fallback classifier for ambiguous consent replies
    pub fn reply_classifier(mut self, classifier: Arc<dyn ReplyClassifier>) -> Self {
        self.reply_classifier = Some(classifier);
        self
    }

    /// Set the live channel sink (required for live mode)
    pub fn live_channel(mut self, channel: Arc<dyn LiveChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Set the typing-indicator notifier
    pub fn notifier(mut self, notifier: Arc<dyn StatusNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Build the orchestrator
    pub fn build(self) -> Result<Orchestrator> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let agents = self
            .agents
            .ok_or_else(|| Error::config("Agent lookup is required"))?;
        let backend = self
            .backend
            .ok_or_else(|| Error::config("Synthesis backend is required"))?;
        let classifier = self
            .classifier
            .unwrap_or_else(|| Arc::new(KeywordClassifier::new()));
        let consent = ConsentGate::new().with_fallback_timeout(config.classifier_timeout);
        let consent = match self.reply_classifier {
            Some(fallback) => consent.with_fallback(fallback),
            None => consent,
        };

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                executor: FanOutExecutor::from_config(&config),
                registry: SessionRegistry::new(config.history_limit),
                synthesizer: Synthesizer::new(backend).with_timeout(config.synthesis_timeout),
                config,
                agents,
                classifier,
                consent,
                channel: self.channel,
                notifier: self.notifier,
                tasks: DashMap::new(),
                live_sessions: DashMap::new(),
            }),
        })
    }
}

struct Inner {
    config: CollaborationConfig,
    agents: Arc<dyn AgentLookup>,
    classifier: Arc<dyn ComplexityClassifier>,
    synthesizer: Synthesizer,
    executor: FanOutExecutor,
    consent: ConsentGate,
    channel: Option<Arc<dyn LiveChannel>>,
    notifier: Option<Arc<dyn StatusNotifier>>,
    registry: SessionRegistry,
    /// Owning task of each active session
    tasks: DashMap<SessionId, AbortHandle>,
    /// Live channel -> session currently collaborating on it
    live_sessions: DashMap<ChannelId, SessionId>,
}

/// Multi-agent collaboration orchestrator
///
/// Cheap to clone; every clone drives the same registry. Each session is
/// driven by exactly one background task, which is the only writer of the
/// session's fields apart from cancellation.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Create a new builder
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// The active configuration
    pub fn config(&self) -> &CollaborationConfig {
        &self.inner.config
    }

    /// Start a batch collaboration and return immediately.
    ///
    /// `supporting_agents` are deduplicated, stripped of the primary agent and
    /// of anything outside `available_agents` (when that list is non-empty),
    /// then truncated to the supporting cap. An empty list asks the
    /// complexity classifier for suggestions in the background.
    pub fn start_batch_collaboration(
        &self,
        query: impl Into<String>,
        primary_agent: impl Into<AgentName>,
        available_agents: &[AgentName],
        supporting_agents: Vec<AgentName>,
        channel_id: Option<ChannelId>,
    ) -> Result<SessionId> {
        let query = query.into();
        if query.trim().is_empty() {
            return Err(Error::InvalidInput("query must not be empty".to_string()));
        }
        let primary_agent = primary_agent.into();
        let cap = self.inner.config.supporting_cap();

        let mut supporting: Vec<AgentName> = Vec::new();
        for agent in supporting_agents {
            if agent == primary_agent || supporting.contains(&agent) {
                continue;
            }
            if !available_agents.is_empty() && !available_agents.contains(&agent) {
                tracing::warn!(agent = %agent, "Requested supporting agent is not available; skipping");
                continue;
            }
            supporting.push(agent);
        }
        if supporting.len() > cap {
            tracing::warn!(
                requested = supporting.len(),
                cap,
                "Too many supporting agents requested; truncating"
            );
            supporting.truncate(cap);
        }

        let session = CollaborationSession::new(query, primary_agent, supporting, channel_id, SessionMode::Batch);
        let handle = self.inner.registry.create(SessionHandle::new(session));
        let id = handle.id();
        tracing::info!(session_id = %id, "Batch collaboration started");

        let inner = Arc::clone(&self.inner);
        let available = available_agents.to_vec();
        let driven = handle.clone();
        self.inner.spawn_driver(&handle, async move {
            inner.run_batch(driven, available).await;
        });
        Ok(id)
    }

    /// Wait for a session's final text.
    ///
    /// Defaults to the group timeout. Returns [`Error::AwaitTimeout`] if the
    /// session is still running; the session is left untouched and can be
    /// awaited again.
    pub async fn await_result(&self, session_id: SessionId, timeout: Option<Duration>) -> Result<String> {
        let handle = self
            .inner
            .registry
            .lookup(&session_id)
            .ok_or(Error::SessionNotFound(session_id))?;
        let timeout = timeout.unwrap_or(self.inner.config.group_timeout);
        match tokio::time::timeout(timeout, handle.result_cell().wait()).await {
            Ok(outcome) => outcome.into_result(),
            Err(_) => Err(Error::AwaitTimeout(session_id)),
        }
    }

    /// Entry point for every turn of a live conversation.
    ///
    /// Returns `true` when the message was consumed: it answered an open
    /// consent prompt, or it started a new collaboration. Returns `false`
    /// when the channel should handle the message itself.
    pub async fn handle_live_message(&self, channel_id: &ChannelId, text: &str) -> Result<bool> {
        let inner = &self.inner;
        match inner.consent.offer_reply(channel_id, text).await {
            ReplyOutcome::NotPending => {}
            ReplyOutcome::Decided(decision) => {
                tracing::debug!(channel_id = %channel_id, ?decision, "Consent reply received");
                return Ok(true);
            }
            ReplyOutcome::Reprompt => {
                inner.push(channel_id, consent::reprompt_message()).await;
                return Ok(true);
            }
            ReplyOutcome::StillWaiting => return Ok(true),
        }

        if text.trim().is_empty() || inner.live_sessions.contains_key(channel_id) {
            return Ok(false);
        }
        if inner.channel.is_none() {
            return Err(Error::config("Live mode requires a live channel"));
        }

        let available = inner.agents.available();
        let default_agent = inner.config.default_agent.as_ref();
        let analysis = classify_or_direct(
            inner.classifier.as_ref(),
            text,
            &available,
            default_agent,
            inner.config.supporting_cap(),
            inner.config.classifier_timeout,
        )
        .await;
        if !analysis.is_complex {
            tracing::debug!(channel_id = %channel_id, reasoning = %analysis.reasoning, "Answering directly");
            return Ok(false);
        }

        let mut suggested = analysis.suggested_agents.clone();
        let primary = match default_agent {
            Some(agent) => agent.clone(),
            None if !suggested.is_empty() => suggested.remove(0),
            None => return Ok(false),
        };
        let mut session = CollaborationSession::new(text, primary, suggested, Some(channel_id.clone()), SessionMode::Live);
        session.analysis = Some(analysis);
        let id = session.id;

        match inner.live_sessions.entry(channel_id.clone()) {
            Entry::Occupied(_) => return Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        let handle = inner.registry.create(SessionHandle::new(session));
        handle.advance(SessionStatus::AwaitingConsent)?;
        let (prompt, estimated) = handle.read(|s| {
            let specialists = if s.supporting_agents.is_empty() {
                s.invited()
            } else {
                s.supporting_agents.clone()
            };
            let estimated = s.analysis.as_ref().map_or(0, |a| a.estimated_duration_seconds);
            (consent::prompt_message(&specialists, estimated), estimated)
        });
        let decision = inner.consent.open(channel_id.clone(), id, prompt.clone());
        tracing::info!(session_id = %id, channel_id = %channel_id, estimated, "Asking for consent to collaborate");
        inner.push(channel_id, &prompt).await;

        let driver = Arc::clone(inner);
        let channel = channel_id.clone();
        let driven = handle.clone();
        inner.spawn_driver(&handle, async move {
            driver.run_live(driven, channel, decision).await;
        });
        Ok(true)
    }

    /// Aggregate counts and participation table
    pub fn get_statistics(&self) -> CollaborationStatistics {
        self.inner.registry.statistics()
    }

    /// Read-only view of an active or recently retired session
    pub fn get_session(&self, session_id: SessionId) -> Result<SessionSnapshot> {
        self.inner
            .registry
            .lookup(&session_id)
            .map(|handle| handle.snapshot())
            .ok_or(Error::SessionNotFound(session_id))
    }

    /// Live session currently bound to `channel_id`, if any
    pub fn live_session(&self, channel_id: &ChannelId) -> Option<SessionId> {
        self.inner.live_sessions.get(channel_id).map(|entry| *entry.value())
    }

    /// Cancel an in-flight session, resolving it as `Failed`.
    ///
    /// Returns `false` if the session had already finished.
    pub async fn cancel(&self, session_id: SessionId) -> Result<bool> {
        let inner = &self.inner;
        let Some(handle) = inner.registry.lookup(&session_id) else {
            return Err(Error::SessionNotFound(session_id));
        };
        if !handle.fail(SessionStatus::Failed, "cancelled") {
            return Ok(false);
        }
        if let Some((_, task)) = inner.tasks.remove(&session_id) {
            task.abort();
        }
        tracing::info!(session_id = %session_id, "Session cancelled");

        inner.registry.retire(&session_id);
        if let Some(channel_id) = handle.read(|s| s.channel_id.clone()) {
            if handle.read(|s| s.mode) == SessionMode::Live {
                inner.consent.withdraw(&channel_id, session_id);
                inner.release_channel(&channel_id).await;
                inner.live_sessions.remove_if(&channel_id, |_, id| *id == session_id);
            }
        }
        inner.notify_finished(&handle).await;
        Ok(true)
    }
}

impl Inner {
    /// Spawn the owning task of a session under its span
    fn spawn_driver<F>(&self, handle: &SessionHandle, driver: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let (id, mode, channel_id) = handle.read(|s| (s.id, s.mode, s.channel_id.clone()));
        let span = session_span(id, mode, channel_id.as_ref());
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(
            async move {
                // Start only once the abort handle is on record
                let _ = registered_rx.await;
                driver.await;
            }
            .instrument(span),
        );
        self.tasks.insert(id, task.abort_handle());
        let _ = registered_tx.send(());
    }

    async fn run_batch(&self, handle: SessionHandle, available: Vec<AgentName>) {
        if let Err(e) = handle.advance(SessionStatus::InProgress) {
            tracing::warn!(error = %e, "Session could not start");
            return;
        }

        if handle.read(|s| s.supporting_agents.is_empty()) {
            let (query, primary) = handle.read(|s| (s.query.clone(), s.primary_agent.clone()));
            let available = if available.is_empty() {
                self.agents.available()
            } else {
                available
            };
            let analysis = classify_or_direct(
                self.classifier.as_ref(),
                &query,
                &available,
                Some(&primary),
                self.config.supporting_cap(),
                self.config.classifier_timeout,
            )
            .await;
            tracing::debug!(is_complex = analysis.is_complex, suggested = ?analysis.suggested_agents, "Classified batch query");
            handle.update(|s| {
                if analysis.is_complex {
                    s.supporting_agents = analysis.suggested_agents.clone();
                }
                s.analysis = Some(analysis);
            });
        }

        self.collaborate(&handle, None).await;
        self.finish(&handle).await;
    }

    async fn run_live(
        &self,
        handle: SessionHandle,
        channel_id: ChannelId,
        decision: oneshot::Receiver<ConsentDecision>,
    ) {
        let id = handle.id();
        let decision = self
            .consent
            .await_decision(&channel_id, id, decision, self.config.consent_timeout)
            .await;
        tracing::info!(?decision, "Consent settled");

        match decision {
            ConsentDecision::Granted => {
                let specialists = handle.read(|s| {
                    if s.supporting_agents.is_empty() {
                        s.invited()
                    } else {
                        s.supporting_agents.clone()
                    }
                });
                handle.update(|s| s.consent = Consent::Granted);
                self.push(&channel_id, &consent::accepted_message(&specialists)).await;
                self.collaborate(&handle, Some(&channel_id)).await;
            }
            ConsentDecision::Declined { reason } => {
                handle.update(|s| s.consent = Consent::Declined);
                match reason {
                    DeclineReason::UserDeclined => self.push(&channel_id, consent::declined_message()).await,
                    DeclineReason::TimedOut => self.push(&channel_id, consent::expired_message()).await,
                    DeclineReason::Withdrawn => {}
                }
                handle.complete(DIRECT_ANSWER_NOTICE);
            }
        }

        self.finish(&handle).await;
        tokio::time::sleep(self.config.handoff_grace).await;
        self.release_channel(&channel_id).await;
        self.live_sessions.remove_if(&channel_id, |_, session| *session == id);
    }

    /// Fan out, then synthesize. Leaves the session terminal.
    async fn collaborate(&self, handle: &SessionHandle, live: Option<&ChannelId>) {
        if let Err(e) = handle.advance(SessionStatus::Collaborating) {
            tracing::warn!(error = %e, "Session could not start collaborating");
            return;
        }
        if let Some(channel_id) = live {
            self.push(channel_id, HOLD_MESSAGE).await;
        }

        let report = self.executor.run(handle, self.agents.as_ref()).await;
        tracing::info!(
            answered = report.answered,
            invited = report.invited.len(),
            group_timed_out = report.group_timed_out,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Fan-out finished"
        );
        if handle.status().is_terminal() {
            return;
        }

        if report.answered == 0 {
            let (status, reason) = if report.group_timed_out {
                (
                    SessionStatus::TimedOut,
                    format!("group deadline of {:?} passed with no usable answer", self.config.group_timeout),
                )
            } else {
                (SessionStatus::Failed, "every invited agent failed".to_string())
            };
            tracing::warn!(status = %status, "Collaboration produced nothing");
            handle.fail(status, reason);
            if let Some(channel_id) = live {
                self.push(channel_id, FALLBACK_MESSAGE).await;
            }
            return;
        }

        if let Err(e) = handle.advance(SessionStatus::Synthesizing) {
            tracing::warn!(error = %e, "Session could not start synthesizing");
            return;
        }
        let snapshot = handle.snapshot();
        let synthesis = match live {
            Some(channel_id) => self.synthesize_live(&snapshot, channel_id).await,
            None => self.synthesizer.synthesize(&snapshot, None).await,
        };
        match synthesis {
            Ok(synthesis) => {
                tracing::info!(method = ?synthesis.method, "Collaboration completed");
                handle.complete(synthesis.text);
            }
            Err(e) => {
                handle.fail(SessionStatus::Failed, e.to_string());
            }
        }
    }

    /// Synthesize while streaming into the live channel after the framing phrase
    async fn synthesize_live(
        &self,
        snapshot: &SessionSnapshot,
        channel_id: &ChannelId,
    ) -> Result<Synthesis> {
        self.push(channel_id, FRAMING_MESSAGE).await;
        if !self.config.stream_synthesis {
            let synthesis = self.synthesizer.synthesize(snapshot, None).await?;
            self.push(channel_id, &synthesis.text).await;
            return Ok(synthesis);
        }

        let (sink, mut tokens) = mpsc::unbounded_channel::<String>();
        let forwarder = async {
            let mut forwarded = 0usize;
            while let Some(token) = tokens.recv().await {
                self.push(channel_id, &token).await;
                forwarded += 1;
            }
            forwarded
        };
        // The sink is dropped when synthesis returns, which ends the forwarder
        let (synthesis, forwarded) = tokio::join!(self.synthesizer.synthesize(snapshot, Some(sink)), forwarder);
        let synthesis = synthesis?;
        if forwarded == 0 || synthesis.method == SynthesisMethod::Fallback {
            self.push(channel_id, &synthesis.text).await;
        }
        Ok(synthesis)
    }

    /// Retire a terminal session and notify the status broadcaster
    async fn finish(&self, handle: &SessionHandle) {
        let id = handle.id();
        self.tasks.remove(&id);
        self.registry.retire(&id);
        self.notify_finished(handle).await;
    }

    async fn notify_finished(&self, handle: &SessionHandle) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let (channel_id, invited) = handle.read(|s| (s.channel_id.clone(), s.invited()));
        if let Err(e) = notifier.clear_typing(channel_id.as_ref(), &invited).await {
            tracing::debug!(error = %channel_failure(e), "Failed to clear typing indicators");
        }
    }

    /// Best-effort push; failures are logged and ignored
    async fn push(&self, channel_id: &ChannelId, text: &str) {
        let Some(channel) = &self.channel else {
            return;
        };
        if let Err(e) = channel.push(channel_id, text).await {
            tracing::warn!(channel_id = %channel_id, error = %channel_failure(e), "Live channel push failed");
        }
    }

    async fn release_channel(&self, channel_id: &ChannelId) {
        let Some(channel) = &self.channel else {
            return;
        };
        if let Err(e) = channel.release(channel_id).await {
            tracing::warn!(channel_id = %channel_id, error = %channel_failure(e), "Failed to release live channel");
        }
    }
}

/// Error of a best-effort channel or notifier call, as absorbed by the session.
///
/// Collaborator errors pass through; anything else is reported as a
/// [`Error::LiveChannel`] failure so it never reads as a session error.
fn channel_failure(err: Error) -> Error {
    if err.is_degradable() {
        err
    } else {
        Error::live_channel(err.to_string())
    }
}
