//! Live-mode consent gate: ask before paying the latency of collaboration

use crate::error::{Error, Result};
use crate::llm_client::SynthesisBackend;
use crate::types::{join_names, AgentName, ChannelId, SessionId};
use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::oneshot;

/// Classification of a free-text reply to the consent prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentReply {
    /// "yes", "go ahead", ...
    Affirmative,
    /// "no", "skip it", ...
    Negative,
    /// Neither, or both
    Unclear,
}

/// Why a consent request ended without permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclineReason {
    /// User said no
    UserDeclined,
    /// Countdown expired without an answer
    TimedOut,
    /// The pending request was replaced or dropped
    Withdrawn,
}

/// Final answer of the consent gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ConsentDecision {
    /// Proceed with collaboration
    Granted,
    /// Answer directly instead
    Declined {
        /// Why
        reason: DeclineReason,
    },
}

/// Result of offering a live message to the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// No consent request is open on this channel
    NotPending,
    /// The reply settled the request
    Decided(ConsentDecision),
    /// Unclear reply; the caller should push the re-prompt
    Reprompt,
    /// Unclear again after the re-prompt; keep waiting for the countdown
    StillWaiting,
}

static NEGATIVE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    phrase_regex(&[
        "no", "nope", "nah", "no thanks", "no thank you", "skip it", "skip", "don't", "do not",
        "not now", "never mind", "nevermind", "just answer", "cancel", "not necessary",
    ])
});

static AFFIRMATIVE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    phrase_regex(&[
        "yes", "yeah", "yep", "yup", "sure", "ok", "okay", "go ahead", "please do", "do it",
        "sounds good", "absolutely", "of course", "let's do it", "go for it", "definitely",
    ])
});

static HEDGING: LazyLock<Option<Regex>> =
    LazyLock::new(|| phrase_regex(&["maybe", "not sure", "don't know", "i guess", "perhaps"]));

fn phrase_regex(phrases: &[&str]) -> Option<Regex> {
    let alternation = phrases.iter().map(|p| regex::escape(p)).collect::<Vec<_>>().join("|");
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternation)).ok()
}

fn matches(re: &Option<Regex>, text: &str) -> bool {
    re.as_ref().is_some_and(|re| re.is_match(text))
}

/// Fast keyword classification of a consent reply
pub fn classify_keywords(text: &str) -> ConsentReply {
    let text = text.replace('’', "'");
    if matches(&HEDGING, &text) {
        return ConsentReply::Unclear;
    }
    match (matches(&AFFIRMATIVE, &text), matches(&NEGATIVE, &text)) {
        (true, false) => ConsentReply::Affirmative,
        (false, true) => ConsentReply::Negative,
        _ => ConsentReply::Unclear,
    }
}

/// Slow-path classifier for replies the keyword match cannot settle
#[async_trait]
pub trait ReplyClassifier: Send + Sync {
    /// Classify `reply` as an answer to `prompt`
    async fn classify_reply(&self, prompt: &str, reply: &str) -> Result<ConsentReply>;
}

const REPLY_SYSTEM_PROMPT: &str = "You classify a user's reply to a yes/no question. \
Answer with exactly one word: YES, NO, or UNCLEAR.";

/// Yes/no classifier backed by an LLM completion
pub struct LlmReplyClassifier {
    backend: Arc<dyn SynthesisBackend>,
}

impl LlmReplyClassifier {
    /// Create a reply classifier on top of a completion backend
    pub fn new(backend: Arc<dyn SynthesisBackend>) -> Self {
        Self { backend }
    }

    fn parse(reply: &str) -> ConsentReply {
        let word = reply
            .trim()
            .trim_matches(|c: char| !c.is_ascii_alphabetic())
            .to_ascii_uppercase();
        match word.as_str() {
            "YES" => ConsentReply::Affirmative,
            "NO" => ConsentReply::Negative,
            _ => ConsentReply::Unclear,
        }
    }
}

#[async_trait]
impl ReplyClassifier for LlmReplyClassifier {
    async fn classify_reply(&self, prompt: &str, reply: &str) -> Result<ConsentReply> {
        let user_prompt = format!("Question: {}\nReply: {}", prompt, reply);
        let answer = self
            .backend
            .complete(REPLY_SYSTEM_PROMPT, &user_prompt)
            .await
            .map_err(|e| Error::classifier(e.to_string()))?;
        Ok(Self::parse(&answer))
    }
}

/// An open consent request on one channel
struct PendingConsent {
    session_id: SessionId,
    prompt: String,
    reprompted: bool,
    decision: oneshot::Sender<ConsentDecision>,
}

/// Tracks open consent requests and settles them
///
/// Each request is settled exactly once: by a decisive reply, by the
/// countdown in [`ConsentGate::await_decision`], or by being withdrawn.
/// Whoever removes the pending entry owns the decision.
pub struct ConsentGate {
    pending: DashMap<ChannelId, PendingConsent>,
    fallback: Option<Arc<dyn ReplyClassifier>>,
    fallback_timeout: Duration,
}

impl ConsentGate {
    /// Create a gate with keyword classification only
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            fallback: None,
            fallback_timeout: Duration::from_secs(5),
        }
    }

    /// Use `classifier` when the keyword match is inconclusive
    pub fn with_fallback(mut self, classifier: Arc<dyn ReplyClassifier>) -> Self {
        self.fallback = Some(classifier);
        self
    }

    /// Treat a fallback classification still running after `timeout` as unclear
    pub fn with_fallback_timeout(mut self, timeout: Duration) -> Self {
        self.fallback_timeout = timeout;
        self
    }

    /// Open a request for `session_id` on `channel_id`.
    ///
    /// A request already open on the channel is withdrawn.
    pub fn open(
        &self,
        channel_id: ChannelId,
        session_id: SessionId,
        prompt: impl Into<String>,
    ) -> oneshot::Receiver<ConsentDecision> {
        let (tx, rx) = oneshot::channel();
        let previous = self.pending.insert(
            channel_id,
            PendingConsent {
                session_id,
                prompt: prompt.into(),
                reprompted: false,
                decision: tx,
            },
        );
        if let Some(previous) = previous {
            let _ = previous.decision.send(ConsentDecision::Declined {
                reason: DeclineReason::Withdrawn,
            });
        }
        rx
    }

    /// Whether a request is open on the channel
    pub fn is_pending(&self, channel_id: &ChannelId) -> bool {
        self.pending.contains_key(channel_id)
    }

    /// Classify a reply: keywords first, then the fallback classifier
    pub async fn classify(&self, prompt: &str, text: &str) -> ConsentReply {
        let fast = classify_keywords(text);
        if fast != ConsentReply::Unclear {
            return fast;
        }
        let Some(fallback) = &self.fallback else {
            return ConsentReply::Unclear;
        };
        match tokio::time::timeout(self.fallback_timeout, fallback.classify_reply(prompt, text)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Reply classifier failed; treating reply as unclear");
                ConsentReply::Unclear
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.fallback_timeout.as_millis() as u64,
                    "Reply classifier timed out; treating reply as unclear"
                );
                ConsentReply::Unclear
            }
        }
    }

    /// Offer a live message to the request open on `channel_id`
    pub async fn offer_reply(&self, channel_id: &ChannelId, text: &str) -> ReplyOutcome {
        // Never hold a map guard across the classifier call
        let Some((session_id, prompt)) = self
            .pending
            .get(channel_id)
            .map(|p| (p.session_id, p.prompt.clone()))
        else {
            return ReplyOutcome::NotPending;
        };

        let decision = match self.classify(&prompt, text).await {
            ConsentReply::Affirmative => ConsentDecision::Granted,
            ConsentReply::Negative => ConsentDecision::Declined {
                reason: DeclineReason::UserDeclined,
            },
            ConsentReply::Unclear => {
                return match self.pending.get_mut(channel_id) {
                    Some(mut p) if p.session_id == session_id => {
                        if p.reprompted {
                            ReplyOutcome::StillWaiting
                        } else {
                            p.reprompted = true;
                            ReplyOutcome::Reprompt
                        }
                    }
                    _ => ReplyOutcome::NotPending,
                };
            }
        };

        match self
            .pending
            .remove_if(channel_id, |_, p| p.session_id == session_id)
        {
            Some((_, pending)) => {
                let _ = pending.decision.send(decision);
                ReplyOutcome::Decided(decision)
            }
            // The countdown expired while we were classifying
            None => ReplyOutcome::NotPending,
        }
    }

    /// Withdraw the request for `session_id`; `true` if it was still open
    pub fn withdraw(&self, channel_id: &ChannelId, session_id: SessionId) -> bool {
        self.pending
            .remove_if(channel_id, |_, p| p.session_id == session_id)
            .is_some()
    }

    /// Wait for the decision, declining when `countdown` expires.
    ///
    /// The countdown is owned by the caller's task and released as soon as
    /// a decision arrives. A reply that wins the race against expiry is
    /// honoured.
    pub async fn await_decision(
        &self,
        channel_id: &ChannelId,
        session_id: SessionId,
        mut decision: oneshot::Receiver<ConsentDecision>,
        countdown: Duration,
    ) -> ConsentDecision {
        let withdrawn = ConsentDecision::Declined {
            reason: DeclineReason::Withdrawn,
        };
        match tokio::time::timeout(countdown, &mut decision).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) => withdrawn,
            Err(_) => {
                if self.withdraw(channel_id, session_id) {
                    ConsentDecision::Declined {
                        reason: DeclineReason::TimedOut,
                    }
                } else {
                    // A reply removed the entry first; its send follows immediately
                    decision.await.unwrap_or(withdrawn)
                }
            }
        }
    }
}

impl Default for ConsentGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Prompt asking the end user for permission
pub fn prompt_message(agents: &[AgentName], estimated_seconds: u64) -> String {
    let duration = if estimated_seconds == 0 {
        "a little longer".to_string()
    } else {
        format!("about {} seconds", estimated_seconds)
    };
    format!(
        "This question could benefit from our {} specialist{}. Consulting them will take {}. \
         Would you like me to check with them?",
        join_names(agents),
        if agents.len() == 1 { "" } else { "s" },
        duration
    )
}

/// Single re-prompt after an unclear reply
pub fn reprompt_message() -> &'static str {
    "Sorry, I didn't catch that. Should I consult the specialists? Please say yes or no."
}

/// Acknowledgement after permission was granted
pub fn accepted_message(agents: &[AgentName]) -> String {
    format!("Great, I'm checking with {} now.", join_names(agents))
}

/// Acknowledgement after an explicit "no"
pub fn declined_message() -> &'static str {
    "No problem, I'll answer directly."
}

/// Notice after the countdown expired
pub fn expired_message() -> &'static str {
    "I didn't hear back, so I'll give you a direct answer instead."
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedClassifier(ConsentReply);

    struct HangingClassifier;

    #[async_trait]
    impl ReplyClassifier for HangingClassifier {
        async fn classify_reply(&self, _prompt: &str, _reply: &str) -> Result<ConsentReply> {
            std::future::pending().await
        }
    }

    #[async_trait]
    impl ReplyClassifier for FixedClassifier {
        async fn classify_reply(&self, _prompt: &str, _reply: &str) -> Result<ConsentReply> {
            Ok(self.0)
        }
    }

    #[test]
    fn test_keyword_classification() {
        assert_eq!(classify_keywords("Yes please"), ConsentReply::Affirmative);
        assert_eq!(classify_keywords("sure, go ahead!"), ConsentReply::Affirmative);
        assert_eq!(classify_keywords("no thanks"), ConsentReply::Negative);
        assert_eq!(classify_keywords("Skip it."), ConsentReply::Negative);
        assert_eq!(classify_keywords("don’t bother"), ConsentReply::Negative);
        assert_eq!(classify_keywords("yes... no"), ConsentReply::Unclear);
        assert_eq!(classify_keywords("I don't know"), ConsentReply::Unclear);
        assert_eq!(classify_keywords("what was the question"), ConsentReply::Unclear);
        // Whole words only
        assert_eq!(classify_keywords("I know the answer"), ConsentReply::Unclear);
    }

    #[test]
    fn test_llm_reply_parsing() {
        assert_eq!(LlmReplyClassifier::parse("YES"), ConsentReply::Affirmative);
        assert_eq!(LlmReplyClassifier::parse(" no."), ConsentReply::Negative);
        assert_eq!(LlmReplyClassifier::parse("It depends"), ConsentReply::Unclear);
    }

    #[test]
    fn test_prompt_mentions_agents_and_duration() {
        let prompt = prompt_message(&[AgentName::new("LEGAL")], 20);
        assert!(prompt.contains("LEGAL specialist."));
        assert!(prompt.contains("about 20 seconds"));
    }

    #[tokio::test]
    async fn test_decisive_reply_settles_request() {
        let gate = ConsentGate::new();
        let channel = ChannelId::new("call-1");
        let session = SessionId::new();
        let rx = gate.open(channel.clone(), session, "consult?");

        assert_eq!(
            gate.offer_reply(&channel, "no thanks").await,
            ReplyOutcome::Decided(ConsentDecision::Declined {
                reason: DeclineReason::UserDeclined
            })
        );
        assert!(!gate.is_pending(&channel));
        let decision = gate
            .await_decision(&channel, session, rx, Duration::from_secs(5))
            .await;
        assert_eq!(
            decision,
            ConsentDecision::Declined {
                reason: DeclineReason::UserDeclined
            }
        );
    }

    #[tokio::test]
    async fn test_unclear_reprompts_once() {
        let gate = ConsentGate::new();
        let channel = ChannelId::new("call-2");
        let _rx = gate.open(channel.clone(), SessionId::new(), "consult?");

        assert_eq!(gate.offer_reply(&channel, "hmm").await, ReplyOutcome::Reprompt);
        assert_eq!(gate.offer_reply(&channel, "what?").await, ReplyOutcome::StillWaiting);
        assert!(gate.is_pending(&channel));
        assert_eq!(
            gate.offer_reply(&channel, "ok").await,
            ReplyOutcome::Decided(ConsentDecision::Granted)
        );
    }

    #[tokio::test]
    async fn test_fallback_classifier_resolves_ambiguity() {
        let gate = ConsentGate::new().with_fallback(Arc::new(FixedClassifier(ConsentReply::Affirmative)));
        let channel = ChannelId::new("call-3");
        let _rx = gate.open(channel.clone(), SessionId::new(), "consult?");

        assert_eq!(
            gate.offer_reply(&channel, "that would be lovely").await,
            ReplyOutcome::Decided(ConsentDecision::Granted)
        );
    }

    #[tokio::test]
    async fn test_hung_fallback_counts_as_unclear() {
        let gate = ConsentGate::new()
            .with_fallback(Arc::new(HangingClassifier))
            .with_fallback_timeout(Duration::from_millis(50));
        let channel = ChannelId::new("call-6");
        let _rx = gate.open(channel.clone(), SessionId::new(), "consult?");

        let started = std::time::Instant::now();
        assert_eq!(
            gate.classify("consult?", "that would be lovely").await,
            ConsentReply::Unclear
        );
        assert_eq!(
            gate.offer_reply(&channel, "that would be lovely").await,
            ReplyOutcome::Reprompt
        );
        assert!(started.elapsed() < Duration::from_secs(1));
        // Keywords never reach the fallback
        assert_eq!(
            gate.offer_reply(&channel, "yes").await,
            ReplyOutcome::Decided(ConsentDecision::Granted)
        );
    }

    #[tokio::test]
    async fn test_countdown_expiry_declines() {
        let gate = ConsentGate::new();
        let channel = ChannelId::new("call-4");
        let session = SessionId::new();
        let rx = gate.open(channel.clone(), session, "consult?");

        let decision = gate
            .await_decision(&channel, session, rx, Duration::from_millis(50))
            .await;
        assert_eq!(
            decision,
            ConsentDecision::Declined {
                reason: DeclineReason::TimedOut
            }
        );
        assert!(!gate.is_pending(&channel));
        // A late reply finds nothing to settle
        assert_eq!(gate.offer_reply(&channel, "yes").await, ReplyOutcome::NotPending);
    }

    #[tokio::test]
    async fn test_reopening_withdraws_previous_request() {
        let gate = ConsentGate::new();
        let channel = ChannelId::new("call-5");
        let first = SessionId::new();
        let rx = gate.open(channel.clone(), first, "consult?");
        let _rx2 = gate.open(channel.clone(), SessionId::new(), "consult again?");

        let decision = gate
            .await_decision(&channel, first, rx, Duration::from_secs(5))
            .await;
        assert_eq!(
            decision,
            ConsentDecision::Declined {
                reason: DeclineReason::Withdrawn
            }
        );
        // The newer request is untouched
        assert!(gate.is_pending(&channel));
    }
}
