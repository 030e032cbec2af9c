//! Complexity classification: is a query worth a multi-agent collaboration?

use crate::error::{Error, Result};
use crate::llm_client::SynthesisBackend;
use crate::types::AgentName;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Classifier verdict for one query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityAnalysis {
    /// Whether collaboration is warranted
    pub is_complex: bool,
    /// Confidence in [0, 1]
    #[serde(default)]
    pub confidence: f32,
    /// Short explanation
    #[serde(default)]
    pub reasoning: String,
    /// Agents to invite as supporting agents
    #[serde(default)]
    pub suggested_agents: Vec<AgentName>,
    /// Expected collaboration time
    #[serde(default)]
    pub estimated_duration_seconds: u64,
}

impl ComplexityAnalysis {
    /// Verdict for "answer directly"
    pub fn direct(reasoning: impl Into<String>) -> Self {
        Self {
            is_complex: false,
            confidence: 0.0,
            reasoning: reasoning.into(),
            suggested_agents: Vec::new(),
            estimated_duration_seconds: 0,
        }
    }

    /// Verdict used when the classifier cannot be reached
    pub fn unavailable() -> Self {
        Self::direct("classifier unavailable")
    }

    /// Keep only invitable suggestions, in order and without duplicates.
    ///
    /// Suggestions outside `candidates` (which never contain the default
    /// agent) are dropped; the list is truncated to `cap`. A complex verdict
    /// left with no agents becomes a direct one.
    pub fn sanitize(mut self, candidates: &[AgentName], cap: usize) -> Self {
        let mut kept: Vec<AgentName> = Vec::new();
        for agent in self.suggested_agents.drain(..) {
            if candidates.contains(&agent) && !kept.contains(&agent) {
                kept.push(agent);
            }
        }
        kept.truncate(cap);
        self.suggested_agents = kept;
        self.confidence = if self.confidence.is_finite() {
            self.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if self.is_complex && self.suggested_agents.is_empty() {
            self.is_complex = false;
            self.reasoning = format!("{} (no invitable agents suggested)", self.reasoning);
        }
        self
    }
}

/// Decides whether a query warrants collaboration
#[async_trait]
pub trait ComplexityClassifier: Send + Sync {
    /// Classify `query` given the invitable agents
    async fn classify(&self, query: &str, available: &[AgentName]) -> Result<ComplexityAnalysis>;
}

/// Classify without ever failing or hanging.
///
/// Short-circuits to a direct answer when no agent besides `default_agent`
/// is available. Classifier errors, and classifiers still running after
/// `deadline`, degrade to [`ComplexityAnalysis::unavailable`].
pub async fn classify_or_direct(
    classifier: &dyn ComplexityClassifier,
    query: &str,
    available: &[AgentName],
    default_agent: Option<&AgentName>,
    cap: usize,
    deadline: Duration,
) -> ComplexityAnalysis {
    let candidates: Vec<AgentName> = available
        .iter()
        .filter(|agent| Some(*agent) != default_agent)
        .cloned()
        .collect();
    if candidates.is_empty() || query.trim().is_empty() {
        return ComplexityAnalysis::direct("no specialist agents available");
    }

    match tokio::time::timeout(deadline, classifier.classify(query, &candidates)).await {
        Ok(Ok(analysis)) => analysis.sanitize(&candidates, cap),
        Ok(Err(e)) if e.is_degradable() => {
            tracing::warn!(error = %e, "Complexity classifier failed; answering directly");
            ComplexityAnalysis::unavailable()
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Complexity classifier misbehaved; answering directly");
            ComplexityAnalysis::unavailable()
        }
        Err(_) => {
            tracing::warn!(timeout_ms = deadline.as_millis() as u64, "Complexity classifier timed out; answering directly");
            ComplexityAnalysis::unavailable()
        }
    }
}

/// Phrases suggesting a query spans several areas of expertise
const MULTI_DOMAIN_CUES: &[&str] = &[
    "compare",
    "comparison",
    "implications",
    "pros and cons",
    "trade-offs",
    "tradeoffs",
    "both",
    "versus",
    "vs",
    "impact on",
    "from every angle",
    "perspectives",
];

/// Heuristic classifier: matches agent keywords and multi-domain cues.
///
/// Each agent matches on its own name plus any registered keywords (whole
/// words, case-insensitive). Two or more matched agents, or one matched
/// agent plus a multi-domain cue, make the query complex.
pub struct KeywordClassifier {
    agent_keywords: HashMap<AgentName, Vec<String>>,
    cues: Option<Regex>,
    seconds_per_agent: u64,
}

impl KeywordClassifier {
    /// Create a classifier with the built-in cue list
    pub fn new() -> Self {
        Self {
            agent_keywords: HashMap::new(),
            cues: word_regex(MULTI_DOMAIN_CUES.iter().copied()),
            seconds_per_agent: 10,
        }
    }

    /// Register extra keywords for an agent
    pub fn with_keywords<I, S>(mut self, agent: impl Into<AgentName>, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.agent_keywords
            .entry(agent.into())
            .or_default()
            .extend(keywords.into_iter().map(Into::into));
        self
    }

    fn matches_agent(&self, query: &str, agent: &AgentName) -> bool {
        let name = agent.as_str().to_lowercase();
        let extra = self.agent_keywords.get(agent).into_iter().flatten().map(String::as_str);
        word_regex(std::iter::once(name.as_str()).chain(extra)).is_some_and(|re| re.is_match(query))
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Case-insensitive whole-word alternation; `None` when there are no words
fn word_regex<'a>(words: impl Iterator<Item = &'a str>) -> Option<Regex> {
    let alternation = words
        .filter(|w| !w.trim().is_empty())
        .map(|w| regex::escape(w.trim()))
        .collect::<Vec<_>>()
        .join("|");
    if alternation.is_empty() {
        return None;
    }
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternation)).ok()
}

#[async_trait]
impl ComplexityClassifier for KeywordClassifier {
    async fn classify(&self, query: &str, available: &[AgentName]) -> Result<ComplexityAnalysis> {
        let matched: Vec<AgentName> = available
            .iter()
            .filter(|agent| self.matches_agent(query, agent))
            .cloned()
            .collect();
        let has_cue = self.cues.as_ref().is_some_and(|re| re.is_match(query));

        let is_complex = matched.len() >= 2 || (matched.len() == 1 && has_cue);
        let confidence = match (matched.len(), has_cue) {
            (0, _) => 0.1,
            (1, false) => 0.3,
            (1, true) => 0.6,
            (_, false) => 0.7,
            (_, true) => 0.9,
        };
        let reasoning = if matched.is_empty() {
            "no specialist domain mentioned".to_string()
        } else {
            format!(
                "mentions {} specialist domain(s){}",
                matched.len(),
                if has_cue { " with a multi-domain cue" } else { "" }
            )
        };
        let estimated_duration_seconds = 10 + self.seconds_per_agent * matched.len() as u64;

        Ok(ComplexityAnalysis {
            is_complex,
            confidence,
            reasoning,
            suggested_agents: if is_complex { matched } else { Vec::new() },
            estimated_duration_seconds: if is_complex { estimated_duration_seconds } else { 0 },
        })
    }
}

const CLASSIFIER_SYSTEM_PROMPT: &str = "You decide whether a user's question needs input from several \
specialist agents. Reply with a single JSON object and nothing else, with the fields: \
is_complex (bool), confidence (number 0-1), reasoning (string), suggested_agents (array of agent \
names taken only from the provided list), estimated_duration_seconds (integer).";

/// LLM-backed classifier returning a JSON verdict
pub struct LlmClassifier {
    backend: Arc<dyn SynthesisBackend>,
}

impl LlmClassifier {
    /// Create a classifier on top of a completion backend
    pub fn new(backend: Arc<dyn SynthesisBackend>) -> Self {
        Self { backend }
    }

    fn user_prompt(query: &str, available: &[AgentName]) -> String {
        let names = available.iter().map(AgentName::as_str).collect::<Vec<_>>().join(", ");
        format!("Available specialist agents: {}\n\nQuestion: {}", names, query)
    }

    /// Parse the model's reply, tolerating prose or code fences around the JSON
    pub fn parse_verdict(reply: &str) -> Result<ComplexityAnalysis> {
        let start = reply.find('{');
        let end = reply.rfind('}');
        match (start, end) {
            (Some(start), Some(end)) if end > start => {
                Ok(serde_json::from_str(&reply[start..=end])?)
            }
            _ => Err(Error::classifier(format!(
                "Classifier reply has no JSON object: {}",
                reply.chars().take(80).collect::<String>()
            ))),
        }
    }
}

#[async_trait]
impl ComplexityClassifier for LlmClassifier {
    async fn classify(&self, query: &str, available: &[AgentName]) -> Result<ComplexityAnalysis> {
        let reply = self
            .backend
            .complete(CLASSIFIER_SYSTEM_PROMPT, &Self::user_prompt(query, available))
            .await
            .map_err(|e| Error::classifier(e.to_string()))?;
        Self::parse_verdict(&reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<AgentName> {
        list.iter().map(|n| AgentName::new(*n)).collect()
    }

    struct BrokenClassifier;

    #[async_trait]
    impl ComplexityClassifier for BrokenClassifier {
        async fn classify(&self, _query: &str, _available: &[AgentName]) -> Result<ComplexityAnalysis> {
            Err(Error::classifier("connection refused"))
        }
    }

    const DEADLINE: Duration = Duration::from_secs(1);

    struct HangingClassifier;

    #[async_trait]
    impl ComplexityClassifier for HangingClassifier {
        async fn classify(&self, _query: &str, _available: &[AgentName]) -> Result<ComplexityAnalysis> {
            std::future::pending().await
        }
    }

    struct EagerClassifier;

    #[async_trait]
    impl ComplexityClassifier for EagerClassifier {
        async fn classify(&self, _query: &str, _available: &[AgentName]) -> Result<ComplexityAnalysis> {
            Ok(ComplexityAnalysis {
                is_complex: true,
                confidence: 1.7,
                reasoning: "everything".into(),
                suggested_agents: names(&["MODERATOR", "LEGAL", "LEGAL", "GHOST", "FINANCIAL", "TAX", "HR"]),
                estimated_duration_seconds: 30,
            })
        }
    }

    #[tokio::test]
    async fn test_keyword_classifier_detects_multi_domain_query() {
        let classifier = KeywordClassifier::new().with_keywords("FINANCIAL", ["finance", "financial", "cost"]);
        let analysis = classifier
            .classify(
                "Compare the legal and financial implications of the merger",
                &names(&["LEGAL", "FINANCIAL"]),
            )
            .await
            .unwrap();
        assert!(analysis.is_complex);
        assert_eq!(analysis.suggested_agents, names(&["LEGAL", "FINANCIAL"]));
        assert!(analysis.confidence > 0.8);
    }

    #[tokio::test]
    async fn test_keyword_classifier_simple_query() {
        let classifier = KeywordClassifier::new();
        let analysis = classifier
            .classify("What time is it?", &names(&["LEGAL", "FINANCIAL"]))
            .await
            .unwrap();
        assert!(!analysis.is_complex);
        assert!(analysis.suggested_agents.is_empty());
    }

    #[tokio::test]
    async fn test_keyword_matches_whole_words_only() {
        let classifier = KeywordClassifier::new().with_keywords("TAX", ["tax"]);
        let analysis = classifier
            .classify("Compare taxonomy approaches", &names(&["TAX"]))
            .await
            .unwrap();
        assert!(!analysis.is_complex);
    }

    #[tokio::test]
    async fn test_failure_degrades_to_direct() {
        let analysis = classify_or_direct(&BrokenClassifier, "q", &names(&["LEGAL"]), None, 3, DEADLINE).await;
        assert!(!analysis.is_complex);
        assert_eq!(analysis.confidence, 0.0);
        assert_eq!(analysis.reasoning, "classifier unavailable");
    }

    #[tokio::test]
    async fn test_hung_classifier_degrades_to_direct() {
        let started = std::time::Instant::now();
        let analysis = classify_or_direct(
            &HangingClassifier,
            "compare the legal and financial risks",
            &names(&["LEGAL", "FINANCIAL"]),
            None,
            3,
            Duration::from_millis(50),
        )
        .await;
        assert!(!analysis.is_complex);
        assert_eq!(analysis, ComplexityAnalysis::unavailable());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_short_circuit_without_candidates() {
        let moderator = AgentName::new("MODERATOR");
        let analysis =
            classify_or_direct(&EagerClassifier, "q", &names(&["MODERATOR"]), Some(&moderator), 3, DEADLINE).await;
        assert!(!analysis.is_complex);
    }

    #[tokio::test]
    async fn test_suggestions_are_sanitized() {
        let moderator = AgentName::new("MODERATOR");
        let analysis = classify_or_direct(
            &EagerClassifier,
            "q",
            &names(&["MODERATOR", "LEGAL", "FINANCIAL", "TAX", "HR"]),
            Some(&moderator),
            3,
            DEADLINE,
        )
        .await;
        assert!(analysis.is_complex);
        assert_eq!(analysis.suggested_agents, names(&["LEGAL", "FINANCIAL", "TAX"]));
        assert_eq!(analysis.confidence, 1.0);
    }

    #[test]
    fn test_parse_verdict_with_surrounding_prose() {
        let reply = "Sure! ```json\n{\"is_complex\": true, \"confidence\": 0.8, \"reasoning\": \"two domains\", \
                     \"suggested_agents\": [\"LEGAL\"], \"estimated_duration_seconds\": 20}\n```";
        let analysis = LlmClassifier::parse_verdict(reply).unwrap();
        assert!(analysis.is_complex);
        assert_eq!(analysis.suggested_agents, names(&["LEGAL"]));
        assert_eq!(analysis.estimated_duration_seconds, 20);

        assert!(LlmClassifier::parse_verdict("I think yes").is_err());
    }
}
