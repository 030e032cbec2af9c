//! Merging agent answers into one final text

use crate::error::{Error, Result};
use crate::llm_client::{SynthesisBackend, TokenSink};
use crate::orchestrator::session::CollaborationSession;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

const SYNTHESIS_SYSTEM_PROMPT: &str = "You combine answers from several specialist agents into one \
cohesive reply to the user's question. Attribute each claim to the specialist who made it, resolve \
contradictions explicitly, and make sure every aspect of the question is covered. Some specialists may \
not have answered; mention that only if it matters for the question.";

/// How the final text was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisMethod {
    /// Only one usable answer; returned unchanged
    SingleResponse,
    /// Merged by the synthesis backend
    Llm,
    /// Deterministic concatenation after a backend failure
    Fallback,
}

/// Final text of a session
#[derive(Debug, Clone)]
pub struct Synthesis {
    /// Text delivered to the caller
    pub text: String,
    /// How it was produced
    pub method: SynthesisMethod,
}

/// Default deadline for the synthesis backend
pub const DEFAULT_SYNTHESIS_TIMEOUT: Duration = Duration::from_secs(30);

/// Merges the responses of a session
#[derive(Clone)]
pub struct Synthesizer {
    backend: Arc<dyn SynthesisBackend>,
    timeout: Duration,
}

impl Synthesizer {
    /// Create a synthesizer on top of a completion backend
    pub fn new(backend: Arc<dyn SynthesisBackend>) -> Self {
        Self {
            backend,
            timeout: DEFAULT_SYNTHESIS_TIMEOUT,
        }
    }

    /// Give up on the backend after `timeout` and concatenate instead
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Produce the final text for `session`.
    ///
    /// Fails only when the session has no usable answer. Backend errors,
    /// empty completions and backends still running after the timeout fall
    /// back to [`fallback_concatenation`]. When `sink` is given, completion
    /// tokens are forwarded as they arrive; the sink is dropped on return.
    pub async fn synthesize(&self, session: &CollaborationSession, sink: Option<TokenSink>) -> Result<Synthesis> {
        let mut usable = session
            .invited()
            .into_iter()
            .filter_map(|agent| session.responses.get(&agent).filter(|r| r.is_usable()));
        let Some(first) = usable.next() else {
            return Err(Error::NoResponsesAvailable(format!(
                "none of the {} invited agents answered",
                session.invited().len()
            )));
        };
        if usable.next().is_none() {
            return Ok(Synthesis {
                text: first.text.clone(),
                method: SynthesisMethod::SingleResponse,
            });
        }

        let user_prompt = format!("Question: {}\n\n{}", session.query, fallback_concatenation(session));
        let completion = async {
            match sink {
                Some(sink) => {
                    self.backend
                        .complete_streaming(SYNTHESIS_SYSTEM_PROMPT, &user_prompt, sink)
                        .await
                }
                None => self.backend.complete(SYNTHESIS_SYSTEM_PROMPT, &user_prompt).await,
            }
        };

        let failure = match tokio::time::timeout(self.timeout, completion).await {
            Ok(Ok(text)) if !text.trim().is_empty() => {
                return Ok(Synthesis {
                    text,
                    method: SynthesisMethod::Llm,
                })
            }
            Ok(Ok(_)) => Error::synthesis("backend returned an empty completion"),
            Ok(Err(e)) => Error::synthesis(e.to_string()),
            Err(_) => Error::synthesis(format!("backend did not finish within {:?}", self.timeout)),
        };
        tracing::warn!(
            session_id = %session.id,
            backend = self.backend.backend_type(),
            error = %failure,
            "Synthesis failed; concatenating answers"
        );
        Ok(Synthesis {
            text: fallback_concatenation(session),
            method: SynthesisMethod::Fallback,
        })
    }
}

/// Labelled answers in invitation order, primary first.
///
/// Placeholders are included under their agent's label; agents without a
/// slot are skipped.
pub fn fallback_concatenation(session: &CollaborationSession) -> String {
    let mut text = String::new();
    for (index, agent) in session.invited().iter().enumerate() {
        let Some(response) = session.responses.get(agent) else {
            continue;
        };
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        let label = if index == 0 { "Primary Agent" } else { "Supporting Agent" };
        let _ = write!(text, "{} ({}):\n{}", label, agent, response.text);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::session::{AgentResponse, SessionMode};
    use crate::types::AgentName;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    struct StubBackend {
        reply: std::result::Result<&'static str, &'static str>,
        calls: Mutex<Vec<String>>,
    }

    impl StubBackend {
        fn new(reply: std::result::Result<&'static str, &'static str>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SynthesisBackend for StubBackend {
        async fn complete(&self, _system_prompt: &str, user_prompt: &str) -> Result<String> {
            self.calls.lock().push(user_prompt.to_string());
            self.reply.map(str::to_string).map_err(Error::openrouter)
        }

        fn backend_type(&self) -> &str {
            "stub"
        }
    }

    fn session_with(answers: &[(&str, Option<&str>)]) -> CollaborationSession {
        let names: Vec<AgentName> = answers.iter().map(|(n, _)| AgentName::new(*n)).collect();
        let mut session = CollaborationSession::new(
            "compare the legal and financial implications of X",
            names[0].clone(),
            names[1..].to_vec(),
            None,
            SessionMode::Batch,
        );
        for (name, answer) in answers {
            let agent = AgentName::new(*name);
            let response = match answer {
                Some(text) => AgentResponse::answered(*text, 10),
                None => AgentResponse::errored(&agent, "503"),
            };
            session.record_response(agent, response);
        }
        session
    }

    #[tokio::test]
    async fn test_single_response_skips_backend() {
        let backend = StubBackend::new(Ok("merged"));
        let session = session_with(&[("MODERATOR", Some("only answer")), ("LEGAL", None)]);

        let synthesis = Synthesizer::new(backend.clone()).synthesize(&session, None).await.unwrap();
        assert_eq!(synthesis.text, "only answer");
        assert_eq!(synthesis.method, SynthesisMethod::SingleResponse);
        assert!(backend.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_backend_merges_labelled_answers() {
        let backend = StubBackend::new(Ok("merged answer"));
        let session = session_with(&[
            ("MODERATOR", Some("overview")),
            ("LEGAL", Some("contract risk")),
            ("FINANCIAL", None),
        ]);

        let synthesis = Synthesizer::new(backend.clone()).synthesize(&session, None).await.unwrap();
        assert_eq!(synthesis.method, SynthesisMethod::Llm);
        assert_eq!(synthesis.text, "merged answer");
        let prompt = backend.calls.lock()[0].clone();
        assert!(prompt.starts_with("Question: compare the legal"));
        assert!(prompt.contains("Supporting Agent (LEGAL):\ncontract risk"));
        assert!(prompt.contains("Supporting Agent (FINANCIAL):"));
    }

    #[tokio::test]
    async fn test_backend_failure_falls_back_to_concatenation() {
        let session = session_with(&[
            ("MODERATOR", Some("m")),
            ("LEGAL", Some("l")),
            ("FINANCIAL", Some("f")),
        ]);
        for backend in [StubBackend::new(Err("503")), StubBackend::new(Ok("  "))] {
            let synthesis = Synthesizer::new(backend).synthesize(&session, None).await.unwrap();
            assert_eq!(synthesis.method, SynthesisMethod::Fallback);
            assert_eq!(
                synthesis.text,
                "Primary Agent (MODERATOR):\nm\n\nSupporting Agent (LEGAL):\nl\n\nSupporting Agent (FINANCIAL):\nf"
            );
        }
    }

    struct HangingBackend;

    #[async_trait]
    impl SynthesisBackend for HangingBackend {
        async fn complete(&self, _system_prompt: &str, _user_prompt: &str) -> Result<String> {
            std::future::pending().await
        }

        fn backend_type(&self) -> &str {
            "hanging"
        }
    }

    #[tokio::test]
    async fn test_hung_backend_falls_back_after_timeout() {
        let session = session_with(&[("MODERATOR", Some("m")), ("LEGAL", Some("l"))]);
        let synthesizer = Synthesizer::new(Arc::new(HangingBackend)).with_timeout(Duration::from_millis(50));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let started = std::time::Instant::now();
        let synthesis = synthesizer.synthesize(&session, Some(tx)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(synthesis.method, SynthesisMethod::Fallback);
        assert_eq!(synthesis.text, "Primary Agent (MODERATOR):\nm\n\nSupporting Agent (LEGAL):\nl");
        // The abandoned stream is closed
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_streaming_forwards_tokens() {
        let session = session_with(&[("MODERATOR", Some("m")), ("LEGAL", Some("l"))]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let synthesis = Synthesizer::new(StubBackend::new(Ok("streamed")))
            .synthesize(&session, Some(tx))
            .await
            .unwrap();
        assert_eq!(synthesis.text, "streamed");
        assert_eq!(rx.recv().await.as_deref(), Some("streamed"));
    }

    #[tokio::test]
    async fn test_no_usable_answers_is_an_error() {
        let session = session_with(&[("MODERATOR", None), ("LEGAL", None)]);
        let err = Synthesizer::new(StubBackend::new(Ok("merged")))
            .synthesize(&session, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoResponsesAvailable(_)));
    }
}
