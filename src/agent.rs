//! Worker agent capability and agent lookup

use crate::error::{Error, Result};
use crate::llm_client::{SynthesisBackend, TokenSink};
use crate::types::{AgentName, ChannelId, SessionId};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Role of an invited agent within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Anchors the response
    Primary,
    /// Augments the primary's answer
    Supporting,
}

/// Context handed to an agent alongside the query
#[derive(Debug, Clone)]
pub struct AgentContext {
    /// Session the answer is for
    pub session_id: SessionId,
    /// This agent's role
    pub role: AgentRole,
    /// Conversation or call the session belongs to
    pub channel_id: Option<ChannelId>,
    /// Every invited agent, primary first
    pub invited: Vec<AgentName>,
}

/// An external capability that answers a query
#[async_trait]
pub trait WorkerAgent: Send + Sync {
    /// Agent identifier
    fn name(&self) -> &AgentName;

    /// Answer `query`, optionally streaming partial tokens into `sink`
    async fn answer(
        &self,
        query: &str,
        context: &AgentContext,
        sink: Option<TokenSink>,
    ) -> Result<String>;
}

/// Resolves agent identifiers to agents
pub trait AgentLookup: Send + Sync {
    /// Find an agent by name
    fn get(&self, name: &AgentName) -> Option<Arc<dyn WorkerAgent>>;

    /// Names of every agent that can be invited
    fn available(&self) -> Vec<AgentName>;
}

/// Concurrent in-memory agent roster
#[derive(Default)]
pub struct AgentRegistry {
    agents: DashMap<AgentName, Arc<dyn WorkerAgent>>,
}

impl AgentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent, replacing any agent with the same name
    pub fn register(&self, agent: Arc<dyn WorkerAgent>) {
        self.agents.insert(agent.name().clone(), agent);
    }

    /// Register an agent, builder style
    pub fn with_agent(self, agent: Arc<dyn WorkerAgent>) -> Self {
        self.register(agent);
        self
    }

    /// Remove an agent
    pub fn unregister(&self, name: &AgentName) -> bool {
        self.agents.remove(name).is_some()
    }

    /// Number of registered agents
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl AgentLookup for AgentRegistry {
    fn get(&self, name: &AgentName) -> Option<Arc<dyn WorkerAgent>> {
        self.agents.get(name).map(|entry| Arc::clone(entry.value()))
    }

    fn available(&self) -> Vec<AgentName> {
        let mut names: Vec<_> = self.agents.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }
}

/// Worker agent backed by an LLM completion with a persona prompt
pub struct LlmAgent {
    name: AgentName,
    system_prompt: String,
    client: Arc<dyn SynthesisBackend>,
}

impl LlmAgent {
    /// Create a new agent builder
    pub fn builder() -> LlmAgentBuilder {
        LlmAgentBuilder::new()
    }

    /// The persona prompt
    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    fn user_prompt(&self, query: &str, context: &AgentContext) -> String {
        match context.role {
            AgentRole::Primary => query.to_string(),
            AgentRole::Supporting => format!(
                "You are one of several specialists consulted on this question. \
                 Focus on your own area of expertise; another agent will merge the answers.\n\n{}",
                query
            ),
        }
    }
}

#[async_trait]
impl WorkerAgent for LlmAgent {
    fn name(&self) -> &AgentName {
        &self.name
    }

    async fn answer(
        &self,
        query: &str,
        context: &AgentContext,
        sink: Option<TokenSink>,
    ) -> Result<String> {
        let prompt = self.user_prompt(query, context);
        let result = match sink {
            Some(sink) => self.client.complete_streaming(&self.system_prompt, &prompt, sink).await,
            None => self.client.complete(&self.system_prompt, &prompt).await,
        };
        result.map_err(|e| Error::agent(&self.name, e.to_string()))
    }
}

/// LLM agent builder
#[derive(Default)]
pub struct LlmAgentBuilder {
    name: Option<AgentName>,
    system_prompt: Option<String>,
    client: Option<Arc<dyn SynthesisBackend>>,
}

impl LlmAgentBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the agent name
    pub fn name(mut self, name: impl Into<AgentName>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the system prompt
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Set the completion backend
    pub fn client(mut self, client: Arc<dyn SynthesisBackend>) -> Self {
        self.client = Some(client);
        self
    }

    /// Build the agent
    pub fn build(self) -> Result<LlmAgent> {
        let name = self.name.ok_or_else(|| Error::config("Agent name is required"))?;
        let system_prompt = self
            .system_prompt
            .ok_or_else(|| Error::config("System prompt is required"))?;
        let client = self
            .client
            .ok_or_else(|| Error::config("LLM client not configured"))?;

        Ok(LlmAgent {
            name,
            system_prompt,
            client,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingBackend {
        prompts: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl SynthesisBackend for RecordingBackend {
        async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
            self.prompts
                .lock()
                .push((system_prompt.to_string(), user_prompt.to_string()));
            Ok("answer".to_string())
        }

        fn backend_type(&self) -> &str {
            "recording"
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl SynthesisBackend for FailingBackend {
        async fn complete(&self, _system_prompt: &str, _user_prompt: &str) -> Result<String> {
            Err(Error::openrouter("503"))
        }

        fn backend_type(&self) -> &str {
            "failing"
        }
    }

    fn context(role: AgentRole) -> AgentContext {
        AgentContext {
            session_id: SessionId::new(),
            role,
            channel_id: None,
            invited: vec![AgentName::new("LEGAL")],
        }
    }

    #[test]
    fn test_builder_requires_fields() {
        assert!(LlmAgent::builder().name("LEGAL").build().is_err());
        assert!(LlmAgent::builder()
            .name("LEGAL")
            .system_prompt("You are a lawyer.")
            .build()
            .is_err());
    }

    #[tokio::test]
    async fn test_supporting_agent_prompt_is_framed() {
        let backend = Arc::new(RecordingBackend {
            prompts: Mutex::new(Vec::new()),
        });
        let agent = LlmAgent::builder()
            .name("LEGAL")
            .system_prompt("You are a lawyer.")
            .client(backend.clone())
            .build()
            .unwrap();

        agent.answer("Is this legal?", &context(AgentRole::Primary), None).await.unwrap();
        agent.answer("Is this legal?", &context(AgentRole::Supporting), None).await.unwrap();

        let prompts = backend.prompts.lock();
        assert_eq!(prompts[0].0, "You are a lawyer.");
        assert_eq!(prompts[0].1, "Is this legal?");
        assert!(prompts[1].1.contains("several specialists"));
        assert!(prompts[1].1.ends_with("Is this legal?"));
    }

    #[tokio::test]
    async fn test_backend_failure_is_agent_error() {
        let agent = LlmAgent::builder()
            .name("FINANCIAL")
            .system_prompt("You are an accountant.")
            .client(Arc::new(FailingBackend))
            .build()
            .unwrap();

        let err = agent.answer("q", &context(AgentRole::Primary), None).await.unwrap_err();
        assert!(matches!(err, Error::Agent { ref agent, .. } if agent.as_str() == "FINANCIAL"));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = AgentRegistry::new().with_agent(Arc::new(
            LlmAgent::builder()
                .name("LEGAL")
                .system_prompt("p")
                .client(Arc::new(FailingBackend))
                .build()
                .unwrap(),
        ));

        assert_eq!(registry.available(), vec![AgentName::new("LEGAL")]);
        assert!(registry.get(&AgentName::new("LEGAL")).is_some());
        assert!(registry.get(&AgentName::new("TAX")).is_none());
        assert!(registry.unregister(&AgentName::new("LEGAL")));
        assert!(registry.is_empty());
    }
}
