//! # Confer
//!
//! A multi-agent collaboration orchestrator built with Rust.
//!
//! Given a user query, Confer fans work out to several independent expert
//! agents, bounds their execution in time, tolerates partial failure and
//! merges whatever came back into one coherent answer.
//!
//! ## Features
//!
//! - **Batch mode**: start a session and await its result cell
//! - **Consent-gated live mode**: ask the caller on a live channel before collaborating,
//!   then stream the merged answer back into it
//! - **Bounded fan-out**: individual and group deadlines with placeholder answers
//! - **Never-failing synthesis**: LLM merge with a deterministic fallback
//! - **OpenRouter Integration**: synthesis and classification through a single API
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use confer::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client: Arc<dyn SynthesisBackend> = Arc::new(OpenRouterClient::from_env()?);
//!
//!     let agents = AgentRegistry::new();
//!     for (name, persona) in [
//!         ("MODERATOR", "You give balanced overviews."),
//!         ("LEGAL", "You are a corporate lawyer."),
//!         ("FINANCIAL", "You are a financial analyst."),
//!     ] {
//!         agents.register(Arc::new(
//!             LlmAgent::builder()
//!                 .name(name)
//!                 .system_prompt(persona)
//!                 .client(client.clone())
//!                 .build()?,
//!         ));
//!     }
//!
//!     let orchestrator = Orchestrator::builder()
//!         .agents(Arc::new(agents))
//!         .backend(client)
//!         .build()?;
//!
//!     let id = orchestrator.start_batch_collaboration(
//!         "Compare the legal and financial implications of a merger",
//!         "MODERATOR",
//!         &[],
//!         vec!["LEGAL".into(), "FINANCIAL".into()],
//!         None,
//!     )?;
//!     println!("{}", orchestrator.await_result(id, None).await?);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod agent;
pub mod channel;
pub mod config;
pub mod error;
pub mod llm_client;
pub mod openrouter;
pub mod orchestrator;
pub mod tracing_ext;
pub mod types;

// Re-exports for convenience
pub use agent::{AgentContext, AgentLookup, AgentRegistry, AgentRole, LlmAgent, LlmAgentBuilder, WorkerAgent};
pub use channel::{LiveChannel, StatusNotifier};
pub use config::{CollaborationConfig, OpenRouterConfig, MAX_SUPPORTING_AGENTS};
pub use error::{Error, Result};
pub use llm_client::{SynthesisBackend, TokenSink};
pub use openrouter::{CompletionRequest, OpenRouterClient, StreamChunk};
pub use orchestrator::{
    CollaborationSession, CollaborationStatistics, ComplexityAnalysis, ComplexityClassifier,
    Orchestrator, OrchestratorBuilder, SessionStatus,
};
pub use tracing_ext::{init_tracing, LogFormat};
pub use types::{AgentName, ChannelId, SessionId};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::agent::{AgentRegistry, LlmAgent, WorkerAgent};
    pub use crate::channel::{LiveChannel, StatusNotifier};
    pub use crate::config::CollaborationConfig;
    pub use crate::error::{Error, Result};
    pub use crate::llm_client::SynthesisBackend;
    pub use crate::openrouter::OpenRouterClient;
    pub use crate::orchestrator::{KeywordClassifier, LlmClassifier, Orchestrator};
    pub use crate::types::{AgentName, ChannelId, SessionId};
}
