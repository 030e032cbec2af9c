//! Orchestrator module - multi-agent collaboration sessions
//!
//! A query flows through the same pipeline in both modes:
//!
//! - **Classifier**: decides whether collaboration is worth it and whom to invite
//! - **Consent gate** (live mode): asks the end user before paying the latency
//! - **Fan-out executor**: runs the invited agents under individual and group deadlines
//! - **Synthesizer**: merges the answers, falling back to concatenation
//! - **Registry**: owns sessions until retirement and keeps statistics
//!
//! # Example
//!
//! ```rust,ignore
//! use confer::orchestrator::Orchestrator;
//!
//! let orchestrator = Orchestrator::builder()
//!     .agents(agents)
//!     .backend(backend)
//!     .build()?;
//! let id = orchestrator.start_batch_collaboration(query, "MODERATOR", &available, vec![], None)?;
//! let answer = orchestrator.await_result(id, None).await?;
//! ```

pub mod classifier;
pub mod consent;
pub mod engine;
pub mod executor;
pub mod registry;
pub mod session;
pub mod synthesis;

// Re-exports
pub use classifier::{
    classify_or_direct,
    ComplexityAnalysis,
    ComplexityClassifier,
    KeywordClassifier,
    LlmClassifier,
};
pub use consent::{
    classify_keywords,
    ConsentDecision,
    ConsentGate,
    ConsentReply,
    DeclineReason,
    LlmReplyClassifier,
    ReplyClassifier,
    ReplyOutcome,
};
pub use engine::{Orchestrator, OrchestratorBuilder};
pub use executor::{FanOutExecutor, FanOutReport};
pub use registry::{CollaborationStatistics, CompletedRecord, SessionRegistry};
pub use session::{
    AgentResponse,
    CollaborationSession,
    Consent,
    ResponseOutcome,
    ResultCell,
    SessionHandle,
    SessionMode,
    SessionOutcome,
    SessionSnapshot,
    SessionStatus,
};
pub use synthesis::{fallback_concatenation, Synthesis, SynthesisMethod, Synthesizer};
