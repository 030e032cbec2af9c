//! Batch collaboration example
//!
//! Requires `OPENROUTER_API_KEY` (a `.env` file works).

use confer::prelude::*;
use confer::OpenRouterConfig;
use confer::tracing_ext::{init_tracing, LogFormat};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(LogFormat::Pretty);

    println!("=== Confer Batch Collaboration Example ===\n");

    let config = CollaborationConfig::from_env()?.with_group_timeout(Duration::from_secs(120));
    let openrouter = OpenRouterConfig::from_env()?.with_collaboration_defaults(&config);
    let client: Arc<dyn SynthesisBackend> = Arc::new(OpenRouterClient::new(openrouter)?);
    println!("✓ OpenRouter client initialized ({})", config.synthesis_model);

    let agents = AgentRegistry::new();
    for (name, persona) in [
        (
            "MODERATOR",
            "You are a moderator who gives short, balanced overviews of business questions.",
        ),
        (
            "LEGAL",
            "You are a corporate lawyer. Point out regulatory and contractual risks.",
        ),
        (
            "FINANCIAL",
            "You are a financial analyst. Focus on costs, valuation and cash flow.",
        ),
    ] {
        agents.register(Arc::new(
            LlmAgent::builder()
                .name(name)
                .system_prompt(persona)
                .client(client.clone())
                .build()?,
        ));
    }
    println!("✓ Registered {} agents", agents.len());

    let orchestrator = Orchestrator::builder()
        .config(config)
        .agents(Arc::new(agents))
        .backend(client.clone())
        .classifier(Arc::new(LlmClassifier::new(client)))
        .build()?;

    let query = "Compare the legal and financial implications of acquiring a competitor.";
    let id = orchestrator.start_batch_collaboration(
        query,
        "MODERATOR",
        &["MODERATOR".into(), "LEGAL".into(), "FINANCIAL".into()],
        vec![],
        None,
    )?;
    println!("✓ Session {} started\n", id);

    let answer = orchestrator.await_result(id, None).await?;
    println!("{}\n", answer);

    let session = orchestrator.get_session(id)?;
    println!("Status: {} in {}ms", session.status, session.duration_ms());
    println!(
        "Statistics: {}",
        serde_json::to_string_pretty(&orchestrator.get_statistics())?
    );

    Ok(())
}
