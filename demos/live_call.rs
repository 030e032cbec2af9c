//! Consent-gated live collaboration on a console "call"
//!
//! Every stdin line is a caller turn; pushes into the channel are printed.
//! Requires `OPENROUTER_API_KEY` (a `.env` file works).

use async_trait::async_trait;
use confer::orchestrator::consent::LlmReplyClassifier;
use confer::prelude::*;
use confer::tracing_ext::{init_tracing, LogFormat};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Prints everything pushed into the call
struct ConsoleChannel;

#[async_trait]
impl LiveChannel for ConsoleChannel {
    async fn push(&self, _channel_id: &ChannelId, fragment: &str) -> Result<()> {
        print!("{}", fragment);
        std::io::stdout().flush()?;
        Ok(())
    }

    async fn release(&self, channel_id: &ChannelId) -> Result<()> {
        println!("\n[{} back to normal handling]", channel_id);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(LogFormat::Pretty);

    println!("=== Confer Live Call Example ===\n");

    let client: Arc<dyn SynthesisBackend> = Arc::new(OpenRouterClient::from_env()?);

    let agents = AgentRegistry::new();
    for (name, persona) in [
        ("RECEPTIONIST", "You are a friendly receptionist for a small accounting firm."),
        ("TAX", "You are a tax advisor for small businesses."),
        ("PAYROLL", "You are a payroll specialist."),
    ] {
        agents.register(Arc::new(
            LlmAgent::builder()
                .name(name)
                .system_prompt(persona)
                .client(client.clone())
                .build()?,
        ));
    }

    let classifier = KeywordClassifier::new()
        .with_keywords("TAX", ["tax", "taxes", "deduction", "vat"])
        .with_keywords("PAYROLL", ["payroll", "salary", "salaries", "wages"]);

    let orchestrator = Orchestrator::builder()
        .config(CollaborationConfig::default().with_default_agent("RECEPTIONIST"))
        .agents(Arc::new(agents))
        .backend(client.clone())
        .classifier(Arc::new(classifier))
        .reply_classifier(Arc::new(LlmReplyClassifier::new(client)))
        .live_channel(Arc::new(ConsoleChannel))
        .build()?;

    let call = ChannelId::new("console-call");
    println!("Try: \"How do salaries affect my tax deductions?\" (Ctrl-D to hang up)\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if !orchestrator.handle_live_message(&call, &line).await? {
            println!("[receptionist handles \"{}\" directly]", line.trim());
        }
    }

    Ok(())
}
