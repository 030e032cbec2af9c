//! Configuration for the orchestrator and its OpenRouter backend

use crate::error::{Error, Result};
use crate::types::AgentName;
use dotenvy::dotenv;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Hard cap on supporting agents per session
pub const MAX_SUPPORTING_AGENTS: usize = 3;

/// Prefix for environment overrides, e.g. `CONFER__GROUP_TIMEOUT=120`
pub const ENV_PREFIX: &str = "CONFER";

/// Tunables for collaboration sessions
///
/// Durations are written as (fractional) seconds in YAML/TOML files and
/// environment variables, so `consent_timeout: 0.1` is 100ms.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaborationConfig {
    /// Deadline for a single agent's answer
    #[serde(with = "secs")]
    pub agent_timeout: Duration,
    /// Deadline for the whole fan-out group, measured from group start
    #[serde(with = "secs")]
    pub group_timeout: Duration,
    /// How long the live consent prompt waits for a reply
    #[serde(with = "secs")]
    pub consent_timeout: Duration,
    /// Delay between the final live push and releasing the channel
    #[serde(with = "secs")]
    pub handoff_grace: Duration,
    /// Deadline for a complexity or consent-reply classification
    #[serde(with = "secs")]
    pub classifier_timeout: Duration,
    /// Deadline for the synthesis backend before falling back to concatenation
    #[serde(with = "secs")]
    pub synthesis_timeout: Duration,
    /// Requested supporting agent cap (never above [`MAX_SUPPORTING_AGENTS`])
    pub max_supporting_agents: usize,
    /// Completed sessions kept for statistics
    pub history_limit: usize,
    /// Primary responder for live sessions; never suggested as a supporting agent
    pub default_agent: Option<AgentName>,
    /// Forward synthesis tokens to the live channel as they arrive
    pub stream_synthesis: bool,
    /// Model for the synthesis backend.
    ///
    /// The orchestrator receives a ready backend and never reads this; apply
    /// it with [`OpenRouterConfig::with_collaboration_defaults`].
    pub synthesis_model: String,
}

impl Default for CollaborationConfig {
    fn default() -> Self {
        Self {
            agent_timeout: Duration::from_secs(30),
            group_timeout: Duration::from_secs(90),
            consent_timeout: Duration::from_secs(10),
            handoff_grace: Duration::from_millis(1500),
            classifier_timeout: Duration::from_secs(5),
            synthesis_timeout: Duration::from_secs(30),
            max_supporting_agents: MAX_SUPPORTING_AGENTS,
            history_limit: 100,
            default_agent: None,
            stream_synthesis: true,
            synthesis_model: presets::BALANCED.to_string(),
        }
    }
}

impl CollaborationConfig {
    /// Load configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::config(format!("Failed to parse YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file (YAML, TOML or JSON by extension),
    /// with `CONFER__*` environment variables taking precedence
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let _ = dotenv();
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(Self::env_source())
            .build()
            .map_err(|e| Error::config(format!("Failed to read configuration: {}", e)))?;
        Self::from_settings(settings)
    }

    /// Load configuration from `CONFER__*` environment variables only
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();
        let settings = config::Config::builder()
            .add_source(Self::env_source())
            .build()
            .map_err(|e| Error::config(format!("Failed to read environment: {}", e)))?;
        Self::from_settings(settings)
    }

    fn env_source() -> config::Environment {
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }

    fn from_settings(settings: config::Config) -> Result<Self> {
        let config: Self = settings
            .try_deserialize()
            .map_err(|e| Error::config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the orchestrator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.agent_timeout.is_zero() {
            return Err(Error::config("agent_timeout must be greater than zero"));
        }
        if self.group_timeout.is_zero() {
            return Err(Error::config("group_timeout must be greater than zero"));
        }
        if self.consent_timeout.is_zero() {
            return Err(Error::config("consent_timeout must be greater than zero"));
        }
        if self.classifier_timeout.is_zero() {
            return Err(Error::config("classifier_timeout must be greater than zero"));
        }
        if self.synthesis_timeout.is_zero() {
            return Err(Error::config("synthesis_timeout must be greater than zero"));
        }
        if self.history_limit == 0 {
            return Err(Error::config("history_limit must be at least 1"));
        }
        Ok(())
    }

    /// Effective supporting agent cap
    pub fn supporting_cap(&self) -> usize {
        self.max_supporting_agents.min(MAX_SUPPORTING_AGENTS)
    }

    /// Set the individual agent timeout
    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    /// Set the group timeout
    pub fn with_group_timeout(mut self, timeout: Duration) -> Self {
        self.group_timeout = timeout;
        self
    }

    /// Set the consent countdown
    pub fn with_consent_timeout(mut self, timeout: Duration) -> Self {
        self.consent_timeout = timeout;
        self
    }

    /// Set the live channel hand-back delay
    pub fn with_handoff_grace(mut self, grace: Duration) -> Self {
        self.handoff_grace = grace;
        self
    }

    /// Set the classifier deadline
    pub fn with_classifier_timeout(mut self, timeout: Duration) -> Self {
        self.classifier_timeout = timeout;
        self
    }

    /// Set the synthesis backend deadline
    pub fn with_synthesis_timeout(mut self, timeout: Duration) -> Self {
        self.synthesis_timeout = timeout;
        self
    }

    /// Set the live-mode primary responder
    pub fn with_default_agent(mut self, agent: impl Into<AgentName>) -> Self {
        self.default_agent = Some(agent.into());
        self
    }

    /// Set the completed-session history size
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }
}

/// Serde adapter for durations expressed as fractional seconds
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// OpenRouter client configuration
#[derive(Clone)]
pub struct OpenRouterConfig {
    /// API key (loaded from environment variable)
    pub api_key: SecretString,
    /// Base URL for OpenRouter API
    pub base_url: Url,
    /// Default model for completions
    pub default_model: String,
    /// Request timeout
    pub timeout: Duration,
    /// App name for OpenRouter tracking
    pub app_name: String,
}

const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

impl OpenRouterConfig {
    /// Create a new OpenRouter configuration from environment
    pub fn from_env() -> Result<Self> {
        // Load .env if present so local development picks up OPENROUTER_API_KEY
        let _ = dotenv();

        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| Error::config("OPENROUTER_API_KEY environment variable not set"))?;

        let mut config = Self::new(api_key)?;
        if let Ok(base) = std::env::var("OPENROUTER_BASE_URL") {
            let url = Url::parse(&base)
                .map_err(|e| Error::config(format!("Invalid OPENROUTER_BASE_URL: {}", e)))?;
            config = config.with_base_url(url);
        }
        Ok(config)
    }

    /// Create a new OpenRouter configuration with a specific API key
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let base_url = Url::parse(OPENROUTER_BASE_URL)
            .map_err(|e| Error::config(format!("Invalid OpenRouter URL: {}", e)))?;
        Ok(Self {
            api_key: SecretString::from(api_key.into()),
            base_url,
            default_model: presets::BALANCED.to_string(),
            timeout: Duration::from_secs(120),
            app_name: "Confer Collaboration Orchestrator".to_string(),
        })
    }

    /// Set the base URL
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = base_url;
        self
    }

    /// Set the default model
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// Adopt the synthesis model of a collaboration config
    pub fn with_collaboration_defaults(self, config: &CollaborationConfig) -> Self {
        self.with_default_model(config.synthesis_model.clone())
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get the API key as a string
    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }

    /// Chat completions endpoint
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.as_str().trim_end_matches('/'))
    }
}

impl std::fmt::Debug for OpenRouterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterConfig")
            .field("api_key", &"***REDACTED***")
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .field("timeout", &self.timeout)
            .field("app_name", &self.app_name)
            .finish()
    }
}

/// Recommended model configurations
pub mod presets {
    /// Balanced performance and cost; default for synthesis
    pub const BALANCED: &str = "anthropic/claude-sonnet-4";

    /// Fast responses, lower cost; suited to yes/no and complexity checks
    pub const FAST: &str = "anthropic/claude-haiku-4";

    /// Recommended for complex reasoning tasks
    pub const REASONING: &str = "anthropic/claude-opus-4";
}
