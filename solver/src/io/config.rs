//! Solver configuration stored in a TOML file (default `solver.toml`).
//!
//! Secrets never live in the file: the run secret and API credentials come
//! from the environment (see [`Credentials`]).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::escalation::EscalationPolicy;
use crate::core::types::ModelTier;

pub const DEFAULT_CONFIG_PATH: &str = "solver.toml";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const AIPROXY_BASE_URL: &str = "https://aiproxy.sanand.workers.dev/openai/v1";

/// Solver configuration (TOML).
///
/// Missing fields default to the values a deployed solver runs with.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SolverConfig {
    pub budget: BudgetConfig,
    pub sandbox: SandboxConfig,
    pub reasoner: ReasonerConfig,
    pub renderer: RendererConfig,
    pub submit: SubmitConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BudgetConfig {
    /// Wall-clock ceiling for one run, kept below any outer request timeout.
    pub run_timeout_secs: u64,
    /// Maximum chained tasks per run.
    pub max_steps: u32,
    /// Solve attempts per task.
    pub max_attempts: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            run_timeout_secs: 160,
            max_steps: 10,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Interpreter command; the program file path is appended.
    pub interpreter: Vec<String>,
    pub timeout_secs: u64,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Environment variables removed from the child process.
    pub scrub_env: Vec<String>,
    /// Parent directory for per-execution scratch directories.
    pub work_dir: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: vec!["python3".to_string()],
            timeout_secs: 60,
            output_limit_bytes: 200_000,
            scrub_env: vec![
                "OPENAI_API_KEY".to_string(),
                "AIPROXY_TOKEN".to_string(),
                "USER_SECRET".to_string(),
            ],
            work_dir: None,
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReasonerConfig {
    /// Chat-completions base URL. Unset means OpenAI, or the AI proxy when
    /// `AIPROXY_TOKEN` is present.
    pub base_url: Option<String>,
    pub fast_model: String,
    pub strong_model: String,
    pub transcription_model: String,
    /// Tier per attempt index; the last entry repeats.
    pub escalation: Vec<ModelTier>,
    pub request_timeout_secs: u64,
    /// Maximum bytes for a rendered prompt before sections are dropped.
    pub prompt_budget_bytes: usize,
    /// Refuse to download audio clips larger than this.
    pub max_audio_bytes: usize,
}

impl Default for ReasonerConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            fast_model: "gpt-4o-mini".to_string(),
            strong_model: "gpt-4o".to_string(),
            transcription_model: "whisper-1".to_string(),
            escalation: vec![ModelTier::Fast, ModelTier::Strong],
            request_timeout_secs: 90,
            prompt_budget_bytes: 60_000,
            max_audio_bytes: 25 * 1024 * 1024,
        }
    }
}

impl ReasonerConfig {
    pub fn escalation_policy(&self) -> Result<EscalationPolicy> {
        EscalationPolicy::new(self.escalation.clone())
    }

    /// Base URL to call, given the credentials in use.
    pub fn effective_base_url(&self, credentials: &Credentials) -> String {
        let base = match (&self.base_url, credentials.via_proxy) {
            (Some(url), _) => url.as_str(),
            (None, true) => AIPROXY_BASE_URL,
            (None, false) => OPENAI_BASE_URL,
        };
        base.trim_end_matches('/').to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RendererConfig {
    pub timeout_secs: u64,
    /// Below this many visible characters the raw page body is used instead.
    pub min_text_chars: usize,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            min_text_chars: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SubmitConfig {
    pub timeout_secs: u64,
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Finished runs kept in memory before the oldest are dropped.
    pub max_retained_runs: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8000,
            max_retained_runs: 500,
        }
    }
}

impl SolverConfig {
    pub fn validate(&self) -> Result<()> {
        if self.budget.run_timeout_secs == 0 {
            return Err(anyhow!("budget.run_timeout_secs must be > 0"));
        }
        if self.budget.max_steps == 0 {
            return Err(anyhow!("budget.max_steps must be > 0"));
        }
        if self.budget.max_attempts == 0 {
            return Err(anyhow!("budget.max_attempts must be > 0"));
        }
        if self.sandbox.interpreter.is_empty() || self.sandbox.interpreter[0].trim().is_empty() {
            return Err(anyhow!("sandbox.interpreter must be a non-empty array"));
        }
        if self.sandbox.timeout_secs == 0 {
            return Err(anyhow!("sandbox.timeout_secs must be > 0"));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox.output_limit_bytes must be > 0"));
        }
        if self.reasoner.fast_model.trim().is_empty() || self.reasoner.strong_model.trim().is_empty()
        {
            return Err(anyhow!("reasoner models must be non-empty"));
        }
        if self.reasoner.request_timeout_secs == 0 {
            return Err(anyhow!("reasoner.request_timeout_secs must be > 0"));
        }
        if self.reasoner.prompt_budget_bytes < 1_000 {
            return Err(anyhow!("reasoner.prompt_budget_bytes must be >= 1000"));
        }
        self.reasoner
            .escalation_policy()
            .context("invalid reasoner.escalation")?;
        if self.renderer.timeout_secs == 0 {
            return Err(anyhow!("renderer.timeout_secs must be > 0"));
        }
        if self.submit.timeout_secs == 0 {
            return Err(anyhow!("submit.timeout_secs must be > 0"));
        }
        if self.server.max_retained_runs == 0 {
            return Err(anyhow!("server.max_retained_runs must be > 0"));
        }
        Ok(())
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.budget.run_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SolverConfig::default()`.
pub fn load_config(path: &Path) -> Result<SolverConfig> {
    if !path.exists() {
        let cfg = SolverConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SolverConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Render the effective config as TOML.
pub fn render_config(cfg: &SolverConfig) -> Result<String> {
    toml::to_string_pretty(cfg).context("serialize config toml")
}

/// API credentials for the reasoning service, read from the environment.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: Option<String>,
    /// True when the key is an AI-proxy token.
    pub via_proxy: bool,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("via_proxy", &self.via_proxy)
            .finish()
    }
}

impl Credentials {
    /// `AIPROXY_TOKEN` wins over `OPENAI_API_KEY`; blank values count as unset.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        if let Some(token) = read("AIPROXY_TOKEN") {
            return Self {
                api_key: Some(token),
                via_proxy: true,
            };
        }
        Self {
            api_key: read("OPENAI_API_KEY"),
            via_proxy: false,
        }
    }
}
