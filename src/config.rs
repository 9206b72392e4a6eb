//! Configuration loader and validator for the campaign dispatch engine.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub carrier: Carrier,
    pub ai: Ai,
    pub dispatch: Dispatch,
    pub templates: Templates,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub planner_interval_ms: u64,
    pub max_backoff_seconds: u64,
    pub dispatch_workers: u32,
}

/// Carrier gateway credentials and endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Carrier {
    pub account_sid: String,
    pub auth_token: String,
    pub base_url: String,
}

/// AI text service settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ai {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub reply_model: String,
}

/// Dispatch and planning knobs. These feed the policy value objects passed
/// into the planner and workers; nothing reads them ambiently.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dispatch {
    pub message_cost_cents: i64,
    pub max_attempts: i32,
    pub send_window_start_hour: u32,
    pub send_window_end_hour: u32,
    pub score_pause_below: i64,
    pub score_block_below: i64,
    pub reply_max_chars: usize,
}

/// Message template sources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Templates {
    pub csv_path: String,
}

/// Planner inputs, passed explicitly at call time.
#[derive(Debug, Clone, Copy)]
pub struct PlannerPolicy {
    pub send_window_start_hour: u32,
    pub send_window_end_hour: u32,
    pub max_attempts: i32,
}

/// Dispatch-worker inputs, passed explicitly at call time.
#[derive(Debug, Clone, Copy)]
pub struct DispatchPolicy {
    pub message_cost_cents: i64,
    pub max_backoff_secs: i64,
    pub score_pause_below: i64,
    pub score_block_below: i64,
    pub reply_max_chars: usize,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn planner_policy(&self) -> PlannerPolicy {
        PlannerPolicy {
            send_window_start_hour: self.dispatch.send_window_start_hour,
            send_window_end_hour: self.dispatch.send_window_end_hour,
            max_attempts: self.dispatch.max_attempts,
        }
    }

    pub fn dispatch_policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            message_cost_cents: self.dispatch.message_cost_cents,
            max_backoff_secs: self.app.max_backoff_seconds as i64,
            score_pause_below: self.dispatch.score_pause_below,
            score_block_below: self.dispatch.score_block_below,
            reply_max_chars: self.dispatch.reply_max_chars,
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.planner_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.planner_interval_ms must be > 0"));
    }
    if cfg.app.dispatch_workers == 0 {
        return Err(ConfigError::Invalid("app.dispatch_workers must be > 0"));
    }

    if cfg.carrier.account_sid.trim().is_empty() {
        return Err(ConfigError::Invalid("carrier.account_sid must be non-empty"));
    }
    if cfg.carrier.auth_token.trim().is_empty() {
        return Err(ConfigError::Invalid("carrier.auth_token must be non-empty"));
    }
    if cfg.carrier.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("carrier.base_url must be non-empty"));
    }

    if cfg.ai.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("ai.api_key must be non-empty"));
    }
    if cfg.ai.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("ai.base_url must be non-empty"));
    }
    if cfg.ai.model.trim().is_empty() {
        return Err(ConfigError::Invalid("ai.model must be non-empty"));
    }
    if cfg.ai.reply_model.trim().is_empty() {
        return Err(ConfigError::Invalid("ai.reply_model must be non-empty"));
    }

    if cfg.dispatch.message_cost_cents <= 0 {
        return Err(ConfigError::Invalid("dispatch.message_cost_cents must be > 0"));
    }
    if cfg.dispatch.max_attempts <= 0 {
        return Err(ConfigError::Invalid("dispatch.max_attempts must be > 0"));
    }
    if cfg.dispatch.send_window_start_hour >= cfg.dispatch.send_window_end_hour {
        return Err(ConfigError::Invalid(
            "dispatch.send_window_start_hour must be before send_window_end_hour",
        ));
    }
    if cfg.dispatch.send_window_end_hour > 24 {
        return Err(ConfigError::Invalid("dispatch.send_window_end_hour must be <= 24"));
    }
    if cfg.dispatch.score_block_below >= cfg.dispatch.score_pause_below {
        return Err(ConfigError::Invalid(
            "dispatch.score_block_below must be below score_pause_below",
        ));
    }
    if cfg.dispatch.reply_max_chars < 40 {
        return Err(ConfigError::Invalid("dispatch.reply_max_chars must be >= 40"));
    }

    if cfg.templates.csv_path.trim().is_empty() {
        return Err(ConfigError::Invalid("templates.csv_path must be non-empty"));
    }

    Ok(())
}

/// Canonical example config, also used as a fixture by tests.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  planner_interval_ms: 60000
  max_backoff_seconds: 3600
  dispatch_workers: 2

carrier:
  account_sid: "YOUR_CARRIER_ACCOUNT_SID"
  auth_token: "YOUR_CARRIER_AUTH_TOKEN"
  base_url: "https://api.twilio.com/"

ai:
  api_key: "YOUR_LLM_API_KEY"
  base_url: "https://api.openai.com/"
  model: "gpt-4o-mini"
  reply_model: "gpt-4o-mini"

dispatch:
  message_cost_cents: 1
  max_attempts: 5
  send_window_start_hour: 7
  send_window_end_hour: 19
  score_pause_below: 50
  score_block_below: 25
  reply_max_chars: 320

templates:
  csv_path: "./templates.csv"
"#
}
