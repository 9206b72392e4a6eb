//! AI text service: inbound classification and reply drafting over an
//! OpenAI-style chat completions endpoint, plus the deterministic guardrails
//! applied to every generated reply before it can reach a handset.

use crate::model::{LeadStatus, Sentiment};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use tracing::debug;

const OPT_OUT_FOOTER: &str = "Reply STOP to opt out.";

const CLASSIFY_SYSTEM_PROMPT: &str = "You classify inbound SMS replies to real-estate \
outreach. Respond with strict JSON only, no prose: \
{\"status\": one of HOT|WARM|NURTURE|DRIP|NOT_INTERESTED|WRONG_NUMBER|DNC|NO_STATUS, \
\"sentiment\": one of POSITIVE|NEUTRAL|NEGATIVE, \
\"tags\": array of short strings, \"confidence\": number 0..1}";

const REPLY_SYSTEM_PROMPT: &str = "You draft a short, friendly SMS reply for a \
real-estate outreach conversation. One or two sentences, plain text, no links, \
no emojis, never promise a price.";

/// Outcome of classifying one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub status: LeadStatus,
    pub sentiment: Sentiment,
    pub tags: Vec<String>,
    pub confidence: f64,
}

#[async_trait]
pub trait AiService: Send + Sync {
    /// Classify an inbound reply given the outbound message it answers.
    async fn classify(&self, inbound_body: &str, last_outbound: Option<&str>)
        -> Result<Classification>;

    /// Draft a conversational reply to an inbound message.
    async fn draft_reply(&self, inbound_body: &str, contact_first_name: Option<&str>)
        -> Result<String>;
}

/// Collapse the model's free-text status into the closed lead-status set.
/// Anything unrecognized degrades to `NO_STATUS` rather than failing.
pub fn normalize_status(raw: &str) -> LeadStatus {
    let canonical: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    match canonical.trim_matches('_') {
        "HOT" => LeadStatus::Hot,
        "WARM" => LeadStatus::Warm,
        "NURTURE" => LeadStatus::Nurture,
        "DRIP" => LeadStatus::Drip,
        "NOT_INTERESTED" => LeadStatus::NotInterested,
        "WRONG_NUMBER" => LeadStatus::WrongNumber,
        "DNC" | "DO_NOT_CONTACT" | "OPT_OUT" => LeadStatus::Dnc,
        _ => LeadStatus::NoStatus,
    }
}

/// Sentiment implied by a lead status, used when the model omits one.
pub fn sentiment_for_status(status: LeadStatus) -> Sentiment {
    match status {
        LeadStatus::Hot | LeadStatus::Warm => Sentiment::Positive,
        LeadStatus::NotInterested | LeadStatus::WrongNumber | LeadStatus::Dnc => {
            Sentiment::Negative
        }
        _ => Sentiment::Neutral,
    }
}

/// Deterministic post-processing for generated replies: trim, cap the length,
/// and guarantee the opt-out footer is present. Generated text is never
/// trusted to carry the footer itself.
pub fn apply_reply_guardrails(draft: &str, max_chars: usize) -> String {
    let mut text = draft.trim().to_string();
    if text.chars().count() > max_chars {
        text = text.chars().take(max_chars.saturating_sub(3)).collect();
        text = text.trim_end().to_string();
        text.push_str("...");
    }
    if !text.to_lowercase().contains("stop") {
        if !text.is_empty() {
            text.push(' ');
        }
        text.push_str(OPT_OUT_FOOTER);
    }
    text
}

#[derive(Clone)]
pub struct HttpAiClient {
    http: Client,
    base_url: Url,
    api_key: String,
    model: String,
    reply_model: String,
}

impl fmt::Debug for HttpAiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpAiClient")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl HttpAiClient {
    pub fn from_config(cfg: &crate::config::Config) -> Result<Self> {
        let base_url =
            Url::parse(&cfg.ai.base_url).map_err(|e| anyhow!("invalid ai.base_url: {e}"))?;
        let http = Client::builder()
            .user_agent("campaign-engine/0.1")
            .build()
            .context("building AI HTTP client")?;
        Ok(Self {
            http,
            base_url,
            api_key: cfg.ai.api_key.clone(),
            model: cfg.ai.model.clone(),
            reply_model: cfg.ai.reply_model.clone(),
        })
    }

    async fn chat(&self, model: &str, system: &str, user: String) -> Result<String> {
        let endpoint = self.base_url.join("v1/chat/completions")?;
        let payload = json!({
            "model": model,
            "temperature": 0.2,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        });
        debug!(url = %endpoint, model, "calling AI chat endpoint");
        let res = self
            .http
            .post(endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .context("failed to reach AI service")?;
        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(anyhow!("AI service returned {status}: {text}"));
        }

        #[derive(Deserialize)]
        struct ChatResponse {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMessage,
        }
        #[derive(Deserialize)]
        struct ChoiceMessage {
            content: String,
        }

        let parsed: ChatResponse = res.json().await.context("invalid AI response body")?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow!("AI response contained no choices"))
    }
}

#[derive(Deserialize)]
struct ClassificationBody {
    status: Option<String>,
    sentiment: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    confidence: Option<f64>,
}

/// Some models wrap JSON in a markdown fence; strip it before parsing.
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

fn parse_classification(raw: &str) -> Result<Classification> {
    let body: ClassificationBody = serde_json::from_str(strip_code_fence(raw))
        .with_context(|| format!("AI classification was not valid JSON: {raw}"))?;
    let status = normalize_status(body.status.as_deref().unwrap_or(""));
    let sentiment = body
        .sentiment
        .as_deref()
        .and_then(Sentiment::parse)
        .unwrap_or_else(|| sentiment_for_status(status));
    Ok(Classification {
        status,
        sentiment,
        tags: body.tags,
        confidence: body.confidence.unwrap_or(0.0).clamp(0.0, 1.0),
    })
}

#[async_trait]
impl AiService for HttpAiClient {
    async fn classify(
        &self,
        inbound_body: &str,
        last_outbound: Option<&str>,
    ) -> Result<Classification> {
        let mut user = String::new();
        if let Some(outbound) = last_outbound {
            user.push_str(&format!("Our last message: {outbound}\n"));
        }
        user.push_str(&format!("Their reply: {inbound_body}"));
        let raw = self.chat(&self.model, CLASSIFY_SYSTEM_PROMPT, user).await?;
        parse_classification(&raw)
    }

    async fn draft_reply(
        &self,
        inbound_body: &str,
        contact_first_name: Option<&str>,
    ) -> Result<String> {
        let mut user = String::new();
        if let Some(name) = contact_first_name {
            user.push_str(&format!("Contact first name: {name}\n"));
        }
        user.push_str(&format!("They wrote: {inbound_body}"));
        self.chat(&self.reply_model, REPLY_SYSTEM_PROMPT, user).await
    }
}
