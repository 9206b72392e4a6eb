//! Carrier gateway: synchronous-accept SMS submission with a typed error
//! taxonomy (transient vs. rejected), so the dispatch worker never has to
//! match on exception identity.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::fmt;
use thiserror::Error;
use tracing::debug;

const CARRIER_API_BASE: &str = "https://api.twilio.com/";

/// Synchronous accept from the carrier; delivery arrives later via callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarrierAccept {
    pub provider_sid: String,
    pub status: String,
}

#[derive(Debug, Error)]
pub enum CarrierError {
    /// Network trouble or carrier-side overload; safe to retry with backoff.
    #[error("transient carrier error: {message}")]
    Transient { status: Option<u16>, message: String },
    /// Semantic rejection; retrying would re-send to someone who opted out
    /// or re-use a number the carrier already refused.
    #[error("carrier rejected send (code {code}): {message}")]
    Rejected { code: i64, message: String },
}

/// Semantic classes of carrier rejection codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    RecipientOptedOut,
    CarrierFiltered,
    RecipientUnreachable,
    /// The *sending* number is the problem; the identity must be blocked.
    SenderBlocked,
    InvalidDestination,
    Unknown,
}

pub fn rejection_kind(code: i64) -> RejectionKind {
    match code {
        21610 => RejectionKind::RecipientOptedOut,
        30007 => RejectionKind::CarrierFiltered,
        30003 | 30004 | 30005 => RejectionKind::RecipientUnreachable,
        21606 | 30006 => RejectionKind::SenderBlocked,
        21211 | 21614 => RejectionKind::InvalidDestination,
        _ => RejectionKind::Unknown,
    }
}

#[async_trait]
pub trait CarrierGateway: Send + Sync {
    async fn send_sms(&self, from: &str, to: &str, body: &str)
        -> Result<CarrierAccept, CarrierError>;
}

#[derive(Clone)]
pub struct HttpCarrierClient {
    http: Client,
    base_url: Url,
    account_sid: String,
    auth_token: String,
}

impl fmt::Debug for HttpCarrierClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpCarrierClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpCarrierClient {
    pub fn new(account_sid: String, auth_token: String) -> Self {
        let base_url = Url::parse(CARRIER_API_BASE).expect("valid default carrier URL");
        Self::with_base_url(account_sid, auth_token, base_url)
    }

    pub fn with_base_url(account_sid: String, auth_token: String, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("campaign-engine/0.1")
            .build()
            .expect("reqwest client");
        Self { http, base_url, account_sid, auth_token }
    }

    pub fn from_config(cfg: &crate::config::Config) -> anyhow::Result<Self> {
        let base_url = Url::parse(&cfg.carrier.base_url)
            .map_err(|e| anyhow::anyhow!("invalid carrier.base_url: {e}"))?;
        Ok(Self::with_base_url(
            cfg.carrier.account_sid.clone(),
            cfg.carrier.auth_token.clone(),
            base_url,
        ))
    }

    pub fn build_request(
        &self,
        from: &str,
        to: &str,
        body: &str,
    ) -> Result<reqwest::Request, CarrierError> {
        let endpoint = self
            .base_url
            .join(&format!("2010-04-01/Accounts/{}/Messages.json", self.account_sid))
            .map_err(|e| CarrierError::Transient {
                status: None,
                message: format!("invalid carrier base URL: {e}"),
            })?;
        self.http
            .post(endpoint)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("From", from), ("To", to), ("Body", body)])
            .build()
            .map_err(|e| CarrierError::Transient {
                status: None,
                message: format!("failed to build carrier request: {e}"),
            })
    }
}

#[derive(Deserialize)]
struct AcceptBody {
    sid: String,
    status: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: Option<i64>,
    message: Option<String>,
}

#[async_trait]
impl CarrierGateway for HttpCarrierClient {
    async fn send_sms(
        &self,
        from: &str,
        to: &str,
        body: &str,
    ) -> Result<CarrierAccept, CarrierError> {
        let request = self.build_request(from, to, body)?;
        debug!(url = %request.url(), to, "submitting message to carrier");
        let res = self.http.execute(request).await.map_err(|e| CarrierError::Transient {
            status: None,
            message: format!("failed to reach carrier: {e}"),
        })?;

        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            let text = res.text().await.unwrap_or_default();
            return Err(CarrierError::Transient {
                status: Some(status.as_u16()),
                message: format!("carrier returned {status}: {text}"),
            });
        }
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            let parsed: ErrorBody =
                serde_json::from_str(&text).unwrap_or(ErrorBody { code: None, message: None });
            return Err(CarrierError::Rejected {
                code: parsed.code.unwrap_or(0),
                message: parsed.message.unwrap_or(text),
            });
        }

        let accepted: AcceptBody = res.json().await.map_err(|e| CarrierError::Transient {
            status: None,
            message: format!("invalid carrier response: {e}"),
        })?;
        Ok(CarrierAccept { provider_sid: accepted.sid, status: accepted.status })
    }
}
