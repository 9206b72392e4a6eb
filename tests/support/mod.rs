#![allow(dead_code)]

use async_trait::async_trait;
use campaign_engine::ai::{AiService, Classification};
use campaign_engine::carrier::{CarrierAccept, CarrierError, CarrierGateway};
use campaign_engine::config::{DispatchPolicy, PlannerPolicy};
use campaign_engine::db::{self, Pool};
use campaign_engine::model::{LeadStatus, Sentiment};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

pub async fn setup_pool() -> Pool {
    let pool = Pool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub fn planner_policy() -> PlannerPolicy {
    // An always-open window keeps test sends due immediately.
    PlannerPolicy { send_window_start_hour: 0, send_window_end_hour: 24, max_attempts: 5 }
}

pub fn dispatch_policy() -> DispatchPolicy {
    DispatchPolicy {
        message_cost_cents: 1,
        max_backoff_secs: 3600,
        score_pause_below: 50,
        score_block_below: 25,
        reply_max_chars: 320,
    }
}

/// Next carrier response a [`FakeCarrier`] will produce.
pub enum Scripted {
    Accept,
    Transient,
    Rejected(i64),
}

/// Recording carrier double: every accepted send is captured as
/// (from, to, body); failures can be scripted ahead of time.
#[derive(Default)]
pub struct FakeCarrier {
    pub sent: Mutex<Vec<(String, String, String)>>,
    script: Mutex<VecDeque<Scripted>>,
    counter: AtomicUsize,
}

impl FakeCarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, outcome: Scripted) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl CarrierGateway for FakeCarrier {
    async fn send_sms(
        &self,
        from: &str,
        to: &str,
        body: &str,
    ) -> Result<CarrierAccept, CarrierError> {
        let outcome = self.script.lock().unwrap().pop_front().unwrap_or(Scripted::Accept);
        match outcome {
            Scripted::Accept => {
                self.sent.lock().unwrap().push((from.into(), to.into(), body.into()));
                let n = self.counter.fetch_add(1, Ordering::SeqCst);
                Ok(CarrierAccept { provider_sid: format!("SM{n:08}"), status: "queued".into() })
            }
            Scripted::Transient => Err(CarrierError::Transient {
                status: Some(503),
                message: "service unavailable".into(),
            }),
            Scripted::Rejected(code) => {
                Err(CarrierError::Rejected { code, message: "rejected".into() })
            }
        }
    }
}

/// AI double with a fixed classification and reply text; classification can
/// be switched to fail for outage scenarios.
pub struct FakeAi {
    pub classification: Mutex<Classification>,
    pub reply: Mutex<String>,
    pub classify_calls: AtomicUsize,
    pub reply_calls: AtomicUsize,
    pub fail_classify: AtomicBool,
}

impl FakeAi {
    pub fn new() -> Self {
        Self {
            classification: Mutex::new(Classification {
                status: LeadStatus::Warm,
                sentiment: Sentiment::Positive,
                tags: vec!["interested".into()],
                confidence: 0.8,
            }),
            reply: Mutex::new("Thanks for getting back to us!".into()),
            classify_calls: AtomicUsize::new(0),
            reply_calls: AtomicUsize::new(0),
            fail_classify: AtomicBool::new(false),
        }
    }

    pub fn set_classification(&self, c: Classification) {
        *self.classification.lock().unwrap() = c;
    }
}

#[async_trait]
impl AiService for FakeAi {
    async fn classify(
        &self,
        _inbound_body: &str,
        _last_outbound: Option<&str>,
    ) -> anyhow::Result<Classification> {
        self.classify_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_classify.load(Ordering::SeqCst) {
            anyhow::bail!("model unavailable");
        }
        Ok(self.classification.lock().unwrap().clone())
    }

    async fn draft_reply(
        &self,
        _inbound_body: &str,
        _contact_first_name: Option<&str>,
    ) -> anyhow::Result<String> {
        self.reply_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.reply.lock().unwrap().clone())
    }
}

/// One funded tenant with a running campaign, one active number, and one
/// fresh contact, ready for a plan/dispatch cycle.
pub struct Tenant {
    pub org: i64,
    pub campaign: i64,
    pub number: i64,
    pub contact: i64,
}

pub async fn seed_tenant(pool: &Pool, wallet_cents: i64) -> Tenant {
    let org = db::create_org(pool, "acme", "UTC", wallet_cents, None).await.unwrap();
    let campaign = db::create_campaign(pool, org, "spring outreach", 50, 30).await.unwrap();
    db::set_campaign_status(pool, campaign, campaign_engine::model::CampaignStatus::Running)
        .await
        .unwrap();
    let number = db::create_number(pool, org, "+15559990001", 60).await.unwrap();
    let contact =
        db::create_contact(pool, org, "+15550001111", Some("Ana"), Some("12 Oak St"))
            .await
            .unwrap();
    Tenant { org, campaign, number, contact }
}

pub async fn make_queue_due_now(pool: &Pool) {
    sqlx::query("UPDATE send_queue SET due_at = datetime('now', '-1 seconds')")
        .execute(pool)
        .await
        .unwrap();
}
