//! View models returned by repositories.
//!
//! Keep these structs focused on the data the workers actually read.
//! Business logic lives in the planner/dispatch/feedback modules.

use crate::model::{CampaignStatus, LeadStatus, NumberStatus};
use chrono::{DateTime, Utc};

/// Tenant billing slice read by the planner and the billing gate.
#[derive(Debug, Clone)]
pub struct OrgBilling {
    pub id: i64,
    pub time_zone: String,
    pub wallet_balance_cents: i64,
    pub monthly_cap_cents: Option<i64>,
    pub monthly_spend_cents: i64,
    pub auto_replies_enabled: bool,
    pub auto_calls_enabled: bool,
    pub subscription_active: bool,
    pub reenqueue_deferred: bool,
    pub dedup_window_hours: i64,
}

impl OrgBilling {
    pub fn monthly_cap_reached(&self) -> bool {
        match self.monthly_cap_cents {
            Some(cap) => self.monthly_spend_cents >= cap,
            None => false,
        }
    }
}

/// Campaign slice used by both the planner and the dispatch worker.
#[derive(Debug, Clone)]
pub struct CampaignForDispatch {
    pub id: i64,
    pub org_id: i64,
    pub status: CampaignStatus,
    pub paused_reason: Option<String>,
    pub batch_size: i64,
    pub interval_minutes: i64,
    pub quiet_hours_start: Option<u32>,
    pub quiet_hours_end: Option<u32>,
    pub direct_reply: bool,
}

/// Contact slice re-validated at dispatch time.
#[derive(Debug, Clone)]
pub struct ContactForDispatch {
    pub id: i64,
    pub org_id: i64,
    pub phone: String,
    pub first_name: Option<String>,
    pub property_address: Option<String>,
    pub status: LeadStatus,
    pub assigned_number_id: Option<i64>,
    pub last_send_at: Option<DateTime<Utc>>,
}

/// Minimal contact row enumerated by the planner.
#[derive(Debug, Clone)]
pub struct ContactForPlanning {
    pub id: i64,
    pub phone: String,
    pub last_send_at: Option<DateTime<Utc>>,
}

/// Sending identity slice used for selection and throttling.
#[derive(Debug, Clone)]
pub struct NumberForSend {
    pub id: i64,
    pub phone_number: String,
    pub status: NumberStatus,
    pub warmup_level: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_used_count: i64,
    pub deliverability_score: i64,
}

/// Message slice looked up by provider sid in the feedback loop.
#[derive(Debug, Clone)]
pub struct MessageForFeedback {
    pub id: i64,
    pub org_id: i64,
    pub contact_id: i64,
    pub from_number: String,
}
