use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Queued,
    Running,
    Paused,
    Completed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "DRAFT",
            CampaignStatus::Scheduled => "SCHEDULED",
            CampaignStatus::Queued => "QUEUED",
            CampaignStatus::Running => "RUNNING",
            CampaignStatus::Paused => "PAUSED",
            CampaignStatus::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(CampaignStatus::Draft),
            "SCHEDULED" => Some(CampaignStatus::Scheduled),
            "QUEUED" => Some(CampaignStatus::Queued),
            "RUNNING" => Some(CampaignStatus::Running),
            "PAUSED" => Some(CampaignStatus::Paused),
            "COMPLETED" => Some(CampaignStatus::Completed),
            _ => None,
        }
    }

    /// Work items for a campaign in any other state are silent no-ops.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, CampaignStatus::Queued | CampaignStatus::Running)
    }
}

/// Machine-readable reason attached to every `PAUSED` transition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PauseReason {
    LowBalance,
    BillingCap,
    NoNumbers,
    NoTemplate,
    Operator,
}

impl PauseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseReason::LowBalance => "LOW_BALANCE",
            PauseReason::BillingCap => "BILLING_CAP",
            PauseReason::NoNumbers => "NO_NUMBERS",
            PauseReason::NoTemplate => "NO_TEMPLATE",
            PauseReason::Operator => "OPERATOR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LOW_BALANCE" => Some(PauseReason::LowBalance),
            "BILLING_CAP" => Some(PauseReason::BillingCap),
            "NO_NUMBERS" => Some(PauseReason::NoNumbers),
            "NO_TEMPLATE" => Some(PauseReason::NoTemplate),
            "OPERATOR" => Some(PauseReason::Operator),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LeadStatus {
    Hot,
    Warm,
    Nurture,
    Drip,
    NotInterested,
    WrongNumber,
    Dnc,
    NoStatus,
    /// Cooldown deferral; becomes eligible again at `next_eligible_at`.
    Deferred24h,
    /// Held for manual review when the tenant disables auto re-enqueue.
    Deferred,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::Hot => "HOT",
            LeadStatus::Warm => "WARM",
            LeadStatus::Nurture => "NURTURE",
            LeadStatus::Drip => "DRIP",
            LeadStatus::NotInterested => "NOT_INTERESTED",
            LeadStatus::WrongNumber => "WRONG_NUMBER",
            LeadStatus::Dnc => "DNC",
            LeadStatus::NoStatus => "NO_STATUS",
            LeadStatus::Deferred24h => "DEFERRED_24H",
            LeadStatus::Deferred => "DEFERRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "HOT" => Some(LeadStatus::Hot),
            "WARM" => Some(LeadStatus::Warm),
            "NURTURE" => Some(LeadStatus::Nurture),
            "DRIP" => Some(LeadStatus::Drip),
            "NOT_INTERESTED" => Some(LeadStatus::NotInterested),
            "WRONG_NUMBER" => Some(LeadStatus::WrongNumber),
            "DNC" => Some(LeadStatus::Dnc),
            "NO_STATUS" => Some(LeadStatus::NoStatus),
            "DEFERRED_24H" => Some(LeadStatus::Deferred24h),
            "DEFERRED" => Some(LeadStatus::Deferred),
            _ => None,
        }
    }

    /// Contacts in these states are never dispatched to and never auto-replied.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, LeadStatus::Dnc | LeadStatus::WrongNumber)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NumberStatus {
    Active,
    Paused,
    Blocked,
}

impl NumberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NumberStatus::Active => "ACTIVE",
            NumberStatus::Paused => "PAUSED",
            NumberStatus::Blocked => "BLOCKED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(NumberStatus::Active),
            "PAUSED" => Some(NumberStatus::Paused),
            "BLOCKED" => Some(NumberStatus::Blocked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "INBOUND",
            Direction::Outbound => "OUTBOUND",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageStatus {
    Queued,
    Sent,
    Delivered,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Queued => "QUEUED",
            MessageStatus::Sent => "SENT",
            MessageStatus::Delivered => "DELIVERED",
            MessageStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(MessageStatus::Queued),
            "SENT" => Some(MessageStatus::Sent),
            "DELIVERED" => Some(MessageStatus::Delivered),
            "FAILED" => Some(MessageStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "POSITIVE",
            Sentiment::Neutral => "NEUTRAL",
            Sentiment::Negative => "NEGATIVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "POSITIVE" => Some(Sentiment::Positive),
            "NEUTRAL" => Some(Sentiment::Neutral),
            "NEGATIVE" => Some(Sentiment::Negative),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UsageType {
    AiSms,
    AiSmsReply,
}

impl UsageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageType::AiSms => "AI_SMS",
            UsageType::AiSmsReply => "AI_SMS_REPLY",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    pub org_id: i64,
    pub campaign_id: i64,
    pub contact_id: i64,
    pub attempt: i32,
    pub max_attempts: i32,
    pub due_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_round_trips() {
        for s in ["DRAFT", "SCHEDULED", "QUEUED", "RUNNING", "PAUSED", "COMPLETED"] {
            assert_eq!(CampaignStatus::parse(s).unwrap().as_str(), s);
        }
        for s in ["LOW_BALANCE", "BILLING_CAP", "NO_NUMBERS", "NO_TEMPLATE", "OPERATOR"] {
            assert_eq!(PauseReason::parse(s).unwrap().as_str(), s);
        }
        assert_eq!(LeadStatus::parse("DEFERRED_24H"), Some(LeadStatus::Deferred24h));
        assert!(CampaignStatus::parse("bogus").is_none());
    }

    #[test]
    fn unreachable_states() {
        assert!(LeadStatus::Dnc.is_unreachable());
        assert!(LeadStatus::WrongNumber.is_unreachable());
        assert!(!LeadStatus::Hot.is_unreachable());
        assert!(!LeadStatus::Deferred.is_unreachable());
    }
}
