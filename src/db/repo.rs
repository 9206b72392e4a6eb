use super::model::{
    CampaignForDispatch, ContactForDispatch, ContactForPlanning, MessageForFeedback, NumberForSend,
    OrgBilling,
};
use crate::model::{
    CampaignStatus, Direction, LeadStatus, MessageStatus, NumberStatus, PauseReason, QueueItem,
};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous=FULL;").execute(&pool).await?;
    Ok(pool)
}

/// For file-backed SQLite URLs, expand a leading `~/` and create the parent
/// directory. In-memory URLs and non-sqlite schemes pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path_part.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&expanded).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query_part {
        Some(q) => format!("sqlite://{}?{}", expanded, q),
        None => format!("sqlite://{}", expanded),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Organizations

#[instrument(skip_all)]
pub async fn create_org(
    pool: &Pool,
    name: &str,
    time_zone: &str,
    wallet_balance_cents: i64,
    monthly_cap_cents: Option<i64>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO organizations (name, time_zone, wallet_balance_cents, monthly_cap_cents) \
         VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(name)
    .bind(time_zone)
    .bind(wallet_balance_cents)
    .bind(monthly_cap_cents)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn org_billing(pool: &Pool, org_id: i64) -> Result<OrgBilling> {
    let row = sqlx::query(
        "SELECT id, time_zone, wallet_balance_cents, monthly_cap_cents, monthly_spend_cents, \
                auto_replies_enabled, auto_calls_enabled, subscription_active, \
                reenqueue_deferred, dedup_window_hours \
         FROM organizations WHERE id = ?",
    )
    .bind(org_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Err(anyhow!("organization {} not found", org_id));
    };
    Ok(OrgBilling {
        id: row.get("id"),
        time_zone: row.get("time_zone"),
        wallet_balance_cents: row.get("wallet_balance_cents"),
        monthly_cap_cents: row.get("monthly_cap_cents"),
        monthly_spend_cents: row.get("monthly_spend_cents"),
        auto_replies_enabled: row.get("auto_replies_enabled"),
        auto_calls_enabled: row.get("auto_calls_enabled"),
        subscription_active: row.get("subscription_active"),
        reenqueue_deferred: row.get("reenqueue_deferred"),
        dedup_window_hours: row.get("dedup_window_hours"),
    })
}

// ---------------------------------------------------------------------------
// Campaigns

#[instrument(skip_all)]
pub async fn create_campaign(
    pool: &Pool,
    org_id: i64,
    name: &str,
    batch_size: i64,
    interval_minutes: i64,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO campaigns (org_id, name, status, batch_size, interval_minutes) \
         VALUES (?, ?, 'DRAFT', ?, ?) RETURNING id",
    )
    .bind(org_id)
    .bind(name)
    .bind(batch_size)
    .bind(interval_minutes)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn campaign_for_dispatch(pool: &Pool, id: i64) -> Result<Option<CampaignForDispatch>> {
    let row = sqlx::query(
        "SELECT id, org_id, status, paused_reason, batch_size, interval_minutes, \
                quiet_hours_start, quiet_hours_end, direct_reply \
         FROM campaigns WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else { return Ok(None) };
    let status_str: String = row.get("status");
    let status = CampaignStatus::parse(&status_str)
        .ok_or_else(|| anyhow!("campaign {} has unknown status {}", id, status_str))?;
    Ok(Some(CampaignForDispatch {
        id: row.get("id"),
        org_id: row.get("org_id"),
        status,
        paused_reason: row.get("paused_reason"),
        batch_size: row.get("batch_size"),
        interval_minutes: row.get("interval_minutes"),
        quiet_hours_start: row.get::<Option<i64>, _>("quiet_hours_start").map(|h| h as u32),
        quiet_hours_end: row.get::<Option<i64>, _>("quiet_hours_end").map(|h| h as u32),
        direct_reply: row.get("direct_reply"),
    }))
}

#[instrument(skip_all)]
pub async fn set_campaign_status(pool: &Pool, id: i64, status: CampaignStatus) -> Result<()> {
    sqlx::query("UPDATE campaigns SET status = ?, paused_reason = NULL WHERE id = ?")
        .bind(status.as_str())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Transition a campaign to `PAUSED` with a machine-readable reason.
///
/// Idempotent: a campaign already paused or completed is left alone and no
/// audit entry is written. Returns whether a transition happened.
#[instrument(skip_all)]
pub async fn pause_campaign(
    pool: &Pool,
    id: i64,
    org_id: i64,
    reason: PauseReason,
    detail: &Value,
) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let res = sqlx::query(
        "UPDATE campaigns SET status = 'PAUSED', paused_reason = ? \
         WHERE id = ? AND status NOT IN ('PAUSED', 'COMPLETED')",
    )
    .bind(reason.as_str())
    .bind(id)
    .execute(&mut *tx)
    .await?;
    if res.rows_affected() == 0 {
        return Ok(false);
    }
    insert_audit_tx(&mut tx, org_id, "CAMPAIGN", id, "CAMPAIGN_PAUSED", reason.as_str(), detail)
        .await?;
    sqlx::query(
        "INSERT INTO activities (org_id, activity_type, message, meta) VALUES (?, 'CAMPAIGN_PAUSED', ?, ?)",
    )
    .bind(org_id)
    .bind(format!("Campaign {} paused: {}", id, reason.as_str()))
    .bind(detail.to_string())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(true)
}

#[instrument(skip_all)]
pub async fn due_scheduled_campaigns(pool: &Pool) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM campaigns WHERE status = 'SCHEDULED' \
         AND scheduled_start IS NOT NULL AND datetime(scheduled_start) <= CURRENT_TIMESTAMP \
         ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

#[instrument(skip_all)]
pub async fn campaigns_with_status(pool: &Pool, status: CampaignStatus) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar::<_, i64>("SELECT id FROM campaigns WHERE status = ? ORDER BY id")
        .bind(status.as_str())
        .fetch_all(pool)
        .await?;
    Ok(ids)
}

/// Operator view: paused campaigns with their reason codes.
pub async fn list_paused_campaigns(pool: &Pool) -> Result<Vec<(i64, String, Option<String>)>> {
    let rows = sqlx::query("SELECT id, name, paused_reason FROM campaigns WHERE status = 'PAUSED'")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .into_iter()
        .map(|r| (r.get("id"), r.get("name"), r.get("paused_reason")))
        .collect())
}

// ---------------------------------------------------------------------------
// Contacts

#[instrument(skip_all)]
pub async fn create_contact(
    pool: &Pool,
    org_id: i64,
    phone: &str,
    first_name: Option<&str>,
    property_address: Option<&str>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO contacts (org_id, phone, first_name, property_address) \
         VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(org_id)
    .bind(phone)
    .bind(first_name)
    .bind(property_address)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn contact_for_dispatch(pool: &Pool, id: i64) -> Result<Option<ContactForDispatch>> {
    let row = sqlx::query(
        "SELECT id, org_id, phone, first_name, property_address, status, \
                assigned_number_id, last_send_at \
         FROM contacts WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else { return Ok(None) };
    let status_str: String = row.get("status");
    let status = LeadStatus::parse(&status_str)
        .ok_or_else(|| anyhow!("contact {} has unknown status {}", id, status_str))?;
    Ok(Some(ContactForDispatch {
        id: row.get("id"),
        org_id: row.get("org_id"),
        phone: row.get("phone"),
        first_name: row.get("first_name"),
        property_address: row.get("property_address"),
        status,
        assigned_number_id: row.get("assigned_number_id"),
        last_send_at: row.get("last_send_at"),
    }))
}

/// Contacts eligible for planning: not opted out, not held for review, past
/// any deferral window, and without a pending work item (so re-running the
/// planner never double-enqueues).
#[instrument(skip_all)]
pub async fn contacts_for_planning(pool: &Pool, org_id: i64) -> Result<Vec<ContactForPlanning>> {
    let rows = sqlx::query(
        "SELECT c.id, c.phone, c.last_send_at FROM contacts c \
         WHERE c.org_id = ? \
           AND c.status NOT IN ('DNC', 'WRONG_NUMBER', 'DEFERRED') \
           AND (c.next_eligible_at IS NULL OR datetime(c.next_eligible_at) <= CURRENT_TIMESTAMP) \
           AND NOT EXISTS (SELECT 1 FROM send_queue q WHERE q.contact_id = c.id) \
         ORDER BY c.id",
    )
    .bind(org_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| ContactForPlanning {
            id: r.get("id"),
            phone: r.get("phone"),
            last_send_at: r.get("last_send_at"),
        })
        .collect())
}

#[instrument(skip_all)]
pub async fn defer_contact(
    pool: &Pool,
    id: i64,
    status: LeadStatus,
    next_eligible_at: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query("UPDATE contacts SET status = ?, next_eligible_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(next_eligible_at)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Sticky identity assignment with a revision bump so moves are auditable.
#[instrument(skip_all)]
pub async fn assign_contact_number(pool: &Pool, contact_id: i64, number_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE contacts SET assigned_number_id = ?, assignment_revision = assignment_revision + 1 \
         WHERE id = ?",
    )
    .bind(number_id)
    .bind(contact_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Stamp the cooldown clock after a successful carrier accept.
#[instrument(skip_all)]
pub async fn stamp_contact_sent(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("UPDATE contacts SET last_send_at = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn upsert_contact_by_phone(pool: &Pool, org_id: i64, phone: &str) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO contacts (org_id, phone) VALUES (?, ?) \
         ON CONFLICT(org_id, phone) DO UPDATE SET phone = excluded.phone \
         RETURNING id",
    )
    .bind(org_id)
    .bind(phone)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

/// Mark that the contact wrote back. Every stored inbound stamps this,
/// including opt-outs and messages that never reach classification.
#[instrument(skip_all)]
pub async fn stamp_contact_replied(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE contacts SET has_replied = 1, last_inbound_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn apply_contact_classification(
    pool: &Pool,
    id: i64,
    status: LeadStatus,
    tags_json: &str,
) -> Result<()> {
    sqlx::query("UPDATE contacts SET status = ?, tags = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(tags_json)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn contact_tags(pool: &Pool, id: i64) -> Result<Vec<String>> {
    let raw: String = sqlx::query_scalar("SELECT tags FROM contacts WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await?;
    Ok(serde_json::from_str(&raw).unwrap_or_default())
}

/// Operator view: deferred or held contacts.
pub async fn list_deferred_contacts(
    pool: &Pool,
    org_id: i64,
) -> Result<Vec<(i64, String, String, Option<DateTime<Utc>>)>> {
    let rows = sqlx::query(
        "SELECT id, phone, status, next_eligible_at FROM contacts \
         WHERE org_id = ? AND status IN ('DEFERRED_24H', 'DEFERRED') ORDER BY id",
    )
    .bind(org_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| (r.get("id"), r.get("phone"), r.get("status"), r.get("next_eligible_at")))
        .collect())
}

// ---------------------------------------------------------------------------
// Sending numbers

#[instrument(skip_all)]
pub async fn create_number(
    pool: &Pool,
    org_id: i64,
    phone_number: &str,
    warmup_level: i64,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO sending_numbers (org_id, phone_number, warmup_level) \
         VALUES (?, ?, ?) RETURNING id",
    )
    .bind(org_id)
    .bind(phone_number)
    .bind(warmup_level)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

fn row_to_number(row: &sqlx::sqlite::SqliteRow) -> Result<NumberForSend> {
    let status_str: String = row.get("status");
    let status = NumberStatus::parse(&status_str)
        .ok_or_else(|| anyhow!("sending number has unknown status {}", status_str))?;
    Ok(NumberForSend {
        id: row.get("id"),
        phone_number: row.get("phone_number"),
        status,
        warmup_level: row.get("warmup_level"),
        last_used_at: row.get("last_used_at"),
        last_used_count: row.get("last_used_count"),
        deliverability_score: row.get("deliverability_score"),
    })
}

#[instrument(skip_all)]
pub async fn number_by_id(pool: &Pool, id: i64) -> Result<Option<NumberForSend>> {
    let row = sqlx::query(
        "SELECT id, phone_number, status, warmup_level, last_used_at, last_used_count, \
                deliverability_score \
         FROM sending_numbers WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(row_to_number).transpose()
}

/// Look up a sending identity by its E.164 number; returns (id, org_id).
#[instrument(skip_all)]
pub async fn number_by_phone(pool: &Pool, phone_number: &str) -> Result<Option<(i64, i64)>> {
    let row = sqlx::query("SELECT id, org_id FROM sending_numbers WHERE phone_number = ?")
        .bind(phone_number)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| (r.get("id"), r.get("org_id"))))
}

/// Non-blocked pool for an org, least-used first (LRU tie-break).
#[instrument(skip_all)]
pub async fn active_numbers(pool: &Pool, org_id: i64) -> Result<Vec<NumberForSend>> {
    let rows = sqlx::query(
        "SELECT id, phone_number, status, warmup_level, last_used_at, last_used_count, \
                deliverability_score \
         FROM sending_numbers WHERE org_id = ? AND status = 'ACTIVE' \
         ORDER BY last_used_count ASC, datetime(last_used_at) ASC, id ASC",
    )
    .bind(org_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_number).collect()
}

/// Transition a sending identity and write the compliance audit entry in the
/// same transaction, so a blocked number can never be observed without its
/// audit trail.
#[instrument(skip_all)]
pub async fn transition_number_status(
    pool: &Pool,
    id: i64,
    org_id: i64,
    status: NumberStatus,
    reason: &str,
    detail: &Value,
) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let res = sqlx::query("UPDATE sending_numbers SET status = ? WHERE id = ? AND status != ?")
        .bind(status.as_str())
        .bind(id)
        .bind(status.as_str())
        .execute(&mut *tx)
        .await?;
    if res.rows_affected() == 0 {
        return Ok(false);
    }
    let action = match status {
        NumberStatus::Active => "NUMBER_ACTIVATED",
        NumberStatus::Paused => "NUMBER_PAUSED",
        NumberStatus::Blocked => "NUMBER_BLOCKED",
    };
    insert_audit_tx(&mut tx, org_id, "SENDING_NUMBER", id, action, reason, detail).await?;
    tx.commit().await?;
    Ok(true)
}

/// Usage counters tolerate races; this is deliberately not transactional
/// with the send itself.
#[instrument(skip_all)]
pub async fn bump_number_usage(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE sending_numbers SET last_used_at = CURRENT_TIMESTAMP, \
         last_used_count = last_used_count + 1 WHERE id = ?",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Apply a deliverability delta, clamp to [0, 100], and demote the number if
/// it crossed a threshold. Returns the new score and any status transition.
#[instrument(skip_all)]
pub async fn apply_score_delta(
    pool: &Pool,
    number_id: i64,
    org_id: i64,
    delta: i64,
    pause_below: i64,
    block_below: i64,
    error_code: Option<i64>,
) -> Result<(i64, Option<NumberStatus>)> {
    let mut tx = pool.begin().await?;
    let row = sqlx::query("SELECT deliverability_score, status FROM sending_numbers WHERE id = ?")
        .bind(number_id)
        .fetch_optional(&mut *tx)
        .await?;
    let Some(row) = row else {
        return Err(anyhow!("sending number {} not found", number_id));
    };
    let score: i64 = row.get("deliverability_score");
    let status_str: String = row.get("status");
    let status = NumberStatus::parse(&status_str)
        .ok_or_else(|| anyhow!("sending number {} has unknown status {}", number_id, status_str))?;

    let new_score = (score + delta).clamp(0, 100);
    sqlx::query("UPDATE sending_numbers SET deliverability_score = ? WHERE id = ?")
        .bind(new_score)
        .bind(number_id)
        .execute(&mut *tx)
        .await?;

    // A blocked number stays blocked; pauses can still escalate to a block.
    let next = if status != NumberStatus::Blocked && new_score < block_below {
        Some(NumberStatus::Blocked)
    } else if status == NumberStatus::Active && new_score < pause_below {
        Some(NumberStatus::Paused)
    } else {
        None
    };

    if let Some(next_status) = next {
        sqlx::query("UPDATE sending_numbers SET status = ? WHERE id = ?")
            .bind(next_status.as_str())
            .bind(number_id)
            .execute(&mut *tx)
            .await?;
        let action = match next_status {
            NumberStatus::Paused => "NUMBER_PAUSED",
            _ => "NUMBER_BLOCKED",
        };
        let reason = error_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "DELIVERY_FAILURE".to_string());
        let detail = serde_json::json!({ "score": new_score, "delta": delta, "errorCode": error_code });
        insert_audit_tx(&mut tx, org_id, "SENDING_NUMBER", number_id, action, &reason, &detail)
            .await?;
    }

    tx.commit().await?;
    Ok((new_score, next))
}

/// Operator view: numbers demoted for deliverability.
pub async fn list_blocked_numbers(pool: &Pool, org_id: i64) -> Result<Vec<(String, String)>> {
    let rows = sqlx::query(
        "SELECT phone_number, status FROM sending_numbers \
         WHERE org_id = ? AND status IN ('BLOCKED', 'PAUSED') ORDER BY id",
    )
    .bind(org_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| (r.get("phone_number"), r.get("status")))
        .collect())
}

// ---------------------------------------------------------------------------
// Messages

#[allow(clippy::too_many_arguments)]
#[instrument(skip_all)]
pub async fn insert_message(
    pool: &Pool,
    org_id: i64,
    contact_id: i64,
    direction: Direction,
    status: MessageStatus,
    from_number: &str,
    to_number: &str,
    body: &str,
    is_ai_generated: bool,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO messages (org_id, contact_id, direction, status, from_number, to_number, body, is_ai_generated) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(org_id)
    .bind(contact_id)
    .bind(direction.as_str())
    .bind(status.as_str())
    .bind(from_number)
    .bind(to_number)
    .bind(body)
    .bind(is_ai_generated)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn mark_message_sent(pool: &Pool, id: i64, provider_sid: &str) -> Result<()> {
    sqlx::query(
        "UPDATE messages SET status = 'SENT', provider_sid = ?, sent_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(provider_sid)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_message_failed(pool: &Pool, id: i64, error_code: Option<i64>) -> Result<()> {
    sqlx::query("UPDATE messages SET status = 'FAILED', error_code = ? WHERE id = ?")
        .bind(error_code)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn message_by_provider_sid(pool: &Pool, sid: &str) -> Result<Option<MessageForFeedback>> {
    let row = sqlx::query(
        "SELECT id, org_id, contact_id, from_number FROM messages WHERE provider_sid = ?",
    )
    .bind(sid)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| MessageForFeedback {
        id: r.get("id"),
        org_id: r.get("org_id"),
        contact_id: r.get("contact_id"),
        from_number: r.get("from_number"),
    }))
}

#[instrument(skip_all)]
pub async fn update_message_status_by_sid(
    pool: &Pool,
    sid: &str,
    status: MessageStatus,
    error_code: Option<i64>,
) -> Result<()> {
    sqlx::query("UPDATE messages SET status = ?, error_code = COALESCE(?, error_code) WHERE provider_sid = ?")
        .bind(status.as_str())
        .bind(error_code)
        .bind(sid)
        .execute(pool)
        .await?;
    Ok(())
}

/// Most recent outbound body for a contact, used as classification context.
#[instrument(skip_all)]
pub async fn last_outbound_body(pool: &Pool, contact_id: i64) -> Result<Option<String>> {
    let body = sqlx::query_scalar(
        "SELECT body FROM messages WHERE contact_id = ? AND direction = 'OUTBOUND' \
         ORDER BY id DESC LIMIT 1",
    )
    .bind(contact_id)
    .fetch_optional(pool)
    .await?;
    Ok(body)
}

#[instrument(skip_all)]
pub async fn set_message_ai_results(
    pool: &Pool,
    id: i64,
    ai_status: &str,
    ai_sentiment: &str,
) -> Result<()> {
    sqlx::query("UPDATE messages SET ai_status = ?, ai_sentiment = ? WHERE id = ?")
        .bind(ai_status)
        .bind(ai_sentiment)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Durable delayed queue

#[instrument(skip_all)]
pub async fn enqueue_send(
    pool: &Pool,
    org_id: i64,
    campaign_id: i64,
    contact_id: i64,
    due_at: DateTime<Utc>,
    max_attempts: i32,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO send_queue (org_id, campaign_id, contact_id, attempt, max_attempts, due_at) \
         VALUES (?, ?, ?, 0, ?, ?) RETURNING id",
    )
    .bind(org_id)
    .bind(campaign_id)
    .bind(contact_id)
    .bind(max_attempts)
    .bind(due_at)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

/// Pop the next due item and push its `due_at` forward by a visibility
/// timeout in the same statement, so concurrent workers cannot claim the
/// same item. A crashed worker's claim simply re-becomes due.
#[instrument(skip_all)]
pub async fn claim_next_due(pool: &Pool, visibility_secs: i64) -> Result<Option<QueueItem>> {
    let row = sqlx::query(
        "UPDATE send_queue SET due_at = datetime('now', ? || ' seconds') \
         WHERE id = (SELECT id FROM send_queue \
                     WHERE datetime(due_at) <= CURRENT_TIMESTAMP \
                     ORDER BY datetime(due_at) ASC LIMIT 1) \
         RETURNING id, org_id, campaign_id, contact_id, attempt, max_attempts, due_at",
    )
    .bind(visibility_secs)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else { return Ok(None) };
    Ok(Some(QueueItem {
        id: row.get("id"),
        org_id: row.get("org_id"),
        campaign_id: row.get("campaign_id"),
        contact_id: row.get("contact_id"),
        attempt: row.get("attempt"),
        max_attempts: row.get("max_attempts"),
        due_at: row.get("due_at"),
    }))
}

#[instrument(skip_all)]
pub async fn delete_queue_item(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM send_queue WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Push an item's due time forward without counting an attempt (used for
/// warmup throttling, where the item itself did nothing wrong).
#[instrument(skip_all)]
pub async fn delay_queue_item(pool: &Pool, id: i64, secs: i64) -> Result<()> {
    sqlx::query("UPDATE send_queue SET due_at = datetime('now', ? || ' seconds') WHERE id = ?")
        .bind(secs.max(1))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Exponential backoff: 5s * 2^attempt, capped at `max_cap_secs`.
#[instrument(skip_all)]
pub async fn backoff_queue_item(pool: &Pool, id: i64, attempt: i32, max_cap_secs: i64) -> Result<()> {
    let secs = (5_i64) * (1_i64 << attempt.min(10));
    let secs = if max_cap_secs > 0 { secs.min(max_cap_secs) } else { secs };
    sqlx::query(
        "UPDATE send_queue SET attempt = ?, due_at = datetime('now', ? || ' seconds') WHERE id = ?",
    )
    .bind(attempt + 1)
    .bind(secs)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_queue_for_campaign(pool: &Pool, campaign_id: i64) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM send_queue WHERE campaign_id = ?")
        .bind(campaign_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn count_queue(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM send_queue")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// Delivery events, audit, activity

/// Idempotency guard for carrier callbacks. Returns false when this
/// (sid, status) pair was already processed.
#[instrument(skip_all)]
pub async fn record_delivery_event(
    pool: &Pool,
    provider_sid: &str,
    status: &str,
    error_code: Option<i64>,
) -> Result<bool> {
    let res = sqlx::query(
        "INSERT OR IGNORE INTO delivery_events (provider_sid, status, error_code) VALUES (?, ?, ?)",
    )
    .bind(provider_sid)
    .bind(status)
    .bind(error_code)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn insert_audit(
    pool: &Pool,
    org_id: i64,
    entity_type: &str,
    entity_id: i64,
    action: &str,
    reason: &str,
    detail: &Value,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    insert_audit_tx(&mut tx, org_id, entity_type, entity_id, action, reason, detail).await?;
    tx.commit().await?;
    Ok(())
}

async fn insert_audit_tx(
    tx: &mut Transaction<'_, Sqlite>,
    org_id: i64,
    entity_type: &str,
    entity_id: i64,
    action: &str,
    reason: &str,
    detail: &Value,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO compliance_audit_log (org_id, entity_type, entity_id, action, reason, detail) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(org_id)
    .bind(entity_type)
    .bind(entity_id)
    .bind(action)
    .bind(reason)
    .bind(detail.to_string())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn insert_activity(
    pool: &Pool,
    org_id: i64,
    activity_type: &str,
    message: &str,
    meta: &Value,
) -> Result<()> {
    sqlx::query("INSERT INTO activities (org_id, activity_type, message, meta) VALUES (?, ?, ?, ?)")
        .bind(org_id)
        .bind(activity_type)
        .bind(message)
        .bind(meta.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn claim_is_exclusive_and_backoff_requeues() {
        let pool = setup_pool().await;
        let org = create_org(&pool, "acme", "UTC", 100, None).await.unwrap();
        let campaign = create_campaign(&pool, org, "c1", 50, 30).await.unwrap();
        let contact = create_contact(&pool, org, "+15550001111", None, None).await.unwrap();

        enqueue_send(&pool, org, campaign, contact, Utc::now(), 5).await.unwrap();

        let item = claim_next_due(&pool, 60).await.unwrap().expect("item due");
        assert_eq!(item.contact_id, contact);
        // The claim pushed due_at forward, so a second worker sees nothing.
        assert!(claim_next_due(&pool, 60).await.unwrap().is_none());

        backoff_queue_item(&pool, item.id, item.attempt, 3600).await.unwrap();
        let attempt: i32 = sqlx::query_scalar("SELECT attempt FROM send_queue WHERE id = ?")
            .bind(item.id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(attempt, 1);

        delete_queue_item(&pool, item.id).await.unwrap();
        assert_eq!(count_queue(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn planning_skips_unreachable_and_pending_contacts() {
        let pool = setup_pool().await;
        let org = create_org(&pool, "acme", "UTC", 100, None).await.unwrap();
        let campaign = create_campaign(&pool, org, "c1", 50, 30).await.unwrap();
        let reachable = create_contact(&pool, org, "+15550001111", None, None).await.unwrap();
        let opted_out = create_contact(&pool, org, "+15550002222", None, None).await.unwrap();
        let queued = create_contact(&pool, org, "+15550003333", None, None).await.unwrap();

        defer_contact(&pool, opted_out, LeadStatus::Dnc, None).await.unwrap();
        enqueue_send(&pool, org, campaign, queued, Utc::now(), 5).await.unwrap();

        let plan = contacts_for_planning(&pool, org).await.unwrap();
        let ids: Vec<i64> = plan.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![reachable]);
    }

    #[tokio::test]
    async fn score_delta_clamps_and_demotes() {
        let pool = setup_pool().await;
        let org = create_org(&pool, "acme", "UTC", 100, None).await.unwrap();
        let number = create_number(&pool, org, "+15559990000", 1).await.unwrap();

        let (score, transition) =
            apply_score_delta(&pool, number, org, -30, 50, 25, Some(30007)).await.unwrap();
        assert_eq!(score, 70);
        assert!(transition.is_none());

        let (score, transition) =
            apply_score_delta(&pool, number, org, -30, 50, 25, Some(30007)).await.unwrap();
        assert_eq!(score, 40);
        assert_eq!(transition, Some(NumberStatus::Paused));

        let (score, transition) =
            apply_score_delta(&pool, number, org, -30, 50, 25, Some(21610)).await.unwrap();
        assert_eq!(score, 10);
        assert_eq!(transition, Some(NumberStatus::Blocked));

        // Floor at zero, no resurrection past BLOCKED.
        let (score, transition) =
            apply_score_delta(&pool, number, org, -30, 50, 25, None).await.unwrap();
        assert_eq!(score, 0);
        assert!(transition.is_none());

        let audits: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM compliance_audit_log WHERE entity_id = ?")
                .bind(number)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(audits, 2);
    }

    #[tokio::test]
    async fn delivery_event_recorded_once() {
        let pool = setup_pool().await;
        assert!(record_delivery_event(&pool, "SM123", "delivered", None).await.unwrap());
        assert!(!record_delivery_event(&pool, "SM123", "delivered", None).await.unwrap());
        assert!(record_delivery_event(&pool, "SM123", "failed", Some(30007)).await.unwrap());
    }

    #[tokio::test]
    async fn pause_campaign_is_idempotent() {
        let pool = setup_pool().await;
        let org = create_org(&pool, "acme", "UTC", 0, None).await.unwrap();
        let campaign = create_campaign(&pool, org, "c1", 50, 30).await.unwrap();
        set_campaign_status(&pool, campaign, CampaignStatus::Running).await.unwrap();

        let detail = serde_json::json!({ "campaignId": campaign });
        assert!(pause_campaign(&pool, campaign, org, PauseReason::LowBalance, &detail)
            .await
            .unwrap());
        assert!(!pause_campaign(&pool, campaign, org, PauseReason::LowBalance, &detail)
            .await
            .unwrap());

        let loaded = campaign_for_dispatch(&pool, campaign).await.unwrap().unwrap();
        assert_eq!(loaded.status, CampaignStatus::Paused);
        assert_eq!(loaded.paused_reason.as_deref(), Some("LOW_BALANCE"));

        let audits: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM compliance_audit_log WHERE action = 'CAMPAIGN_PAUSED'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(audits, 1);
    }

    #[tokio::test]
    async fn upsert_contact_reuses_existing_row() {
        let pool = setup_pool().await;
        let org = create_org(&pool, "acme", "UTC", 100, None).await.unwrap();
        let a = upsert_contact_by_phone(&pool, org, "+15550001111").await.unwrap();
        let b = upsert_contact_by_phone(&pool, org, "+15550001111").await.unwrap();
        assert_eq!(a, b);
    }
}
