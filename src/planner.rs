//! Eligibility and scheduling planner.
//!
//! Runs periodically per tenant: promotes scheduled campaigns whose start has
//! arrived, filters contacts through the compliance and cooldown gates, and
//! enqueues durable work items spread into batches inside the tenant's
//! allowed send window. Planning is idempotent: a contact with a pending
//! work item is never enqueued twice.

use crate::billing;
use crate::config::PlannerPolicy;
use crate::db::{self, OrgBilling, Pool};
use crate::model::{CampaignStatus, LeadStatus, PauseReason};
use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use tracing::{info, instrument, warn};

/// What one planning pass over a campaign produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub enqueued: usize,
    pub deferred: usize,
    pub completed: bool,
}

/// Promote SCHEDULED campaigns whose start time has arrived to QUEUED.
#[instrument(skip_all)]
pub async fn start_due_campaigns(pool: &Pool) -> Result<Vec<i64>> {
    let due = db::due_scheduled_campaigns(pool).await?;
    for id in &due {
        db::set_campaign_status(pool, *id, CampaignStatus::Queued).await?;
        info!(campaign_id = id, "scheduled campaign promoted to queued");
    }
    Ok(due)
}

/// One planning pass for a single campaign.
#[instrument(skip_all, fields(campaign_id))]
pub async fn plan_campaign(
    pool: &Pool,
    policy: &PlannerPolicy,
    campaign_id: i64,
) -> Result<PlanSummary> {
    let Some(campaign) = db::campaign_for_dispatch(pool, campaign_id).await? else {
        return Ok(PlanSummary::default());
    };
    if !campaign.status.is_dispatchable() {
        return Ok(PlanSummary::default());
    }

    let org = db::org_billing(pool, campaign.org_id).await?;
    if !org.subscription_active {
        let detail = serde_json::json!({ "campaignId": campaign_id });
        db::insert_audit(
            pool,
            org.id,
            "CAMPAIGN",
            campaign_id,
            "PLANNING_SKIPPED",
            "SUBSCRIPTION_INACTIVE",
            &detail,
        )
        .await?;
        warn!(campaign_id, org_id = org.id, "subscription inactive; campaign not planned");
        return Ok(PlanSummary::default());
    }
    if org.monthly_cap_reached() {
        billing::pause_for_funding(pool, campaign_id, org.id, PauseReason::BillingCap).await?;
        return Ok(PlanSummary::default());
    }

    let tz: Tz = org.time_zone.parse().unwrap_or(chrono_tz::UTC);
    let now = Utc::now();
    let cooldown = Duration::hours(org.dedup_window_hours.max(0));

    let candidates = db::contacts_for_planning(pool, org.id).await?;
    let mut summary = PlanSummary::default();
    let mut eligible = Vec::new();
    for contact in candidates {
        let Some(last_send) = contact.last_send_at else {
            eligible.push(contact);
            continue;
        };
        if now - last_send >= cooldown {
            eligible.push(contact);
            continue;
        }

        // Inside the dedup window: defer per tenant policy.
        summary.deferred += 1;
        defer_for_cooldown(pool, &org, campaign_id, contact.id, last_send).await?;
    }

    if eligible.is_empty() {
        if db::count_queue_for_campaign(pool, campaign_id).await? == 0 && summary.deferred == 0 {
            db::set_campaign_status(pool, campaign_id, CampaignStatus::Completed).await?;
            summary.completed = true;
            info!(campaign_id, "campaign completed; no contacts left to plan");
        }
        return Ok(summary);
    }

    let batch_size = campaign.batch_size.max(1) as usize;
    let quiet = match (campaign.quiet_hours_start, campaign.quiet_hours_end) {
        (Some(s), Some(e)) if s != e => Some((s, e)),
        _ => None,
    };
    for (batch_index, batch) in eligible.chunks(batch_size).enumerate() {
        let raw_due = now + Duration::minutes(campaign.interval_minutes * batch_index as i64);
        let due_at = if campaign.direct_reply {
            raw_due
        } else {
            shift_into_window(
                raw_due,
                tz,
                policy.send_window_start_hour,
                policy.send_window_end_hour,
                quiet,
            )
        };
        for contact in batch {
            db::enqueue_send(pool, org.id, campaign_id, contact.id, due_at, policy.max_attempts)
                .await?;
            summary.enqueued += 1;
        }
    }

    if campaign.status == CampaignStatus::Queued {
        db::set_campaign_status(pool, campaign_id, CampaignStatus::Running).await?;
    }
    info!(
        campaign_id,
        enqueued = summary.enqueued,
        deferred = summary.deferred,
        "planning pass finished"
    );
    Ok(summary)
}

/// Defer a contact that was messaged inside the tenant's dedup window.
/// With auto re-enqueue the contact carries a concrete `next_eligible_at`
/// and is picked up again once it lapses; otherwise it is held for manual
/// review. Either way an activity records the deferral.
pub async fn defer_for_cooldown(
    pool: &Pool,
    org: &OrgBilling,
    campaign_id: i64,
    contact_id: i64,
    last_send: DateTime<Utc>,
) -> Result<()> {
    let cooldown = Duration::hours(org.dedup_window_hours.max(0));
    if org.reenqueue_deferred {
        db::defer_contact(pool, contact_id, LeadStatus::Deferred24h, Some(last_send + cooldown))
            .await?;
        db::insert_activity(
            pool,
            org.id,
            "DEFERRED_DUPLICATE",
            &format!("Contact {} deferred; messaged within cooldown window", contact_id),
            &serde_json::json!({ "contactId": contact_id, "campaignId": campaign_id }),
        )
        .await?;
    } else {
        db::defer_contact(pool, contact_id, LeadStatus::Deferred, None).await?;
        db::insert_activity(
            pool,
            org.id,
            "DEFERRED_MANUAL",
            &format!("Contact {} held for manual review", contact_id),
            &serde_json::json!({ "contactId": contact_id, "campaignId": campaign_id }),
        )
        .await?;
    }
    Ok(())
}

/// One full planner tick: promote due campaigns, then plan everything
/// currently queued or running.
#[instrument(skip_all)]
pub async fn run_planner_once(pool: &Pool, policy: &PlannerPolicy) -> Result<()> {
    start_due_campaigns(pool).await?;
    let mut ids = db::campaigns_with_status(pool, CampaignStatus::Queued).await?;
    ids.extend(db::campaigns_with_status(pool, CampaignStatus::Running).await?);
    for id in ids {
        if let Err(err) = plan_campaign(pool, policy, id).await {
            warn!(campaign_id = id, error = %err, "planning pass failed");
        }
    }
    Ok(())
}

fn in_quiet_hours(hour: u32, start: u32, end: u32) -> bool {
    if start < end {
        hour >= start && hour < end
    } else {
        // Window wraps midnight, e.g. 22..06.
        hour >= start || hour < end
    }
}

/// Push a timestamp forward until it falls inside the tenant-local send
/// window and outside the campaign's quiet hours. Deferrals never move a
/// send earlier.
pub fn shift_into_window(
    due: DateTime<Utc>,
    tz: Tz,
    window_start: u32,
    window_end: u32,
    quiet: Option<(u32, u32)>,
) -> DateTime<Utc> {
    let mut current = due;
    // Each adjustment jumps to a boundary, so a handful of rounds settles;
    // the bound guards against degenerate window configurations.
    for _ in 0..16 {
        let local = current.with_timezone(&tz);
        let hour = local.hour();

        if hour < window_start {
            current = local_at(tz, local.date_naive(), window_start);
            continue;
        }
        if hour >= window_end {
            let next_day = local.date_naive() + Duration::days(1);
            current = local_at(tz, next_day, window_start);
            continue;
        }
        if let Some((qs, qe)) = quiet {
            if in_quiet_hours(hour, qs, qe) {
                let date = if hour >= qe { local.date_naive() + Duration::days(1) } else { local.date_naive() };
                current = local_at(tz, date, qe);
                continue;
            }
        }
        return current;
    }
    current
}

/// Construct a tenant-local wall-clock time and convert it to UTC. DST gaps
/// roll forward an hour; ambiguous times take the earlier offset.
fn local_at(tz: Tz, date: NaiveDate, hour: u32) -> DateTime<Utc> {
    for h in hour..=(hour + 2).min(23) {
        match tz.with_ymd_and_hms(date.year(), date.month(), date.day(), h, 0, 0) {
            chrono::LocalResult::Single(dt) => return dt.with_timezone(&Utc),
            chrono::LocalResult::Ambiguous(earlier, _) => return earlier.with_timezone(&Utc),
            chrono::LocalResult::None => continue,
        }
    }
    Utc.with_ymd_and_hms(date.year(), date.month(), date.day(), hour.min(23), 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}
