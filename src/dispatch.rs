//! Dispatch worker: drains the durable queue one claimed item at a time,
//! re-validating every gate at point of send. Each carrier outcome maps to
//! exactly one of: delete the item, back it off for retry, or fail it
//! terminally with an audit trail.

use crate::billing::{self, DebitOutcome};
use crate::carrier::{rejection_kind, CarrierError, CarrierGateway, RejectionKind};
use crate::config::DispatchPolicy;
use crate::db::{self, Pool};
use crate::model::{Direction, LeadStatus, MessageStatus, PauseReason, UsageType};
use crate::numbers::{self, Resolution};
use crate::planner;
use crate::templates::{self, TemplatePools};
use anyhow::Result;
use chrono::Utc;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// A claimed item invisible to other workers for this long; a crashed worker
/// forfeits its claim when the clock runs out.
const CLAIM_VISIBILITY_SECS: i64 = 120;

/// Process at most one due work item. Returns whether an item was claimed.
#[instrument(skip_all)]
pub async fn process_next_item(
    pool: &Pool,
    carrier: &dyn CarrierGateway,
    pools: &TemplatePools,
    policy: &DispatchPolicy,
) -> Result<bool> {
    let Some(item) = db::claim_next_due(pool, CLAIM_VISIBILITY_SECS).await? else {
        return Ok(false);
    };

    // The world may have changed since planning; every gate re-checks here.
    let campaign = db::campaign_for_dispatch(pool, item.campaign_id).await?;
    let Some(campaign) = campaign.filter(|c| c.status.is_dispatchable()) else {
        debug!(item_id = item.id, "campaign gone or not dispatchable; dropping item");
        db::delete_queue_item(pool, item.id).await?;
        return Ok(true);
    };

    // A DEFERRED_24H contact stays dispatchable: the deferral is transient
    // and the cooldown re-check below decides whether it has lapsed.
    let contact = db::contact_for_dispatch(pool, item.contact_id).await?;
    let Some(contact) =
        contact.filter(|c| !c.status.is_unreachable() && c.status != LeadStatus::Deferred)
    else {
        debug!(item_id = item.id, "contact gone or no longer reachable; dropping item");
        db::delete_queue_item(pool, item.id).await?;
        return Ok(true);
    };

    let org = db::org_billing(pool, campaign.org_id).await?;

    // The contact may have been messaged after this item was planned (an
    // auto-reply, or another campaign); the dedup window binds at point of
    // send, not at enqueue time.
    if let Some(last_send) = contact.last_send_at {
        if Utc::now() - last_send < chrono::Duration::hours(org.dedup_window_hours.max(0)) {
            planner::defer_for_cooldown(pool, &org, campaign.id, contact.id, last_send).await?;
            db::delete_queue_item(pool, item.id).await?;
            debug!(
                item_id = item.id,
                contact_id = contact.id,
                "contact messaged within cooldown window; item deferred"
            );
            return Ok(true);
        }
    }

    let Some(template) = pools.choose(&contact).map(str::to_string) else {
        billing::pause_for_funding(pool, campaign.id, campaign.org_id, PauseReason::NoTemplate)
            .await?;
        db::delete_queue_item(pool, item.id).await?;
        return Ok(true);
    };

    let number = match numbers::resolve_number(pool, &contact).await? {
        Resolution::Assigned { number, .. } => number,
        Resolution::PoolEmpty => {
            billing::pause_for_funding(pool, campaign.id, campaign.org_id, PauseReason::NoNumbers)
                .await?;
            db::delete_queue_item(pool, item.id).await?;
            return Ok(true);
        }
    };

    // Read-only wallet precheck: never reach the carrier on an empty wallet.
    if org.wallet_balance_cents < policy.message_cost_cents {
        billing::pause_for_funding(pool, campaign.id, campaign.org_id, PauseReason::LowBalance)
            .await?;
        db::delete_queue_item(pool, item.id).await?;
        return Ok(true);
    }

    let wait = numbers::throttle_wait(&number, Utc::now());
    if wait > Duration::ZERO {
        // Small jitter keeps workers from re-colliding on the same boundary.
        let jitter: i64 = rand::thread_rng().gen_range(0..=3);
        db::delay_queue_item(pool, item.id, wait.as_secs() as i64 + jitter).await?;
        debug!(item_id = item.id, wait_secs = wait.as_secs(), "identity warming up; item delayed");
        return Ok(true);
    }

    let body = templates::render(&template, &contact);
    match carrier.send_sms(&number.phone_number, &contact.phone, &body).await {
        Ok(accept) => {
            let message_id = db::insert_message(
                pool,
                org.id,
                contact.id,
                Direction::Outbound,
                MessageStatus::Queued,
                &number.phone_number,
                &contact.phone,
                &body,
                false,
            )
            .await?;
            db::mark_message_sent(pool, message_id, &accept.provider_sid).await?;
            db::bump_number_usage(pool, number.id).await?;
            db::stamp_contact_sent(pool, contact.id).await?;

            match billing::debit(
                pool,
                org.id,
                UsageType::AiSms,
                policy.message_cost_cents,
                Some(message_id),
            )
            .await?
            {
                DebitOutcome::Debited { remaining_cents } => {
                    info!(
                        message_id,
                        contact_id = contact.id,
                        sid = %accept.provider_sid,
                        remaining_cents,
                        "message dispatched"
                    );
                }
                // The carrier already accepted; the send cannot be unwound.
                // Record the shortfall and stop the campaign from spending more.
                DebitOutcome::InsufficientFunds => {
                    let detail = serde_json::json!({
                        "messageId": message_id,
                        "costCents": policy.message_cost_cents,
                    });
                    db::insert_audit(
                        pool,
                        org.id,
                        "MESSAGE",
                        message_id,
                        "BILLING_SHORTFALL",
                        "WALLET_RACE",
                        &detail,
                    )
                    .await?;
                    billing::pause_for_funding(
                        pool,
                        campaign.id,
                        campaign.org_id,
                        PauseReason::LowBalance,
                    )
                    .await?;
                    warn!(message_id, org_id = org.id, "wallet raced to empty after accept");
                }
            }
            db::delete_queue_item(pool, item.id).await?;
        }
        Err(CarrierError::Transient { status, message }) => {
            if item.attempt + 1 >= item.max_attempts {
                let message_id = db::insert_message(
                    pool,
                    org.id,
                    contact.id,
                    Direction::Outbound,
                    MessageStatus::Failed,
                    &number.phone_number,
                    &contact.phone,
                    &body,
                    false,
                )
                .await?;
                let detail = serde_json::json!({
                    "messageId": message_id,
                    "attempts": item.attempt + 1,
                    "lastError": message,
                });
                db::insert_audit(
                    pool,
                    org.id,
                    "MESSAGE",
                    message_id,
                    "RETRIES_EXHAUSTED",
                    "TRANSIENT_FAILURES",
                    &detail,
                )
                .await?;
                db::delete_queue_item(pool, item.id).await?;
                warn!(item_id = item.id, contact_id = contact.id, "retries exhausted; send failed");
            } else {
                db::backoff_queue_item(pool, item.id, item.attempt, policy.max_backoff_secs)
                    .await?;
                debug!(
                    item_id = item.id,
                    attempt = item.attempt + 1,
                    http_status = ?status,
                    "transient carrier failure; item backed off"
                );
            }
        }
        Err(CarrierError::Rejected { code, message }) => {
            let message_id = db::insert_message(
                pool,
                org.id,
                contact.id,
                Direction::Outbound,
                MessageStatus::Failed,
                &number.phone_number,
                &contact.phone,
                &body,
                false,
            )
            .await?;
            db::mark_message_failed(pool, message_id, Some(code)).await?;
            let detail = serde_json::json!({
                "messageId": message_id,
                "errorCode": code,
                "errorMessage": message,
            });
            db::insert_audit(
                pool,
                org.id,
                "MESSAGE",
                message_id,
                "SEND_REJECTED",
                &code.to_string(),
                &detail,
            )
            .await?;

            match rejection_kind(code) {
                RejectionKind::RecipientOptedOut => {
                    db::defer_contact(pool, contact.id, LeadStatus::Dnc, None).await?;
                    db::insert_audit(
                        pool,
                        org.id,
                        "CONTACT",
                        contact.id,
                        "CONTACT_OPTED_OUT",
                        &code.to_string(),
                        &serde_json::json!({ "messageId": message_id }),
                    )
                    .await?;
                }
                RejectionKind::InvalidDestination => {
                    db::defer_contact(pool, contact.id, LeadStatus::WrongNumber, None).await?;
                }
                RejectionKind::SenderBlocked => {
                    // The identity is burned; the next resolution reroutes
                    // every contact still pointing at it.
                    numbers::block_number(pool, number.id, org.id, code).await?;
                }
                RejectionKind::CarrierFiltered
                | RejectionKind::RecipientUnreachable
                | RejectionKind::Unknown => {}
            }
            db::delete_queue_item(pool, item.id).await?;
            warn!(item_id = item.id, code, "carrier rejected send");
        }
    }

    Ok(true)
}

/// Long-running worker loop: drain the queue, idle-poll when empty.
pub async fn run_worker(
    pool: Pool,
    carrier: std::sync::Arc<dyn CarrierGateway>,
    pools: std::sync::Arc<TemplatePools>,
    policy: DispatchPolicy,
    poll_interval: Duration,
) {
    loop {
        match process_next_item(&pool, carrier.as_ref(), &pools, &policy).await {
            Ok(true) => {}
            Ok(false) => tokio::time::sleep(poll_interval).await,
            Err(err) => {
                warn!(error = %err, "dispatch pass failed");
                tokio::time::sleep(poll_interval).await;
            }
        }
    }
}
