//! Billing gate: the only code allowed to touch wallet balance and monthly
//! spend. The pre-send check and the debit are one transaction, so two
//! workers racing on a nearly-empty wallet cannot both pass.

use crate::db::{self, Pool};
use crate::model::{PauseReason, UsageType};
use anyhow::Result;
use sqlx::Row;
use tracing::{info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitOutcome {
    Debited { remaining_cents: i64 },
    InsufficientFunds,
}

/// Planner pre-enqueue checkpoint: has the tenant already hit its monthly cap?
#[instrument(skip_all)]
pub async fn monthly_cap_reached(pool: &Pool, org_id: i64) -> Result<bool> {
    let org = db::org_billing(pool, org_id).await?;
    Ok(org.monthly_cap_reached())
}

/// Point-of-send checkpoint and debit, as one atomic operation:
/// balance predicate + decrement + spend counter + ledger row. When the
/// balance lands on exactly zero, the automated reply/call feature flags are
/// cleared in the same transaction as a safety backstop.
#[instrument(skip_all)]
pub async fn debit(
    pool: &Pool,
    org_id: i64,
    usage_type: UsageType,
    cost_cents: i64,
    message_id: Option<i64>,
) -> Result<DebitOutcome> {
    let mut tx = pool.begin().await?;
    let res = sqlx::query(
        "UPDATE organizations \
         SET wallet_balance_cents = wallet_balance_cents - ?, \
             monthly_spend_cents = monthly_spend_cents + ? \
         WHERE id = ? AND wallet_balance_cents >= ?",
    )
    .bind(cost_cents)
    .bind(cost_cents)
    .bind(org_id)
    .bind(cost_cents)
    .execute(&mut *tx)
    .await?;
    if res.rows_affected() == 0 {
        // Dropping the transaction rolls back; nothing was written.
        return Ok(DebitOutcome::InsufficientFunds);
    }

    sqlx::query("INSERT INTO usage_ledger (org_id, usage_type, cost_cents, message_id) VALUES (?, ?, ?, ?)")
        .bind(org_id)
        .bind(usage_type.as_str())
        .bind(cost_cents)
        .bind(message_id)
        .execute(&mut *tx)
        .await?;

    let remaining: i64 = sqlx::query("SELECT wallet_balance_cents FROM organizations WHERE id = ?")
        .bind(org_id)
        .fetch_one(&mut *tx)
        .await?
        .get("wallet_balance_cents");
    if remaining == 0 {
        sqlx::query(
            "UPDATE organizations SET auto_replies_enabled = 0, auto_calls_enabled = 0 WHERE id = ?",
        )
        .bind(org_id)
        .execute(&mut *tx)
        .await?;
        info!(org_id, "wallet depleted; automated replies and calls disabled");
    }

    tx.commit().await?;
    Ok(DebitOutcome::Debited { remaining_cents: remaining })
}

/// Billing-cycle rollover: zero the monthly spend counter so a campaign
/// paused on `BILLING_CAP` can be resumed. Invoked from the operator
/// surface when the tenant's cycle renews; the wallet is untouched.
#[instrument(skip_all)]
pub async fn reset_monthly_spend(pool: &Pool, org_id: i64) -> Result<()> {
    sqlx::query("UPDATE organizations SET monthly_spend_cents = 0 WHERE id = ?")
        .bind(org_id)
        .execute(pool)
        .await?;
    info!(org_id, "monthly spend counter reset");
    Ok(())
}

/// Funding pause invoked by the gate. The abandoned work item is re-planned
/// once the wallet is topped up; it is never retried in place.
#[instrument(skip_all)]
pub async fn pause_for_funding(
    pool: &Pool,
    campaign_id: i64,
    org_id: i64,
    reason: PauseReason,
) -> Result<()> {
    let detail = serde_json::json!({ "campaignId": campaign_id, "reason": reason.as_str() });
    db::pause_campaign(pool, campaign_id, org_id, reason, &detail).await?;
    Ok(())
}
