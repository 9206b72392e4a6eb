//! Deliverability feedback loop: carrier status callbacks update the message
//! record and feed the per-identity deliverability score. Callbacks are
//! retried by carriers, so every mutation sits behind an idempotency guard.

use crate::carrier::{rejection_kind, RejectionKind};
use crate::config::DispatchPolicy;
use crate::db::{self, Pool};
use crate::model::MessageStatus;
use anyhow::Result;
use tracing::{debug, info, instrument, warn};

/// One delivery status callback from the carrier.
#[derive(Debug, Clone)]
pub struct StatusCallback {
    pub provider_sid: String,
    pub status: String,
    pub error_code: Option<i64>,
}

/// Collapse the carrier's wire status vocabulary onto the message states.
pub fn normalize_callback_status(raw: &str) -> Option<MessageStatus> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "delivered" => Some(MessageStatus::Delivered),
        "accepted" | "queued" | "sending" | "sent" => Some(MessageStatus::Sent),
        "undelivered" | "failed" => Some(MessageStatus::Failed),
        _ => None,
    }
}

/// Deliverability penalty for one callback. Successes are worth nothing;
/// the score only ever recovers by the identity resting.
pub fn score_delta(status: MessageStatus, error_code: Option<i64>) -> i64 {
    if status != MessageStatus::Failed {
        return 0;
    }
    match error_code.map(rejection_kind) {
        Some(RejectionKind::RecipientOptedOut)
        | Some(RejectionKind::CarrierFiltered)
        | Some(RejectionKind::SenderBlocked) => -30,
        _ => -10,
    }
}

/// Apply one carrier callback. Returns false when the callback was a
/// duplicate and nothing was touched.
#[instrument(skip_all, fields(sid = %cb.provider_sid, status = %cb.status))]
pub async fn apply_status_callback(
    pool: &Pool,
    policy: &DispatchPolicy,
    cb: &StatusCallback,
) -> Result<bool> {
    let Some(status) = normalize_callback_status(&cb.status) else {
        debug!("unrecognized callback status ignored");
        return Ok(false);
    };
    if !db::record_delivery_event(pool, &cb.provider_sid, cb.status.trim(), cb.error_code).await? {
        debug!("duplicate delivery callback ignored");
        return Ok(false);
    }

    let Some(message) = db::message_by_provider_sid(pool, &cb.provider_sid).await? else {
        warn!("delivery callback for unknown message sid");
        return Ok(false);
    };
    db::update_message_status_by_sid(pool, &cb.provider_sid, status, cb.error_code).await?;

    let delta = score_delta(status, cb.error_code);
    if delta != 0 {
        let Some((number_id, org_id)) = db::number_by_phone(pool, &message.from_number).await?
        else {
            warn!(from = %message.from_number, "callback references unknown sending number");
            return Ok(true);
        };
        let (score, transition) = db::apply_score_delta(
            pool,
            number_id,
            org_id,
            delta,
            policy.score_pause_below,
            policy.score_block_below,
            cb.error_code,
        )
        .await?;
        if let Some(next) = transition {
            info!(number_id, score, status = next.as_str(), "identity demoted for deliverability");
        }
    }

    Ok(true)
}
