//! Inbound reply loop: record the message, honor opt-out keywords before
//! anything else, classify the reply, and optionally send an AI-drafted
//! answer back from the same sending identity the contact already knows.

use crate::ai::{self, AiService};
use crate::billing::{self, DebitOutcome};
use crate::carrier::CarrierGateway;
use crate::config::DispatchPolicy;
use crate::db::{self, Pool};
use crate::model::{Direction, LeadStatus, MessageStatus, Sentiment, UsageType};
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, instrument, warn};

const MAX_TAGS: usize = 50;

/// Compliance keywords are matched deterministically, whole-message, before
/// any model sees the text.
static OPT_OUT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(stop|stopall|unsubscribe|cancel|end|quit)\s*$").expect("valid regex")
});

/// One inbound SMS as delivered by the carrier webhook.
#[derive(Debug, Clone)]
pub struct InboundSms {
    /// The sending identity that received it (one of ours).
    pub to: String,
    /// The contact's phone.
    pub from: String,
    pub body: String,
}

pub fn is_opt_out(body: &str) -> bool {
    OPT_OUT_RE.is_match(body)
}

/// Merge classification tags into the contact's existing set: sentiment and
/// status markers included, order preserved, duplicates dropped, capped.
pub fn merge_tags(
    existing: Vec<String>,
    new_tags: &[String],
    sentiment: Sentiment,
    status: LeadStatus,
) -> Vec<String> {
    let mut merged = existing;
    let mut push = |tag: String| {
        if !merged.iter().any(|t| t.eq_ignore_ascii_case(&tag)) && merged.len() < MAX_TAGS {
            merged.push(tag);
        }
    };
    for tag in new_tags {
        let tag = tag.trim();
        if !tag.is_empty() {
            push(tag.to_string());
        }
    }
    push(format!("Sentiment:{}", sentiment.as_str()));
    push(format!("Status:{}", status.as_str()));
    merged
}

/// Process one inbound SMS end to end. Returns the stored inbound message id,
/// or None when the destination number is not one of ours.
#[instrument(skip_all, fields(to = %sms.to))]
pub async fn process_inbound(
    pool: &Pool,
    ai_service: &dyn AiService,
    carrier: &dyn CarrierGateway,
    policy: &DispatchPolicy,
    sms: &InboundSms,
) -> Result<Option<i64>> {
    let Some((_number_id, org_id)) = db::number_by_phone(pool, &sms.to).await? else {
        debug!("inbound for a number we do not own; ignoring");
        return Ok(None);
    };

    let contact_id = db::upsert_contact_by_phone(pool, org_id, &sms.from).await?;
    let inbound_id = db::insert_message(
        pool,
        org_id,
        contact_id,
        Direction::Inbound,
        MessageStatus::Delivered,
        &sms.from,
        &sms.to,
        &sms.body,
        false,
    )
    .await?;
    db::stamp_contact_replied(pool, contact_id).await?;

    // Opt-out keywords short-circuit everything, including classification.
    if is_opt_out(&sms.body) {
        db::defer_contact(pool, contact_id, LeadStatus::Dnc, None).await?;
        db::insert_audit(
            pool,
            org_id,
            "CONTACT",
            contact_id,
            "CONTACT_OPTED_OUT",
            "KEYWORD",
            &serde_json::json!({ "messageId": inbound_id }),
        )
        .await?;
        info!(contact_id, "contact opted out via keyword");
        return Ok(Some(inbound_id));
    }

    let last_outbound = db::last_outbound_body(pool, contact_id).await?;
    let classification = match ai_service.classify(&sms.body, last_outbound.as_deref()).await {
        Ok(c) => c,
        // A webhook must not fail because the model is down; the reply is
        // stored and can be reclassified later.
        Err(err) => {
            warn!(contact_id, error = %err, "classification failed; inbound stored unclassified");
            return Ok(Some(inbound_id));
        }
    };

    let existing = db::contact_tags(pool, contact_id).await.unwrap_or_default();
    let tags = merge_tags(
        existing,
        &classification.tags,
        classification.sentiment,
        classification.status,
    );
    let tags_json = serde_json::to_string(&tags)?;
    db::apply_contact_classification(pool, contact_id, classification.status, &tags_json).await?;
    db::set_message_ai_results(
        pool,
        inbound_id,
        classification.status.as_str(),
        classification.sentiment.as_str(),
    )
    .await?;
    info!(
        contact_id,
        status = classification.status.as_str(),
        sentiment = classification.sentiment.as_str(),
        "inbound classified"
    );

    maybe_auto_reply(pool, ai_service, carrier, policy, org_id, contact_id, sms, &classification)
        .await?;
    Ok(Some(inbound_id))
}

#[allow(clippy::too_many_arguments)]
async fn maybe_auto_reply(
    pool: &Pool,
    ai_service: &dyn AiService,
    carrier: &dyn CarrierGateway,
    policy: &DispatchPolicy,
    org_id: i64,
    contact_id: i64,
    sms: &InboundSms,
    classification: &ai::Classification,
) -> Result<()> {
    if classification.status.is_unreachable() {
        return Ok(());
    }
    let org = db::org_billing(pool, org_id).await?;
    if !org.auto_replies_enabled {
        return Ok(());
    }
    if org.wallet_balance_cents < policy.message_cost_cents {
        debug!(org_id, "wallet too low for auto-reply; skipping");
        return Ok(());
    }

    let first_name = db::contact_for_dispatch(pool, contact_id)
        .await?
        .and_then(|c| c.first_name);
    let draft = match ai_service.draft_reply(&sms.body, first_name.as_deref()).await {
        Ok(d) => d,
        Err(err) => {
            warn!(contact_id, error = %err, "reply drafting failed; no auto-reply sent");
            return Ok(());
        }
    };
    let reply = ai::apply_reply_guardrails(&draft, policy.reply_max_chars);

    // Reply from the same identity the contact texted.
    match carrier.send_sms(&sms.to, &sms.from, &reply).await {
        Ok(accept) => {
            let message_id = db::insert_message(
                pool,
                org_id,
                contact_id,
                Direction::Outbound,
                MessageStatus::Queued,
                &sms.to,
                &sms.from,
                &reply,
                true,
            )
            .await?;
            db::mark_message_sent(pool, message_id, &accept.provider_sid).await?;
            db::stamp_contact_sent(pool, contact_id).await?;
            if let DebitOutcome::InsufficientFunds = billing::debit(
                pool,
                org_id,
                UsageType::AiSmsReply,
                policy.message_cost_cents,
                Some(message_id),
            )
            .await?
            {
                db::insert_audit(
                    pool,
                    org_id,
                    "MESSAGE",
                    message_id,
                    "BILLING_SHORTFALL",
                    "WALLET_RACE",
                    &serde_json::json!({ "messageId": message_id }),
                )
                .await?;
            }
            info!(contact_id, sid = %accept.provider_sid, "auto-reply sent");
        }
        Err(err) => {
            let message_id = db::insert_message(
                pool,
                org_id,
                contact_id,
                Direction::Outbound,
                MessageStatus::Failed,
                &sms.to,
                &sms.from,
                &reply,
                true,
            )
            .await?;
            if let crate::carrier::CarrierError::Rejected { code, .. } = &err {
                db::mark_message_failed(pool, message_id, Some(*code)).await?;
            }
            warn!(contact_id, error = %err, "auto-reply send failed");
        }
    }
    Ok(())
}
