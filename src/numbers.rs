//! Sending identity pool: sticky contact→number routing, warmup throttling,
//! and reassignment away from blocked numbers.

use crate::db::{self, NumberForSend, Pool};
use crate::model::NumberStatus;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{info, instrument};

/// How a sending identity was obtained for a contact.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// An identity was (re)assigned; `reassigned_from` is set when the
    /// contact was moved off a previously assigned number.
    Assigned {
        number: NumberForSend,
        reassigned_from: Option<i64>,
    },
    /// The org has zero usable identities; the campaign must pause.
    PoolEmpty,
}

/// FNV-1a. The hash must be stable across processes and restarts so that
/// repeated attempts for the same contact land on the same identity.
pub fn stable_hash(input: &str) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in input.as_bytes() {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

/// Resolve the sending identity for a contact.
///
/// Sticky: an existing ACTIVE assignment is reused as-is. A missing or
/// demoted assignment is replaced deterministically (hash of the contact
/// phone modulo the active pool); a first-ever assignment takes the
/// least-used number so aggregate load spreads across the pool.
#[instrument(skip_all)]
pub async fn resolve_number(
    pool: &Pool,
    contact: &db::ContactForDispatch,
) -> Result<Resolution> {
    if let Some(number_id) = contact.assigned_number_id {
        if let Some(number) = db::number_by_id(pool, number_id).await? {
            if number.status == NumberStatus::Active {
                return Ok(Resolution::Assigned { number, reassigned_from: None });
            }
        }
    }

    let candidates = db::active_numbers(pool, contact.org_id).await?;
    if candidates.is_empty() {
        return Ok(Resolution::PoolEmpty);
    }

    let (number, action) = match contact.assigned_number_id {
        // Previous assignment exists but is unusable: deterministic re-route.
        Some(_) => {
            let idx = (stable_hash(&contact.phone) % candidates.len() as u64) as usize;
            (candidates[idx].clone(), "NUMBER_REASSIGNED")
        }
        // Fresh contact: least-used first (the repo orders the pool).
        None => (candidates[0].clone(), "NUMBER_ASSIGNED"),
    };

    db::assign_contact_number(pool, contact.id, number.id).await?;
    let detail = serde_json::json!({
        "contactId": contact.id,
        "from": contact.assigned_number_id,
        "to": number.id,
    });
    let reason = if contact.assigned_number_id.is_some() { "PREVIOUS_UNUSABLE" } else { "INITIAL" };
    db::insert_audit(pool, contact.org_id, "CONTACT", contact.id, action, reason, &detail).await?;
    if let Some(old) = contact.assigned_number_id {
        info!(contact_id = contact.id, old, new = number.id, "contact reassigned to new sending number");
    }

    Ok(Resolution::Assigned { number, reassigned_from: contact.assigned_number_id })
}

/// Remaining wait implied by the identity's warmup ceiling (messages per
/// minute) since its last use. Zero when the number is cold.
pub fn throttle_wait(number: &NumberForSend, now: DateTime<Utc>) -> Duration {
    let Some(last_used) = number.last_used_at else {
        return Duration::ZERO;
    };
    let gap_secs = 60 / number.warmup_level.max(1);
    let elapsed = (now - last_used).num_seconds();
    if elapsed >= gap_secs {
        Duration::ZERO
    } else {
        Duration::from_secs((gap_secs - elapsed).max(0) as u64)
    }
}

/// Demote an identity to BLOCKED after a carrier-side block signal.
#[instrument(skip_all)]
pub async fn block_number(pool: &Pool, number_id: i64, org_id: i64, error_code: i64) -> Result<bool> {
    let detail = serde_json::json!({ "errorCode": error_code });
    db::transition_number_status(
        pool,
        number_id,
        org_id,
        NumberStatus::Blocked,
        &error_code.to_string(),
        &detail,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    async fn setup_pool() -> Pool {
        let pool = Pool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn number(warmup_level: i64, last_used_secs_ago: Option<i64>) -> NumberForSend {
        NumberForSend {
            id: 1,
            phone_number: "+15550000000".into(),
            status: NumberStatus::Active,
            warmup_level,
            last_used_at: last_used_secs_ago.map(|s| Utc::now() - ChronoDuration::seconds(s)),
            last_used_count: 0,
            deliverability_score: 100,
        }
    }

    #[test]
    fn hash_is_stable() {
        assert_eq!(stable_hash("+15550001111"), stable_hash("+15550001111"));
        assert_ne!(stable_hash("+15550001111"), stable_hash("+15550001112"));
    }

    #[test]
    fn throttle_respects_warmup_ceiling() {
        // 2 msgs/min => 30s gap; 10s elapsed => ~20s left.
        let wait = throttle_wait(&number(2, Some(10)), Utc::now());
        assert!(wait >= Duration::from_secs(19) && wait <= Duration::from_secs(20));

        assert_eq!(throttle_wait(&number(2, Some(31)), Utc::now()), Duration::ZERO);
        assert_eq!(throttle_wait(&number(2, None), Utc::now()), Duration::ZERO);
    }

    #[tokio::test]
    async fn sticky_assignment_reused_while_active() {
        let pool = setup_pool().await;
        let org = db::create_org(&pool, "acme", "UTC", 100, None).await.unwrap();
        let n1 = db::create_number(&pool, org, "+15559990001", 1).await.unwrap();
        let _n2 = db::create_number(&pool, org, "+15559990002", 1).await.unwrap();
        let contact_id = db::create_contact(&pool, org, "+15550001111", None, None).await.unwrap();

        let contact = db::contact_for_dispatch(&pool, contact_id).await.unwrap().unwrap();
        let first = match resolve_number(&pool, &contact).await.unwrap() {
            Resolution::Assigned { number, reassigned_from } => {
                assert!(reassigned_from.is_none());
                number
            }
            Resolution::PoolEmpty => panic!("pool should not be empty"),
        };
        assert_eq!(first.id, n1);

        // Second resolution keeps the same identity.
        let contact = db::contact_for_dispatch(&pool, contact_id).await.unwrap().unwrap();
        match resolve_number(&pool, &contact).await.unwrap() {
            Resolution::Assigned { number, .. } => assert_eq!(number.id, first.id),
            Resolution::PoolEmpty => panic!("pool should not be empty"),
        }
    }

    #[tokio::test]
    async fn blocked_assignment_is_replaced_and_audited() {
        let pool = setup_pool().await;
        let org = db::create_org(&pool, "acme", "UTC", 100, None).await.unwrap();
        let n1 = db::create_number(&pool, org, "+15559990001", 1).await.unwrap();
        let n2 = db::create_number(&pool, org, "+15559990002", 1).await.unwrap();
        let contact_id = db::create_contact(&pool, org, "+15550001111", None, None).await.unwrap();

        db::assign_contact_number(&pool, contact_id, n1).await.unwrap();
        assert!(block_number(&pool, n1, org, 30007).await.unwrap());

        let contact = db::contact_for_dispatch(&pool, contact_id).await.unwrap().unwrap();
        match resolve_number(&pool, &contact).await.unwrap() {
            Resolution::Assigned { number, reassigned_from } => {
                assert_eq!(number.id, n2);
                assert_eq!(reassigned_from, Some(n1));
            }
            Resolution::PoolEmpty => panic!("pool should not be empty"),
        }

        let reassignments: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM compliance_audit_log WHERE action = 'NUMBER_REASSIGNED'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(reassignments, 1);

        let revision: i64 =
            sqlx::query_scalar("SELECT assignment_revision FROM contacts WHERE id = ?")
                .bind(contact_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(revision, 2);
    }

    #[tokio::test]
    async fn empty_pool_reported() {
        let pool = setup_pool().await;
        let org = db::create_org(&pool, "acme", "UTC", 100, None).await.unwrap();
        let n1 = db::create_number(&pool, org, "+15559990001", 1).await.unwrap();
        assert!(block_number(&pool, n1, org, 30007).await.unwrap());

        let contact_id = db::create_contact(&pool, org, "+15550001111", None, None).await.unwrap();
        let contact = db::contact_for_dispatch(&pool, contact_id).await.unwrap().unwrap();
        assert!(matches!(resolve_number(&pool, &contact).await.unwrap(), Resolution::PoolEmpty));
    }
}
