mod support;

use campaign_engine::ai::Classification;
use campaign_engine::db;
use campaign_engine::inbound::{process_inbound, InboundSms};
use campaign_engine::model::{LeadStatus, Sentiment};
use std::sync::atomic::Ordering;
use support::{dispatch_policy, seed_tenant, setup_pool, FakeAi, FakeCarrier};

fn inbound(body: &str) -> InboundSms {
    InboundSms { to: "+15559990001".into(), from: "+15550001111".into(), body: body.into() }
}

async fn enable_auto_replies(pool: &db::Pool, org: i64) {
    sqlx::query("UPDATE organizations SET auto_replies_enabled = 1 WHERE id = ?")
        .bind(org)
        .execute(pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn unknown_destination_number_is_ignored() {
    let pool = setup_pool().await;
    seed_tenant(&pool, 10).await;
    let ai = FakeAi::new();
    let carrier = FakeCarrier::new();

    let sms = InboundSms { to: "+15550009999".into(), from: "+15550001111".into(), body: "hi".into() };
    let result = process_inbound(&pool, &ai, &carrier, &dispatch_policy(), &sms).await.unwrap();
    assert!(result.is_none());

    let messages: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM messages").fetch_one(&pool).await.unwrap();
    assert_eq!(messages, 0);
}

#[tokio::test]
async fn stop_keyword_opts_out_without_model_or_reply() {
    let pool = setup_pool().await;
    let t = seed_tenant(&pool, 10).await;
    enable_auto_replies(&pool, t.org).await;
    let ai = FakeAi::new();
    let carrier = FakeCarrier::new();

    let id = process_inbound(&pool, &ai, &carrier, &dispatch_policy(), &inbound("STOP"))
        .await
        .unwrap()
        .expect("inbound stored");

    let contact = db::contact_for_dispatch(&pool, t.contact).await.unwrap().unwrap();
    assert_eq!(contact.status, LeadStatus::Dnc);
    assert_eq!(ai.classify_calls.load(Ordering::SeqCst), 0);
    assert_eq!(ai.reply_calls.load(Ordering::SeqCst), 0);
    assert_eq!(carrier.sent_count(), 0);

    // The reply is still on the record even though classification never ran.
    let (has_replied, last_inbound_at): (i64, Option<String>) =
        sqlx::query_as("SELECT has_replied, last_inbound_at FROM contacts WHERE id = ?")
            .bind(t.contact)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(has_replied, 1);
    assert!(last_inbound_at.is_some());

    let audits: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM compliance_audit_log \
         WHERE action = 'CONTACT_OPTED_OUT' AND reason = 'KEYWORD'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(audits, 1);

    let direction: String = sqlx::query_scalar("SELECT direction FROM messages WHERE id = ?")
        .bind(id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(direction, "INBOUND");
}

#[tokio::test]
async fn reply_is_classified_and_answered_from_same_number() {
    let pool = setup_pool().await;
    let t = seed_tenant(&pool, 10).await;
    enable_auto_replies(&pool, t.org).await;
    let ai = FakeAi::new();
    let carrier = FakeCarrier::new();

    let id = process_inbound(
        &pool,
        &ai,
        &carrier,
        &dispatch_policy(),
        &inbound("Yes, I'd consider selling"),
    )
    .await
    .unwrap()
    .expect("inbound stored");

    let contact = db::contact_for_dispatch(&pool, t.contact).await.unwrap().unwrap();
    assert_eq!(contact.status, LeadStatus::Warm);
    let tags = db::contact_tags(&pool, t.contact).await.unwrap();
    assert!(tags.contains(&"interested".to_string()));
    assert!(tags.contains(&"Sentiment:POSITIVE".to_string()));
    assert!(tags.contains(&"Status:WARM".to_string()));

    let (ai_status, ai_sentiment): (Option<String>, Option<String>) =
        sqlx::query_as("SELECT ai_status, ai_sentiment FROM messages WHERE id = ?")
            .bind(id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(ai_status.as_deref(), Some("WARM"));
    assert_eq!(ai_sentiment.as_deref(), Some("POSITIVE"));

    // Reply went out from the number the contact texted, with the footer.
    assert_eq!(carrier.sent_count(), 1);
    {
        let sent = carrier.sent.lock().unwrap();
        assert_eq!(sent[0].0, "+15559990001");
        assert_eq!(sent[0].1, "+15550001111");
        assert!(sent[0].2.ends_with("Reply STOP to opt out."));
    }

    // The reply was billed as an AI reply against the wallet.
    let billing = db::org_billing(&pool, t.org).await.unwrap();
    assert_eq!(billing.wallet_balance_cents, 9);
    let usage: String = sqlx::query_scalar("SELECT usage_type FROM usage_ledger WHERE org_id = ?")
        .bind(t.org)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(usage, "AI_SMS_REPLY");

    let ai_generated: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM messages WHERE direction = 'OUTBOUND' AND is_ai_generated = 1",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(ai_generated, 1);
}

#[tokio::test]
async fn classification_outage_still_stores_and_stamps_the_reply() {
    let pool = setup_pool().await;
    let t = seed_tenant(&pool, 10).await;
    let ai = FakeAi::new();
    ai.fail_classify.store(true, Ordering::SeqCst);
    let carrier = FakeCarrier::new();

    let id = process_inbound(&pool, &ai, &carrier, &dispatch_policy(), &inbound("call me back"))
        .await
        .unwrap()
        .expect("inbound stored despite model outage");

    let body: String = sqlx::query_scalar("SELECT body FROM messages WHERE id = ?")
        .bind(id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(body, "call me back");

    let has_replied: i64 = sqlx::query_scalar("SELECT has_replied FROM contacts WHERE id = ?")
        .bind(t.contact)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(has_replied, 1);
    assert_eq!(carrier.sent_count(), 0);
}

#[tokio::test]
async fn auto_reply_respects_tenant_flag_and_wallet() {
    let pool = setup_pool().await;
    let t = seed_tenant(&pool, 10).await;
    let ai = FakeAi::new();
    let carrier = FakeCarrier::new();

    // Flag off: classification happens, no reply.
    process_inbound(&pool, &ai, &carrier, &dispatch_policy(), &inbound("tell me more"))
        .await
        .unwrap();
    assert_eq!(ai.classify_calls.load(Ordering::SeqCst), 1);
    assert_eq!(carrier.sent_count(), 0);

    // Flag on but wallet empty: still no reply.
    enable_auto_replies(&pool, t.org).await;
    sqlx::query("UPDATE organizations SET wallet_balance_cents = 0 WHERE id = ?")
        .bind(t.org)
        .execute(&pool)
        .await
        .unwrap();
    process_inbound(&pool, &ai, &carrier, &dispatch_policy(), &inbound("still here"))
        .await
        .unwrap();
    assert_eq!(carrier.sent_count(), 0);
}

#[tokio::test]
async fn unreachable_classification_suppresses_reply() {
    let pool = setup_pool().await;
    let t = seed_tenant(&pool, 10).await;
    enable_auto_replies(&pool, t.org).await;
    let ai = FakeAi::new();
    ai.set_classification(Classification {
        status: LeadStatus::WrongNumber,
        sentiment: Sentiment::Negative,
        tags: vec![],
        confidence: 0.9,
    });
    let carrier = FakeCarrier::new();

    process_inbound(&pool, &ai, &carrier, &dispatch_policy(), &inbound("who is this?"))
        .await
        .unwrap();

    let contact = db::contact_for_dispatch(&pool, t.contact).await.unwrap().unwrap();
    assert_eq!(contact.status, LeadStatus::WrongNumber);
    assert_eq!(ai.reply_calls.load(Ordering::SeqCst), 0);
    assert_eq!(carrier.sent_count(), 0);
}

#[tokio::test]
async fn first_inbound_from_new_phone_creates_the_contact() {
    let pool = setup_pool().await;
    let t = seed_tenant(&pool, 10).await;
    let ai = FakeAi::new();
    let carrier = FakeCarrier::new();

    let sms = InboundSms {
        to: "+15559990001".into(),
        from: "+15550007777".into(),
        body: "got your note".into(),
    };
    process_inbound(&pool, &ai, &carrier, &dispatch_policy(), &sms).await.unwrap();

    let (count, has_replied): (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), MAX(has_replied) FROM contacts WHERE org_id = ? AND phone = '+15550007777'",
    )
    .bind(t.org)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(count, 1);
    assert_eq!(has_replied, 1);
}
