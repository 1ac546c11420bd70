mod common;

use chrono::{Duration, Utc};
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use uuid::Uuid;

use storefront_api::{
    entities::order::{self, OrderStatus},
    entities::payment::{self, PaymentMethod, PaymentStatus},
    errors::ServiceError,
    gateway::IntentStatus,
    services::payments::{CreateIntentRequest, WebhookOutcome},
    services::reconciliation::ValidationCode,
    webhooks::{EVENT_CANCELED, EVENT_REQUIRES_ACTION, EVENT_SUCCEEDED},
};

use common::TestApp;

/// `is_paid` must be true exactly when a completed payment exists for the
/// order, after every lifecycle operation.
async fn assert_projection_consistent(app: &TestApp, order_id: Uuid) {
    let order = order::Entity::find_by_id(order_id)
        .one(&*app.db)
        .await
        .unwrap()
        .expect("order exists");
    let has_completed = payment::Entity::find()
        .filter(payment::Column::OrderId.eq(order_id))
        .all(&*app.db)
        .await
        .unwrap()
        .iter()
        .any(|p| p.status == PaymentStatus::Completed);
    assert_eq!(
        order.is_paid, has_completed,
        "is_paid diverged from payment records for order {}",
        order_id
    );
}

#[tokio::test]
async fn card_payment_end_to_end_with_idempotent_replay() {
    let app = TestApp::new().await;
    let buyer = app.buyer(Uuid::new_v4());
    let order = app.create_order(&buyer, dec!(1000)).await;

    // Intent creation records a pending attempt.
    let created = app
        .services
        .payments
        .create_intent(
            CreateIntentRequest {
                order_id: order.id,
                amount: dec!(1000),
                currency: None,
            },
            &buyer,
        )
        .await
        .expect("create intent");
    assert!(created.client_secret.is_some());

    let pending = app
        .services
        .payments
        .current_payment(order.id)
        .await
        .unwrap()
        .expect("payment row");
    assert_eq!(pending.status, PaymentStatus::Pending);
    assert_eq!(pending.method, PaymentMethod::Card);
    assert_projection_consistent(&app, order.id).await;

    // Gateway reports success through the webhook pipeline.
    let event = app.gateway_event(
        EVENT_SUCCEEDED,
        &created.payment_intent_id,
        order.id,
        100_000,
    );
    let outcome = app
        .services
        .webhook_router
        .dispatch(&app.services.payments, event)
        .await
        .expect("dispatch");
    assert!(matches!(outcome, WebhookOutcome::Applied { .. }));

    let order_after = order::Entity::find_by_id(order.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert!(order_after.is_paid);
    assert!(order_after.paid_at.is_some());
    assert_eq!(order_after.status, OrderStatus::Paid);
    assert_eq!(order_after.payment_status, PaymentStatus::Completed);
    assert!(order_after.payment_completed_at.is_some());
    assert_projection_consistent(&app, order.id).await;

    let completed = app
        .services
        .payments
        .current_payment(order.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(completed.status, PaymentStatus::Completed);
    assert!(completed.processed_at.is_some());

    // Replaying the same event is a no-op: same final state, event
    // acknowledged but discarded.
    let replay = app.gateway_event(
        EVENT_SUCCEEDED,
        &created.payment_intent_id,
        order.id,
        100_000,
    );
    let outcome = app
        .services
        .webhook_router
        .dispatch(&app.services.payments, replay)
        .await
        .expect("dispatch replay");
    assert!(matches!(outcome, WebhookOutcome::Discarded { .. }));

    let after_replay = app
        .services
        .payments
        .current_payment(order.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after_replay.status, PaymentStatus::Completed);
    assert_eq!(after_replay.updated_at, completed.updated_at);
    assert_projection_consistent(&app, order.id).await;

    // The reconciled pair validates.
    let order_final = order::Entity::find_by_id(order.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    let validation = app
        .services
        .reconciliation
        .validate_order(&order_final)
        .await
        .unwrap();
    assert!(validation.is_valid);
    assert_eq!(validation.code, ValidationCode::Valid);
}

#[tokio::test]
async fn stale_events_lose_the_rank_gate() {
    let app = TestApp::new().await;
    let buyer = app.buyer(Uuid::new_v4());
    let order = app.create_order(&buyer, dec!(500)).await;

    let created = app
        .services
        .payments
        .create_intent(
            CreateIntentRequest {
                order_id: order.id,
                amount: dec!(500),
                currency: None,
            },
            &buyer,
        )
        .await
        .unwrap();

    // Success lands first.
    let succeeded = app.gateway_event(EVENT_SUCCEEDED, &created.payment_intent_id, order.id, 50_000);
    app.services
        .webhook_router
        .dispatch(&app.services.payments, succeeded)
        .await
        .unwrap();

    // A delayed lower-ranked event must not revert it.
    for kind in [EVENT_REQUIRES_ACTION, EVENT_CANCELED] {
        let stale = app.gateway_event(kind, &created.payment_intent_id, order.id, 50_000);
        let outcome = app
            .services
            .webhook_router
            .dispatch(&app.services.payments, stale)
            .await
            .unwrap();
        assert!(
            matches!(outcome, WebhookOutcome::Discarded { .. }),
            "{} should have been discarded",
            kind
        );
    }

    let payment = app
        .services
        .payments
        .current_payment(order.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);
    assert_projection_consistent(&app, order.id).await;
}

#[tokio::test]
async fn out_of_order_cancel_then_requires_action_keeps_cancel() {
    let app = TestApp::new().await;
    let buyer = app.buyer(Uuid::new_v4());
    let order = app.create_order(&buyer, dec!(250)).await;

    let created = app
        .services
        .payments
        .create_intent(
            CreateIntentRequest {
                order_id: order.id,
                amount: dec!(250),
                currency: None,
            },
            &buyer,
        )
        .await
        .unwrap();

    let cancel = app.gateway_event(EVENT_CANCELED, &created.payment_intent_id, order.id, 25_000);
    app.services
        .webhook_router
        .dispatch(&app.services.payments, cancel)
        .await
        .unwrap();

    let late = app.gateway_event(
        EVENT_REQUIRES_ACTION,
        &created.payment_intent_id,
        order.id,
        25_000,
    );
    let outcome = app
        .services
        .webhook_router
        .dispatch(&app.services.payments, late)
        .await
        .unwrap();
    assert!(matches!(outcome, WebhookOutcome::Discarded { .. }));

    let payment = app
        .services
        .payments
        .current_payment(order.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Canceled);

    let order_after = order::Entity::find_by_id(order.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order_after.payment_status, PaymentStatus::Canceled);
    assert!(order_after.payment_canceled_at.is_some());
    assert!(!order_after.is_paid);
}

#[tokio::test]
async fn amount_mismatch_creates_no_payment_row() {
    let app = TestApp::new().await;
    let buyer = app.buyer(Uuid::new_v4());
    let order = app.create_order(&buyer, dec!(1000)).await;

    let err = app
        .services
        .payments
        .create_intent(
            CreateIntentRequest {
                order_id: order.id,
                amount: dec!(1000.02),
                currency: None,
            },
            &buyer,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::AmountMismatch(_)));

    let payments = payment::Entity::find()
        .filter(payment::Column::OrderId.eq(order.id))
        .all(&*app.db)
        .await
        .unwrap();
    assert!(payments.is_empty());
    assert_eq!(app.gateway.intent_count(), 0);

    // Within the minor-unit tolerance the charge is accepted.
    let created = app
        .services
        .payments
        .create_intent(
            CreateIntentRequest {
                order_id: order.id,
                amount: dec!(1000.01),
                currency: None,
            },
            &buyer,
        )
        .await;
    assert!(created.is_ok());
}

#[tokio::test]
async fn foreign_buyer_is_forbidden() {
    let app = TestApp::new().await;
    let buyer = app.buyer(Uuid::new_v4());
    let order = app.create_order(&buyer, dec!(100)).await;

    let stranger = app.buyer(Uuid::new_v4());
    let err = app
        .services
        .payments
        .create_intent(
            CreateIntentRequest {
                order_id: order.id,
                amount: dec!(100),
                currency: None,
            },
            &stranger,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Forbidden(_)));

    // The admin may act on any order.
    let created = app
        .services
        .payments
        .create_intent(
            CreateIntentRequest {
                order_id: order.id,
                amount: dec!(100),
                currency: None,
            },
            &app.admin(),
        )
        .await;
    assert!(created.is_ok());
}

#[tokio::test]
async fn webhook_arriving_before_local_payment_row_upserts() {
    let app = TestApp::new().await;
    let buyer = app.buyer(Uuid::new_v4());
    let order = app.create_order(&buyer, dec!(750)).await;

    // No create_intent call: the event races ahead of the client flow.
    let event = app.gateway_event(EVENT_SUCCEEDED, "pi_races_ahead", order.id, 75_000);
    let outcome = app
        .services
        .webhook_router
        .dispatch(&app.services.payments, event)
        .await
        .unwrap();
    assert!(matches!(outcome, WebhookOutcome::Applied { .. }));

    let payment = app
        .services
        .payments
        .current_payment(order.id)
        .await
        .unwrap()
        .expect("upserted payment");
    assert_eq!(payment.status, PaymentStatus::Completed);
    assert_eq!(payment.transaction_id.as_deref(), Some("pi_races_ahead"));
    assert_eq!(payment.amount, dec!(750));

    let order_after = order::Entity::find_by_id(order.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert!(order_after.is_paid);
    assert_eq!(order_after.status, OrderStatus::Paid);
    assert_projection_consistent(&app, order.id).await;
}

#[tokio::test]
async fn a_second_attempt_cannot_complete_a_paid_order() {
    let app = TestApp::new().await;
    let buyer = app.buyer(Uuid::new_v4());
    let order = app.create_order(&buyer, dec!(600)).await;

    let created = app
        .services
        .payments
        .create_intent(
            CreateIntentRequest {
                order_id: order.id,
                amount: dec!(600),
                currency: None,
            },
            &buyer,
        )
        .await
        .unwrap();
    let event = app.gateway_event(EVENT_SUCCEEDED, &created.payment_intent_id, order.id, 60_000);
    app.services
        .webhook_router
        .dispatch(&app.services.payments, event)
        .await
        .unwrap();

    // A success event for a superseded intent id must not mint a second
    // completed attempt.
    let stray = app.gateway_event(EVENT_SUCCEEDED, "pi_superseded_attempt", order.id, 60_000);
    let outcome = app
        .services
        .webhook_router
        .dispatch(&app.services.payments, stray)
        .await
        .unwrap();
    assert!(matches!(outcome, WebhookOutcome::Discarded { .. }));

    let completed: Vec<_> = payment::Entity::find()
        .filter(payment::Column::OrderId.eq(order.id))
        .all(&*app.db)
        .await
        .unwrap()
        .into_iter()
        .filter(|p| p.status == PaymentStatus::Completed)
        .collect();
    assert_eq!(completed.len(), 1);
    assert_projection_consistent(&app, order.id).await;
}

#[tokio::test]
async fn webhook_for_unknown_order_fails_soft() {
    let app = TestApp::new().await;

    let event = app.gateway_event(EVENT_SUCCEEDED, "pi_orphan", Uuid::new_v4(), 10_000);
    let outcome = app
        .services
        .webhook_router
        .dispatch(&app.services.payments, event)
        .await
        .expect("soft failure, not an error");
    assert!(matches!(outcome, WebhookOutcome::OrderMissing));

    let payments = payment::Entity::find().all(&*app.db).await.unwrap();
    assert!(payments.is_empty());
}

#[tokio::test]
async fn unknown_event_kind_is_acknowledged_and_ignored() {
    let app = TestApp::new().await;
    let buyer = app.buyer(Uuid::new_v4());
    let order = app.create_order(&buyer, dec!(100)).await;

    let event = app.gateway_event("payment_intent.amount_capturable_updated", "pi_x", order.id, 10_000);
    let outcome = app
        .services
        .webhook_router
        .dispatch(&app.services.payments, event)
        .await
        .unwrap();
    assert!(matches!(outcome, WebhookOutcome::Discarded { .. }));
}

#[tokio::test]
async fn confirm_intent_applies_gateway_state() {
    let app = TestApp::new().await;
    let buyer = app.buyer(Uuid::new_v4());
    let order = app.create_order(&buyer, dec!(300)).await;

    let created = app
        .services
        .payments
        .create_intent(
            CreateIntentRequest {
                order_id: order.id,
                amount: dec!(300),
                currency: None,
            },
            &buyer,
        )
        .await
        .unwrap();

    // Client-side auth finished; the gateway now reports success.
    app.gateway
        .set_status(&created.payment_intent_id, IntentStatus::Succeeded);

    let confirmed = app
        .services
        .payments
        .confirm_intent(&created.payment_intent_id, order.id, &buyer)
        .await
        .unwrap();
    assert_eq!(confirmed.payment_status, PaymentStatus::Completed);
    assert!(confirmed.order.is_paid);
    assert_eq!(confirmed.order.status, OrderStatus::Paid);
    assert_projection_consistent(&app, order.id).await;

    // Confirming again is a replay.
    let err = app
        .services
        .payments
        .confirm_intent(&created.payment_intent_id, order.id, &buyer)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::AlreadyProcessed(_)));
}

#[tokio::test]
async fn confirm_intent_rejects_expired_sessions() {
    let app = TestApp::new().await;
    let buyer = app.buyer(Uuid::new_v4());
    let order = app.create_order(&buyer, dec!(300)).await;

    let created = app
        .services
        .payments
        .create_intent(
            CreateIntentRequest {
                order_id: order.id,
                amount: dec!(300),
                currency: None,
            },
            &buyer,
        )
        .await
        .unwrap();

    app.gateway
        .set_created(&created.payment_intent_id, Utc::now() - Duration::hours(2));
    app.gateway
        .set_status(&created.payment_intent_id, IntentStatus::Succeeded);

    let err = app
        .services
        .payments
        .confirm_intent(&created.payment_intent_id, order.id, &buyer)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::SessionExpired));

    // Nothing moved: the attempt is still pending and the order unpaid.
    let payment = app
        .services
        .payments
        .current_payment(order.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_projection_consistent(&app, order.id).await;
}

#[tokio::test]
async fn gateway_failure_leaves_state_untouched() {
    let app = TestApp::new().await;
    let buyer = app.buyer(Uuid::new_v4());
    let order = app.create_order(&buyer, dec!(300)).await;

    let err = app
        .services
        .payments
        .confirm_intent("pi_does_not_exist", order.id, &buyer)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::GatewayError(_)));

    let order_after = order::Entity::find_by_id(order.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    // A transport error is not a payment failure: no failure stamp.
    assert!(order_after.payment_failed_at.is_none());
    assert!(!order_after.is_paid);
}

#[tokio::test]
async fn cash_flow_settles_through_admin_override() {
    let app = TestApp::new().await;
    let buyer = app.buyer(Uuid::new_v4());
    let admin = app.admin();
    let order = app.create_order(&buyer, dec!(450)).await;

    let recorded = app
        .services
        .payments
        .confirm_cash(order.id, dec!(450), &buyer)
        .await
        .unwrap();
    assert_eq!(recorded.payment.method, PaymentMethod::Cash);
    assert_eq!(recorded.payment.gateway, "cash");
    assert_eq!(recorded.payment.status, PaymentStatus::Pending);
    assert!(recorded
        .payment
        .transaction_id
        .as_deref()
        .unwrap()
        .starts_with("cash_"));
    // Fulfillment proceeds before settlement.
    assert_eq!(recorded.order.status, OrderStatus::Confirmed);
    assert!(!recorded.order.is_paid);

    // A buyer cannot settle their own cash payment.
    let err = app
        .services
        .payments
        .update_status(recorded.payment.id, PaymentStatus::Completed, &buyer)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Forbidden(_)));

    // The admin settles it once collected.
    let settled = app
        .services
        .payments
        .update_status(recorded.payment.id, PaymentStatus::Completed, &admin)
        .await
        .unwrap();
    assert_eq!(settled.payment.status, PaymentStatus::Completed);
    assert!(settled.order.is_paid);
    assert_eq!(settled.order.status, OrderStatus::Paid);
    assert_projection_consistent(&app, order.id).await;

    // Downgrades lose the rank gate even for admins.
    let err = app
        .services
        .payments
        .update_status(recorded.payment.id, PaymentStatus::Processing, &admin)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidStatus(_)));

    // Refund, then refund again: the second call is a no-op.
    let refunded = app
        .services
        .payments
        .update_status(recorded.payment.id, PaymentStatus::Refunded, &admin)
        .await
        .unwrap();
    assert_eq!(refunded.payment.status, PaymentStatus::Refunded);
    assert!(refunded.payment.refunded_at.is_some());
    assert!(!refunded.order.is_paid);
    assert_projection_consistent(&app, order.id).await;

    let again = app
        .services
        .payments
        .update_status(recorded.payment.id, PaymentStatus::Refunded, &admin)
        .await
        .unwrap();
    assert_eq!(again.payment.status, PaymentStatus::Refunded);
    assert_eq!(again.payment.refunded_at, refunded.payment.refunded_at);
}

#[tokio::test]
async fn card_refund_goes_through_the_gateway() {
    let app = TestApp::new().await;
    let buyer = app.buyer(Uuid::new_v4());
    let admin = app.admin();
    let order = app.create_order(&buyer, dec!(800)).await;

    let created = app
        .services
        .payments
        .create_intent(
            CreateIntentRequest {
                order_id: order.id,
                amount: dec!(800),
                currency: None,
            },
            &buyer,
        )
        .await
        .unwrap();
    let event = app.gateway_event(EVENT_SUCCEEDED, &created.payment_intent_id, order.id, 80_000);
    app.services
        .webhook_router
        .dispatch(&app.services.payments, event)
        .await
        .unwrap();

    let payment = app
        .services
        .payments
        .current_payment(order.id)
        .await
        .unwrap()
        .unwrap();

    let refunded = app
        .services
        .payments
        .update_status(payment.id, PaymentStatus::Refunded, &admin)
        .await
        .unwrap();
    assert_eq!(refunded.payment.status, PaymentStatus::Refunded);
    assert!(!refunded.order.is_paid);
    // Refund details land in the audit trail.
    let audit = refunded.payment.gateway_response.expect("audit trail");
    let entries = audit.as_array().expect("audit is an array");
    assert!(entries
        .iter()
        .any(|entry| entry.get("refund_id").is_some()));
    assert_projection_consistent(&app, order.id).await;
}

#[tokio::test]
async fn stale_pending_order_is_flagged_by_the_validator() {
    let app = TestApp::new().await;
    let buyer = app.buyer(Uuid::new_v4());
    let order = app.create_order(&buyer, dec!(120)).await;

    app.services
        .payments
        .create_intent(
            CreateIntentRequest {
                order_id: order.id,
                amount: dec!(120),
                currency: None,
            },
            &buyer,
        )
        .await
        .unwrap();

    // Backdate the order past the stale-pending window.
    let mut active: order::ActiveModel = order::Entity::find_by_id(order.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap()
        .into();
    active.created_at = Set(Utc::now() - Duration::hours(25));
    active.update(&*app.db).await.unwrap();

    let stale = order::Entity::find_by_id(order.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    let validation = app
        .services
        .reconciliation
        .validate_order(&stale)
        .await
        .unwrap();
    assert!(!validation.is_valid);
    assert_eq!(validation.code, ValidationCode::ExpiredPending);

    // Buyers no longer see the abandoned order; admins see it annotated.
    let visible = app.services.orders.my_orders(&buyer).await.unwrap();
    assert!(visible.iter().all(|o| o.id != order.id));

    let (annotated, _) = app
        .services
        .orders
        .list_orders(1, 50, &app.admin())
        .await
        .unwrap();
    let entry = annotated
        .iter()
        .find(|v| v.order.id == order.id)
        .expect("admin sees the order");
    assert_eq!(entry.payment_validation.code, ValidationCode::ExpiredPending);
}
