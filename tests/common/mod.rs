use rust_decimal::Decimal;
use sea_orm::{ConnectOptions, Database};
use sea_orm_migration::MigratorTrait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use storefront_api::{
    auth::{AuthUser, ROLE_ADMIN, ROLE_BUYER},
    config::AppConfig,
    db::DbPool,
    entities::order,
    events::EventSender,
    gateway::MockGateway,
    handlers::AppServices,
    migrator::Migrator,
    services::orders::{Address, CreateOrderRequest, OrderItemInput},
    webhooks::{self, GatewayEvent},
};

/// Test fixture wiring the service layer to an in-memory database and a
/// scriptable mock gateway.
pub struct TestApp {
    pub db: Arc<DbPool>,
    pub gateway: Arc<MockGateway>,
    pub services: AppServices,
}

impl TestApp {
    pub async fn new() -> Self {
        // A single pooled connection keeps the in-memory database alive and
        // shared for the whole test.
        let mut options = ConnectOptions::new("sqlite::memory:");
        options
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(Duration::from_secs(3600));
        let db = Database::connect(options).await.expect("connect sqlite");
        Migrator::up(&db, None).await.expect("run migrations");
        let db = Arc::new(db);

        // Drain events so senders never block.
        let (tx, mut rx) = mpsc::channel(256);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let event_sender = Arc::new(EventSender::new(tx));

        let gateway = Arc::new(MockGateway::new());
        let config = AppConfig::new(
            "sqlite::memory:".into(),
            "integration_test_jwt_secret_long_enough_for_validation_0123456789".into(),
            3600,
            "127.0.0.1".into(),
            8080,
            "development".into(),
        );

        let services =
            AppServices::with_gateway(db.clone(), event_sender, &config, gateway.clone());

        Self {
            db,
            gateway,
            services,
        }
    }

    pub fn buyer(&self, id: Uuid) -> AuthUser {
        AuthUser {
            user_id: id.to_string(),
            name: Some("Test Buyer".into()),
            email: Some("buyer@example.com".into()),
            roles: vec![ROLE_BUYER.to_string()],
            token_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn admin(&self) -> AuthUser {
        AuthUser {
            user_id: Uuid::new_v4().to_string(),
            name: Some("Test Admin".into()),
            email: Some("admin@example.com".into()),
            roles: vec![ROLE_ADMIN.to_string()],
            token_id: Uuid::new_v4().to_string(),
        }
    }

    /// Create an order for `buyer` with a single line item priced at
    /// `total`.
    pub async fn create_order(&self, buyer: &AuthUser, total: Decimal) -> order::Model {
        let request = CreateOrderRequest {
            items: vec![OrderItemInput {
                product_id: Uuid::new_v4(),
                quantity: 1,
                price: total,
                size: None,
            }],
            shipping_address: Address {
                address: "1 Market St".into(),
                city: "San Francisco".into(),
                postal_code: Some("94105".into()),
                country: Some("US".into()),
            },
            payment_method: Some("card".into()),
            items_price: None,
            shipping_price: None,
            total_price: total,
            currency: Some("usd".into()),
            notes: None,
        };
        self.services
            .orders
            .create_order(request, buyer)
            .await
            .expect("create order")
    }

    /// Build a signed-and-parsed gateway event of the given kind.
    pub fn gateway_event(
        &self,
        kind: &str,
        transaction_id: &str,
        order_id: Uuid,
        amount_minor: i64,
    ) -> GatewayEvent {
        let body = json!({
            "id": format!("evt_{}", Uuid::new_v4().simple()),
            "type": kind,
            "data": { "object": {
                "id": transaction_id,
                "amount": amount_minor,
                "currency": "usd",
                "metadata": { "order_id": order_id.to_string() },
            }}
        });
        webhooks::parse_event(body.to_string().as_bytes()).expect("parse test event")
    }
}
