use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use super::payment::PaymentStatus;

/// Fulfillment status of an order. `Paid` is only ever entered as a
/// consequence of the payment projection flipping `is_paid`; it is not a
/// status fulfillment operations may set directly.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
    strum::Display,
    strum::EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "confirmed")]
    Confirmed,
    #[sea_orm(string_value = "paid")]
    Paid,
    #[sea_orm(string_value = "shipped")]
    Shipped,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

/// The `orders` table.
///
/// Alongside fulfillment state the order carries a denormalized projection
/// of its current payment attempt (`payment_status`, `is_paid`, `paid_at`,
/// `payment_result`) for read-path convenience. The projection is written
/// only by the payment lifecycle code, in the same transaction as the
/// payment row itself.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize, Validate, ToSchema)]
#[schema(as = Order)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(unique)]
    #[validate(length(
        min = 1,
        max = 50,
        message = "Order number must be between 1 and 50 characters"
    ))]
    pub order_number: String,

    pub customer_id: Uuid,

    pub status: OrderStatus,

    /// Authoritative charge amounts, immutable after creation.
    pub items_price: Decimal,
    pub shipping_price: Decimal,
    pub total_price: Decimal,
    pub currency: String,

    /// Mirrors the method the buyer chose at checkout ("card" or "cash").
    pub payment_method: String,

    /// Projection of the current payment attempt's status.
    pub payment_status: PaymentStatus,

    pub is_paid: bool,
    pub paid_at: Option<DateTime<Utc>>,

    /// Last-known gateway identifiers/status, display only.
    pub payment_result: Option<Json>,

    /// Payment lifecycle timestamps, appended as the attempt advances and
    /// never retracted.
    pub payment_initiated_at: Option<DateTime<Utc>>,
    pub payment_completed_at: Option<DateTime<Utc>>,
    pub payment_failed_at: Option<DateTime<Utc>>,
    pub payment_canceled_at: Option<DateTime<Utc>>,

    pub shipping_address: Option<Json>,
    pub notes: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItem,
    #[sea_orm(has_many = "super::payment::Entity")]
    Payments,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItem.def()
    }
}

impl Related<super::payment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Payments.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
