use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Enum representing the lifecycle status of a payment attempt.
///
/// Statuses carry an integer rank used to resolve out-of-order updates:
/// a transition is applied only if the incoming status outranks the stored
/// one, or re-applies the same status. This is what keeps a late-arriving
/// `processing` webhook from clobbering an already-completed payment.
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
pub enum PaymentStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "requires_action")]
    RequiresAction,
    #[sea_orm(string_value = "canceled")]
    Canceled,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "refunded")]
    Refunded,
}

impl PaymentStatus {
    /// Monotonic ordering of statuses. Ties (`processing`/`requires_action`,
    /// `canceled`/`failed`) are intentional: neither side may overwrite the
    /// other once stored.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Processing | Self::RequiresAction => 1,
            Self::Canceled | Self::Failed => 2,
            Self::Completed => 3,
            Self::Refunded => 4,
        }
    }

    /// Terminal statuses admit no further automatic transition for this
    /// attempt; only a new attempt or an admin override moves past them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Canceled | Self::Refunded
        )
    }

    /// The rank gate: a stored status accepts `next` only if `next` strictly
    /// outranks it, or equals it (idempotent re-application).
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        next.rank() > self.rank() || next == *self
    }
}

/// How the buyer paid. Cash attempts are settled out of band; card attempts
/// run through the configured gateway.
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
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentMethod {
    #[sea_orm(string_value = "card")]
    Card,
    #[sea_orm(string_value = "cash")]
    Cash,
}

impl PaymentMethod {
    /// Whether the given gateway identifier is a plausible backend for this
    /// method. Card payments must not be recorded against the cash pseudo
    /// gateway and vice versa.
    pub fn matches_gateway(&self, gateway: &str) -> bool {
        match self {
            Self::Card => gateway != "cash",
            Self::Cash => gateway == "cash",
        }
    }
}

/// The `payments` table. One row per payment attempt; rows are never
/// deleted. Failed attempts are retained for audit and new attempts get
/// fresh rows.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize, ToSchema)]
#[schema(as = Payment)]
#[sea_orm(table_name = "payments")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// The order this attempt pays for.
    pub order_id: Uuid,

    /// The buyer the attempt belongs to.
    pub customer_id: Uuid,

    /// Charged amount; must match the order total within tolerance at
    /// creation time.
    pub amount: Decimal,
    pub currency: String,

    pub method: PaymentMethod,

    /// Which backend processed the attempt ("stripe", "mock", "cash").
    pub gateway: String,

    /// Gateway-assigned identifier. Sparse-unique: cash attempts receive a
    /// locally generated id at confirmation time.
    #[sea_orm(unique)]
    pub transaction_id: Option<String>,

    pub status: PaymentStatus,

    /// Card display data only; the full number and CVV never reach us.
    pub card_last4: Option<String>,
    pub card_brand: Option<String>,
    pub card_expiry: Option<String>,

    /// Raw gateway payloads, appended in arrival order. Diagnostic audit
    /// trail; control decisions only ever read `status`.
    pub gateway_response: Option<Json>,

    pub failure_reason: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id"
    )]
    Order,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
