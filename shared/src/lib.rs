use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub price: BigDecimal,
    pub stock: i32,
    pub reserved: i32,
    pub created_at: DateTime<Utc>,
}

impl Product {
    pub fn available(&self) -> i32 {
        self.stock - self.reserved
    }

    pub fn view(&self) -> ProductView {
        ProductView {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            price: self.price.clone(),
            stock: self.stock,
            available_stock: self.available(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProduct {
    pub name: String,
    pub description: Option<String>,
    pub price: BigDecimal,
    pub stock: i32,
}

impl NewProduct {
    /// The product offered by a freshly seeded deployment.
    pub fn flash_sale_demo() -> Self {
        Self {
            name: "Flash Sale Product".to_string(),
            description: Some("Limited edition flash sale item".to_string()),
            price: BigDecimal::from(9999) / BigDecimal::from(100),
            stock: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductView {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub price: BigDecimal,
    pub stock: i32,
    pub available_stock: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hold {
    pub id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub created_at: DateTime<Utc>,
}

impl Hold {
    pub fn new(product_id: Uuid, quantity: i32, now: DateTime<Utc>, ttl: chrono::Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            product_id,
            quantity,
            token: Uuid::new_v4().to_string(),
            expires_at: now + ttl,
            used: false,
            created_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// A hold can be turned into an order only while it is unused and unexpired.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        !self.used && !self.is_expired(now)
    }

    pub fn receipt(&self) -> HoldReceipt {
        HoldReceipt {
            hold_id: self.id,
            token: self.token.clone(),
            expires_at: self.expires_at,
            quantity: self.quantity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldReceipt {
    pub hold_id: Uuid,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub quantity: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "paid" => Ok(OrderStatus::Paid),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown order status: {0}")]
pub struct UnknownStatus(pub String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub product_id: Uuid,
    pub hold_id: Uuid,
    pub quantity: i32,
    pub total_amount: BigDecimal,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn pending(hold: &Hold, unit_price: &BigDecimal, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            product_id: hold.product_id,
            hold_id: hold.id,
            quantity: hold.quantity,
            total_amount: BigDecimal::from(hold.quantity) * unit_price,
            status: OrderStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn receipt(&self) -> OrderReceipt {
        OrderReceipt {
            order_id: self.id,
            status: self.status,
            total_amount: self.total_amount.clone(),
            quantity: self.quantity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub total_amount: BigDecimal,
    pub quantity: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HoldOutcome {
    Created(Hold),
    InsufficientStock { requested: i32, available: i32 },
    ProductNotFound,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderOutcome {
    Created(Order),
    InvalidHold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Success,
    Failed,
}

/// Payment notification as delivered by the gateway, minus its idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementPayload {
    pub status: PaymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SettlementPayload {
    pub fn success() -> Self {
        Self {
            status: PaymentStatus::Success,
            order_id: None,
            hold_token: None,
            failure_reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: PaymentStatus::Failed,
            order_id: None,
            hold_token: None,
            failure_reason: Some(reason.into()),
        }
    }

    pub fn for_order(mut self, order_id: Uuid) -> Self {
        self.order_id = Some(order_id);
        self
    }

    pub fn for_hold(mut self, token: impl Into<String>) -> Self {
        self.hold_token = Some(token.into());
        self
    }
}

/// Settlement result as seen by the transport: a status code and the exact
/// JSON body that was produced the first time the idempotency key was seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementResponse {
    pub status_code: u16,
    pub body: String,
}

impl SettlementResponse {
    pub const SETTLED: u16 = 200;
    pub const ACCEPTED: u16 = 202;
    pub const FAILED: u16 = 400;

    pub fn new(status_code: u16, body: &SettlementBody) -> serde_json::Result<Self> {
        Ok(Self {
            status_code,
            body: serde_json::to_string(body)?,
        })
    }

    pub fn json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.body)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementBody {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<OrderStatus>,
}

impl SettlementBody {
    pub fn accepted() -> Self {
        Self {
            message: "Webhook accepted, order processing".to_string(),
            order_id: None,
            status: None,
        }
    }

    pub fn for_order(message: &str, order: &Order) -> Self {
        Self {
            message: message.to_string(),
            order_id: Some(order.id),
            status: Some(order.status),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub request_fingerprint: String,
    pub response_body: String,
    pub response_status: u16,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn response(&self) -> SettlementResponse {
        SettlementResponse {
            status_code: self.response_status,
            body: self.response_body.clone(),
        }
    }
}
