use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use shared::{Hold, IdempotencyRecord, Order, Product};
use uuid::Uuid;

use crate::error::StoreError;

#[derive(Debug, Clone, Queryable, Insertable, Identifiable)]
#[diesel(table_name = crate::schema::products)]
pub struct ProductRow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub price: BigDecimal,
    pub stock: i32,
    pub reserved: i32,
    pub created_at: DateTime<Utc>,
}

impl From<ProductRow> for Product {
    fn from(row: ProductRow) -> Self {
        Product {
            id: row.id,
            name: row.name,
            description: row.description,
            price: row.price,
            stock: row.stock,
            reserved: row.reserved,
            created_at: row.created_at,
        }
    }
}

impl From<&Product> for ProductRow {
    fn from(product: &Product) -> Self {
        ProductRow {
            id: product.id,
            name: product.name.clone(),
            description: product.description.clone(),
            price: product.price.clone(),
            stock: product.stock,
            reserved: product.reserved,
            created_at: product.created_at,
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable, Identifiable)]
#[diesel(table_name = crate::schema::holds)]
pub struct HoldRow {
    pub id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub created_at: DateTime<Utc>,
}

impl From<HoldRow> for Hold {
    fn from(row: HoldRow) -> Self {
        Hold {
            id: row.id,
            product_id: row.product_id,
            quantity: row.quantity,
            token: row.token,
            expires_at: row.expires_at,
            used: row.used,
            created_at: row.created_at,
        }
    }
}

impl From<&Hold> for HoldRow {
    fn from(hold: &Hold) -> Self {
        HoldRow {
            id: hold.id,
            product_id: hold.product_id,
            quantity: hold.quantity,
            token: hold.token.clone(),
            expires_at: hold.expires_at,
            used: hold.used,
            created_at: hold.created_at,
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable, Identifiable)]
#[diesel(table_name = crate::schema::orders)]
pub struct OrderRow {
    pub id: Uuid,
    pub product_id: Uuid,
    pub hold_id: Uuid,
    pub quantity: i32,
    pub total_amount: BigDecimal,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("order {}: {}", row.id, e)))?;
        Ok(Order {
            id: row.id,
            product_id: row.product_id,
            hold_id: row.hold_id,
            quantity: row.quantity,
            total_amount: row.total_amount,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl From<&Order> for OrderRow {
    fn from(order: &Order) -> Self {
        OrderRow {
            id: order.id,
            product_id: order.product_id,
            hold_id: order.hold_id,
            quantity: order.quantity,
            total_amount: order.total_amount.clone(),
            status: order.status.as_str().to_string(),
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::idempotency_records)]
pub struct IdempotencyRow {
    pub key: String,
    pub request_fingerprint: String,
    pub response_body: String,
    pub response_status: i32,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<IdempotencyRow> for IdempotencyRecord {
    type Error = StoreError;

    fn try_from(row: IdempotencyRow) -> Result<Self, Self::Error> {
        let response_status = u16::try_from(row.response_status)
            .map_err(|_| StoreError::Corrupt(format!("idempotency key {}: status {}", row.key, row.response_status)))?;
        Ok(IdempotencyRecord {
            key: row.key,
            request_fingerprint: row.request_fingerprint,
            response_body: row.response_body,
            response_status,
            expires_at: row.expires_at,
            created_at: row.created_at,
        })
    }
}

impl From<&IdempotencyRecord> for IdempotencyRow {
    fn from(record: &IdempotencyRecord) -> Self {
        IdempotencyRow {
            key: record.key.clone(),
            request_fingerprint: record.request_fingerprint.clone(),
            response_body: record.response_body.clone(),
            response_status: i32::from(record.response_status),
            expires_at: record.expires_at,
            created_at: record.created_at,
        }
    }
}
