//! # Purchase Receiving Ledger
//!
//! Converts a pending purchase order into inventory lots.
//!
//! ## Receive, All-Or-Nothing
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Receive(po)                                                            │
//! │                                                                         │
//! │  order must be 'pending' and have items                                │
//! │                                                                         │
//! │  per item:   ┌──────────────┐  ┌─────────────────────┐  ┌──────────┐  │
//! │              │ InventoryLot │  │ confirm_receive adj │  │ flow row │  │
//! │              │ (counts as   │  │ (audit trail ONLY - │  │          │  │
//! │              │  stock)      │  │  filtered from the  │  │          │  │
//! │              └──────────────┘  │  stock fold)        │  └──────────┘  │
//! │                                └─────────────────────┘                 │
//! │                                                                         │
//! │  then once:  one negative 'purchase' Transaction for the total cost    │
//! │              order → 'received'                                        │
//! │                                                                         │
//! │  One transaction. Partial receipt is not modeled.                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{NaiveDate, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use tally_core::error::{CoreError, ValidationError};
use tally_core::types::{
    reference, AdjustmentReason, PurchaseOrder, PurchaseOrderItem, PurchaseOrderStatus,
    TransactionKind, TransactionStatus,
};
use tally_core::validation;

use crate::error::{DbError, LedgerResult};
use crate::ledger::inventory::InventoryLedger;

// =============================================================================
// Requests
// =============================================================================

/// One line on a new purchase order. Batch/expiry data, when the supplier
/// provides it, travels onto the lot at receive time.
#[derive(Debug, Clone)]
pub struct NewPurchaseLine {
    pub variant_id: i64,
    pub quantity: i64,
    pub unit_cost_cents: i64,
    pub batch_number: Option<String>,
    pub manufactured_date: Option<NaiveDate>,
    pub expiry_date: Option<NaiveDate>,
}

// =============================================================================
// Purchase Ledger
// =============================================================================

/// Purchase order intake, receiving and cancellation.
#[derive(Debug, Clone)]
pub struct PurchaseLedger {
    pool: SqlitePool,
}

impl PurchaseLedger {
    /// Creates a new PurchaseLedger.
    pub fn new(pool: SqlitePool) -> Self {
        PurchaseLedger { pool }
    }

    /// Raises a pending purchase order against a supplier.
    ///
    /// Minimal intake: enough for receiving to have something to receive.
    /// Item lines are validated here and become immutable once the order
    /// leaves `pending`.
    pub async fn create_order(
        &self,
        supplier_id: i64,
        items: Vec<NewPurchaseLine>,
        user_id: i64,
    ) -> LedgerResult<PurchaseOrder> {
        validation::validate_line_count(items.len())?;
        for item in &items {
            validation::validate_quantity(item.quantity)?;
            validation::validate_price_cents(item.unit_cost_cents)?;
        }

        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let supplier: Option<i64> = sqlx::query_scalar("SELECT id FROM suppliers WHERE id = ?1")
            .bind(supplier_id)
            .fetch_optional(&mut *tx)
            .await?;
        if supplier.is_none() {
            return Err(CoreError::ReferenceNotFound {
                entity: "supplier",
                id: supplier_id,
            }
            .into());
        }

        let now = Utc::now();
        let order_id = sqlx::query(
            r#"
            INSERT INTO purchase_orders (supplier_id, status, user_id, created_at, received_at)
            VALUES (?1, ?2, ?3, ?4, NULL)
            "#,
        )
        .bind(supplier_id)
        .bind(PurchaseOrderStatus::Pending)
        .bind(user_id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for item in &items {
            let variant: Option<i64> = sqlx::query_scalar("SELECT id FROM variants WHERE id = ?1")
                .bind(item.variant_id)
                .fetch_optional(&mut *tx)
                .await?;
            if variant.is_none() {
                return Err(CoreError::ReferenceNotFound {
                    entity: "variant",
                    id: item.variant_id,
                }
                .into());
            }

            sqlx::query(
                r#"
                INSERT INTO purchase_order_items
                    (purchase_order_id, variant_id, quantity, unit_cost_cents,
                     batch_number, manufactured_date, expiry_date)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(order_id)
            .bind(item.variant_id)
            .bind(item.quantity)
            .bind(item.unit_cost_cents)
            .bind(&item.batch_number)
            .bind(item.manufactured_date)
            .bind(item.expiry_date)
            .execute(&mut *tx)
            .await?;
        }

        let order = fetch_order(&mut tx, order_id).await?;
        tx.commit().await.map_err(DbError::from)?;

        debug!(order_id, supplier_id, items = items.len(), "Purchase order created");
        Ok(order)
    }

    /// Receives a pending order: one lot + one confirm_receive adjustment +
    /// one flow row per item, one purchase transaction for the total cost,
    /// order flipped to `received`. All-or-nothing.
    pub async fn receive(&self, order_id: i64, user_id: i64) -> LedgerResult<PurchaseOrder> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let order = fetch_order(&mut tx, order_id).await?;
        if order.status != PurchaseOrderStatus::Pending {
            return Err(CoreError::InvalidStateTransition {
                entity: "purchase order",
                id: order_id,
                state: order.status.to_string(),
                operation: "receive",
            }
            .into());
        }

        let items = fetch_order_items(&mut tx, order_id).await?;
        if items.is_empty() {
            return Err(CoreError::Validation(ValidationError::Required {
                field: "purchase order items",
            })
            .into());
        }

        let now = Utc::now();
        let mut total_cost_cents: i64 = 0;

        for item in &items {
            // Intake already validated these; re-checked here because the
            // rows could predate stricter intake rules.
            if item.quantity <= 0 {
                return Err(CoreError::Validation(ValidationError::MustBePositive {
                    field: "quantity",
                })
                .into());
            }
            if item.unit_cost_cents < 0 {
                return Err(CoreError::Validation(ValidationError::MustNotBeNegative {
                    field: "unit_cost",
                })
                .into());
            }

            let lot_id = sqlx::query(
                r#"
                INSERT INTO inventory_lots
                    (variant_id, batch_number, manufactured_date, expiry_date,
                     quantity, unit_cost_cents, purchase_order_item_id, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )
            .bind(item.variant_id)
            .bind(&item.batch_number)
            .bind(item.manufactured_date)
            .bind(item.expiry_date)
            .bind(item.quantity)
            .bind(item.unit_cost_cents)
            .bind(item.id)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

            // The lot already counts as stock; this adjustment is the audit
            // record of the receipt (excluded from the stock fold).
            InventoryLedger::insert_adjustment(
                &mut tx,
                item.variant_id,
                Some(lot_id),
                item.quantity,
                AdjustmentReason::ConfirmReceive,
                Some(reference::PURCHASE_ORDER),
                Some(order_id),
                user_id,
            )
            .await?;
            InventoryLedger::insert_flow(
                &mut tx,
                item.variant_id,
                item.quantity,
                AdjustmentReason::ConfirmReceive,
                Some(reference::PURCHASE_ORDER),
                Some(order_id),
            )
            .await?;

            total_cost_cents += item.quantity * item.unit_cost_cents;
        }

        // Purchases are cash out: a single negative transaction.
        sqlx::query(
            r#"
            INSERT INTO transactions
                (purchase_order_id, amount_cents, kind, payment_method_id, status, transaction_date)
            VALUES (?1, ?2, ?3, NULL, ?4, ?5)
            "#,
        )
        .bind(order_id)
        .bind(-total_cost_cents)
        .bind(TransactionKind::Purchase)
        .bind(TransactionStatus::Completed)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE purchase_orders SET status = ?2, received_at = ?3 WHERE id = ?1",
        )
        .bind(order_id)
        .bind(PurchaseOrderStatus::Received)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let order = fetch_order(&mut tx, order_id).await?;
        tx.commit().await.map_err(DbError::from)?;

        info!(
            order_id,
            items = items.len(),
            total_cost = total_cost_cents,
            "Purchase order received"
        );
        Ok(order)
    }

    /// Cancels a pending order. Received or already cancelled orders cannot
    /// be cancelled.
    pub async fn cancel(&self, order_id: i64) -> LedgerResult<PurchaseOrder> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let order = fetch_order(&mut tx, order_id).await?;
        if order.status != PurchaseOrderStatus::Pending {
            return Err(CoreError::InvalidStateTransition {
                entity: "purchase order",
                id: order_id,
                state: order.status.to_string(),
                operation: "cancel",
            }
            .into());
        }

        sqlx::query("UPDATE purchase_orders SET status = ?2 WHERE id = ?1")
            .bind(order_id)
            .bind(PurchaseOrderStatus::Cancelled)
            .execute(&mut *tx)
            .await?;

        let order = fetch_order(&mut tx, order_id).await?;
        tx.commit().await.map_err(DbError::from)?;

        debug!(order_id, "Purchase order cancelled");
        Ok(order)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Loads one purchase order.
    pub async fn get_order(&self, order_id: i64) -> LedgerResult<PurchaseOrder> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        fetch_order(&mut conn, order_id).await
    }

    /// Loads the items of a purchase order.
    pub async fn order_items(&self, order_id: i64) -> LedgerResult<Vec<PurchaseOrderItem>> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        fetch_order_items(&mut conn, order_id).await
    }
}

// =============================================================================
// Queries
// =============================================================================

async fn fetch_order(
    conn: &mut SqliteConnection,
    order_id: i64,
) -> LedgerResult<PurchaseOrder> {
    let order = sqlx::query_as::<_, PurchaseOrder>(
        r#"
        SELECT id, supplier_id, status, user_id, created_at, received_at
        FROM purchase_orders
        WHERE id = ?1
        "#,
    )
    .bind(order_id)
    .fetch_optional(&mut *conn)
    .await?;

    order.ok_or_else(|| {
        CoreError::ReferenceNotFound {
            entity: "purchase order",
            id: order_id,
        }
        .into()
    })
}

async fn fetch_order_items(
    conn: &mut SqliteConnection,
    order_id: i64,
) -> LedgerResult<Vec<PurchaseOrderItem>> {
    let items = sqlx::query_as::<_, PurchaseOrderItem>(
        r#"
        SELECT id, purchase_order_id, variant_id, quantity, unit_cost_cents,
               batch_number, manufactured_date, expiry_date
        FROM purchase_order_items
        WHERE purchase_order_id = ?1
        ORDER BY id
        "#,
    )
    .bind(order_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(items)
}

// =============================================================================
// Unit Tests
// =============================================================================
