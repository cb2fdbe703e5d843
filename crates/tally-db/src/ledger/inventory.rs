//! # Inventory Ledger
//!
//! Stock as a fold over an append-only event log.
//!
//! ## The Stock Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  inventory_lots          what arrived (immutable batches with cost)    │
//! │  inventory_adjustments   what moved   (append-only, signed)            │
//! │                                                                         │
//! │  stock(v) = Σ lot.quantity                                             │
//! │           + Σ adj.quantity_change                                      │
//! │               WHERE reason != 'confirm_receive' OR lot_id IS NULL      │
//! │                                                                         │
//! │  The confirm_receive exclusion: receiving writes BOTH a lot (which     │
//! │  already counts as stock) and an adjustment (audit trail only).        │
//! │  Double-counting is avoided by this filter, not by omitting the        │
//! │  adjustment.                                                           │
//! │                                                                         │
//! │  There is no stored stock counter. The fold is the truth, and it is    │
//! │  trivially reconstructible from scratch.                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## FIFO
//! Consumption drains the oldest non-exhausted lot first; restoration
//! re-credits exactly the lots a consumption drained, in the original draw
//! order, so a returned unit goes back into the lot it came from and keeps
//! its cost basis for future consumption.

use std::collections::HashMap;

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use tally_core::error::{CoreError, ValidationError};
use tally_core::types::{
    reference, AdjustmentReason, InventoryAdjustment, InventoryLot, ProductFlow,
};

use crate::deps::{ConsumeStock, LotDraw, RestoreStock};
use crate::error::{DbError, LedgerResult};

/// Computes stock, draws it FIFO, and restores it - always with one
/// adjustment row and one flow row per mutation.
#[derive(Debug, Clone)]
pub struct InventoryLedger {
    pool: SqlitePool,
}

impl InventoryLedger {
    /// Creates a new InventoryLedger.
    pub fn new(pool: SqlitePool) -> Self {
        InventoryLedger { pool }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Current stock on hand for a variant.
    ///
    /// Pool-level read: fine for display and the pre-transaction check, but
    /// the authoritative check during a sale happens inside the sale's own
    /// transaction (see `consume_fifo`).
    pub async fn stock_on_hand(&self, variant_id: i64) -> LedgerResult<i64> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        Self::stock_on_hand_in(&mut conn, variant_id).await
    }

    /// All lots for a variant, oldest first.
    pub async fn lots_for_variant(&self, variant_id: i64) -> LedgerResult<Vec<InventoryLot>> {
        let lots = sqlx::query_as::<_, InventoryLot>(
            r#"
            SELECT id, variant_id, batch_number, manufactured_date, expiry_date,
                   quantity, unit_cost_cents, purchase_order_item_id, created_at
            FROM inventory_lots
            WHERE variant_id = ?1
            ORDER BY created_at, id
            "#,
        )
        .bind(variant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(lots)
    }

    /// The full audit trail for a variant, in insertion order.
    pub async fn adjustments_for_variant(
        &self,
        variant_id: i64,
    ) -> LedgerResult<Vec<InventoryAdjustment>> {
        let adjustments = sqlx::query_as::<_, InventoryAdjustment>(
            r#"
            SELECT id, variant_id, lot_id, quantity_change, reason,
                   reference_type, reference_id, adjusted_by, adjusted_at
            FROM inventory_adjustments
            WHERE variant_id = ?1
            ORDER BY id
            "#,
        )
        .bind(variant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(adjustments)
    }

    /// The movement feed for a variant, in insertion order.
    pub async fn flows_for_variant(&self, variant_id: i64) -> LedgerResult<Vec<ProductFlow>> {
        let flows = sqlx::query_as::<_, ProductFlow>(
            r#"
            SELECT id, variant_id, quantity_change, reason,
                   reference_type, reference_id, created_at
            FROM product_flows
            WHERE variant_id = ?1
            ORDER BY id
            "#,
        )
        .bind(variant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(flows)
    }

    // =========================================================================
    // Manual Correction
    // =========================================================================

    /// Records a manual, non-lot-specific stock correction.
    ///
    /// ## Rules
    /// - `quantity_change` is signed and must be non-zero
    /// - A negative correction may not push stock below zero
    /// - The adjustment row has `lot_id = NULL` ("not lot-specific") and
    ///   still counts toward stock despite the confirm_receive filter
    pub async fn record_correction(
        &self,
        variant_id: i64,
        quantity_change: i64,
        adjusted_by: i64,
    ) -> LedgerResult<InventoryAdjustment> {
        if quantity_change == 0 {
            return Err(ValidationError::MustBeNonZero {
                field: "quantity_change",
            }
            .into());
        }

        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let known: Option<i64> = sqlx::query_scalar("SELECT id FROM variants WHERE id = ?1")
            .bind(variant_id)
            .fetch_optional(&mut *tx)
            .await?;
        if known.is_none() {
            return Err(CoreError::ReferenceNotFound {
                entity: "variant",
                id: variant_id,
            }
            .into());
        }

        if quantity_change < 0 {
            let available = Self::stock_on_hand_in(&mut tx, variant_id).await?;
            if available + quantity_change < 0 {
                return Err(CoreError::InsufficientStock {
                    variant_id,
                    available,
                    requested: -quantity_change,
                }
                .into());
            }
        }

        let adjustment_id = Self::insert_adjustment(
            &mut tx,
            variant_id,
            None,
            quantity_change,
            AdjustmentReason::Correction,
            Some(reference::MANUAL),
            None,
            adjusted_by,
        )
        .await?;
        Self::insert_flow(
            &mut tx,
            variant_id,
            quantity_change,
            AdjustmentReason::Correction,
            Some(reference::MANUAL),
            None,
        )
        .await?;

        let adjustment = sqlx::query_as::<_, InventoryAdjustment>(
            r#"
            SELECT id, variant_id, lot_id, quantity_change, reason,
                   reference_type, reference_id, adjusted_by, adjusted_at
            FROM inventory_adjustments
            WHERE id = ?1
            "#,
        )
        .bind(adjustment_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await.map_err(DbError::from)?;

        debug!(variant_id, quantity_change, "Stock correction recorded");
        Ok(adjustment)
    }

    // =========================================================================
    // Transaction-scoped Internals
    // =========================================================================
    // These run on the caller's open transaction: the sale/return/cancel
    // that moves stock and the stock movement itself commit or roll back
    // together.

    /// The stock fold, evaluated on the given connection.
    pub(crate) async fn stock_on_hand_in(
        conn: &mut SqliteConnection,
        variant_id: i64,
    ) -> LedgerResult<i64> {
        let stock: i64 = sqlx::query_scalar(
            r#"
            SELECT
                COALESCE((SELECT SUM(quantity)
                          FROM inventory_lots
                          WHERE variant_id = ?1), 0)
              + COALESCE((SELECT SUM(quantity_change)
                          FROM inventory_adjustments
                          WHERE variant_id = ?1
                            AND (reason != 'confirm_receive' OR lot_id IS NULL)), 0)
            "#,
        )
        .bind(variant_id)
        .fetch_one(&mut *conn)
        .await?;

        Ok(stock)
    }

    /// Draws `request.quantity` units oldest-lot-first.
    ///
    /// The availability check and the draw share the caller's transaction:
    /// two concurrent sales cannot both pass against stale stock.
    ///
    /// Writes one adjustment per lot touched and one flow row for the whole
    /// draw. Errors with `InsufficientStock` (and writes nothing) when the
    /// lots cannot cover the request.
    pub(crate) async fn consume_fifo(
        conn: &mut SqliteConnection,
        request: &ConsumeStock,
    ) -> LedgerResult<Vec<LotDraw>> {
        // Each lot annotated with its remaining quantity. The lot's own
        // confirm_receive adjustment is audit-only and excluded, same as in
        // the stock fold.
        let lots: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT
                l.id,
                l.quantity + COALESCE((
                    SELECT SUM(a.quantity_change)
                    FROM inventory_adjustments a
                    WHERE a.lot_id = l.id AND a.reason != 'confirm_receive'
                ), 0) AS remaining
            FROM inventory_lots l
            WHERE l.variant_id = ?1
            ORDER BY l.created_at, l.id
            "#,
        )
        .bind(request.variant_id)
        .fetch_all(&mut *conn)
        .await?;

        let available: i64 = lots.iter().map(|(_, remaining)| (*remaining).max(0)).sum();
        if available < request.quantity {
            return Err(CoreError::InsufficientStock {
                variant_id: request.variant_id,
                available,
                requested: request.quantity,
            }
            .into());
        }

        let mut needed = request.quantity;
        let mut draws = Vec::new();
        for (lot_id, remaining) in lots {
            if needed == 0 {
                break;
            }
            let take = needed.min(remaining.max(0));
            if take == 0 {
                continue;
            }

            Self::insert_adjustment(
                &mut *conn,
                request.variant_id,
                Some(lot_id),
                -take,
                request.reason,
                Some(request.reference_type),
                Some(request.reference_id),
                request.adjusted_by,
            )
            .await?;
            draws.push(LotDraw {
                lot_id,
                quantity: take,
            });
            needed -= take;
        }

        Self::insert_flow(
            &mut *conn,
            request.variant_id,
            -request.quantity,
            request.reason,
            Some(request.reference_type),
            Some(request.reference_id),
        )
        .await?;

        debug!(
            variant_id = request.variant_id,
            quantity = request.quantity,
            lots = draws.len(),
            "FIFO consumption"
        );
        Ok(draws)
    }

    /// Re-credits the lots a prior sale consumption drained.
    ///
    /// Replays the original draw order, crediting each lot at most
    /// `consumed − already restored` (counting the sale's cancellation and
    /// all of its returns). Repeated partial returns followed by a
    /// cancellation therefore never over-credit a lot; a full restore
    /// mirrors the consumption exactly.
    ///
    /// Returns the credits actually made; their total may be less than
    /// `request.quantity` when most of the consumption was already undone.
    pub(crate) async fn restore_consumption(
        conn: &mut SqliteConnection,
        request: &RestoreStock,
    ) -> LedgerResult<Vec<LotDraw>> {
        // What the sale drew, per lot, in draw order.
        let consumed: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT a.lot_id, SUM(-a.quantity_change) AS consumed
            FROM inventory_adjustments a
            WHERE a.variant_id = ?1
              AND a.reason = 'sale'
              AND a.reference_type = 'sale'
              AND a.reference_id = ?2
              AND a.lot_id IS NOT NULL
            GROUP BY a.lot_id
            ORDER BY MIN(a.id)
            "#,
        )
        .bind(request.variant_id)
        .bind(request.sale_id)
        .fetch_all(&mut *conn)
        .await?;

        // What has already been credited back, per lot, via this sale's
        // cancellation or any of its returns.
        let restored_rows: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT a.lot_id, SUM(a.quantity_change)
            FROM inventory_adjustments a
            WHERE a.variant_id = ?1
              AND a.lot_id IS NOT NULL
              AND (
                    (a.reason = 'cancel' AND a.reference_type = 'sale'
                     AND a.reference_id = ?2)
                 OR (a.reason = 'return' AND a.reference_type = 'return'
                     AND a.reference_id IN (SELECT id FROM returns WHERE sale_id = ?2))
              )
            GROUP BY a.lot_id
            "#,
        )
        .bind(request.variant_id)
        .bind(request.sale_id)
        .fetch_all(&mut *conn)
        .await?;
        let restored: HashMap<i64, i64> = restored_rows.into_iter().collect();

        let mut needed = request.quantity;
        let mut credits = Vec::new();
        for (lot_id, lot_consumed) in consumed {
            if needed == 0 {
                break;
            }
            let restorable = lot_consumed - restored.get(&lot_id).copied().unwrap_or(0);
            let credit = needed.min(restorable.max(0));
            if credit == 0 {
                continue;
            }

            Self::insert_adjustment(
                &mut *conn,
                request.variant_id,
                Some(lot_id),
                credit,
                request.reason,
                Some(request.reference_type),
                Some(request.reference_id),
                request.adjusted_by,
            )
            .await?;
            credits.push(LotDraw {
                lot_id,
                quantity: credit,
            });
            needed -= credit;
        }

        let total: i64 = credits.iter().map(|c| c.quantity).sum();
        if total > 0 {
            Self::insert_flow(
                &mut *conn,
                request.variant_id,
                total,
                request.reason,
                Some(request.reference_type),
                Some(request.reference_id),
            )
            .await?;
        }

        debug!(
            variant_id = request.variant_id,
            sale_id = request.sale_id,
            requested = request.quantity,
            restored = total,
            "Stock restoration"
        );
        Ok(credits)
    }

    /// Appends one adjustment row. The trail is append-only: nothing in this
    /// crate updates or deletes from `inventory_adjustments`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn insert_adjustment(
        conn: &mut SqliteConnection,
        variant_id: i64,
        lot_id: Option<i64>,
        quantity_change: i64,
        reason: AdjustmentReason,
        reference_type: Option<&str>,
        reference_id: Option<i64>,
        adjusted_by: i64,
    ) -> LedgerResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO inventory_adjustments
                (variant_id, lot_id, quantity_change, reason,
                 reference_type, reference_id, adjusted_by, adjusted_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(variant_id)
        .bind(lot_id)
        .bind(quantity_change)
        .bind(reason)
        .bind(reference_type)
        .bind(reference_id)
        .bind(adjusted_by)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Appends one movement-feed row.
    pub(crate) async fn insert_flow(
        conn: &mut SqliteConnection,
        variant_id: i64,
        quantity_change: i64,
        reason: AdjustmentReason,
        reference_type: Option<&str>,
        reference_id: Option<i64>,
    ) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO product_flows
                (variant_id, quantity_change, reason, reference_type, reference_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(variant_id)
        .bind(quantity_change)
        .bind(reason)
        .bind(reference_type)
        .bind(reference_id)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;

        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
