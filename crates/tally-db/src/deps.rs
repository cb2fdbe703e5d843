//! # Capability Dependencies
//!
//! Narrow interface contracts injected into the sale ledger.
//!
//! ## Why Traits Here?
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │              The Sale Ledger's Capability Set                           │
//! │                                                                         │
//! │   SaleLedger<C, P, S>                                                  │
//! │      │                                                                  │
//! │      ├── C: CatalogLookup          "what does this variant cost?"      │
//! │      ├── P: PaymentMethodValidator "is this tender type real?"         │
//! │      └── S: StockGate              "check / draw / restore stock"      │
//! │                                                                         │
//! │   The sale ledger never imports the catalog or inventory internals     │
//! │   directly - it sees exactly these three contracts. Tests can swap     │
//! │   any of them; production wires the Db* implementations below.        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every method takes `&mut SqliteConnection` so the implementation runs on
//! the **caller's open transaction** - a capability can never accidentally
//! read stale state from outside the transaction.

use sqlx::SqliteConnection;

use tally_core::error::CoreError;
use tally_core::types::AdjustmentReason;

use crate::error::LedgerResult;
use crate::ledger::inventory::InventoryLedger;

// =============================================================================
// Contract Types
// =============================================================================

/// The catalog data a sale freezes onto its items at creation time.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VariantPricing {
    pub variant_id: i64,
    pub unit_price_cents: i64,
    pub unit_cost_cents: i64,
    pub tax_category_id: Option<i64>,
}

/// A request to draw stock FIFO from a variant's lots.
#[derive(Debug, Clone)]
pub struct ConsumeStock {
    pub variant_id: i64,
    pub quantity: i64,
    pub reason: AdjustmentReason,
    /// Polymorphic pointer to the causing entity.
    pub reference_type: &'static str,
    pub reference_id: i64,
    pub adjusted_by: i64,
}

/// A request to re-credit stock previously drawn for a sale.
#[derive(Debug, Clone)]
pub struct RestoreStock {
    pub variant_id: i64,
    /// The sale whose consumption is being undone.
    pub sale_id: i64,
    /// How much to restore; capped at the not-yet-restored remainder.
    pub quantity: i64,
    pub reason: AdjustmentReason,
    /// The causing entity (the return, or the cancelled sale itself).
    pub reference_type: &'static str,
    pub reference_id: i64,
    pub adjusted_by: i64,
}

/// One lot touched by a consume or restore, with the quantity moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LotDraw {
    pub lot_id: i64,
    pub quantity: i64,
}

// =============================================================================
// Capability Traits
// =============================================================================

/// Resolves the frozen pricing snapshot for a variant.
#[allow(async_fn_in_trait)]
pub trait CatalogLookup {
    /// Returns pricing for an active variant, or `ReferenceNotFound`.
    async fn variant_pricing(
        &self,
        conn: &mut SqliteConnection,
        variant_id: i64,
    ) -> LedgerResult<VariantPricing>;
}

/// Validates that a tender type exists and is active.
#[allow(async_fn_in_trait)]
pub trait PaymentMethodValidator {
    /// Errors with `ReferenceNotFound` for unknown or inactive methods.
    async fn ensure_method(
        &self,
        conn: &mut SqliteConnection,
        payment_method_id: i64,
    ) -> LedgerResult<()>;
}

/// The stock boundary: availability, FIFO draw, capped restore.
#[allow(async_fn_in_trait)]
pub trait StockGate {
    /// Current stock on hand for a variant.
    async fn available(&self, conn: &mut SqliteConnection, variant_id: i64) -> LedgerResult<i64>;

    /// Draws stock oldest-lot-first; errors with `InsufficientStock` when
    /// the variant's lots cannot cover the request.
    async fn consume(
        &self,
        conn: &mut SqliteConnection,
        request: &ConsumeStock,
    ) -> LedgerResult<Vec<LotDraw>>;

    /// Re-credits the lots a prior sale consumption drained, in original
    /// draw order, never crediting a lot past what it gave.
    async fn restore(
        &self,
        conn: &mut SqliteConnection,
        request: &RestoreStock,
    ) -> LedgerResult<Vec<LotDraw>>;
}

// =============================================================================
// Database-backed Implementations
// =============================================================================

/// Catalog lookup against the `variants` table.
#[derive(Debug, Clone, Copy)]
pub struct DbCatalog;

impl CatalogLookup for DbCatalog {
    async fn variant_pricing(
        &self,
        conn: &mut SqliteConnection,
        variant_id: i64,
    ) -> LedgerResult<VariantPricing> {
        let pricing = sqlx::query_as::<_, VariantPricing>(
            r#"
            SELECT
                id AS variant_id,
                price_cents AS unit_price_cents,
                cost_cents AS unit_cost_cents,
                tax_category_id
            FROM variants
            WHERE id = ?1 AND is_active = 1
            "#,
        )
        .bind(variant_id)
        .fetch_optional(&mut *conn)
        .await?;

        pricing.ok_or_else(|| {
            CoreError::ReferenceNotFound {
                entity: "variant",
                id: variant_id,
            }
            .into()
        })
    }
}

/// Payment method validation against the `payment_methods` table.
#[derive(Debug, Clone, Copy)]
pub struct DbPaymentMethods;

impl PaymentMethodValidator for DbPaymentMethods {
    async fn ensure_method(
        &self,
        conn: &mut SqliteConnection,
        payment_method_id: i64,
    ) -> LedgerResult<()> {
        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM payment_methods WHERE id = ?1 AND is_active = 1",
        )
        .bind(payment_method_id)
        .fetch_optional(&mut *conn)
        .await?;

        if exists.is_none() {
            return Err(CoreError::ReferenceNotFound {
                entity: "payment method",
                id: payment_method_id,
            }
            .into());
        }

        Ok(())
    }
}

/// The inventory ledger IS the production stock gate; the impl delegates to
/// its transaction-scoped internals.
impl StockGate for InventoryLedger {
    async fn available(&self, conn: &mut SqliteConnection, variant_id: i64) -> LedgerResult<i64> {
        InventoryLedger::stock_on_hand_in(conn, variant_id).await
    }

    async fn consume(
        &self,
        conn: &mut SqliteConnection,
        request: &ConsumeStock,
    ) -> LedgerResult<Vec<LotDraw>> {
        InventoryLedger::consume_fifo(conn, request).await
    }

    async fn restore(
        &self,
        conn: &mut SqliteConnection,
        request: &RestoreStock,
    ) -> LedgerResult<Vec<LotDraw>> {
        InventoryLedger::restore_consumption(conn, request).await
    }
}
