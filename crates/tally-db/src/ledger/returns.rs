//! # Return Ledger
//!
//! Validates returns, restores stock, and issues the refund.
//!
//! ## CreateReturn, One Transaction
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  per requested (sale_item, quantity):                                   │
//! │                                                                         │
//! │    returnable = original quantity − already returned                   │
//! │    quantity > returnable  →  OverReturn, roll back everything          │
//! │                                                                         │
//! │    refund = quantity × frozen price_per_unit                           │
//! │             (the sale-time price, never the current catalog price)     │
//! │                                                                         │
//! │    restore stock to the lots the sale drained (FIFO cost basis kept)   │
//! │    insert ReturnItem                                                   │
//! │                                                                         │
//! │  then: one refund against the sale (negative transaction, paid amount  │
//! │  decremented, 'refunded' only when paid reaches zero)                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;

use tally_core::error::CoreError;
use tally_core::types::{reference, AdjustmentReason, Return, ReturnItem, SaleItem, SaleStatus};
use tally_core::validation;

use crate::deps::RestoreStock;
use crate::error::{DbError, LedgerResult};
use crate::ledger::inventory::InventoryLedger;
use crate::ledger::sale;

// =============================================================================
// Requests & Responses
// =============================================================================

/// One requested return line.
#[derive(Debug, Clone)]
pub struct NewReturnLine {
    pub sale_item_id: i64,
    pub quantity: i64,
}

/// What a completed return looks like to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnSummary {
    pub id: i64,
    pub total_refund_cents: i64,
    pub item_count: usize,
}

// =============================================================================
// Return Ledger
// =============================================================================

/// Accepts returns against prior sales.
#[derive(Debug, Clone)]
pub struct ReturnLedger {
    pool: SqlitePool,
}

impl ReturnLedger {
    /// Creates a new ReturnLedger.
    pub fn new(pool: SqlitePool) -> Self {
        ReturnLedger { pool }
    }

    /// Processes a return: validates each line against the returnable
    /// remainder, restores stock, records the return, refunds the sale.
    pub async fn create_return(
        &self,
        sale_id: i64,
        lines: Vec<NewReturnLine>,
        reason: Option<String>,
        user_id: i64,
    ) -> LedgerResult<ReturnSummary> {
        validation::validate_line_count(lines.len())?;
        for line in &lines {
            validation::validate_quantity(line.quantity)?;
        }

        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let sale_row = sale::fetch_sale(&mut tx, sale_id).await?;
        if sale_row.status == SaleStatus::Cancelled {
            return Err(CoreError::InvalidStateTransition {
                entity: "sale",
                id: sale_id,
                state: sale_row.status.to_string(),
                operation: "accept a return",
            }
            .into());
        }

        let now = Utc::now();
        let return_id = sqlx::query(
            r#"
            INSERT INTO returns (sale_id, reason, total_refund_cents, user_id, created_at)
            VALUES (?1, ?2, 0, ?3, ?4)
            "#,
        )
        .bind(sale_id)
        .bind(&reason)
        .bind(user_id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let mut total_refund_cents: i64 = 0;
        for line in &lines {
            let item = fetch_sale_item(&mut tx, sale_id, line.sale_item_id).await?;

            let already_returned: i64 = sqlx::query_scalar(
                "SELECT COALESCE(SUM(quantity), 0) FROM return_items WHERE sale_item_id = ?1",
            )
            .bind(item.id)
            .fetch_one(&mut *tx)
            .await?;

            let returnable = item.quantity - already_returned;
            if line.quantity > returnable {
                return Err(CoreError::OverReturn {
                    sale_item_id: item.id,
                    requested: line.quantity,
                    returnable: returnable.max(0),
                }
                .into());
            }

            // Refund at the frozen sale-time price, never the catalog price.
            let refund_cents = line.quantity * item.unit_price_cents;
            total_refund_cents += refund_cents;

            InventoryLedger::restore_consumption(
                &mut tx,
                &RestoreStock {
                    variant_id: item.variant_id,
                    sale_id,
                    quantity: line.quantity,
                    reason: AdjustmentReason::Return,
                    reference_type: reference::RETURN,
                    reference_id: return_id,
                    adjusted_by: user_id,
                },
            )
            .await?;

            sqlx::query(
                r#"
                INSERT INTO return_items (return_id, sale_item_id, quantity, refund_cents)
                VALUES (?1, ?2, ?3, ?4)
                "#,
            )
            .bind(return_id)
            .bind(item.id)
            .bind(line.quantity)
            .bind(refund_cents)
            .execute(&mut *tx)
            .await?;
        }

        if total_refund_cents > 0 {
            // Fails (rolling back the whole return) if the refund would
            // exceed what was actually paid.
            sale::apply_refund(&mut tx, sale_id, total_refund_cents).await?;
        }

        sqlx::query("UPDATE returns SET total_refund_cents = ?2 WHERE id = ?1")
            .bind(return_id)
            .bind(total_refund_cents)
            .execute(&mut *tx)
            .await?;

        tx.commit().await.map_err(DbError::from)?;

        info!(
            return_id,
            sale_id,
            refund = total_refund_cents,
            items = lines.len(),
            "Return processed"
        );
        Ok(ReturnSummary {
            id: return_id,
            total_refund_cents,
            item_count: lines.len(),
        })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Loads one return.
    pub async fn get_return(&self, return_id: i64) -> LedgerResult<Return> {
        let row = sqlx::query_as::<_, Return>(
            r#"
            SELECT id, sale_id, reason, total_refund_cents, user_id, created_at
            FROM returns
            WHERE id = ?1
            "#,
        )
        .bind(return_id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| {
            CoreError::ReferenceNotFound {
                entity: "return",
                id: return_id,
            }
            .into()
        })
    }

    /// Loads the items of a return.
    pub async fn return_items(&self, return_id: i64) -> LedgerResult<Vec<ReturnItem>> {
        let items = sqlx::query_as::<_, ReturnItem>(
            r#"
            SELECT id, return_id, sale_item_id, quantity, refund_cents
            FROM return_items
            WHERE return_id = ?1
            ORDER BY id
            "#,
        )
        .bind(return_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    /// All returns recorded against a sale, oldest first.
    pub async fn returns_for_sale(&self, sale_id: i64) -> LedgerResult<Vec<Return>> {
        let rows = sqlx::query_as::<_, Return>(
            r#"
            SELECT id, sale_id, reason, total_refund_cents, user_id, created_at
            FROM returns
            WHERE sale_id = ?1
            ORDER BY id
            "#,
        )
        .bind(sale_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

/// Loads a sale item, verifying it belongs to the given sale.
async fn fetch_sale_item(
    conn: &mut SqliteConnection,
    sale_id: i64,
    sale_item_id: i64,
) -> LedgerResult<SaleItem> {
    let item = sqlx::query_as::<_, SaleItem>(
        r#"
        SELECT id, sale_id, variant_id, quantity, unit_price_cents, unit_cost_cents,
               discount_cents, tax_rate_bps, tax_cents, tax_rule_snapshot, created_at
        FROM sale_items
        WHERE id = ?1 AND sale_id = ?2
        "#,
    )
    .bind(sale_item_id)
    .bind(sale_id)
    .fetch_optional(&mut *conn)
    .await?;

    item.ok_or_else(|| {
        CoreError::ReferenceNotFound {
            entity: "sale item",
            id: sale_item_id,
        }
        .into()
    })
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;
    use crate::ledger::sale::{CreateSale, NewPayment, NewSaleLine, SaleDetail};
    use crate::ledger::testutil;
    use crate::pool::Database;
    use tally_core::types::TaxMode;

    /// A paid sale of `quantity` units at 10.00 each, with stock received
    /// first. Returns the sale detail.
    async fn paid_sale(db: &Database, sku: &str, quantity: i64) -> SaleDetail {
        let variant_id = testutil::seed_variant(db.pool(), sku, 1_000, 400, None).await;
        testutil::receive_stock(db, variant_id, quantity + 10, 400).await;
        let method = testutil::seed_payment_method(db.pool(), &format!("Cash-{sku}")).await;

        db.sales()
            .create_sale(CreateSale {
                items: vec![NewSaleLine {
                    variant_id,
                    quantity,
                    line_discount_cents: 0,
                }],
                customer_id: None,
                discount_cents: 0,
                payments: vec![NewPayment {
                    amount_cents: 1_000 * quantity,
                    payment_method_id: method,
                }],
                tax_mode: TaxMode::Automatic,
                bill_tax_ids: None,
                user_id: 1,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_return_restores_stock_and_refunds() {
        let db = testutil::test_db().await;
        let detail = paid_sale(&db, "RET", 4).await;
        let variant_id = detail.items[0].variant_id;
        assert_eq!(db.inventory().stock_on_hand(variant_id).await.unwrap(), 10);

        let summary = db
            .returns()
            .create_return(
                detail.sale.id,
                vec![NewReturnLine {
                    sale_item_id: detail.items[0].id,
                    quantity: 3,
                }],
                Some("damaged".to_string()),
                1,
            )
            .await
            .unwrap();

        assert_eq!(summary.total_refund_cents, 3_000);
        assert_eq!(summary.item_count, 1);
        assert_eq!(db.inventory().stock_on_hand(variant_id).await.unwrap(), 13);

        // Partial refund keeps the sale paid; the paid amount dropped.
        let sale = db.sales().get_sale(detail.sale.id).await.unwrap();
        assert_eq!(sale.status, SaleStatus::Paid);
        assert_eq!(sale.paid_cents, 1_000);

        let stored = db.returns().get_return(summary.id).await.unwrap();
        assert_eq!(stored.total_refund_cents, 3_000);
        assert_eq!(stored.reason.as_deref(), Some("damaged"));
    }

    #[tokio::test]
    async fn test_full_return_flips_sale_to_refunded() {
        let db = testutil::test_db().await;
        let detail = paid_sale(&db, "FULL", 2).await;

        db.returns()
            .create_return(
                detail.sale.id,
                vec![NewReturnLine {
                    sale_item_id: detail.items[0].id,
                    quantity: 2,
                }],
                None,
                1,
            )
            .await
            .unwrap();

        let sale = db.sales().get_sale(detail.sale.id).await.unwrap();
        assert_eq!(sale.status, SaleStatus::Refunded);
        assert_eq!(sale.paid_cents, 0);

        // Refunded is terminal: no cancellation afterwards.
        let err = db.sales().cancel_sale(detail.sale.id, 1).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Core(CoreError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_over_return_is_rejected_across_multiple_returns() {
        let db = testutil::test_db().await;
        let detail = paid_sale(&db, "MULTI", 5).await;
        let item_id = detail.items[0].id;

        db.returns()
            .create_return(
                detail.sale.id,
                vec![NewReturnLine {
                    sale_item_id: item_id,
                    quantity: 3,
                }],
                None,
                1,
            )
            .await
            .unwrap();

        // Only 2 remain returnable; asking for 3 fails and writes nothing.
        let err = db
            .returns()
            .create_return(
                detail.sale.id,
                vec![NewReturnLine {
                    sale_item_id: item_id,
                    quantity: 3,
                }],
                None,
                1,
            )
            .await
            .unwrap_err();
        match err {
            LedgerError::Core(CoreError::OverReturn {
                requested,
                returnable,
                ..
            }) => {
                assert_eq!(requested, 3);
                assert_eq!(returnable, 2);
            }
            other => panic!("unexpected error: {other}"),
        }

        // The failed return left no rows behind.
        let returns = db.returns().returns_for_sale(detail.sale.id).await.unwrap();
        assert_eq!(returns.len(), 1);

        // The remaining 2 are still returnable.
        db.returns()
            .create_return(
                detail.sale.id,
                vec![NewReturnLine {
                    sale_item_id: item_id,
                    quantity: 2,
                }],
                None,
                1,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_refund_cannot_exceed_paid_amount() {
        // Partially paid sale: returning everything would refund more than
        // was paid → the whole return rolls back.
        let db = testutil::test_db().await;
        let variant_id = testutil::seed_variant(db.pool(), "PART", 1_000, 400, None).await;
        testutil::receive_stock(&db, variant_id, 10, 400).await;
        let method = testutil::seed_payment_method(db.pool(), "Cash").await;

        let detail = db
            .sales()
            .create_sale(CreateSale {
                items: vec![NewSaleLine {
                    variant_id,
                    quantity: 4,
                    line_discount_cents: 0,
                }],
                customer_id: None,
                discount_cents: 0,
                payments: vec![NewPayment {
                    amount_cents: 1_500,
                    payment_method_id: method,
                }],
                tax_mode: TaxMode::Automatic,
                bill_tax_ids: None,
                user_id: 1,
            })
            .await
            .unwrap();

        let err = db
            .returns()
            .create_return(
                detail.sale.id,
                vec![NewReturnLine {
                    sale_item_id: detail.items[0].id,
                    quantity: 4,
                }],
                None,
                1,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Core(CoreError::RefundExceedsPaid { .. })
        ));

        // Rolled back: stock still reflects the sale, no return rows.
        assert_eq!(db.inventory().stock_on_hand(variant_id).await.unwrap(), 6);
        assert!(db
            .returns()
            .returns_for_sale(detail.sale.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_return_then_cancel_never_over_credits() {
        // Return 2 of 5, then cancel the sale: the cancellation restores
        // only the remaining 3.
        let db = testutil::test_db().await;
        let detail = paid_sale(&db, "RC", 5).await;
        let variant_id = detail.items[0].variant_id;
        assert_eq!(db.inventory().stock_on_hand(variant_id).await.unwrap(), 10);

        db.returns()
            .create_return(
                detail.sale.id,
                vec![NewReturnLine {
                    sale_item_id: detail.items[0].id,
                    quantity: 2,
                }],
                None,
                1,
            )
            .await
            .unwrap();
        assert_eq!(db.inventory().stock_on_hand(variant_id).await.unwrap(), 12);

        db.sales().cancel_sale(detail.sale.id, 1).await.unwrap();
        // 15, not 17: the cancel credits only what the returns had not.
        assert_eq!(db.inventory().stock_on_hand(variant_id).await.unwrap(), 15);
    }

    #[tokio::test]
    async fn test_return_against_cancelled_sale_fails() {
        let db = testutil::test_db().await;
        let detail = paid_sale(&db, "RCX", 2).await;
        db.sales().cancel_sale(detail.sale.id, 1).await.unwrap();

        let err = db
            .returns()
            .create_return(
                detail.sale.id,
                vec![NewReturnLine {
                    sale_item_id: detail.items[0].id,
                    quantity: 1,
                }],
                None,
                1,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Core(CoreError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_return_line_must_belong_to_the_sale() {
        let db = testutil::test_db().await;
        let detail_a = paid_sale(&db, "OWN-A", 2).await;
        let detail_b = paid_sale(&db, "OWN-B", 2).await;

        // Item from sale B against sale A.
        let err = db
            .returns()
            .create_return(
                detail_a.sale.id,
                vec![NewReturnLine {
                    sale_item_id: detail_b.items[0].id,
                    quantity: 1,
                }],
                None,
                1,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Core(CoreError::ReferenceNotFound {
                entity: "sale item",
                ..
            })
        ));
    }
}
