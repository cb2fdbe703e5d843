//! # Sale Ledger
//!
//! Sale orchestration and the sale state machine.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   draft ──► partially_paid ──► paid ──► refunded                       │
//! │     │              │             │        (only once paid amount       │
//! │     │              │             │         has returned to zero)       │
//! │     └──────────────┴─────────────┴──► cancelled                        │
//! │                                        (never from refunded)           │
//! │                                                                         │
//! │   fulfillment: pending ──► fulfilled   (independent axis: fulfillment  │
//! │                   └──────► cancelled    ≠ payment ≠ stock)             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## CreateSale, One Transaction
//! ```text
//! validate input shape                      (before the transaction)
//! read-only stock pre-check                 (advisory)
//! ┌── BEGIN ────────────────────────────────────────────────────────┐
//! │ resolve customer exemption, payment methods, frozen pricing     │
//! │ gross per line → distribute invoice discount → net per line     │
//! │ TaxEngine::assess → authoritative grand total                   │
//! │ allocate invoice number (inside the transaction - retries with  │
//! │   the same inputs are safe, numbers are never pre-reserved)     │
//! │ INSERT sale, items (frozen snapshot), payment transactions      │
//! │ consume stock FIFO per line  ← authoritative stock check        │
//! └── COMMIT ───────────────────────────────────────────────────────┘
//! ```
//!
//! Any error anywhere rolls the whole thing back: no sale row without its
//! stock draw, no stock draw without its sale row.

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use tally_core::error::CoreError;
use tally_core::pricing::{distribute_invoice_discount, line_gross_cents};
use tally_core::tax::{TaxEngine, TaxableLine};
use tally_core::types::{
    reference, AdjustmentReason, FulfillmentStatus, Sale, SaleItem, SaleStatus, TaxMode,
    Transaction, TransactionKind, TransactionStatus,
};
use tally_core::validation;
use tally_core::ValidationError;

use crate::deps::{
    CatalogLookup, ConsumeStock, DbCatalog, DbPaymentMethods, PaymentMethodValidator,
    RestoreStock, StockGate,
};
use crate::error::{DbError, LedgerResult};
use crate::ledger::inventory::InventoryLedger;
use crate::ledger::tax;

// =============================================================================
// Requests & Responses
// =============================================================================

/// One requested line on a new sale.
#[derive(Debug, Clone)]
pub struct NewSaleLine {
    pub variant_id: i64,
    pub quantity: i64,
    /// Discount on this line alone; the invoice-level discount is
    /// distributed on top of it.
    pub line_discount_cents: i64,
}

/// One tender on a new sale (split tender is a list of these).
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub amount_cents: i64,
    pub payment_method_id: i64,
}

/// The CreateSale request.
#[derive(Debug, Clone)]
pub struct CreateSale {
    pub items: Vec<NewSaleLine>,
    pub customer_id: Option<i64>,
    /// Invoice-level discount, distributed across lines proportionally.
    pub discount_cents: i64,
    pub payments: Vec<NewPayment>,
    /// Automatic: every matching rule of the active profile applies.
    /// Manual: only the rules named in `bill_tax_ids` apply.
    pub tax_mode: TaxMode,
    /// Rule ids (from the active profile) for `TaxMode::Manual`.
    pub bill_tax_ids: Option<Vec<i64>>,
    pub user_id: i64,
}

/// A sale with its items and transactions, as persisted.
#[derive(Debug, Clone)]
pub struct SaleDetail {
    pub sale: Sale,
    pub items: Vec<SaleItem>,
    pub transactions: Vec<Transaction>,
}

/// Result of a payment or refund mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentOutcome {
    pub paid_cents: i64,
    pub status: SaleStatus,
}

// =============================================================================
// Sale Ledger
// =============================================================================

/// Orchestrates sale creation and owns the sale state machine.
///
/// Generic over its capability set (see [`crate::deps`]): catalog lookup,
/// payment method validation, and the stock gate. Production wiring is
/// [`DbSaleLedger`] via `Database::sales()`; tests may substitute any
/// capability.
#[derive(Debug, Clone)]
pub struct SaleLedger<C, P, S> {
    pool: SqlitePool,
    catalog: C,
    payment_methods: P,
    stock: S,
}

/// The production sale ledger: database-backed capabilities all the way.
pub type DbSaleLedger = SaleLedger<DbCatalog, DbPaymentMethods, InventoryLedger>;

impl<C, P, S> SaleLedger<C, P, S>
where
    C: CatalogLookup,
    P: PaymentMethodValidator,
    S: StockGate,
{
    /// Creates a new SaleLedger with the given capabilities.
    pub fn new(pool: SqlitePool, catalog: C, payment_methods: P, stock: S) -> Self {
        SaleLedger {
            pool,
            catalog,
            payment_methods,
            stock,
        }
    }

    // =========================================================================
    // CreateSale
    // =========================================================================

    /// Creates a sale: freezes pricing, distributes the discount, assesses
    /// tax, records payments, and draws stock - atomically.
    pub async fn create_sale(&self, request: CreateSale) -> LedgerResult<SaleDetail> {
        // Shape/range validation - rejected before any transaction opens.
        validation::validate_line_count(request.items.len())?;
        validation::validate_discount_cents(request.discount_cents)?;
        for line in &request.items {
            validation::validate_quantity(line.quantity)?;
            validation::validate_discount_cents(line.line_discount_cents)?;
        }
        for payment in &request.payments {
            validation::validate_payment_amount(payment.amount_cents)?;
        }

        // Read-only pre-check. Advisory only: the authoritative check is the
        // FIFO draw inside the transaction below.
        {
            let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
            for line in &request.items {
                let available = self.stock.available(&mut conn, line.variant_id).await?;
                if available < line.quantity {
                    return Err(CoreError::InsufficientStock {
                        variant_id: line.variant_id,
                        available,
                        requested: line.quantity,
                    }
                    .into());
                }
            }
        }

        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let exempt = tax::customer_is_exempt(&mut tx, request.customer_id).await?;
        for payment in &request.payments {
            self.payment_methods
                .ensure_method(&mut tx, payment.payment_method_id)
                .await?;
        }

        // Freeze catalog pricing per line.
        let mut pricings = Vec::with_capacity(request.items.len());
        for line in &request.items {
            let pricing = self.catalog.variant_pricing(&mut tx, line.variant_id).await?;
            if line.line_discount_cents > pricing.unit_price_cents * line.quantity {
                return Err(ValidationError::DiscountExceedsGross {
                    discount_cents: line.line_discount_cents,
                    gross_cents: pricing.unit_price_cents * line.quantity,
                }
                .into());
            }
            pricings.push(pricing);
        }

        // Gross per line, then the invoice discount spread over the lines.
        let grosses: Vec<i64> = request
            .items
            .iter()
            .zip(&pricings)
            .map(|(line, pricing)| {
                line_gross_cents(
                    pricing.unit_price_cents,
                    line.quantity,
                    line.line_discount_cents,
                )
            })
            .collect();
        let subtotal_cents: i64 = grosses.iter().sum();
        let shares = distribute_invoice_discount(&grosses, request.discount_cents)
            .map_err(CoreError::from)?;

        // Discounted nets feed the tax engine.
        let taxable: Vec<TaxableLine> = request
            .items
            .iter()
            .enumerate()
            .map(|(idx, line)| TaxableLine {
                unit_price_cents: pricings[idx].unit_price_cents,
                quantity: line.quantity,
                net_cents: (grosses[idx] - shares[idx]).max(0),
                tax_category_id: pricings[idx].tax_category_id,
            })
            .collect();

        let mut rules = tax::load_active_rules(&mut tx).await?;
        if request.tax_mode == TaxMode::Manual {
            // The caller picked the bill's rules; ids must come from the
            // active profile.
            let selected = request.bill_tax_ids.clone().unwrap_or_default();
            for rule_id in &selected {
                if !rules.iter().any(|r| r.id == *rule_id) {
                    return Err(CoreError::ReferenceNotFound {
                        entity: "tax rule",
                        id: *rule_id,
                    }
                    .into());
                }
            }
            rules.retain(|r| selected.contains(&r.id));
        }
        let assessment = TaxEngine::new(rules).assess(&taxable, exempt);

        // The tax engine's grand total IS the sale total.
        let total_cents = assessment.grand_total_cents;
        let paid_cents: i64 = request.payments.iter().map(|p| p.amount_cents).sum();
        if paid_cents > total_cents {
            return Err(CoreError::PaymentExceedsTotal {
                attempted_cents: paid_cents,
                balance_cents: total_cents,
            }
            .into());
        }
        let status = SaleStatus::from_amounts(paid_cents, total_cents);

        // Invoice numbers are allocated inside the transaction, never
        // pre-reserved: a failed sale leaves no gap and a retried sale
        // simply allocates again.
        let invoice_number = next_invoice_number(&mut tx).await?;
        let now = Utc::now();

        let sale_id = sqlx::query(
            r#"
            INSERT INTO sales
                (invoice_number, status, fulfillment_status,
                 subtotal_cents, discount_cents, tax_cents, total_cents, paid_cents,
                 customer_id, user_id, sale_date, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11, ?11)
            "#,
        )
        .bind(&invoice_number)
        .bind(status)
        .bind(FulfillmentStatus::Pending)
        .bind(subtotal_cents)
        .bind(request.discount_cents)
        .bind(assessment.tax_cents)
        .bind(total_cents)
        .bind(paid_cents)
        .bind(request.customer_id)
        .bind(request.user_id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for (idx, line) in request.items.iter().enumerate() {
            let line_tax = &assessment.lines[idx];
            let snapshot = serde_json::to_string(&line_tax.applied)?;

            sqlx::query(
                r#"
                INSERT INTO sale_items
                    (sale_id, variant_id, quantity, unit_price_cents, unit_cost_cents,
                     discount_cents, tax_rate_bps, tax_cents, tax_rule_snapshot, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
            )
            .bind(sale_id)
            .bind(line.variant_id)
            .bind(line.quantity)
            .bind(pricings[idx].unit_price_cents)
            .bind(pricings[idx].unit_cost_cents)
            .bind(line.line_discount_cents + shares[idx])
            .bind(line_tax.tax_rate_bps)
            .bind(line_tax.tax_cents)
            .bind(&snapshot)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        for payment in &request.payments {
            sqlx::query(
                r#"
                INSERT INTO transactions
                    (sale_id, amount_cents, kind, payment_method_id, status, transaction_date)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(sale_id)
            .bind(payment.amount_cents)
            .bind(TransactionKind::Payment)
            .bind(payment.payment_method_id)
            .bind(TransactionStatus::Completed)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        // Authoritative stock check + draw, same transaction as everything
        // above. A lost stock race rolls back the entire sale.
        for line in &request.items {
            self.stock
                .consume(
                    &mut tx,
                    &ConsumeStock {
                        variant_id: line.variant_id,
                        quantity: line.quantity,
                        reason: AdjustmentReason::Sale,
                        reference_type: reference::SALE,
                        reference_id: sale_id,
                        adjusted_by: request.user_id,
                    },
                )
                .await?;
        }

        let detail = fetch_sale_detail(&mut tx, sale_id).await?;
        tx.commit().await.map_err(DbError::from)?;

        info!(
            sale_id,
            invoice = %detail.sale.invoice_number,
            total = total_cents,
            items = detail.items.len(),
            "Sale created"
        );
        Ok(detail)
    }

    // =========================================================================
    // AddPayment
    // =========================================================================

    /// Records an additional payment towards a sale.
    ///
    /// Fails if the sale is cancelled/refunded/already paid, or if the
    /// payment would exceed the outstanding balance.
    pub async fn add_payment(
        &self,
        sale_id: i64,
        amount_cents: i64,
        payment_method_id: i64,
    ) -> LedgerResult<PaymentOutcome> {
        validation::validate_payment_amount(amount_cents)?;

        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let sale = fetch_sale(&mut tx, sale_id).await?;
        if sale.status.is_terminal() || sale.status == SaleStatus::Paid {
            return Err(CoreError::InvalidStateTransition {
                entity: "sale",
                id: sale_id,
                state: sale.status.to_string(),
                operation: "add payment",
            }
            .into());
        }

        let balance = sale.balance_cents();
        if amount_cents > balance {
            return Err(CoreError::PaymentExceedsTotal {
                attempted_cents: amount_cents,
                balance_cents: balance,
            }
            .into());
        }

        self.payment_methods
            .ensure_method(&mut tx, payment_method_id)
            .await?;

        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO transactions
                (sale_id, amount_cents, kind, payment_method_id, status, transaction_date)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(sale_id)
        .bind(amount_cents)
        .bind(TransactionKind::Payment)
        .bind(payment_method_id)
        .bind(TransactionStatus::Completed)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let new_paid = sale.paid_cents + amount_cents;
        let new_status = SaleStatus::from_amounts(new_paid, sale.total_cents);
        sqlx::query("UPDATE sales SET paid_cents = ?2, status = ?3, updated_at = ?4 WHERE id = ?1")
            .bind(sale_id)
            .bind(new_paid)
            .bind(new_status)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await.map_err(DbError::from)?;

        debug!(sale_id, amount = amount_cents, paid = new_paid, "Payment added");
        Ok(PaymentOutcome {
            paid_cents: new_paid,
            status: new_status,
        })
    }

    // =========================================================================
    // CancelSale
    // =========================================================================

    /// Cancels a sale and restores its stock to the lots it was drawn from.
    ///
    /// Fails on already cancelled or refunded sales. If parts of the sale
    /// were already returned, only the not-yet-returned remainder comes
    /// back (the restore is capped per lot).
    pub async fn cancel_sale(&self, sale_id: i64, user_id: i64) -> LedgerResult<()> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let sale = fetch_sale(&mut tx, sale_id).await?;
        if sale.status.is_terminal() {
            return Err(CoreError::InvalidStateTransition {
                entity: "sale",
                id: sale_id,
                state: sale.status.to_string(),
                operation: "cancel",
            }
            .into());
        }

        let items = fetch_items(&mut tx, sale_id).await?;
        for item in &items {
            self.stock
                .restore(
                    &mut tx,
                    &RestoreStock {
                        variant_id: item.variant_id,
                        sale_id,
                        quantity: item.quantity,
                        reason: AdjustmentReason::Cancel,
                        reference_type: reference::SALE,
                        reference_id: sale_id,
                        adjusted_by: user_id,
                    },
                )
                .await?;
        }

        sqlx::query(
            "UPDATE sales SET status = ?2, fulfillment_status = ?3, updated_at = ?4 WHERE id = ?1",
        )
        .bind(sale_id)
        .bind(SaleStatus::Cancelled)
        .bind(FulfillmentStatus::Cancelled)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await.map_err(DbError::from)?;

        info!(sale_id, items = items.len(), "Sale cancelled, stock restored");
        Ok(())
    }

    // =========================================================================
    // FulfillSale
    // =========================================================================

    /// Marks a sale's goods as handed over.
    ///
    /// Pure status transition: no inventory effect, no payment effect.
    /// Fails if already fulfilled or if the sale is cancelled.
    pub async fn fulfill_sale(&self, sale_id: i64) -> LedgerResult<()> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let sale = fetch_sale(&mut tx, sale_id).await?;
        if sale.status == SaleStatus::Cancelled {
            return Err(CoreError::InvalidStateTransition {
                entity: "sale",
                id: sale_id,
                state: sale.status.to_string(),
                operation: "fulfill",
            }
            .into());
        }
        if sale.fulfillment_status != FulfillmentStatus::Pending {
            return Err(CoreError::InvalidStateTransition {
                entity: "sale",
                id: sale_id,
                state: sale.fulfillment_status.to_string(),
                operation: "fulfill",
            }
            .into());
        }

        sqlx::query("UPDATE sales SET fulfillment_status = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(sale_id)
            .bind(FulfillmentStatus::Fulfilled)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;

        tx.commit().await.map_err(DbError::from)?;

        debug!(sale_id, "Sale fulfilled");
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Loads one sale.
    pub async fn get_sale(&self, sale_id: i64) -> LedgerResult<Sale> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        fetch_sale(&mut conn, sale_id).await
    }

    /// Loads one sale with its items and transactions.
    pub async fn sale_detail(&self, sale_id: i64) -> LedgerResult<SaleDetail> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        fetch_sale_detail(&mut conn, sale_id).await
    }
}

// =============================================================================
// Shared Queries (used by the return ledger inside ITS transaction)
// =============================================================================

pub(crate) async fn fetch_sale(conn: &mut SqliteConnection, sale_id: i64) -> LedgerResult<Sale> {
    let sale = sqlx::query_as::<_, Sale>(
        r#"
        SELECT id, invoice_number, status, fulfillment_status,
               subtotal_cents, discount_cents, tax_cents, total_cents, paid_cents,
               customer_id, user_id, sale_date, created_at, updated_at
        FROM sales
        WHERE id = ?1
        "#,
    )
    .bind(sale_id)
    .fetch_optional(&mut *conn)
    .await?;

    sale.ok_or_else(|| {
        CoreError::ReferenceNotFound {
            entity: "sale",
            id: sale_id,
        }
        .into()
    })
}

pub(crate) async fn fetch_items(
    conn: &mut SqliteConnection,
    sale_id: i64,
) -> LedgerResult<Vec<SaleItem>> {
    let items = sqlx::query_as::<_, SaleItem>(
        r#"
        SELECT id, sale_id, variant_id, quantity, unit_price_cents, unit_cost_cents,
               discount_cents, tax_rate_bps, tax_cents, tax_rule_snapshot, created_at
        FROM sale_items
        WHERE sale_id = ?1
        ORDER BY id
        "#,
    )
    .bind(sale_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(items)
}

pub(crate) async fn fetch_transactions(
    conn: &mut SqliteConnection,
    sale_id: i64,
) -> LedgerResult<Vec<Transaction>> {
    let transactions = sqlx::query_as::<_, Transaction>(
        r#"
        SELECT id, sale_id, purchase_order_id, amount_cents, kind,
               payment_method_id, status, transaction_date
        FROM transactions
        WHERE sale_id = ?1
        ORDER BY id
        "#,
    )
    .bind(sale_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(transactions)
}

async fn fetch_sale_detail(
    conn: &mut SqliteConnection,
    sale_id: i64,
) -> LedgerResult<SaleDetail> {
    let sale = fetch_sale(&mut *conn, sale_id).await?;
    let items = fetch_items(&mut *conn, sale_id).await?;
    let transactions = fetch_transactions(&mut *conn, sale_id).await?;
    Ok(SaleDetail {
        sale,
        items,
        transactions,
    })
}

/// Allocates the next invoice number, inside the caller's transaction.
///
/// `INV-` plus a monotonic sequence (zero-padded to three digits, growing
/// naturally past 999). Never pre-reserved: a rolled-back sale frees its
/// number for the next attempt.
async fn next_invoice_number(conn: &mut SqliteConnection) -> LedgerResult<String> {
    let seq: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) + 1 FROM sales")
        .fetch_one(&mut *conn)
        .await?;
    Ok(format!("INV-{seq:03}"))
}

/// Applies a refund to a sale: one negative transaction, paid amount
/// decremented, status flipped to `refunded` only when the paid amount
/// reaches zero. Partial refunds keep the current status.
///
/// Runs on the caller's transaction - the return ledger calls this so the
/// stock restore and the refund commit or roll back together.
pub(crate) async fn apply_refund(
    conn: &mut SqliteConnection,
    sale_id: i64,
    amount_cents: i64,
) -> LedgerResult<PaymentOutcome> {
    validation::validate_payment_amount(amount_cents)?;

    let sale = fetch_sale(&mut *conn, sale_id).await?;
    if amount_cents > sale.paid_cents {
        return Err(CoreError::RefundExceedsPaid {
            requested_cents: amount_cents,
            paid_cents: sale.paid_cents,
        }
        .into());
    }

    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO transactions
            (sale_id, amount_cents, kind, payment_method_id, status, transaction_date)
        VALUES (?1, ?2, ?3, NULL, ?4, ?5)
        "#,
    )
    .bind(sale_id)
    .bind(-amount_cents)
    .bind(TransactionKind::Refund)
    .bind(TransactionStatus::Completed)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    let new_paid = sale.paid_cents - amount_cents;
    let new_status = if new_paid == 0 {
        SaleStatus::Refunded
    } else {
        sale.status
    };
    sqlx::query("UPDATE sales SET paid_cents = ?2, status = ?3, updated_at = ?4 WHERE id = ?1")
        .bind(sale_id)
        .bind(new_paid)
        .bind(new_status)
        .bind(now)
        .execute(&mut *conn)
        .await?;

    debug!(sale_id, refund = amount_cents, paid = new_paid, "Refund applied");
    Ok(PaymentOutcome {
        paid_cents: new_paid,
        status: new_status,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;
    use crate::ledger::testutil;
    use crate::pool::Database;
    use tally_core::types::CustomerKind;

    fn one_line(variant_id: i64, quantity: i64) -> Vec<NewSaleLine> {
        vec![NewSaleLine {
            variant_id,
            quantity,
            line_discount_cents: 0,
        }]
    }

    fn no_payment_sale(items: Vec<NewSaleLine>) -> CreateSale {
        CreateSale {
            items,
            customer_id: None,
            discount_cents: 0,
            payments: Vec::new(),
            tax_mode: TaxMode::Automatic,
            bill_tax_ids: None,
            user_id: 1,
        }
    }

    async fn stocked_variant(db: &Database, sku: &str, price_cents: i64, stock: i64) -> i64 {
        let variant_id = testutil::seed_variant(db.pool(), sku, price_cents, 100, None).await;
        testutil::receive_stock(db, variant_id, stock, 100).await;
        variant_id
    }

    #[tokio::test]
    async fn test_create_sale_with_item_tax() {
        // 2 units @ $50 with a single 10% item rule
        // → tax $10.00, total $110.00.
        let db = testutil::test_db().await;
        testutil::activate_simple_tax(&db, 1000).await;
        let variant_id = stocked_variant(&db, "TAXED", 5000, 10).await;

        let detail = db
            .sales()
            .create_sale(no_payment_sale(one_line(variant_id, 2)))
            .await
            .unwrap();

        assert_eq!(detail.sale.subtotal_cents, 10_000);
        assert_eq!(detail.sale.tax_cents, 1_000);
        assert_eq!(detail.sale.total_cents, 11_000);
        assert_eq!(detail.sale.status, SaleStatus::Draft);
        assert_eq!(detail.sale.invoice_number, "INV-001");

        // Frozen item snapshot carries the applied rule trace.
        let item = &detail.items[0];
        assert_eq!(item.unit_price_cents, 5000);
        assert_eq!(item.tax_cents, 1_000);
        let applied = item.applied_rules().unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].rate_bps, 1000);

        // Stock drawn inside the same transaction.
        assert_eq!(db.inventory().stock_on_hand(variant_id).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_invoice_discount_distribution_persisted() {
        // $20 over $300 and $100 gross → $15.00 and $5.00.
        let db = testutil::test_db().await;
        let variant_a = stocked_variant(&db, "BIG", 30_000, 5).await;
        let variant_b = stocked_variant(&db, "SMALL", 10_000, 5).await;

        let detail = db
            .sales()
            .create_sale(CreateSale {
                items: vec![
                    NewSaleLine {
                        variant_id: variant_a,
                        quantity: 1,
                        line_discount_cents: 0,
                    },
                    NewSaleLine {
                        variant_id: variant_b,
                        quantity: 1,
                        line_discount_cents: 0,
                    },
                ],
                customer_id: None,
                discount_cents: 2_000,
                payments: Vec::new(),
                tax_mode: TaxMode::Automatic,
                bill_tax_ids: None,
                user_id: 1,
            })
            .await
            .unwrap();

        assert_eq!(detail.items[0].discount_cents, 1_500);
        assert_eq!(detail.items[1].discount_cents, 500);
        let distributed: i64 = detail.items.iter().map(|i| i.discount_cents).sum();
        assert_eq!(distributed, detail.sale.discount_cents);

        // No tax profile active: total = subtotal − discount.
        assert_eq!(detail.sale.subtotal_cents, 40_000);
        assert_eq!(detail.sale.total_cents, 38_000);
    }

    #[tokio::test]
    async fn test_totals_reconcile() {
        // Σ price×qty − Σ item discount + Σ item tax == total, exactly.
        let db = testutil::test_db().await;
        testutil::activate_simple_tax(&db, 825).await;
        let variant_a = stocked_variant(&db, "RECON-A", 3_333, 10).await;
        let variant_b = stocked_variant(&db, "RECON-B", 1_111, 10).await;

        let detail = db
            .sales()
            .create_sale(CreateSale {
                items: vec![
                    NewSaleLine {
                        variant_id: variant_a,
                        quantity: 3,
                        line_discount_cents: 199,
                    },
                    NewSaleLine {
                        variant_id: variant_b,
                        quantity: 7,
                        line_discount_cents: 0,
                    },
                ],
                customer_id: None,
                discount_cents: 1_001,
                payments: Vec::new(),
                tax_mode: TaxMode::Automatic,
                bill_tax_ids: None,
                user_id: 1,
            })
            .await
            .unwrap();

        let gross: i64 = detail.items.iter().map(SaleItem::gross_cents).sum();
        let discount: i64 = detail.items.iter().map(|i| i.discount_cents).sum();
        let tax: i64 = detail.items.iter().map(|i| i.tax_cents).sum();
        assert_eq!(gross - discount + tax, detail.sale.total_cents);
        assert_eq!(tax, detail.sale.tax_cents);
    }

    #[tokio::test]
    async fn test_insufficient_stock_creates_nothing() {
        // Selling 11 when only 10 are in stock → InsufficientStock, no sale row,
        // no adjustment.
        let db = testutil::test_db().await;
        let variant_id = stocked_variant(&db, "SHORT", 1_000, 10).await;

        let err = db
            .sales()
            .create_sale(no_payment_sale(one_line(variant_id, 11)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Core(CoreError::InsufficientStock { .. })
        ));

        let sale_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sales")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(sale_count, 0);
        // Only the receive adjustment exists.
        let adjustments = db
            .inventory()
            .adjustments_for_variant(variant_id)
            .await
            .unwrap();
        assert_eq!(adjustments.len(), 1);
    }

    #[tokio::test]
    async fn test_stock_race_is_caught_inside_the_transaction() {
        // Two lines of the same variant individually pass the pre-check but
        // jointly exceed stock: the FIFO draw inside the transaction is
        // authoritative and rolls the sale back.
        let db = testutil::test_db().await;
        let variant_id = stocked_variant(&db, "RACE", 1_000, 10).await;

        let err = db
            .sales()
            .create_sale(CreateSale {
                items: vec![
                    NewSaleLine {
                        variant_id,
                        quantity: 6,
                        line_discount_cents: 0,
                    },
                    NewSaleLine {
                        variant_id,
                        quantity: 6,
                        line_discount_cents: 0,
                    },
                ],
                customer_id: None,
                discount_cents: 0,
                payments: Vec::new(),
                tax_mode: TaxMode::Automatic,
                bill_tax_ids: None,
                user_id: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Core(CoreError::InsufficientStock { .. })
        ));
        assert_eq!(db.inventory().stock_on_hand(variant_id).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_status_derived_from_payments() {
        let db = testutil::test_db().await;
        let method = testutil::seed_payment_method(db.pool(), "Cash").await;
        let variant_id = stocked_variant(&db, "PAY", 1_000, 20).await;

        // Full payment at creation → paid.
        let paid = db
            .sales()
            .create_sale(CreateSale {
                items: one_line(variant_id, 2),
                customer_id: None,
                discount_cents: 0,
                payments: vec![NewPayment {
                    amount_cents: 2_000,
                    payment_method_id: method,
                }],
                tax_mode: TaxMode::Automatic,
                bill_tax_ids: None,
                user_id: 1,
            })
            .await
            .unwrap();
        assert_eq!(paid.sale.status, SaleStatus::Paid);
        assert_eq!(paid.transactions.len(), 1);
        assert_eq!(paid.transactions[0].kind, TransactionKind::Payment);

        // Partial payment → partially_paid.
        let partial = db
            .sales()
            .create_sale(CreateSale {
                items: one_line(variant_id, 2),
                customer_id: None,
                discount_cents: 0,
                payments: vec![NewPayment {
                    amount_cents: 500,
                    payment_method_id: method,
                }],
                tax_mode: TaxMode::Automatic,
                bill_tax_ids: None,
                user_id: 1,
            })
            .await
            .unwrap();
        assert_eq!(partial.sale.status, SaleStatus::PartiallyPaid);
        assert_eq!(partial.sale.paid_cents, 500);
    }

    #[tokio::test]
    async fn test_create_rejects_overpayment() {
        let db = testutil::test_db().await;
        let method = testutil::seed_payment_method(db.pool(), "Cash").await;
        let variant_id = stocked_variant(&db, "OVER", 1_000, 5).await;

        let err = db
            .sales()
            .create_sale(CreateSale {
                items: one_line(variant_id, 1),
                customer_id: None,
                discount_cents: 0,
                payments: vec![NewPayment {
                    amount_cents: 5_000,
                    payment_method_id: method,
                }],
                tax_mode: TaxMode::Automatic,
                bill_tax_ids: None,
                user_id: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Core(CoreError::PaymentExceedsTotal { .. })
        ));
    }

    #[tokio::test]
    async fn test_add_payment_walks_the_state_machine() {
        let db = testutil::test_db().await;
        let method = testutil::seed_payment_method(db.pool(), "Cash").await;
        let variant_id = stocked_variant(&db, "WALK", 1_000, 5).await;

        let detail = db
            .sales()
            .create_sale(no_payment_sale(one_line(variant_id, 3)))
            .await
            .unwrap();
        let sale_id = detail.sale.id;

        let outcome = db.sales().add_payment(sale_id, 1_000, method).await.unwrap();
        assert_eq!(outcome.status, SaleStatus::PartiallyPaid);

        let outcome = db.sales().add_payment(sale_id, 2_000, method).await.unwrap();
        assert_eq!(outcome.status, SaleStatus::Paid);
        assert_eq!(outcome.paid_cents, 3_000);

        // Paid sales accept no further payments.
        let err = db.sales().add_payment(sale_id, 100, method).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Core(CoreError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_add_payment_cannot_exceed_balance() {
        let db = testutil::test_db().await;
        let method = testutil::seed_payment_method(db.pool(), "Cash").await;
        let variant_id = stocked_variant(&db, "BAL", 1_000, 5).await;

        let detail = db
            .sales()
            .create_sale(no_payment_sale(one_line(variant_id, 2)))
            .await
            .unwrap();

        let err = db
            .sales()
            .add_payment(detail.sale.id, 2_001, method)
            .await
            .unwrap_err();
        match err {
            LedgerError::Core(CoreError::PaymentExceedsTotal { balance_cents, .. }) => {
                assert_eq!(balance_cents, 2_000)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_restores_stock_to_the_same_lot() {
        // Sell 6 of 10, then cancel → stock back to 10, restored
        // against the same lot.
        let db = testutil::test_db().await;
        let variant_id = stocked_variant(&db, "CANCEL", 1_000, 10).await;
        let lots = db.inventory().lots_for_variant(variant_id).await.unwrap();

        let detail = db
            .sales()
            .create_sale(no_payment_sale(one_line(variant_id, 6)))
            .await
            .unwrap();
        assert_eq!(db.inventory().stock_on_hand(variant_id).await.unwrap(), 4);

        db.sales().cancel_sale(detail.sale.id, 1).await.unwrap();
        assert_eq!(db.inventory().stock_on_hand(variant_id).await.unwrap(), 10);

        let sale = db.sales().get_sale(detail.sale.id).await.unwrap();
        assert_eq!(sale.status, SaleStatus::Cancelled);
        assert_eq!(sale.fulfillment_status, FulfillmentStatus::Cancelled);

        // The restoring adjustment credits the lot that was drained.
        let adjustments = db
            .inventory()
            .adjustments_for_variant(variant_id)
            .await
            .unwrap();
        let restore = adjustments
            .iter()
            .find(|a| a.reason == AdjustmentReason::Cancel)
            .unwrap();
        assert_eq!(restore.lot_id, Some(lots[0].id));
        assert_eq!(restore.quantity_change, 6);

        // Cancelling again is invalid.
        let err = db.sales().cancel_sale(detail.sale.id, 1).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Core(CoreError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_fulfillment_is_an_independent_axis() {
        let db = testutil::test_db().await;
        let variant_id = stocked_variant(&db, "FULFIL", 1_000, 5).await;

        let detail = db
            .sales()
            .create_sale(no_payment_sale(one_line(variant_id, 1)))
            .await
            .unwrap();

        // Unpaid sale can still be fulfilled; stock is untouched by it.
        let before = db.inventory().stock_on_hand(variant_id).await.unwrap();
        db.sales().fulfill_sale(detail.sale.id).await.unwrap();
        assert_eq!(
            db.inventory().stock_on_hand(variant_id).await.unwrap(),
            before
        );

        let sale = db.sales().get_sale(detail.sale.id).await.unwrap();
        assert_eq!(sale.fulfillment_status, FulfillmentStatus::Fulfilled);
        assert_eq!(sale.status, SaleStatus::Draft);

        // Fulfilling twice is invalid.
        let err = db.sales().fulfill_sale(detail.sale.id).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Core(CoreError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_fulfill_cancelled_sale_fails() {
        let db = testutil::test_db().await;
        let variant_id = stocked_variant(&db, "FCX", 1_000, 5).await;

        let detail = db
            .sales()
            .create_sale(no_payment_sale(one_line(variant_id, 1)))
            .await
            .unwrap();
        db.sales().cancel_sale(detail.sale.id, 1).await.unwrap();

        let err = db.sales().fulfill_sale(detail.sale.id).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Core(CoreError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_references_are_rejected() {
        let db = testutil::test_db().await;
        let variant_id = stocked_variant(&db, "REF", 1_000, 5).await;

        // Unknown variant.
        let err = db
            .sales()
            .create_sale(no_payment_sale(one_line(9999, 1)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Core(CoreError::ReferenceNotFound { entity: "variant", .. })
        ));

        // Unknown payment method.
        let err = db
            .sales()
            .create_sale(CreateSale {
                items: one_line(variant_id, 1),
                customer_id: None,
                discount_cents: 0,
                payments: vec![NewPayment {
                    amount_cents: 100,
                    payment_method_id: 77,
                }],
                tax_mode: TaxMode::Automatic,
                bill_tax_ids: None,
                user_id: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Core(CoreError::ReferenceNotFound {
                entity: "payment method",
                ..
            })
        ));

        // Unknown customer.
        let err = db
            .sales()
            .create_sale(CreateSale {
                items: one_line(variant_id, 1),
                customer_id: Some(123),
                discount_cents: 0,
                payments: Vec::new(),
                tax_mode: TaxMode::Automatic,
                bill_tax_ids: None,
                user_id: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Core(CoreError::ReferenceNotFound { entity: "customer", .. })
        ));
    }

    #[tokio::test]
    async fn test_exempt_customer_pays_no_tax() {
        let db = testutil::test_db().await;
        testutil::activate_simple_tax(&db, 1000).await;
        let exempt_id =
            testutil::seed_customer(db.pool(), "Tax Free Org", CustomerKind::Exempt).await;
        let variant_id = stocked_variant(&db, "EXEMPT", 5_000, 10).await;

        let detail = db
            .sales()
            .create_sale(CreateSale {
                items: one_line(variant_id, 2),
                customer_id: Some(exempt_id),
                discount_cents: 0,
                payments: Vec::new(),
                tax_mode: TaxMode::Automatic,
                bill_tax_ids: None,
                user_id: 1,
            })
            .await
            .unwrap();

        assert_eq!(detail.sale.tax_cents, 0);
        assert_eq!(detail.sale.total_cents, 10_000);
        assert!(detail.items[0].applied_rules().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manual_tax_mode_applies_only_the_named_rules() {
        use crate::ledger::tax::NewTaxRule;
        use tally_core::types::TaxRuleScope;

        let db = testutil::test_db().await;
        let taxes = db.taxes();
        let profile = taxes.create_profile("Picky").await.unwrap();
        let standard = taxes
            .create_rule(NewTaxRule {
                profile_id: profile.id,
                category_id: None,
                name: "Standard".to_string(),
                rule_scope: TaxRuleScope::Item,
                rate_bps: 1000,
                priority: 0,
                is_compound: false,
                min_price_cents: None,
                max_price_cents: None,
            })
            .await
            .unwrap();
        taxes
            .create_rule(NewTaxRule {
                profile_id: profile.id,
                category_id: None,
                name: "Levy".to_string(),
                rule_scope: TaxRuleScope::Invoice,
                rate_bps: 200,
                priority: 1,
                is_compound: false,
                min_price_cents: None,
                max_price_cents: None,
            })
            .await
            .unwrap();
        taxes.activate_profile(profile.id).await.unwrap();

        let variant_id = stocked_variant(&db, "MANUAL", 10_000, 10).await;

        // Only the standard rule, by id: the levy does not apply.
        let detail = db
            .sales()
            .create_sale(CreateSale {
                items: one_line(variant_id, 1),
                customer_id: None,
                discount_cents: 0,
                payments: Vec::new(),
                tax_mode: TaxMode::Manual,
                bill_tax_ids: Some(vec![standard.id]),
                user_id: 1,
            })
            .await
            .unwrap();
        assert_eq!(detail.sale.tax_cents, 1_000);
        assert_eq!(detail.sale.total_cents, 11_000);

        // Manual with no ids: zero tax.
        let detail = db
            .sales()
            .create_sale(CreateSale {
                items: one_line(variant_id, 1),
                customer_id: None,
                discount_cents: 0,
                payments: Vec::new(),
                tax_mode: TaxMode::Manual,
                bill_tax_ids: None,
                user_id: 1,
            })
            .await
            .unwrap();
        assert_eq!(detail.sale.tax_cents, 0);

        // An id outside the active profile is a reference error.
        let err = db
            .sales()
            .create_sale(CreateSale {
                items: one_line(variant_id, 1),
                customer_id: None,
                discount_cents: 0,
                payments: Vec::new(),
                tax_mode: TaxMode::Manual,
                bill_tax_ids: Some(vec![9_999]),
                user_id: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Core(CoreError::ReferenceNotFound {
                entity: "tax rule",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_invoice_numbers_are_monotonic_and_unique() {
        let db = testutil::test_db().await;
        let variant_id = stocked_variant(&db, "SEQ", 1_000, 30).await;

        let mut numbers = Vec::new();
        for _ in 0..3 {
            let detail = db
                .sales()
                .create_sale(no_payment_sale(one_line(variant_id, 1)))
                .await
                .unwrap();
            numbers.push(detail.sale.invoice_number);
        }
        assert_eq!(numbers, vec!["INV-001", "INV-002", "INV-003"]);
    }

    #[tokio::test]
    async fn test_validation_rejections_before_any_write() {
        let db = testutil::test_db().await;
        let variant_id = stocked_variant(&db, "VAL", 1_000, 5).await;

        // Empty cart.
        assert!(db.sales().create_sale(no_payment_sale(vec![])).await.is_err());
        // Zero quantity.
        assert!(db
            .sales()
            .create_sale(no_payment_sale(vec![NewSaleLine {
                variant_id,
                quantity: 0,
                line_discount_cents: 0,
            }]))
            .await
            .is_err());
        // Negative discount.
        let err = db
            .sales()
            .create_sale(CreateSale {
                items: one_line(variant_id, 1),
                customer_id: None,
                discount_cents: -5,
                payments: Vec::new(),
                tax_mode: TaxMode::Automatic,
                bill_tax_ids: None,
                user_id: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Core(CoreError::Validation(_))
        ));

        let sale_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sales")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(sale_count, 0);
    }
}
