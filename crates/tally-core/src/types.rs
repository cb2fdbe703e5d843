//! # Domain Types
//!
//! Core domain types for the sale transaction ledger.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │      Sale       │   │  InventoryLot   │   │   Transaction   │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  invoice_number │   │  quantity       │   │  amount (±)     │       │
//! │  │  status         │   │  (immutable)    │   │  kind           │       │
//! │  │  paid_cents     │   │  unit_cost      │   │  sale/po ref    │       │
//! │  └───────┬─────────┘   └───────┬─────────┘   └─────────────────┘       │
//! │          │ 1:N                 │ drained by                             │
//! │  ┌───────▼─────────┐   ┌───────▼──────────────┐                        │
//! │  │    SaleItem     │   │ InventoryAdjustment  │  append-only,          │
//! │  │  frozen price   │   │  signed qty change   │  never updated         │
//! │  │  tax snapshot   │   │  reason + reference  │  or deleted            │
//! │  └─────────────────┘   └──────────────────────┘                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Conventions
//! - Every entity is keyed by a surrogate integer id (SQLite AUTOINCREMENT)
//! - Monetary fields are integer cents (`*_cents`), rates basis points
//! - Status enums are stored as snake_case TEXT; the `sqlx` feature adds the
//!   database derives without pulling sqlx into pure-logic builds

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::money::Money;

// =============================================================================
// Tax Rate
// =============================================================================

/// Tax rate represented in basis points (bps).
///
/// ## Why Basis Points?
/// 1 basis point = 0.01% = 1/10000
/// 825 bps = 8.25%. Integer all the way down - no float drift in rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxRate(u32);

impl TaxRate {
    /// Creates a tax rate from basis points.
    #[inline]
    pub const fn from_bps(bps: u32) -> Self {
        TaxRate(bps)
    }

    /// Returns the rate in basis points.
    #[inline]
    pub const fn bps(&self) -> u32 {
        self.0
    }

    /// Returns the rate as a percentage (for display only).
    #[inline]
    pub fn percentage(&self) -> f64 {
        self.0 as f64 / 100.0
    }

    /// Zero tax rate.
    #[inline]
    pub const fn zero() -> Self {
        TaxRate(0)
    }

    /// Checks if tax rate is zero.
    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Default for TaxRate {
    fn default() -> Self {
        TaxRate::zero()
    }
}

// =============================================================================
// Status Enums
// =============================================================================

/// The payment status of a sale.
///
/// `Cancelled` is reachable from draft/partially_paid/paid (never from
/// refunded); `Refunded` only from paid, once the paid amount has been fully
/// returned. Enforced by SaleLedger, not by the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum SaleStatus {
    /// Created with no payment yet.
    Draft,
    /// Some, but not all, of the total has been paid.
    PartiallyPaid,
    /// Paid in full.
    Paid,
    /// Cancelled; stock restored.
    Cancelled,
    /// Fully refunded (paid amount returned to zero).
    Refunded,
}

impl SaleStatus {
    /// Terminal states accept no further payments or cancellation.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, SaleStatus::Cancelled | SaleStatus::Refunded)
    }

    /// Derives the payment status from amounts: `Paid` when paid covers the
    /// total, `PartiallyPaid` when something but not everything is paid,
    /// `Draft` otherwise.
    pub const fn from_amounts(paid_cents: i64, total_cents: i64) -> Self {
        if paid_cents >= total_cents {
            SaleStatus::Paid
        } else if paid_cents > 0 {
            SaleStatus::PartiallyPaid
        } else {
            SaleStatus::Draft
        }
    }
}

impl Default for SaleStatus {
    fn default() -> Self {
        SaleStatus::Draft
    }
}

impl std::fmt::Display for SaleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SaleStatus::Draft => "draft",
            SaleStatus::PartiallyPaid => "partially_paid",
            SaleStatus::Paid => "paid",
            SaleStatus::Cancelled => "cancelled",
            SaleStatus::Refunded => "refunded",
        };
        f.write_str(label)
    }
}

/// Whether a sale's goods have been handed over.
///
/// Independent of payment and of stock: fulfillment ≠ payment ≠ stock,
/// three separate axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentStatus {
    Pending,
    Fulfilled,
    Cancelled,
}

impl Default for FulfillmentStatus {
    fn default() -> Self {
        FulfillmentStatus::Pending
    }
}

impl std::fmt::Display for FulfillmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FulfillmentStatus::Pending => "pending",
            FulfillmentStatus::Fulfilled => "fulfilled",
            FulfillmentStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// The status of a purchase order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum PurchaseOrderStatus {
    Pending,
    Received,
    Cancelled,
}

impl std::fmt::Display for PurchaseOrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PurchaseOrderStatus::Pending => "pending",
            PurchaseOrderStatus::Received => "received",
            PurchaseOrderStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// The kind of a monetary transaction.
///
/// Sign convention: payments are positive, refunds negative, purchases
/// negative (cash out), purchase refunds positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Payment,
    Refund,
    Purchase,
    PurchaseRefund,
}

/// Settlement status of a transaction row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Completed,
    Voided,
}

/// Why a stock adjustment happened.
///
/// `ConfirmReceive` rows exist purely for the audit trail: the lot they
/// reference already counts as stock, so `stock_on_hand` filters them out
/// (unless lot_id is NULL) to avoid double counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentReason {
    Sale,
    Return,
    Cancel,
    Correction,
    ConfirmReceive,
}

/// Whether a tax rule applies per item or once per invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum TaxRuleScope {
    Item,
    Invoice,
}

/// How a sale selects its tax rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxMode {
    /// The engine applies every matching rule of the active profile.
    Automatic,
    /// The caller names the bill's rules explicitly (by id, from the active
    /// profile); nothing else applies.
    Manual,
}

impl Default for TaxMode {
    fn default() -> Self {
        TaxMode::Automatic
    }
}

/// Customer classification. `Exempt` short-circuits tax to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum CustomerKind {
    Regular,
    Exempt,
}

// =============================================================================
// Polymorphic Reference Tags
// =============================================================================

/// String tags for `reference_type` on adjustments, flows and snapshots.
/// The pair (reference_type, reference_id) points to the causing entity.
pub mod reference {
    pub const SALE: &str = "sale";
    pub const RETURN: &str = "return";
    pub const PURCHASE_ORDER: &str = "purchase_order";
    pub const MANUAL: &str = "manual";
}

// =============================================================================
// Sale
// =============================================================================

/// A sale transaction.
///
/// Created atomically with its items and transactions; afterwards mutated
/// only by AddPayment, Cancel, Fulfill, or a return's refund callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Sale {
    pub id: i64,
    /// Unique, monotonic `INV-###`, allocated inside the creating transaction.
    pub invoice_number: String,
    pub status: SaleStatus,
    pub fulfillment_status: FulfillmentStatus,
    /// Σ line gross (price × qty − line discount, clamped at zero).
    pub subtotal_cents: i64,
    /// The invoice-level discount input (distributed across lines).
    pub discount_cents: i64,
    pub tax_cents: i64,
    /// Authoritative grand total: subtotal − discount + tax.
    pub total_cents: i64,
    pub paid_cents: i64,
    pub customer_id: Option<i64>,
    pub user_id: i64,
    pub sale_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Sale {
    /// Returns the grand total as Money.
    #[inline]
    pub fn total(&self) -> Money {
        Money::from_cents(self.total_cents)
    }

    /// Returns the amount still owed (never negative).
    #[inline]
    pub fn balance_cents(&self) -> i64 {
        (self.total_cents - self.paid_cents).max(0)
    }
}

// =============================================================================
// Sale Item
// =============================================================================

/// A line item in a sale.
///
/// Uses the snapshot pattern: unit price, unit cost and the applied tax
/// rules are frozen at sale time and never recomputed from the catalog.
/// Once the sale leaves draft, items are immutable except for derived
/// returned-quantity data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct SaleItem {
    pub id: i64,
    pub sale_id: i64,
    pub variant_id: i64,
    pub quantity: i64,
    /// Unit price at time of sale (frozen).
    pub unit_price_cents: i64,
    /// Unit cost at time of sale (frozen, for margin reporting).
    pub unit_cost_cents: i64,
    /// Line discount plus this line's share of the invoice discount.
    pub discount_cents: i64,
    /// Effective tax rate over the net line amount, for display.
    pub tax_rate_bps: i64,
    pub tax_cents: i64,
    /// Serialized `Vec<AppliedTaxRule>` - the audit/replay trace.
    pub tax_rule_snapshot: String,
    pub created_at: DateTime<Utc>,
}

impl SaleItem {
    /// price × quantity, before any discount.
    #[inline]
    pub fn gross_cents(&self) -> i64 {
        self.unit_price_cents * self.quantity
    }

    /// The taxed base: gross minus all discount on this line.
    #[inline]
    pub fn net_cents(&self) -> i64 {
        (self.gross_cents() - self.discount_cents).max(0)
    }

    /// Deserializes the frozen tax rule trace.
    pub fn applied_rules(&self) -> Result<Vec<AppliedTaxRule>, serde_json::Error> {
        serde_json::from_str(&self.tax_rule_snapshot)
    }
}

// =============================================================================
// Transaction
// =============================================================================

/// A monetary movement against a sale or a purchase order.
///
/// Exactly one of `sale_id` / `purchase_order_id` is set (CHECK constraint
/// in the schema mirrors this).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Transaction {
    pub id: i64,
    pub sale_id: Option<i64>,
    pub purchase_order_id: Option<i64>,
    /// Signed; see [`TransactionKind`] for the convention.
    pub amount_cents: i64,
    pub kind: TransactionKind,
    pub payment_method_id: Option<i64>,
    pub status: TransactionStatus,
    pub transaction_date: DateTime<Utc>,
}

impl Transaction {
    /// Returns the amount as Money.
    #[inline]
    pub fn amount(&self) -> Money {
        Money::from_cents(self.amount_cents)
    }
}

// =============================================================================
// Inventory
// =============================================================================

/// One FIFO-orderable batch of received stock with its own cost basis.
///
/// `quantity` is the original received amount and is immutable; lots are
/// only ever drained through adjustments that reference them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct InventoryLot {
    pub id: i64,
    pub variant_id: i64,
    pub batch_number: Option<String>,
    pub manufactured_date: Option<NaiveDate>,
    pub expiry_date: Option<NaiveDate>,
    pub quantity: i64,
    pub unit_cost_cents: i64,
    pub purchase_order_item_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// One append-only entry in the stock audit trail.
///
/// Never updated, never deleted. Stock on hand is always a fold over
/// lots + adjustments, not a stored counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct InventoryAdjustment {
    pub id: i64,
    pub variant_id: i64,
    /// NULL means "not lot-specific" (manual correction).
    pub lot_id: Option<i64>,
    pub quantity_change: i64,
    pub reason: AdjustmentReason,
    pub reference_type: Option<String>,
    pub reference_id: Option<i64>,
    pub adjusted_by: i64,
    pub adjusted_at: DateTime<Utc>,
}

/// One row in the human-auditable movement feed, written alongside the
/// lot-precise adjustment for every stock mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct ProductFlow {
    pub id: i64,
    pub variant_id: i64,
    pub quantity_change: i64,
    pub reason: AdjustmentReason,
    pub reference_type: Option<String>,
    pub reference_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Purchasing
// =============================================================================

/// A purchase order. Items are immutable once the order leaves `pending`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct PurchaseOrder {
    pub id: i64,
    pub supplier_id: i64,
    pub status: PurchaseOrderStatus,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
    pub received_at: Option<DateTime<Utc>>,
}

/// A line on a purchase order.
///
/// Batch and expiry data, when the supplier provides it, is carried onto
/// the inventory lot created at receive time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct PurchaseOrderItem {
    pub id: i64,
    pub purchase_order_id: i64,
    pub variant_id: i64,
    pub quantity: i64,
    pub unit_cost_cents: i64,
    pub batch_number: Option<String>,
    pub manufactured_date: Option<NaiveDate>,
    pub expiry_date: Option<NaiveDate>,
}

// =============================================================================
// Returns
// =============================================================================

/// A return against one sale.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Return {
    pub id: i64,
    pub sale_id: i64,
    pub reason: Option<String>,
    pub total_refund_cents: i64,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
}

/// One returned line; quantity must never exceed the sale item's original
/// quantity minus previously returned quantity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct ReturnItem {
    pub id: i64,
    pub return_id: i64,
    pub sale_item_id: i64,
    pub quantity: i64,
    pub refund_cents: i64,
}

// =============================================================================
// Tax Configuration
// =============================================================================

/// A named set of tax rules (e.g. one region's tax regime).
/// Exactly one profile is active at a time, enforced by application logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct TaxProfile {
    pub id: i64,
    pub name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// A tax category variants can be assigned to (e.g. "groceries", "luxury").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct TaxCategory {
    pub id: i64,
    pub name: String,
}

/// A single tax rule inside a profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct TaxRule {
    pub id: i64,
    pub profile_id: i64,
    /// NULL = applies to all categories.
    pub category_id: Option<i64>,
    pub name: String,
    pub rule_scope: TaxRuleScope,
    pub rate_bps: u32,
    /// Lower evaluates first; equal priorities keep insertion order.
    pub priority: i64,
    /// Compound rules tax the running subtotal including previously
    /// applied rule amounts, not just the base price.
    pub is_compound: bool,
    /// Price band on the item's unit price; missing bound = unbounded.
    pub min_price_cents: Option<i64>,
    pub max_price_cents: Option<i64>,
}

impl TaxRule {
    /// Returns the rate as a TaxRate.
    #[inline]
    pub fn rate(&self) -> TaxRate {
        TaxRate::from_bps(self.rate_bps)
    }

    /// Whether this rule's price band admits the given unit price.
    pub fn matches_price(&self, unit_price_cents: i64) -> bool {
        if let Some(min) = self.min_price_cents {
            if unit_price_cents < min {
                return false;
            }
        }
        if let Some(max) = self.max_price_cents {
            if unit_price_cents > max {
                return false;
            }
        }
        true
    }

    /// Whether this rule's category scoping admits the given item category.
    /// A rule without a category matches everything.
    pub fn matches_category(&self, item_category: Option<i64>) -> bool {
        match self.category_id {
            None => true,
            Some(rule_cat) => item_category == Some(rule_cat),
        }
    }
}

/// One applied rule in a sale item's frozen tax trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedTaxRule {
    pub rule_id: i64,
    pub name: String,
    pub scope: TaxRuleScope,
    pub rate_bps: u32,
    pub amount_cents: i64,
    pub is_compound: bool,
}

// =============================================================================
// Collaborator References
// =============================================================================
// CRUD for these lives outside the ledger core; the ledgers only read them
// to freeze prices and validate references.

/// A sellable variant; its price and cost are frozen onto sale items at
/// sale time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Variant {
    pub id: i64,
    pub sku: String,
    pub name: String,
    pub price_cents: i64,
    pub cost_cents: i64,
    pub tax_category_id: Option<i64>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A customer; `kind = Exempt` zeroes tax on their invoices.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Customer {
    pub id: i64,
    pub name: String,
    pub kind: CustomerKind,
    pub created_at: DateTime<Utc>,
}

/// A tender type (cash, card, ...). Referenced by payment transactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct PaymentMethod {
    pub id: i64,
    pub name: String,
    pub is_active: bool,
}

/// A supplier purchase orders are raised against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Supplier {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Unit Tests
// =============================================================================
