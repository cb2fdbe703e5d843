//! # Error Types
//!
//! Domain-specific error types for tally-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tally-core errors (this file)                                         │
//! │  ├── CoreError        - Business rule violations                       │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  tally-db errors (separate crate)                                      │
//! │  ├── DbError          - Database operation failures                    │
//! │  └── LedgerError      - Core ∪ Db, what ledger operations return       │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → LedgerError → caller              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Principles
//! 1. Use `thiserror` for derive macros (not manual impl)
//! 2. Include context in error messages (ids, amounts, states)
//! 3. Errors are enum variants, never String
//! 4. Validation errors are raised before any transaction opens; state and
//!    stock errors surface inside the transaction and abort it

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Business rule violations raised by the ledgers.
///
/// Every variant is an expected, recoverable condition: the enclosing
/// database transaction rolls back and the caller may retry with new input.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Stock validation lost the race or the shelf is simply empty.
    ///
    /// ## When This Occurs
    /// - FIFO consumption finds less remaining stock than requested
    /// - Raised inside the same transaction that would have drawn the stock,
    ///   so two concurrent sales can never both pass a stale check
    #[error("insufficient stock for variant {variant_id}: available {available}, requested {requested}")]
    InsufficientStock {
        variant_id: i64,
        available: i64,
        requested: i64,
    },

    /// The entity is not in a state that allows the requested operation.
    ///
    /// ## When This Occurs
    /// - Cancelling a refunded sale
    /// - Adding a payment to a cancelled sale
    /// - Receiving a purchase order that is not pending
    #[error("{entity} {id} is {state}, cannot {operation}")]
    InvalidStateTransition {
        entity: &'static str,
        id: i64,
        state: String,
        operation: &'static str,
    },

    /// A return line asks for more than remains returnable.
    #[error("cannot return {requested} of sale item {sale_item_id}: only {returnable} returnable")]
    OverReturn {
        sale_item_id: i64,
        requested: i64,
        returnable: i64,
    },

    /// A referenced entity (variant, customer, payment method, supplier,
    /// sale, purchase order) does not exist.
    #[error("{entity} not found: {id}")]
    ReferenceNotFound { entity: &'static str, id: i64 },

    /// A payment would push the paid amount past the sale total.
    #[error("payment of {attempted_cents} cents exceeds outstanding balance of {balance_cents} cents")]
    PaymentExceedsTotal {
        attempted_cents: i64,
        balance_cents: i64,
    },

    /// A refund would exceed what has actually been paid.
    #[error("refund of {requested_cents} cents exceeds paid amount of {paid_cents} cents")]
    RefundExceedsPaid {
        requested_cents: i64,
        paid_cents: i64,
    },

    /// Validation error (wraps ValidationError).
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// These occur when input doesn't meet shape/range requirements and are
/// detected before the ledger touches inventory or tax computation.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field or collection is missing or empty.
    #[error("{field} is required")]
    Required { field: &'static str },

    /// Value must be strictly positive.
    #[error("{field} must be positive")]
    MustBePositive { field: &'static str },

    /// Value must not be negative.
    #[error("{field} must not be negative")]
    MustNotBeNegative { field: &'static str },

    /// Value must not be zero (signed quantities like manual corrections).
    #[error("{field} must not be zero")]
    MustBeNonZero { field: &'static str },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange {
        field: &'static str,
        min: i64,
        max: i64,
    },

    /// An invoice discount larger than the discountable amount.
    #[error("discount of {discount_cents} cents exceeds discountable amount of {gross_cents} cents")]
    DiscountExceedsGross {
        discount_cents: i64,
        gross_cents: i64,
    },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================
