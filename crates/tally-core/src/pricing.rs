//! # Pricing Module
//!
//! Line gross math and invoice-level discount distribution.
//!
//! ## Where This Runs
//! ```text
//! CreateSale(items, discount)
//!      │
//!      ▼
//! line_gross_cents(price, qty, line_discount)   per line, clamped at zero
//!      │
//!      ▼
//! distribute_invoice_discount(grosses, discount)
//!      │            proportional shares, last line absorbs the remainder
//!      ▼
//! per-line net = gross − share  ──►  TaxEngine::assess
//! ```
//!
//! The distribution guarantee matters: Σ per-line distributed discount equals
//! the invoice discount *exactly*, for any number of lines and any value.

use crate::error::ValidationError;
use crate::money::{distribute_proportionally, Money};

/// Gross amount for one line: `price × qty − line_discount`, clamped at zero.
#[inline]
pub fn line_gross_cents(unit_price_cents: i64, quantity: i64, line_discount_cents: i64) -> i64 {
    (Money::from_cents(unit_price_cents).multiply_quantity(quantity)
        - Money::from_cents(line_discount_cents))
    .clamp_at_zero()
    .cents()
}

/// Distributes a single invoice-level discount across lines proportionally
/// to each line's share of the gross total. The last line absorbs the
/// rounding remainder, so the distributed parts always sum to
/// `discount_cents` exactly.
///
/// Fails if the discount exceeds the total gross - a discount cannot make
/// an invoice negative.
pub fn distribute_invoice_discount(
    grosses: &[i64],
    discount_cents: i64,
) -> Result<Vec<i64>, ValidationError> {
    let gross_total: i64 = grosses.iter().sum();
    if discount_cents > gross_total {
        return Err(ValidationError::DiscountExceedsGross {
            discount_cents,
            gross_cents: gross_total,
        });
    }

    Ok(distribute_proportionally(Money::from_cents(discount_cents), grosses)
        .into_iter()
        .map(|m| m.cents())
        .collect())
}

// =============================================================================
// Unit Tests
// =============================================================================
