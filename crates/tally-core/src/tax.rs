//! # Tax Engine
//!
//! Pure evaluation of tax rules over an invoice-shaped set of lines.
//!
//! ## Evaluation Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        TaxEngine::assess                                │
//! │                                                                         │
//! │  rules ──► partition by scope ──► stable sort by priority              │
//! │                                                                         │
//! │  for each line:                                                        │
//! │    candidates = item rules where                                       │
//! │        category matches (NULL rule category = all)                     │
//! │        AND unit price within [min_price, max_price]                    │
//! │    apply in priority order:                                            │
//! │        simple   → amount = net × rate                                  │
//! │        compound → amount = running × rate   (running includes tax      │
//! │                                              from earlier rules)       │
//! │                                                                         │
//! │  then once per invoice:                                                │
//! │    invoice rules on the tax-inclusive invoice subtotal,                │
//! │    distributed back onto lines (exact sum, last line absorbs           │
//! │    the remainder) for the audit snapshot                               │
//! │                                                                         │
//! │  exempt customer ──► zero tax, short-circuit                           │
//! │  no profile / no matching rule ──► zero tax, not an error              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine is a pure function of (rules, exemption, lines): no I/O, no
//! clock, no randomness. Loading the active profile's rules and the customer
//! record is the caller's job (see tally-db's tax module).

use serde::{Deserialize, Serialize};

use crate::money::{distribute_proportionally, Money};
use crate::types::{AppliedTaxRule, TaxRule, TaxRuleScope};

// =============================================================================
// Inputs
// =============================================================================

/// One invoice line as the tax engine sees it.
///
/// `net_cents` is the discounted line amount (gross minus line discount and
/// minus the line's share of the invoice discount) - tax is charged on what
/// the customer actually pays. `unit_price_cents` is the frozen catalog
/// price, used only for price-band rule matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxableLine {
    pub unit_price_cents: i64,
    pub quantity: i64,
    pub net_cents: i64,
    pub tax_category_id: Option<i64>,
}

// =============================================================================
// Outputs
// =============================================================================

/// Tax computed for one line, with the frozen rule trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineTax {
    pub tax_cents: i64,
    /// Effective rate over the net amount, for display (bps).
    pub tax_rate_bps: i64,
    pub applied: Vec<AppliedTaxRule>,
}

/// The full assessment for an invoice.
///
/// `tax_cents` is authoritative; per-line amounts are distributed so they
/// sum to it exactly (the remainder lands on the last line).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxAssessment {
    pub lines: Vec<LineTax>,
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub grand_total_cents: i64,
}

impl TaxAssessment {
    /// A zero assessment over `n` lines (exempt customer, no active
    /// profile, or no matching rules).
    fn zero(lines: &[TaxableLine]) -> Self {
        let subtotal: i64 = lines.iter().map(|l| l.net_cents).sum();
        TaxAssessment {
            lines: lines
                .iter()
                .map(|_| LineTax {
                    tax_cents: 0,
                    tax_rate_bps: 0,
                    applied: Vec::new(),
                })
                .collect(),
            subtotal_cents: subtotal,
            tax_cents: 0,
            grand_total_cents: subtotal,
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Evaluates a profile's rules over invoice lines.
///
/// Construction partitions the rules by scope and stable-sorts each
/// partition by priority - equal priorities keep their insertion order,
/// which is the documented tie-break, not an accident.
#[derive(Debug, Clone)]
pub struct TaxEngine {
    item_rules: Vec<TaxRule>,
    invoice_rules: Vec<TaxRule>,
}

impl TaxEngine {
    /// Builds an engine from the active profile's rules.
    ///
    /// An empty rule set is valid and assesses zero tax.
    pub fn new(mut rules: Vec<TaxRule>) -> Self {
        // sort_by_key is stable: same-priority rules stay in insertion order
        rules.sort_by_key(|r| r.priority);
        let (item_rules, invoice_rules) = rules
            .into_iter()
            .partition(|r| r.rule_scope == TaxRuleScope::Item);
        TaxEngine {
            item_rules,
            invoice_rules,
        }
    }

    /// Assesses tax for the given lines.
    ///
    /// `exempt` short-circuits the whole invoice to zero tax (customer-level
    /// exemption). Missing profiles and non-matching rules also produce
    /// zero - absence of tax is a result, never an error.
    pub fn assess(&self, lines: &[TaxableLine], exempt: bool) -> TaxAssessment {
        if exempt || lines.is_empty() || (self.item_rules.is_empty() && self.invoice_rules.is_empty())
        {
            return TaxAssessment::zero(lines);
        }

        let subtotal_cents: i64 = lines.iter().map(|l| l.net_cents).sum();

        // Pass 1: item-scope rules, per line.
        let mut line_taxes: Vec<LineTax> = Vec::with_capacity(lines.len());
        for line in lines {
            let base = line.net_cents;
            let mut running = base;
            let mut tax = 0i64;
            let mut applied = Vec::new();

            for rule in self
                .item_rules
                .iter()
                .filter(|r| r.matches_category(line.tax_category_id))
                .filter(|r| r.matches_price(line.unit_price_cents))
            {
                // Compound rules tax the running subtotal (base + taxes
                // applied so far in this pass); simple rules tax the base.
                let basis = if rule.is_compound { running } else { base };
                let amount = Money::from_cents(basis).calculate_tax(rule.rate()).cents();
                tax += amount;
                running += amount;
                applied.push(AppliedTaxRule {
                    rule_id: rule.id,
                    name: rule.name.clone(),
                    scope: TaxRuleScope::Item,
                    rate_bps: rule.rate_bps,
                    amount_cents: amount,
                    is_compound: rule.is_compound,
                });
            }

            line_taxes.push(LineTax {
                tax_cents: tax,
                tax_rate_bps: 0, // filled in below, once invoice rules ran
                applied,
            });
        }

        // Pass 2: invoice-scope rules, once, on the tax-inclusive subtotal.
        // Their amounts are distributed back onto lines proportionally to
        // each line's tax-inclusive weight - snapshot/audit data only, but
        // distributed exactly so Σ line tax always reconciles with the
        // authoritative invoice tax.
        let weights: Vec<i64> = lines
            .iter()
            .zip(&line_taxes)
            .map(|(l, t)| l.net_cents + t.tax_cents)
            .collect();
        let invoice_base: i64 = weights.iter().sum();
        let mut running_invoice = invoice_base;

        for rule in &self.invoice_rules {
            let basis = if rule.is_compound {
                running_invoice
            } else {
                invoice_base
            };
            let amount = Money::from_cents(basis).calculate_tax(rule.rate()).cents();
            running_invoice += amount;

            let shares = distribute_proportionally(Money::from_cents(amount), &weights);
            for (line_tax, share) in line_taxes.iter_mut().zip(shares) {
                line_tax.tax_cents += share.cents();
                line_tax.applied.push(AppliedTaxRule {
                    rule_id: rule.id,
                    name: rule.name.clone(),
                    scope: TaxRuleScope::Invoice,
                    rate_bps: rule.rate_bps,
                    amount_cents: share.cents(),
                    is_compound: rule.is_compound,
                });
            }
        }

        // Effective per-line rate, display only.
        for (line, line_tax) in lines.iter().zip(line_taxes.iter_mut()) {
            line_tax.tax_rate_bps = if line.net_cents > 0 {
                (line_tax.tax_cents * 10_000 + line.net_cents / 2) / line.net_cents
            } else {
                0
            };
        }

        let tax_cents: i64 = line_taxes.iter().map(|t| t.tax_cents).sum();
        TaxAssessment {
            lines: line_taxes,
            subtotal_cents,
            tax_cents,
            grand_total_cents: subtotal_cents + tax_cents,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn item_rule(id: i64, rate_bps: u32, priority: i64, compound: bool) -> TaxRule {
        TaxRule {
            id,
            profile_id: 1,
            category_id: None,
            name: format!("rule-{id}"),
            rule_scope: TaxRuleScope::Item,
            rate_bps,
            priority,
            is_compound: compound,
            min_price_cents: None,
            max_price_cents: None,
        }
    }

    fn line(unit_price: i64, qty: i64) -> TaxableLine {
        TaxableLine {
            unit_price_cents: unit_price,
            quantity: qty,
            net_cents: unit_price * qty,
            tax_category_id: None,
        }
    }

    #[test]
    fn test_two_units_at_ten_percent() {
        // 2 units @ $50 with one 10% simple item-scope rule
        // → tax $10.00, grand total $110.00
        let engine = TaxEngine::new(vec![item_rule(1, 1000, 0, false)]);
        let assessment = engine.assess(&[line(5000, 2)], false);

        assert_eq!(assessment.subtotal_cents, 10_000);
        assert_eq!(assessment.tax_cents, 1_000);
        assert_eq!(assessment.grand_total_cents, 11_000);
        assert_eq!(assessment.lines[0].tax_cents, 1_000);
        assert_eq!(assessment.lines[0].tax_rate_bps, 1_000);
    }

    #[test]
    fn test_no_rules_means_zero_tax_not_error() {
        let engine = TaxEngine::new(vec![]);
        let assessment = engine.assess(&[line(5000, 2)], false);
        assert_eq!(assessment.tax_cents, 0);
        assert_eq!(assessment.grand_total_cents, 10_000);
    }

    #[test]
    fn test_exempt_customer_short_circuits() {
        let engine = TaxEngine::new(vec![item_rule(1, 1000, 0, false)]);
        let assessment = engine.assess(&[line(5000, 2)], true);
        assert_eq!(assessment.tax_cents, 0);
        assert!(assessment.lines[0].applied.is_empty());
    }

    #[test]
    fn test_compound_rule_taxes_the_running_subtotal() {
        // 10% simple then 5% compound on $100:
        //   simple:   100.00 × 10% = 10.00
        //   compound: (100.00 + 10.00) × 5% = 5.50
        let engine = TaxEngine::new(vec![
            item_rule(1, 1000, 0, false),
            item_rule(2, 500, 1, true),
        ]);
        let assessment = engine.assess(&[line(10_000, 1)], false);
        assert_eq!(assessment.lines[0].applied[0].amount_cents, 1_000);
        assert_eq!(assessment.lines[0].applied[1].amount_cents, 550);
        assert_eq!(assessment.tax_cents, 1_550);
    }

    #[test]
    fn test_simple_rule_after_compound_still_taxes_base() {
        // A later simple rule ignores earlier tax amounts.
        let engine = TaxEngine::new(vec![
            item_rule(1, 1000, 0, true),
            item_rule(2, 1000, 1, false),
        ]);
        let assessment = engine.assess(&[line(10_000, 1)], false);
        // First (compound, but nothing applied yet): 100 × 10% = 10.00
        assert_eq!(assessment.lines[0].applied[0].amount_cents, 1_000);
        // Second (simple): still 100 × 10% = 10.00, not 110 × 10%
        assert_eq!(assessment.lines[0].applied[1].amount_cents, 1_000);
    }

    #[test]
    fn test_priority_orders_evaluation_and_ties_keep_insertion_order() {
        // Rule ids 1,2,3 with priorities 5,0,0: evaluation order is 2,3,1.
        let engine = TaxEngine::new(vec![
            item_rule(1, 100, 5, false),
            item_rule(2, 200, 0, false),
            item_rule(3, 300, 0, false),
        ]);
        let assessment = engine.assess(&[line(10_000, 1)], false);
        let order: Vec<i64> = assessment.lines[0].applied.iter().map(|a| a.rule_id).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn test_category_scoping() {
        let mut food_only = item_rule(1, 1000, 0, false);
        food_only.category_id = Some(7);
        let engine = TaxEngine::new(vec![food_only]);

        let mut food = line(1000, 1);
        food.tax_category_id = Some(7);
        let mut other = line(1000, 1);
        other.tax_category_id = Some(8);

        let assessment = engine.assess(&[food, other], false);
        assert_eq!(assessment.lines[0].tax_cents, 100);
        assert_eq!(assessment.lines[1].tax_cents, 0);
    }

    #[test]
    fn test_price_band_matches_unit_price() {
        let mut luxury = item_rule(1, 2000, 0, false);
        luxury.min_price_cents = Some(10_000);
        let engine = TaxEngine::new(vec![luxury]);

        // Unit price below the band: no tax even though qty makes the line big.
        let cheap_bulk = line(5_000, 10);
        // Unit price inside the band.
        let expensive = line(15_000, 1);

        let assessment = engine.assess(&[cheap_bulk, expensive], false);
        assert_eq!(assessment.lines[0].tax_cents, 0);
        assert_eq!(assessment.lines[1].tax_cents, 3_000);
    }

    #[test]
    fn test_invoice_rule_distributes_exactly() {
        // One 10% invoice rule over lines of $3.33 and $6.67: total tax is
        // authoritative (100c), and the per-line snapshot sums to it exactly.
        let mut invoice = item_rule(1, 1000, 0, false);
        invoice.rule_scope = TaxRuleScope::Invoice;
        let engine = TaxEngine::new(vec![invoice]);

        let assessment = engine.assess(&[line(333, 1), line(667, 1)], false);
        assert_eq!(assessment.tax_cents, 100);
        let sum: i64 = assessment.lines.iter().map(|l| l.tax_cents).sum();
        assert_eq!(sum, assessment.tax_cents);
        assert_eq!(assessment.grand_total_cents, 1_100);
    }

    #[test]
    fn test_invoice_rule_applies_to_tax_inclusive_subtotal() {
        // 10% item rule then 10% invoice rule on $100:
        //   item tax: 10.00 → tax-inclusive subtotal 110.00
        //   invoice:  110.00 × 10% = 11.00
        let mut invoice = item_rule(2, 1000, 1, false);
        invoice.rule_scope = TaxRuleScope::Invoice;
        let engine = TaxEngine::new(vec![item_rule(1, 1000, 0, false), invoice]);

        let assessment = engine.assess(&[line(10_000, 1)], false);
        assert_eq!(assessment.tax_cents, 1_000 + 1_100);
        assert_eq!(assessment.grand_total_cents, 12_100);
    }

    #[test]
    fn test_zero_priced_invoice() {
        let engine = TaxEngine::new(vec![item_rule(1, 1000, 0, false)]);
        let assessment = engine.assess(&[line(0, 3)], false);
        assert_eq!(assessment.tax_cents, 0);
        assert_eq!(assessment.grand_total_cents, 0);
    }

    #[test]
    fn test_snapshot_trace_round_trips_through_json() {
        let engine = TaxEngine::new(vec![item_rule(1, 825, 0, false)]);
        let assessment = engine.assess(&[line(1000, 1)], false);

        let json = serde_json::to_string(&assessment.lines[0].applied).unwrap();
        let back: Vec<AppliedTaxRule> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, assessment.lines[0].applied);
        assert_eq!(back[0].amount_cents, 83);
    }
}
