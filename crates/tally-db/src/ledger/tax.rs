//! # Tax Regime
//!
//! Tax configuration (profiles, categories, rules) and the side-effect-free
//! tax simulation entry point.
//!
//! ## Single Active Profile
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  tax_profiles:  "US-TX"  is_active=0                                    │
//! │                 "EU-DE"  is_active=1   ← exactly one, enforced by      │
//! │                 "Legacy" is_active=0     activate_profile (one          │
//! │                                          UPDATE-all + UPDATE-one        │
//! │                                          transaction), not by a DB     │
//! │                                          constraint                     │
//! │                                                                         │
//! │  No active profile ⇒ sales assess zero tax. Absence is a result,       │
//! │  never an error.                                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use tally_core::error::CoreError;
use tally_core::tax::{TaxAssessment, TaxEngine, TaxableLine};
use tally_core::types::{CustomerKind, TaxCategory, TaxProfile, TaxRule, TaxRuleScope};
use tally_core::validation;

use crate::error::{DbError, LedgerResult};

// =============================================================================
// Requests
// =============================================================================

/// A new tax rule for a profile.
#[derive(Debug, Clone)]
pub struct NewTaxRule {
    pub profile_id: i64,
    /// None = applies to all categories.
    pub category_id: Option<i64>,
    pub name: String,
    pub rule_scope: TaxRuleScope,
    pub rate_bps: u32,
    pub priority: i64,
    pub is_compound: bool,
    pub min_price_cents: Option<i64>,
    pub max_price_cents: Option<i64>,
}

/// One line in a tax simulation request.
#[derive(Debug, Clone)]
pub struct SimulationLine {
    pub unit_price_cents: i64,
    pub quantity: i64,
    pub tax_category_id: Option<i64>,
}

// =============================================================================
// Tax Regime
// =============================================================================

/// Tax configuration admin plus the `CalculateTax` simulation.
#[derive(Debug, Clone)]
pub struct TaxRegime {
    pool: SqlitePool,
}

impl TaxRegime {
    /// Creates a new TaxRegime.
    pub fn new(pool: SqlitePool) -> Self {
        TaxRegime { pool }
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Creates an inactive profile.
    pub async fn create_profile(&self, name: &str) -> LedgerResult<TaxProfile> {
        let now = Utc::now();
        let id = sqlx::query(
            "INSERT INTO tax_profiles (name, is_active, created_at) VALUES (?1, 0, ?2)",
        )
        .bind(name)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        debug!(profile_id = id, name, "Tax profile created");
        self.get_profile(id).await
    }

    /// Makes `profile_id` the single active profile.
    ///
    /// Deactivate-all + activate-one in one transaction: the "exactly one
    /// active" invariant never has a window where two profiles are live.
    pub async fn activate_profile(&self, profile_id: i64) -> LedgerResult<TaxProfile> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let known: Option<i64> = sqlx::query_scalar("SELECT id FROM tax_profiles WHERE id = ?1")
            .bind(profile_id)
            .fetch_optional(&mut *tx)
            .await?;
        if known.is_none() {
            return Err(CoreError::ReferenceNotFound {
                entity: "tax profile",
                id: profile_id,
            }
            .into());
        }

        sqlx::query("UPDATE tax_profiles SET is_active = 0 WHERE is_active = 1")
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE tax_profiles SET is_active = 1 WHERE id = ?1")
            .bind(profile_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await.map_err(DbError::from)?;

        info!(profile_id, "Tax profile activated");
        self.get_profile(profile_id).await
    }

    /// Creates a tax category.
    pub async fn create_category(&self, name: &str) -> LedgerResult<TaxCategory> {
        let id = sqlx::query("INSERT INTO tax_categories (name) VALUES (?1)")
            .bind(name)
            .execute(&self.pool)
            .await?
            .last_insert_rowid();

        let category = sqlx::query_as::<_, TaxCategory>(
            "SELECT id, name FROM tax_categories WHERE id = ?1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(category)
    }

    /// Creates a rule inside a profile.
    pub async fn create_rule(&self, rule: NewTaxRule) -> LedgerResult<TaxRule> {
        validation::validate_rate_bps(rule.rate_bps)?;

        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let known: Option<i64> = sqlx::query_scalar("SELECT id FROM tax_profiles WHERE id = ?1")
            .bind(rule.profile_id)
            .fetch_optional(&mut *tx)
            .await?;
        if known.is_none() {
            return Err(CoreError::ReferenceNotFound {
                entity: "tax profile",
                id: rule.profile_id,
            }
            .into());
        }

        let id = sqlx::query(
            r#"
            INSERT INTO tax_rules
                (profile_id, category_id, name, rule_scope, rate_bps, priority,
                 is_compound, min_price_cents, max_price_cents)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(rule.profile_id)
        .bind(rule.category_id)
        .bind(&rule.name)
        .bind(rule.rule_scope)
        .bind(rule.rate_bps)
        .bind(rule.priority)
        .bind(rule.is_compound)
        .bind(rule.min_price_cents)
        .bind(rule.max_price_cents)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let stored = sqlx::query_as::<_, TaxRule>(
            r#"
            SELECT id, profile_id, category_id, name, rule_scope, rate_bps, priority,
                   is_compound, min_price_cents, max_price_cents
            FROM tax_rules
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await.map_err(DbError::from)?;
        Ok(stored)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// The currently active profile, if any.
    pub async fn active_profile(&self) -> LedgerResult<Option<TaxProfile>> {
        let profile = sqlx::query_as::<_, TaxProfile>(
            "SELECT id, name, is_active, created_at FROM tax_profiles WHERE is_active = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(profile)
    }

    /// Loads one profile.
    pub async fn get_profile(&self, profile_id: i64) -> LedgerResult<TaxProfile> {
        let profile = sqlx::query_as::<_, TaxProfile>(
            "SELECT id, name, is_active, created_at FROM tax_profiles WHERE id = ?1",
        )
        .bind(profile_id)
        .fetch_optional(&self.pool)
        .await?;

        profile.ok_or_else(|| {
            CoreError::ReferenceNotFound {
                entity: "tax profile",
                id: profile_id,
            }
            .into()
        })
    }

    /// All rules of a profile, in evaluation order.
    pub async fn rules_for_profile(&self, profile_id: i64) -> LedgerResult<Vec<TaxRule>> {
        let rules = sqlx::query_as::<_, TaxRule>(
            r#"
            SELECT id, profile_id, category_id, name, rule_scope, rate_bps, priority,
                   is_compound, min_price_cents, max_price_cents
            FROM tax_rules
            WHERE profile_id = ?1
            ORDER BY priority, id
            "#,
        )
        .bind(profile_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rules)
    }

    // =========================================================================
    // Simulation
    // =========================================================================

    /// `CalculateTax`: assesses an invoice against the active regime
    /// without persisting anything.
    ///
    /// The same engine the sale ledger uses, so a simulation always matches
    /// what a real sale would charge.
    pub async fn calculate(
        &self,
        lines: Vec<SimulationLine>,
        customer_id: Option<i64>,
    ) -> LedgerResult<TaxAssessment> {
        validation::validate_line_count(lines.len())?;
        for line in &lines {
            validation::validate_quantity(line.quantity)?;
            validation::validate_price_cents(line.unit_price_cents)?;
        }

        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let exempt = customer_is_exempt(&mut conn, customer_id).await?;
        let rules = load_active_rules(&mut conn).await?;

        let taxable: Vec<TaxableLine> = lines
            .iter()
            .map(|line| TaxableLine {
                unit_price_cents: line.unit_price_cents,
                quantity: line.quantity,
                net_cents: line.unit_price_cents * line.quantity,
                tax_category_id: line.tax_category_id,
            })
            .collect();

        Ok(TaxEngine::new(rules).assess(&taxable, exempt))
    }
}

// =============================================================================
// Transaction-scoped Helpers (used by the sale ledger)
// =============================================================================

/// Rules of the active profile, in insertion order (the engine re-sorts by
/// priority with a stable sort). Empty when no profile is active.
pub(crate) async fn load_active_rules(
    conn: &mut SqliteConnection,
) -> LedgerResult<Vec<TaxRule>> {
    let rules = sqlx::query_as::<_, TaxRule>(
        r#"
        SELECT r.id, r.profile_id, r.category_id, r.name, r.rule_scope, r.rate_bps,
               r.priority, r.is_compound, r.min_price_cents, r.max_price_cents
        FROM tax_rules r
        JOIN tax_profiles p ON p.id = r.profile_id
        WHERE p.is_active = 1
        ORDER BY r.id
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    Ok(rules)
}

/// Whether the given customer is tax-exempt. `None` (walk-in) is never
/// exempt; an unknown id is a reference error.
pub(crate) async fn customer_is_exempt(
    conn: &mut SqliteConnection,
    customer_id: Option<i64>,
) -> LedgerResult<bool> {
    let Some(customer_id) = customer_id else {
        return Ok(false);
    };

    let kind: Option<CustomerKind> =
        sqlx::query_scalar("SELECT kind FROM customers WHERE id = ?1")
            .bind(customer_id)
            .fetch_optional(&mut *conn)
            .await?;

    match kind {
        Some(kind) => Ok(kind == CustomerKind::Exempt),
        None => Err(CoreError::ReferenceNotFound {
            entity: "customer",
            id: customer_id,
        }
        .into()),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;
    use crate::ledger::testutil;

    #[tokio::test]
    async fn test_exactly_one_profile_active() {
        let db = testutil::test_db().await;
        let taxes = db.taxes();

        let a = taxes.create_profile("Regime A").await.unwrap();
        let b = taxes.create_profile("Regime B").await.unwrap();
        assert!(taxes.active_profile().await.unwrap().is_none());

        taxes.activate_profile(a.id).await.unwrap();
        assert_eq!(taxes.active_profile().await.unwrap().unwrap().id, a.id);

        // Activating B deactivates A in the same transaction.
        taxes.activate_profile(b.id).await.unwrap();
        let active_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM tax_profiles WHERE is_active = 1")
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(active_count, 1);
        assert_eq!(taxes.active_profile().await.unwrap().unwrap().id, b.id);
    }

    #[tokio::test]
    async fn test_activate_unknown_profile() {
        let db = testutil::test_db().await;
        let err = db.taxes().activate_profile(404).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Core(CoreError::ReferenceNotFound {
                entity: "tax profile",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_rule_rate_is_validated() {
        let db = testutil::test_db().await;
        let taxes = db.taxes();
        let profile = taxes.create_profile("Capped").await.unwrap();

        let err = taxes
            .create_rule(NewTaxRule {
                profile_id: profile.id,
                category_id: None,
                name: "Too much".to_string(),
                rule_scope: TaxRuleScope::Item,
                rate_bps: 10_001,
                priority: 0,
                is_compound: false,
                min_price_cents: None,
                max_price_cents: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Core(CoreError::Validation(_))));
    }

    #[tokio::test]
    async fn test_simulation_matches_the_spec_scenario() {
        // 2 units @ $50, 10% item rule → subtotal 100.00, tax 10.00,
        // grand total 110.00, nothing persisted.
        let db = testutil::test_db().await;
        testutil::activate_simple_tax(&db, 1000).await;

        let assessment = db
            .taxes()
            .calculate(
                vec![SimulationLine {
                    unit_price_cents: 5_000,
                    quantity: 2,
                    tax_category_id: None,
                }],
                None,
            )
            .await
            .unwrap();

        assert_eq!(assessment.subtotal_cents, 10_000);
        assert_eq!(assessment.tax_cents, 1_000);
        assert_eq!(assessment.grand_total_cents, 11_000);

        let sale_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sales")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(sale_count, 0);
    }

    #[tokio::test]
    async fn test_simulation_without_active_profile_is_zero_tax() {
        let db = testutil::test_db().await;
        let assessment = db
            .taxes()
            .calculate(
                vec![SimulationLine {
                    unit_price_cents: 5_000,
                    quantity: 2,
                    tax_category_id: None,
                }],
                None,
            )
            .await
            .unwrap();
        assert_eq!(assessment.tax_cents, 0);
        assert_eq!(assessment.grand_total_cents, 10_000);
    }

    #[tokio::test]
    async fn test_category_scoped_rules_through_storage() {
        let db = testutil::test_db().await;
        let taxes = db.taxes();

        let food = taxes.create_category("Food").await.unwrap();
        let profile = taxes.create_profile("Scoped").await.unwrap();
        taxes
            .create_rule(NewTaxRule {
                profile_id: profile.id,
                category_id: Some(food.id),
                name: "Reduced food rate".to_string(),
                rule_scope: TaxRuleScope::Item,
                rate_bps: 500,
                priority: 0,
                is_compound: false,
                min_price_cents: None,
                max_price_cents: None,
            })
            .await
            .unwrap();
        taxes.activate_profile(profile.id).await.unwrap();

        let assessment = db
            .taxes()
            .calculate(
                vec![
                    SimulationLine {
                        unit_price_cents: 1_000,
                        quantity: 1,
                        tax_category_id: Some(food.id),
                    },
                    SimulationLine {
                        unit_price_cents: 1_000,
                        quantity: 1,
                        tax_category_id: None,
                    },
                ],
                None,
            )
            .await
            .unwrap();

        assert_eq!(assessment.lines[0].tax_cents, 50);
        assert_eq!(assessment.lines[1].tax_cents, 0);
    }

    #[tokio::test]
    async fn test_simulation_respects_exemption() {
        let db = testutil::test_db().await;
        testutil::activate_simple_tax(&db, 1000).await;
        let exempt = testutil::seed_customer(
            db.pool(),
            "School",
            tally_core::types::CustomerKind::Exempt,
        )
        .await;

        let assessment = db
            .taxes()
            .calculate(
                vec![SimulationLine {
                    unit_price_cents: 1_000,
                    quantity: 1,
                    tax_category_id: None,
                }],
                Some(exempt),
            )
            .await
            .unwrap();
        assert_eq!(assessment.tax_cents, 0);
    }
}
