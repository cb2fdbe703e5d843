//! # Seed Data Generator
//!
//! Populates a database with development data and walks the ledgers once:
//! catalog, tax regime, received purchase orders, and a demo sale.
//!
//! ## Usage
//! ```bash
//! # Seed the default ./tally.db
//! cargo run -p tally-db --bin seed
//!
//! # Specify a database path
//! cargo run -p tally-db --bin seed -- --db ./data/tally.db
//! ```
//!
//! ## What Gets Seeded
//! - Payment methods: Cash, Card
//! - A "Standard Regime" tax profile: 10% standard item rule plus a reduced
//!   5% rate for the Groceries category (activated)
//! - A handful of variants with prices and costs
//! - One supplier, one received purchase order per variant (so every
//!   variant has stock in a FIFO lot)
//! - One demo sale, paid in cash, to show the full pipeline end to end

use std::env;

use chrono::Utc;
use tracing::info;

use tally_core::types::{TaxMode, TaxRuleScope};
use tally_db::ledger::purchase::NewPurchaseLine;
use tally_db::ledger::sale::{CreateSale, NewPayment, NewSaleLine};
use tally_db::ledger::tax::NewTaxRule;
use tally_db::{Database, DbConfig};

/// (sku, name, price_cents, cost_cents, grocery)
const VARIANTS: &[(&str, &str, i64, i64, bool)] = &[
    ("COLA-330", "Cola 330ml", 250, 90, true),
    ("WATER-500", "Still Water 500ml", 150, 40, true),
    ("CHIPS-150", "Salted Chips 150g", 399, 150, true),
    ("MUG-CLASSIC", "Classic Mug", 1299, 480, false),
    ("TSHIRT-M", "Logo T-Shirt (M)", 2499, 900, false),
    ("HEADPHONES", "Wired Headphones", 7999, 3500, false),
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let db_path = parse_db_path();
    info!(path = %db_path, "Seeding database");

    let db = Database::new(DbConfig::new(&db_path)).await?;
    let pool = db.pool();
    let now = Utc::now();

    // -------------------------------------------------------------------------
    // Payment methods
    // -------------------------------------------------------------------------
    let mut cash_id = 0i64;
    for name in ["Cash", "Card"] {
        let id = sqlx::query("INSERT INTO payment_methods (name, is_active) VALUES (?1, 1)")
            .bind(name)
            .execute(pool)
            .await?
            .last_insert_rowid();
        if name == "Cash" {
            cash_id = id;
        }
    }
    info!("Payment methods seeded");

    // -------------------------------------------------------------------------
    // Tax regime
    // -------------------------------------------------------------------------
    let taxes = db.taxes();
    let groceries = taxes.create_category("Groceries").await?;
    let profile = taxes.create_profile("Standard Regime").await?;
    taxes
        .create_rule(NewTaxRule {
            profile_id: profile.id,
            category_id: None,
            name: "Standard rate".to_string(),
            rule_scope: TaxRuleScope::Item,
            rate_bps: 1000,
            priority: 0,
            is_compound: false,
            min_price_cents: Some(500),
            max_price_cents: None,
        })
        .await?;
    taxes
        .create_rule(NewTaxRule {
            profile_id: profile.id,
            category_id: Some(groceries.id),
            name: "Reduced grocery rate".to_string(),
            rule_scope: TaxRuleScope::Item,
            rate_bps: 500,
            priority: 1,
            is_compound: false,
            min_price_cents: None,
            max_price_cents: Some(499),
        })
        .await?;
    taxes.activate_profile(profile.id).await?;
    info!(profile = profile.id, "Tax regime activated");

    // -------------------------------------------------------------------------
    // Variants + stock through the purchase ledger
    // -------------------------------------------------------------------------
    let supplier_id = sqlx::query("INSERT INTO suppliers (name, created_at) VALUES (?1, ?2)")
        .bind("Main Street Wholesale")
        .bind(now)
        .execute(pool)
        .await?
        .last_insert_rowid();

    let purchasing = db.purchasing();
    let mut first_variant = 0i64;
    for (sku, name, price_cents, cost_cents, grocery) in VARIANTS {
        let category = if *grocery { Some(groceries.id) } else { None };
        let variant_id = sqlx::query(
            r#"
            INSERT INTO variants (sku, name, price_cents, cost_cents, tax_category_id,
                                  is_active, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)
            "#,
        )
        .bind(sku)
        .bind(name)
        .bind(price_cents)
        .bind(cost_cents)
        .bind(category)
        .bind(now)
        .execute(pool)
        .await?
        .last_insert_rowid();
        if first_variant == 0 {
            first_variant = variant_id;
        }

        let order = purchasing
            .create_order(
                supplier_id,
                vec![NewPurchaseLine {
                    variant_id,
                    quantity: 50,
                    unit_cost_cents: *cost_cents,
                    batch_number: Some(format!("SEED-{sku}")),
                    manufactured_date: None,
                    expiry_date: None,
                }],
                1,
            )
            .await?;
        purchasing.receive(order.id, 1).await?;
    }
    info!(count = VARIANTS.len(), "Variants stocked via received purchase orders");

    // -------------------------------------------------------------------------
    // A demo sale, paid in cash
    // -------------------------------------------------------------------------
    let sales = db.sales();
    let assessment = db
        .taxes()
        .calculate(
            vec![tally_db::ledger::tax::SimulationLine {
                unit_price_cents: VARIANTS[0].2,
                quantity: 2,
                tax_category_id: Some(groceries.id),
            }],
            None,
        )
        .await?;
    let detail = sales
        .create_sale(CreateSale {
            items: vec![NewSaleLine {
                variant_id: first_variant,
                quantity: 2,
                line_discount_cents: 0,
            }],
            customer_id: None,
            discount_cents: 0,
            payments: vec![NewPayment {
                amount_cents: assessment.grand_total_cents,
                payment_method_id: cash_id,
            }],
            tax_mode: TaxMode::Automatic,
            bill_tax_ids: None,
            user_id: 1,
        })
        .await?;

    info!(
        invoice = %detail.sale.invoice_number,
        total = detail.sale.total_cents,
        status = %detail.sale.status,
        "Demo sale created"
    );

    let stock = db.inventory().stock_on_hand(first_variant).await?;
    info!(variant = first_variant, stock, "Stock after demo sale");

    db.close().await;
    println!("Seeded {db_path} ({} variants, 1 demo sale)", VARIANTS.len());
    Ok(())
}

/// Parses `--db <path>` from the command line, defaulting to ./tally.db.
fn parse_db_path() -> String {
    let args: Vec<String> = env::args().collect();
    args.iter()
        .position(|a| a == "--db")
        .and_then(|idx| args.get(idx + 1))
        .cloned()
        .unwrap_or_else(|| "./tally.db".to_string())
}
