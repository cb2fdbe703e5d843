//! # tally-db: Database Layer and Ledgers for Tally POS
//!
//! This crate provides persistence and orchestration for the sale
//! transaction ledger. It uses SQLite for local storage with sqlx for async
//! operations.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally POS Data Flow                              │
//! │                                                                         │
//! │  Caller (REST layer, out of scope)                                     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     tally-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │    Ledgers    │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │  (ledger/*)   │    │  (embedded)  │  │   │
//! │  │   │               │    │               │    │              │  │   │
//! │  │   │ SqlitePool    │◄───│ SaleLedger    │    │ 001_init.sql │  │   │
//! │  │   │ Connection    │    │ InventoryLdgr │    │              │  │   │
//! │  │   │ Management    │    │ PurchaseLdgr  │    │              │  │   │
//! │  │   │               │    │ ReturnLedger  │    │              │  │   │
//! │  │   │               │    │ TaxRegime     │    │              │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │                      SQLite Database (WAL mode)                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## The One-Transaction Rule
//!
//! Every mutating ledger operation runs inside a single database
//! transaction. Stock validation and stock deduction share that transaction,
//! so two concurrent sales can never both pass a stale stock check. An error
//! anywhere rolls back everything - there is no partial application.
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database and ledger error types
//! - [`deps`] - Capability traits injected into the sale ledger
//! - [`ledger`] - The ledger implementations
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("path/to/tally.db")).await?;
//!
//! let detail = db.sales().create_sale(request).await?;
//! let stock = db.inventory().stock_on_hand(variant_id).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod deps;
pub mod error;
pub mod ledger;
pub mod migrations;
pub mod pool;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, LedgerError, LedgerResult};
pub use pool::{Database, DbConfig};

// Ledger re-exports for convenience
pub use ledger::inventory::InventoryLedger;
pub use ledger::purchase::PurchaseLedger;
pub use ledger::returns::ReturnLedger;
pub use ledger::sale::{DbSaleLedger, SaleLedger};
pub use ledger::tax::TaxRegime;
