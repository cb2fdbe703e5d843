//! # Ledger Module
//!
//! The five ledgers that make up the sale transaction core.
//!
//! ## Data Flow Between Ledgers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  SaleLedger ──► TaxEngine (compute) ──► InventoryLedger (consume)      │
//! │       │                                        ▲                        │
//! │       │ refund txn                             │ restore                │
//! │       ▼                                        │                        │
//! │  ReturnLedger ─────────────────────────────────┘                        │
//! │                                                                         │
//! │  PurchaseLedger ──► InventoryLedger (new lots + confirm_receive)       │
//! │                                                                         │
//! │  TaxRegime ──► active profile + rules feeding the TaxEngine            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each mutating operation is one SQLite transaction; cross-ledger calls
//! (sale → stock, return → refund) happen **inside** the caller's
//! transaction, never across two.

pub mod inventory;
pub mod purchase;
pub mod returns;
pub mod sale;
pub mod tax;

// =============================================================================
// Shared Test Fixtures
// =============================================================================
