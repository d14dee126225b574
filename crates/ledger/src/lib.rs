//! Shared plumbing for statement importers.
//!
//! The ledger data model itself (transactions, postings, balance assertions)
//! is `beancount_core`'s; this crate keeps all contact with it behind a few
//! small constructors so the importers only deal in parsed domain values.

pub mod currency;
pub mod dedupe;
pub mod directives;
pub mod importer;

pub use crate::currency::CurrencyMap;
pub use crate::dedupe::dedupe_transactions;
pub use crate::directives::{
    make_account, make_balance, make_posting, make_transaction, TxnFlag,
};
pub use crate::importer::{Importer, MalformedLinePolicy};
