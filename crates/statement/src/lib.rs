//! Row reassembly for bank statements that arrive as plain text lines.
//!
//! PDF text extraction flattens the transaction table of a credit-card
//! statement into whitespace-joined lines, one per visual line. This crate
//! rebuilds rows from that output: [`scan`] walks the lines and decides which
//! of them are actual transaction candidates, [`token`] validates and parses
//! the individual fields, and [`period`] recovers the billing period the
//! statement covers.

pub mod period;
pub mod scan;
pub mod token;

pub use crate::period::BillingPeriod;
pub use crate::scan::{Classified, ScanState, TableLayout, TableScanner};
