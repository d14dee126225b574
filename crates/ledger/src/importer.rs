use std::path::Path;

use anyhow::Result;
use beancount_core::Directive;

/// A self-contained statement importer.
///
/// `identify` is the routing predicate a batch driver uses to hand files to
/// the right importer; `extract` converts one file into ledger directives.
/// Files are processed independently: `extract` holds no state between
/// calls, and the same bytes always produce the same directives.
pub trait Importer {
    fn name(&self) -> &'static str;

    /// The ledger account this importer books against.
    fn account(&self) -> &str;

    /// Whether `path` belongs to this importer, judged by naming convention.
    fn identify(&self, path: &Path) -> bool;

    /// Parse the file and return its directives in statement order.
    fn extract(&self, path: &Path) -> Result<Vec<Directive<'static>>>;
}

/// What to do with an in-table line that fails token parsing.
///
/// Statement layouts that wrap long descriptions onto continuation lines
/// need [`MalformedLinePolicy::Drop`]; layouts where every in-table line is
/// a complete row should keep [`MalformedLinePolicy::Raise`] so a malformed
/// statement surfaces instead of losing rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedLinePolicy {
    /// Drop the line, logging it at debug level.
    Drop,
    /// Fail the whole file, naming the offending line.
    Raise,
}
