use std::collections::HashSet;

use beancount_core::{Directive, Transaction};

/// Drop transactions that repeat an earlier one's signature, keeping the
/// first occurrence and preserving order. Balance assertions and other
/// directives pass through untouched.
///
/// The signature is (date, narration, account, amount, currency) of the
/// generated posting — the fields overlapping exports reproduce exactly.
/// Returns the surviving directives and the number of dropped duplicates.
pub fn dedupe_transactions(
    directives: Vec<Directive<'static>>,
) -> (Vec<Directive<'static>>, usize) {
    let mut seen: HashSet<String> = HashSet::new();
    let mut kept = Vec::with_capacity(directives.len());
    let mut removed = 0usize;

    for directive in directives {
        if let Directive::Transaction(txn) = &directive {
            if let Some(signature) = transaction_signature(txn) {
                if !seen.insert(signature) {
                    removed += 1;
                    tracing::debug!(narration = %txn.narration, "dropping duplicate transaction");
                    continue;
                }
            }
        }
        kept.push(directive);
    }

    (kept, removed)
}

fn transaction_signature(txn: &Transaction<'_>) -> Option<String> {
    let posting = txn.postings.first()?;
    let num = posting.units.num.as_ref()?;
    let currency = posting.units.currency.as_ref()?;
    let account = posting
        .account
        .parts
        .iter()
        .map(|p| p.as_ref())
        .collect::<Vec<_>>()
        .join(":");
    Some(format!(
        "{:?}|{}|{}|{}|{}",
        txn.date, txn.narration, account, num, currency
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directives::{make_posting, make_transaction, TxnFlag};
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn txn(date: (i32, u32, u32), narration: &str, amount: &str) -> Directive<'static> {
        let posting = make_posting(
            "Liabilities:CreditCard:CCB",
            Decimal::from_str(amount).unwrap(),
            "CNY",
        )
        .unwrap();
        Directive::Transaction(make_transaction(
            NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            TxnFlag::Cleared,
            None,
            narration.to_string(),
            &[],
            vec![],
            vec![posting],
        ))
    }

    #[test]
    fn test_exact_repeats_are_dropped() {
        let input = vec![
            txn((2024, 1, 5), "GROCERY STORE", "-88.00"),
            txn((2024, 1, 5), "GROCERY STORE", "-88.00"),
            txn((2024, 1, 6), "GROCERY STORE", "-88.00"),
        ];
        let (kept, removed) = dedupe_transactions(input);
        assert_eq!(kept.len(), 2);
        assert_eq!(removed, 1);
    }

    #[test]
    fn test_different_amounts_survive() {
        let input = vec![
            txn((2024, 1, 5), "COFFEE", "-30.00"),
            txn((2024, 1, 5), "COFFEE", "-31.00"),
        ];
        let (kept, removed) = dedupe_transactions(input);
        assert_eq!(kept.len(), 2);
        assert_eq!(removed, 0);
    }

    #[test]
    fn test_first_occurrence_is_kept_in_order() {
        let input = vec![
            txn((2024, 1, 5), "A", "-1.00"),
            txn((2024, 1, 5), "B", "-2.00"),
            txn((2024, 1, 5), "A", "-1.00"),
        ];
        let (kept, _) = dedupe_transactions(input);
        let narrations: Vec<String> = kept
            .iter()
            .map(|d| match d {
                Directive::Transaction(t) => t.narration.to_string(),
                _ => String::new(),
            })
            .collect();
        assert_eq!(narrations, vec!["A", "B"]);
    }
}
