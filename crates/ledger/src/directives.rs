use std::borrow::Cow;
use std::collections::HashSet;

use anyhow::{anyhow, Result};
use beancount_core::metadata::Meta;
use beancount_core::{
    Account, AccountType, Amount, Balance, Date, Flag, IncompleteAmount, Posting, Tag, Transaction,
};
use chrono::NaiveDate;
use rust_decimal::Decimal;

/// Completion flag of a generated transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnFlag {
    /// Cleared entry (`*`).
    Cleared,
    /// Entry that needs review before it can be trusted (`!`).
    Pending,
}

/// Parse a colon-separated account name into the ledger model's account type.
pub fn make_account(name: &str) -> Result<Account<'static>> {
    let mut segments = name.split(':');

    let ty = match segments.next() {
        Some("Assets") => AccountType::Assets,
        Some("Liabilities") => AccountType::Liabilities,
        Some("Equity") => AccountType::Equity,
        Some("Income") => AccountType::Income,
        Some("Expenses") => AccountType::Expenses,
        _ => {
            return Err(anyhow!(
                "account {:?} must start with Assets, Liabilities, Equity, Income or Expenses",
                name
            ))
        }
    };

    let parts: Vec<Cow<'static, str>> = segments.map(|s| Cow::Owned(s.to_string())).collect();
    if parts.is_empty() || parts.iter().any(|p| p.is_empty()) {
        return Err(anyhow!("account {:?} has empty name segments", name));
    }

    Ok(Account::builder().ty(ty).parts(parts).build())
}

/// Build the single statement-account posting of an imported transaction.
pub fn make_posting(account: &str, amount: Decimal, currency: &str) -> Result<Posting<'static>> {
    Ok(Posting::builder()
        .account(make_account(account)?)
        .units(
            IncompleteAmount::builder()
                .num(amount.to_string().parse().ok())
                .currency(Some(Cow::Owned(currency.to_string())))
                .build(),
        )
        .cost(None)
        .price(None)
        .flag(None)
        .meta(Meta::new())
        .build())
}

/// Build a transaction directive from already-parsed fields.
pub fn make_transaction(
    date: NaiveDate,
    flag: TxnFlag,
    payee: Option<String>,
    narration: String,
    tags: &[String],
    meta: Vec<(String, String)>,
    postings: Vec<Posting<'static>>,
) -> Transaction<'static> {
    let mut meta_map = Meta::new();
    for (key, value) in meta {
        meta_map.insert(key.into(), value.into());
    }

    let tag_set: HashSet<Tag<'static>> = tags.iter().map(|t| Tag::from(t.clone())).collect();

    Transaction::builder()
        .date(owned_date(date))
        .flag(match flag {
            TxnFlag::Cleared => Flag::Okay,
            TxnFlag::Pending => Flag::Warning,
        })
        .payee(payee.map(Cow::Owned))
        .narration(Cow::Owned(narration))
        .tags(tag_set)
        .postings(postings)
        .meta(meta_map)
        .build()
}

/// Build a balance assertion for `account` on `date`.
pub fn make_balance(
    date: NaiveDate,
    account: &str,
    amount: Decimal,
    currency: &str,
    meta: Vec<(String, String)>,
) -> Result<Balance<'static>> {
    let mut meta_map = Meta::new();
    for (key, value) in meta {
        meta_map.insert(key.into(), value.into());
    }

    let num = amount
        .to_string()
        .parse()
        .map_err(|_| anyhow!("amount {} is not representable", amount))?;

    Ok(Balance::builder()
        .date(owned_date(date))
        .account(make_account(account)?)
        .amount(
            Amount::builder()
                .num(num)
                .currency(Cow::Owned(currency.to_string()))
                .build(),
        )
        .tolerance(None)
        .meta(meta_map)
        .build())
}

fn owned_date(date: NaiveDate) -> Date<'static> {
    Date::from_string_unchecked(date.format("%Y-%m-%d").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use beancount_core::Directive;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_make_account_splits_type_and_parts() {
        let account = make_account("Liabilities:CreditCard:CCB").unwrap();
        assert_eq!(account.ty, AccountType::Liabilities);
        assert_eq!(account.parts.len(), 2);
        assert_eq!(account.parts[0], "CreditCard");
        assert_eq!(account.parts[1], "CCB");
    }

    #[test]
    fn test_make_account_rejects_unknown_roots_and_empty_segments() {
        assert!(make_account("Savings:CCB").is_err());
        assert!(make_account("Assets").is_err());
        assert!(make_account("Assets::CCB").is_err());
    }

    #[test]
    fn test_make_posting_carries_amount_and_currency() {
        let posting = make_posting("Liabilities:CreditCard:CCB", dec("-88.00"), "CNY").unwrap();
        assert_eq!(posting.units.num, Some("-88.00".parse().unwrap()));
        assert_eq!(posting.units.currency.as_deref(), Some("CNY"));
    }

    #[test]
    fn test_make_transaction_sets_flag_tags_and_meta() {
        let posting = make_posting("Liabilities:CreditCard:CMB", dec("-200.00"), "CNY").unwrap();
        let txn = make_transaction(
            NaiveDate::from_ymd_opt(2024, 1, 11).unwrap(),
            TxnFlag::Pending,
            None,
            "手机分期".to_string(),
            &["credit-cmb-2024-01".to_string(), "installment".to_string()],
            vec![("raw".to_string(), "01/10 01/11 手机分期 ...".to_string())],
            vec![posting],
        );

        assert_eq!(txn.flag, Flag::Warning);
        assert_eq!(txn.narration, "手机分期");
        assert_eq!(txn.postings.len(), 1);
        assert_eq!(txn.tags.len(), 2);
        assert!(txn.tags.contains(&Tag::from("installment".to_string())));
        assert_eq!(txn.date, owned_date(NaiveDate::from_ymd_opt(2024, 1, 11).unwrap()));
        assert!(txn.meta.contains_key("raw"));
    }

    #[test]
    fn test_make_balance_directive() {
        let balance = make_balance(
            NaiveDate::from_ymd_opt(2024, 12, 22).unwrap(),
            "Assets:Bank:CCB",
            dec("1024.00"),
            "CNY",
            vec![],
        )
        .unwrap();
        assert_eq!(balance.amount.num, "1024.00".parse().unwrap());
        assert_eq!(balance.amount.currency, "CNY");

        // Balance assertions slot into the same directive stream.
        let directive = Directive::Balance(balance);
        assert!(matches!(directive, Directive::Balance(_)));
    }
}
