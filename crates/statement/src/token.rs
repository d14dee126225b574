use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use regex::Regex;
use rust_decimal::Decimal;

/// `2024-01-05`
pub fn iso_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("iso date regex"))
}

/// `01/05`
pub fn month_day_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{2}/\d{2}$").expect("month/day regex"))
}

/// `1,234.56`, `-88.00`, `(1,234.56)`
pub fn amount_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\(?[+-]?\d[\d,]*(?:\.\d+)?\)?$").expect("amount regex"))
}

/// Amount optionally followed by a bracketed currency code: `120.00(US)`
pub fn amount_with_currency_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\(?[+-]?\d[\d,]*(?:\.\d+)?\)?(?:\([A-Za-z]{2,4}\))?$")
            .expect("amount-with-currency regex")
    })
}

/// Card number tail, exactly four digits.
pub fn last4_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{4}$").expect("last4 regex"))
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[-+]?\d+(?:\.\d+)?").expect("number regex"))
}

/// Parse an amount token. Thousands separators are stripped; a parenthesized
/// value is negative: `"(1,234.56)"` -> -1234.56.
pub fn parse_amount(raw: &str) -> Result<Decimal> {
    let cleaned = raw.replace(',', "");
    let cleaned = cleaned.trim();

    if let Some(inner) = cleaned.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        let value: Decimal = inner
            .trim()
            .parse()
            .map_err(|_| anyhow!("cannot parse amount from {:?}", raw))?;
        return Ok(-value);
    }

    cleaned
        .parse()
        .map_err(|_| anyhow!("cannot parse amount from {:?}", raw))
}

/// Parse the numeric part of a composite `label/amount` value such as
/// `"人民币元/32.50"`. The label (and any bracketed suffix) is ignored.
pub fn split_amount(raw: &str) -> Result<Decimal> {
    let tail = raw.rsplit('/').next().unwrap_or(raw);
    let cleaned = tail.replace(',', "");
    let cleaned = cleaned.trim();

    let found = number_re()
        .find(cleaned)
        .ok_or_else(|| anyhow!("cannot parse amount from {:?}", raw))?;
    let mut amount: Decimal = found
        .as_str()
        .parse()
        .map_err(|_| anyhow!("cannot parse amount from {:?}", raw))?;

    if cleaned.starts_with('(') && cleaned.ends_with(')') {
        amount = -amount;
    }
    Ok(amount)
}

/// The label part of a composite `label/amount` value.
pub fn currency_label(raw: &str) -> &str {
    raw.split('/').next().unwrap_or(raw).trim()
}

pub fn parse_iso_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .with_context(|| format!("unsupported date format {:?}", raw))
}

/// Parse a `yyyymmdd` date as found in debit-account exports. Falls back to
/// ISO notation, which some exports use instead.
pub fn parse_compact_date(raw: &str) -> Result<NaiveDate> {
    let s = raw.trim();

    if s.len() == 8 && s.chars().all(|c| c.is_ascii_digit()) {
        let year: i32 = s[0..4].parse()?;
        let month: u32 = s[4..6].parse()?;
        let day: u32 = s[6..8].parse()?;
        return NaiveDate::from_ymd_opt(year, month, day)
            .ok_or_else(|| anyhow!("invalid calendar date {:?}", s));
    }

    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(date);
    }

    Err(anyhow!("unsupported date format {:?}", s))
}

/// Resolve an `mm/dd` token against the statement's reference year and month.
///
/// A token month greater than the reference month belongs to the previous
/// calendar year: a January statement still lists late-December transactions.
pub fn resolve_month_day(raw: &str, year: i32, reference_month: u32) -> Result<NaiveDate> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(anyhow!("empty date token"));
    }

    let (month_s, day_s) = s
        .split_once('/')
        .ok_or_else(|| anyhow!("unexpected date format {:?}", s))?;
    let month: u32 = month_s
        .parse()
        .with_context(|| format!("unexpected date format {:?}", s))?;
    let day: u32 = day_s
        .parse()
        .with_context(|| format!("unexpected date format {:?}", s))?;

    let resolved_year = if month > reference_month { year - 1 } else { year };
    NaiveDate::from_ymd_opt(resolved_year, month, day)
        .ok_or_else(|| anyhow!("invalid calendar date {:?}", s))
}
