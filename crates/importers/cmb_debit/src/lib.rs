use std::collections::HashSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use beancount_core::Directive;
use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;

use ledger::{make_balance, make_posting, make_transaction, Importer, TxnFlag};
use statement::token;

pub const PARSER_NAME: &str = "cmb_debit";

/// Lines of export preamble before the CSV header.
const PREAMBLE_LINES: usize = 7;
/// Trailing summary lines after the last data row.
const FOOTER_LINES: usize = 3;

/// One decoded export row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub date: NaiveDate,
    pub time: String,
    pub amount: Decimal,
    pub balance: Decimal,
    pub kind: String,
    pub description: String,
}

/// Importer for CMB debit-account CSV exports (`CMB_*.csv`).
pub struct CmbDebitImporter {
    pub account: String,
    pub currency: String,
}

fn find_col(headers: &csv::StringRecord, name: &str) -> Result<usize> {
    headers
        .iter()
        .position(|h| h.trim() == name)
        .ok_or_else(|| anyhow!("Missing column: {}", name))
}

fn parse_decimal(raw: &str) -> Result<Decimal> {
    let s = raw.replace(',', "");
    let s = s.trim();
    if s.is_empty() {
        return Err(anyhow!("empty amount"));
    }
    s.parse()
        .map_err(|_| anyhow!("cannot parse amount from {:?}", raw))
}

impl CmbDebitImporter {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            currency: "CNY".to_string(),
        }
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    /// Convert the export text into directives. The export wraps the CSV
    /// table in a preamble and a summary footer, both dropped here; rows
    /// are newest first and the output is reversed to chronological order.
    pub fn extract_text(&self, text: &str, source: &str) -> Result<Vec<Directive<'static>>> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let lines: Vec<&str> = text.lines().collect();
        if lines.len() <= PREAMBLE_LINES + FOOTER_LINES {
            return Err(anyhow!(
                "unexpected export layout: only {} lines in {}",
                lines.len(),
                source
            ));
        }
        let table = lines[PREAMBLE_LINES..lines.len() - FOOTER_LINES].join("\n");

        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(table.as_bytes());
        let headers = reader.headers().context("missing CSV headers")?.clone();

        let c_date = find_col(&headers, "交易日期")?;
        let c_time = find_col(&headers, "交易时间")?;
        let c_income = find_col(&headers, "收入")?;
        let c_outcome = find_col(&headers, "支出")?;
        let c_balance = find_col(&headers, "余额")?;
        let c_kind = find_col(&headers, "交易类型")?;
        let c_description = find_col(&headers, "交易备注")?;

        let mut results = Vec::new();
        let mut seen_days: HashSet<NaiveDate> = HashSet::new();

        for (row_idx, record) in reader.records().enumerate() {
            let record =
                record.with_context(|| format!("CSV read error at row {}", row_idx + 2))?;
            let get = |idx: usize| record.get(idx).unwrap_or("").trim();

            let date = token::parse_compact_date(get(c_date))
                .with_context(|| format!("invalid date {:?} in {}", get(c_date), source))?;

            let income = get(c_income);
            let outcome = get(c_outcome);
            let amount = if !income.is_empty() {
                parse_decimal(income)
                    .with_context(|| format!("invalid income {:?} in {}", income, source))?
            } else {
                -parse_decimal(outcome)
                    .with_context(|| format!("invalid outcome {:?} in {}", outcome, source))?
            };

            let row = Row {
                date,
                time: get(c_time).to_string(),
                amount,
                balance: parse_decimal(get(c_balance)).with_context(|| {
                    format!("invalid balance {:?} in {}", get(c_balance), source)
                })?,
                kind: get(c_kind).to_string(),
                description: get(c_description).to_string(),
            };

            let meta = vec![
                ("source".to_string(), source.to_string()),
                ("time".to_string(), row.time.clone()),
                ("kind".to_string(), row.kind.clone()),
            ];

            if seen_days.insert(row.date) {
                results.push(Directive::Balance(make_balance(
                    row.date + Duration::days(1),
                    &self.account,
                    row.balance,
                    "CNY",
                    meta.clone(),
                )?));
            }

            let posting = make_posting(&self.account, row.amount, &self.currency)?;
            results.push(Directive::Transaction(make_transaction(
                row.date,
                TxnFlag::Cleared,
                None,
                row.description.clone(),
                &[],
                meta,
                vec![posting],
            )));
        }

        if results.is_empty() {
            tracing::warn!(source, "no transaction rows parsed");
        }

        results.reverse();
        Ok(results)
    }
}

impl Importer for CmbDebitImporter {
    fn name(&self) -> &'static str {
        PARSER_NAME
    }

    fn account(&self) -> &str {
        &self.account
    }

    fn identify(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|s| s.to_str())
            .map(|name| name.starts_with("CMB_") && name.ends_with(".csv"))
            .unwrap_or(false)
    }

    fn extract(&self, path: &Path) -> Result<Vec<Directive<'static>>> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        self.extract_text(&text, &path.to_string_lossy())
    }
}
