use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use beancount_core::Directive;
use calamine::{open_workbook, Data, Reader, Xls};
use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;

use ledger::{make_balance, make_posting, make_transaction, Importer, TxnFlag};
use statement::token;

pub const PARSER_NAME: &str = "ccb_debit";

/// One decoded export row. Decoding happens once, at the sheet boundary;
/// anything missing a required column fails there with the column name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub date: NaiveDate,
    pub amount: Decimal,
    pub summary: String,
    pub balance_raw: String,
    pub description: String,
    pub counterparty: String,
}

struct Columns {
    date: usize,
    amount: usize,
    summary: usize,
    balance: usize,
    description: usize,
    counterparty: usize,
}

/// Importer for CCB debit-account exports (`hqmx_*.xls`, 活期明细).
pub struct CcbDebitImporter {
    pub account: String,
    pub currency: String,
}

fn find_header_row(grid: &[Vec<String>]) -> Result<(usize, HashMap<String, usize>)> {
    for (row_idx, row) in grid.iter().enumerate() {
        if row.first().map(|c| c.trim()) == Some("序号") {
            let mut map = HashMap::new();
            for (col_idx, cell) in row.iter().enumerate() {
                let name = cell.trim().to_string();
                if !name.is_empty() {
                    map.insert(name, col_idx);
                }
            }
            if map.contains_key("交易日期") && map.contains_key("交易金额") {
                return Ok((row_idx, map));
            }
        }
    }
    Err(anyhow!(
        "header row not found (expected a row starting with '序号' and containing '交易日期')"
    ))
}

fn locate_columns(map: &HashMap<String, usize>) -> Result<Columns> {
    let required = |name: &str| -> Result<usize> {
        map.get(name)
            .copied()
            .ok_or_else(|| anyhow!("Missing column: {}", name))
    };
    Ok(Columns {
        date: required("交易日期")?,
        amount: required("交易金额")?,
        summary: required("摘要")?,
        balance: required("账户余额")?,
        description: required("交易地点/附言")?,
        counterparty: required("对方账号与户名")?,
    })
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

fn cell_str(cell: Option<&Data>) -> String {
    let Some(c) = cell else {
        return String::new();
    };

    match c {
        Data::String(s) => s.clone(),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::Empty => String::new(),
        _ => c.to_string(),
    }
}

impl CcbDebitImporter {
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

    fn decode_row(&self, row: &[String], columns: &Columns) -> Result<Row> {
        let get = |idx: usize| row.get(idx).map(String::as_str).unwrap_or("").trim();

        let date_raw = get(columns.date);
        let amount_raw = get(columns.amount);
        if date_raw.is_empty() {
            return Err(anyhow!("row is missing 交易日期"));
        }
        if amount_raw.is_empty() {
            return Err(anyhow!("row is missing 交易金额"));
        }

        Ok(Row {
            date: token::parse_compact_date(date_raw)
                .with_context(|| format!("invalid date {:?}", date_raw))?,
            amount: parse_decimal(amount_raw)
                .with_context(|| format!("invalid amount {:?}", amount_raw))?,
            summary: get(columns.summary).to_string(),
            balance_raw: get(columns.balance).replace(',', "").trim().to_string(),
            description: get(columns.description).to_string(),
            counterparty: get(columns.counterparty).to_string(),
        })
    }

    /// Convert a cell grid into directives. The export lists rows newest
    /// first; they are processed in reverse so output is chronological, and
    /// the first row of each day also asserts the day's closing balance.
    pub fn extract_grid(
        &self,
        grid: &[Vec<String>],
        source: &str,
    ) -> Result<Vec<Directive<'static>>> {
        let (header_idx, header_map) = find_header_row(grid)?;
        let columns = locate_columns(&header_map)?;

        let mut results = Vec::new();
        let mut seen_days: HashSet<NaiveDate> = HashSet::new();

        for raw_row in grid[header_idx + 1..].iter().rev() {
            if raw_row.iter().all(|c| c.trim().is_empty()) {
                tracing::debug!("skipping empty export row");
                continue;
            }
            let row = self
                .decode_row(raw_row, &columns)
                .with_context(|| format!("in row {:?} of {}", raw_row, source))?;

            let meta = vec![
                ("source".to_string(), source.to_string()),
                ("summary".to_string(), row.summary.clone()),
                ("counterparty".to_string(), row.counterparty.clone()),
            ];

            if seen_days.insert(row.date) && !row.balance_raw.is_empty() {
                let balance = parse_decimal(&row.balance_raw)
                    .with_context(|| format!("invalid balance {:?}", row.balance_raw))?;
                results.push(Directive::Balance(make_balance(
                    row.date + Duration::days(1),
                    &self.account,
                    balance,
                    &self.currency,
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

        Ok(results)
    }
}

impl Importer for CcbDebitImporter {
    fn name(&self) -> &'static str {
        PARSER_NAME
    }

    fn account(&self) -> &str {
        &self.account
    }

    fn identify(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|s| s.to_str())
            .map(|name| {
                let lower = name.to_lowercase();
                lower.starts_with("hqmx_") && lower.ends_with(".xls")
            })
            .unwrap_or(false)
    }

    fn extract(&self, path: &Path) -> Result<Vec<Directive<'static>>> {
        let mut workbook: Xls<_> =
            open_workbook(path).with_context(|| format!("cannot open {}", path.display()))?;

        let sheet_name = workbook
            .sheet_names()
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("no sheets found in {}", path.display()))?;
        let range = workbook
            .worksheet_range(&sheet_name)
            .with_context(|| format!("cannot read sheet {:?} in {}", sheet_name, path.display()))?;

        let grid: Vec<Vec<String>> = range
            .rows()
            .map(|row| row.iter().map(|cell| cell_str(Some(cell))).collect())
            .collect();

        self.extract_grid(&grid, &path.to_string_lossy())
    }
}
