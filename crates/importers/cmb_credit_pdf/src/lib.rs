use std::path::Path;
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use beancount_core::Directive;
use chrono::NaiveDate;
use regex::Regex;
use rust_decimal::Decimal;

use ledger::{make_posting, make_transaction, Importer, MalformedLinePolicy, TxnFlag};
use statement::scan::{scan, CandidateLine};
use statement::token;
use statement::{period, TableLayout};

pub const PARSER_NAME: &str = "cmb_credit_pdf";

/// Section that dates installments by their booking day and flags them
/// for review.
const SECTION_INSTALLMENT: &str = "分期";

/// One statement row with the section it appeared under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub trade_date: NaiveDate,
    pub booking_date: NaiveDate,
    pub summary: String,
    /// RMB amount token, verbatim.
    pub amount: String,
    pub card_last4: String,
    /// Original-currency amount at the place of purchase, verbatim.
    pub amount_in_location: String,
    pub section: Option<String>,
    pub trade_date_raw: String,
    pub booking_date_raw: String,
    pub raw_line: String,
}

/// Importer for CMB credit-card PDF statements (`CreditCardReckoning*.pdf`).
pub struct CmbCreditPdfImporter {
    pub account: String,
    pub currency: String,
    pub malformed: MalformedLinePolicy,
}

fn name_year_month_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{4})-(\d{2}).*\.pdf$").expect("file name regex"))
}

fn layout() -> TableLayout {
    let patterns = [
        r"招商银行信用卡对账单（个人消费卡账户 \d{4}年\d{2}月）",
        r"CMB Credit Card Statement \(\d{4}\.\d{2}\)",
        r"人民币账户 RMB A/C",
        r"本期账务明细 Transaction Details",
        r"Trans Post Card Number Original Trans",
        r"Date Date \(last 4 digits\) Amount",
        r"Description RMB Amount",
        r"SOLD POSTED DESCRIPTION RMB AMOUNT CARD NO\(Last 4digits\) Original Tran Amount",
    ];

    TableLayout {
        header_contains: vec!["交易日 记账日 交易摘要".to_string()],
        stop_prefixes: vec!["本期还款总额".to_string(), "本期应还金额".to_string()],
        stop_contains: vec!["Current Balance".to_string(), "New Balance".to_string()],
        noise_patterns: patterns
            .iter()
            .map(|p| Regex::new(p).expect("noise pattern"))
            .collect(),
        sections: vec![
            "消费".to_string(),
            SECTION_INSTALLMENT.to_string(),
            "退款".to_string(),
            "还款".to_string(),
        ],
        ..TableLayout::default()
    }
}

impl CmbCreditPdfImporter {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            currency: "CNY".to_string(),
            // Every in-table line of this layout is a complete row, so a
            // line that does not parse is a malformed statement.
            malformed: MalformedLinePolicy::Raise,
        }
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    pub fn with_malformed_policy(mut self, policy: MalformedLinePolicy) -> Self {
        self.malformed = policy;
        self
    }

    fn parse_candidate(&self, candidate: &CandidateLine, year: i32, month: u32) -> Result<Record> {
        let text = candidate.text.as_str();
        let tokens: Vec<&str> = text.split_whitespace().collect();

        if !tokens
            .first()
            .map(|t| token::month_day_re().is_match(t))
            .unwrap_or(false)
        {
            return Err(anyhow!("unexpected line in transaction table: {:?}", text));
        }
        if tokens.len() < 5 {
            return Err(anyhow!("too few tokens in transaction line: {:?}", text));
        }

        let trade_raw = tokens[0];
        let mut idx = 1;
        let booking_raw = if token::month_day_re().is_match(tokens[1]) {
            idx = 2;
            tokens[1]
        } else {
            // Single-date rows book on the trade day.
            trade_raw
        };

        if tokens.len() - idx < 3 {
            return Err(anyhow!(
                "too few trailing tokens in transaction line: {:?}",
                text
            ));
        }

        let n = tokens.len();
        let amount = tokens[n - 3];
        let last4 = tokens[n - 2];
        let amount_in_location = tokens[n - 1];
        let summary = tokens[idx..n - 3].join(" ").trim().to_string();

        if summary.is_empty() {
            return Err(anyhow!("empty summary in transaction line: {:?}", text));
        }
        if !token::amount_re().is_match(amount) {
            return Err(anyhow!("invalid amount in transaction line: {:?}", text));
        }
        if !token::amount_with_currency_re().is_match(amount_in_location) {
            return Err(anyhow!(
                "invalid original amount in transaction line: {:?}",
                text
            ));
        }
        if !token::last4_re().is_match(last4) {
            return Err(anyhow!("invalid card last4 in transaction line: {:?}", text));
        }

        Ok(Record {
            trade_date: token::resolve_month_day(trade_raw, year, month)?,
            booking_date: token::resolve_month_day(booking_raw, year, month)?,
            summary,
            amount: amount.to_string(),
            card_last4: last4.to_string(),
            amount_in_location: amount_in_location.to_string(),
            section: candidate.section.clone(),
            trade_date_raw: trade_raw.to_string(),
            booking_date_raw: booking_raw.to_string(),
            raw_line: text.to_string(),
        })
    }

    /// Reassemble the statement rows against the statement's reference
    /// year and month.
    pub fn extract_records(&self, lines: &[String], year: i32, month: u32) -> Result<Vec<Record>> {
        let candidates = scan(layout(), lines.iter().map(String::as_str));
        let mut records = Vec::new();

        for candidate in &candidates {
            match self.parse_candidate(candidate, year, month) {
                Ok(record) => records.push(record),
                Err(err) => match self.malformed {
                    MalformedLinePolicy::Raise => return Err(err),
                    MalformedLinePolicy::Drop => {
                        tracing::debug!(line = %candidate.text, error = %err, "dropping malformed line");
                    }
                },
            }
        }

        Ok(records)
    }

    /// Convert extracted text lines into ledger directives.
    pub fn extract_lines(
        &self,
        lines: &[String],
        year: i32,
        month: u32,
        period_tag: &str,
        source: &str,
    ) -> Result<Vec<Directive<'static>>> {
        let records = self.extract_records(lines, year, month)?;
        if records.is_empty() {
            tracing::warn!(source, "no transaction rows parsed");
        }

        let mut results = Vec::with_capacity(records.len());
        for record in &records {
            let amount: Decimal = -token::split_amount(&record.amount)
                .with_context(|| format!("in transaction line {:?}", record.raw_line))?;
            let posting = make_posting(&self.account, amount, &self.currency)?;

            let installment = record.section.as_deref() == Some(SECTION_INSTALLMENT);

            // Installments are dated to when they are booked, not when the
            // original purchase happened.
            let date = if installment {
                record.booking_date
            } else {
                record.trade_date
            };
            let flag = if installment {
                TxnFlag::Pending
            } else {
                TxnFlag::Cleared
            };

            let mut tags = vec![period_tag.to_string()];
            if installment {
                tags.push("installment".to_string());
            }

            let mut meta = vec![
                ("source".to_string(), source.to_string()),
                (
                    "trade-date".to_string(),
                    record.trade_date.format("%Y-%m-%d").to_string(),
                ),
                (
                    "booking-date".to_string(),
                    record.booking_date.format("%Y-%m-%d").to_string(),
                ),
                ("card".to_string(), record.card_last4.clone()),
                (
                    "amount-in-location".to_string(),
                    record.amount_in_location.clone(),
                ),
                ("raw".to_string(), record.raw_line.clone()),
            ];
            if let Some(section) = &record.section {
                meta.push(("section".to_string(), section.clone()));
            }

            results.push(Directive::Transaction(make_transaction(
                date,
                flag,
                None,
                record.summary.clone(),
                &tags,
                meta,
                vec![posting],
            )));
        }

        Ok(results)
    }
}

/// Reference year and month of the statement, from its file name.
pub fn year_month_from_name(name: &str) -> Result<(i32, u32)> {
    period::year_month_from_name(name, name_year_month_re())
        .ok_or_else(|| anyhow!("cannot infer year-month from file name {:?}", name))
}

fn extracted_lines(path: &Path) -> Result<Vec<String>> {
    let text = pdf_extract::extract_text(path)
        .with_context(|| format!("cannot extract text from {}", path.display()))?;

    let mut lines = Vec::new();
    for page in text.split('\u{000C}') {
        for line in page.lines() {
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
    }
    Ok(lines)
}

impl Importer for CmbCreditPdfImporter {
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
                name.starts_with("CreditCardReckoning") && name.to_lowercase().ends_with(".pdf")
            })
            .unwrap_or(false)
    }

    fn extract(&self, path: &Path) -> Result<Vec<Directive<'static>>> {
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow!("invalid file name: {}", path.display()))?;
        let (year, month) = year_month_from_name(name)?;
        let period_tag = format!("credit-cmb-{:04}-{:02}", year, month);

        let lines = extracted_lines(path)?;
        self.extract_lines(&lines, year, month, &period_tag, &path.to_string_lossy())
    }
}
