use std::path::Path;
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use beancount_core::Directive;
use chrono::NaiveDate;
use regex::Regex;
use rust_decimal::Decimal;

use ledger::{make_posting, make_transaction, CurrencyMap, Importer, MalformedLinePolicy, TxnFlag};
use statement::scan::{scan, CandidateLine};
use statement::token;
use statement::{period, TableLayout};

pub const PARSER_NAME: &str = "ccb_credit_pdf";

/// One statement row. The raw line is kept for the entry metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub trade_date: NaiveDate,
    pub booking_date: NaiveDate,
    pub card_last4: String,
    pub description: String,
    pub trans_currency: String,
    pub trans_amount: Decimal,
    pub settlement_currency: String,
    pub settlement_amount: Decimal,
    pub raw_line: String,
}

/// Importer for CCB credit-card PDF statements (`ccb-credit-YYYYMM.pdf`).
pub struct CcbCreditPdfImporter {
    pub account: String,
    pub currency: String,
    pub currency_map: CurrencyMap,
    pub malformed: MalformedLinePolicy,
}

fn name_year_month_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{4})(\d{2})\.pdf$").expect("file name regex"))
}

fn layout() -> TableLayout {
    TableLayout {
        header_contains: vec![
            "交易日 银行记账日 卡号后四位 交易描述 交易币/金额 结算币/金额".to_string(),
        ],
        stop_prefixes: vec!["*** 结束".to_string()],
        noise_exact: vec!["承前页".to_string()],
        noise_prefixes: vec!["T-Date P-Date".to_string(), "[人民币账户]".to_string()],
        noise_contains: vec!["接下页".to_string(), "上期账单余额".to_string()],
        ..TableLayout::default()
    }
}

impl CcbCreditPdfImporter {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            currency: "CNY".to_string(),
            currency_map: CurrencyMap::new([("CNY", "CNY")]),
            // CCB wraps long descriptions onto continuation lines, so lines
            // without the leading date pair are dropped, not fatal.
            malformed: MalformedLinePolicy::Drop,
        }
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    pub fn with_currency_map(mut self, currency_map: CurrencyMap) -> Self {
        self.currency_map = currency_map;
        self
    }

    pub fn with_malformed_policy(mut self, policy: MalformedLinePolicy) -> Self {
        self.malformed = policy;
        self
    }

    /// Parse one candidate line. `None` means the line does not have the
    /// two-leading-dates row shape at all (wrapped description text).
    fn parse_record_line(&self, text: &str) -> Result<Option<Record>> {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.len() < 7 {
            return Ok(None);
        }

        let (first, second, last4) = (tokens[0], tokens[1], tokens[2]);
        if !token::iso_date_re().is_match(first) || !token::iso_date_re().is_match(second) {
            return Ok(None);
        }
        if last4.len() != 4 {
            return Ok(None);
        }

        if tokens.len() < 8 {
            return Err(anyhow!("unexpected transaction line: {:?}", text));
        }

        let trade_date = token::parse_iso_date(first)?;
        let booking_date = token::parse_iso_date(second)?;

        let n = tokens.len();
        let trans_amount = token::parse_amount(tokens[n - 3])
            .with_context(|| format!("invalid transaction amount in line {:?}", text))?;
        let settlement_amount = token::parse_amount(tokens[n - 1])
            .with_context(|| format!("invalid settlement amount in line {:?}", text))?;

        let description = tokens[3..n - 4].join(" ").trim().to_string();
        if description.is_empty() {
            return Err(anyhow!("empty description in transaction line: {:?}", text));
        }

        Ok(Some(Record {
            trade_date,
            booking_date,
            card_last4: last4.to_string(),
            description,
            trans_currency: tokens[n - 4].to_string(),
            trans_amount,
            settlement_currency: tokens[n - 2].to_string(),
            settlement_amount,
            raw_line: text.to_string(),
        }))
    }

    fn handle_unshaped(&self, candidate: &CandidateLine) -> Result<()> {
        match self.malformed {
            MalformedLinePolicy::Drop => {
                tracing::debug!(line = %candidate.text, "dropping line without a row shape");
                Ok(())
            }
            MalformedLinePolicy::Raise => Err(anyhow!(
                "unexpected line in transaction table: {:?}",
                candidate.text
            )),
        }
    }

    /// Reassemble the statement rows from the extracted text lines.
    pub fn extract_records(&self, lines: &[String]) -> Result<Vec<Record>> {
        let candidates = scan(layout(), lines.iter().map(String::as_str));
        let mut records = Vec::new();

        for candidate in &candidates {
            match self.parse_record_line(&candidate.text)? {
                Some(record) => records.push(record),
                None => self.handle_unshaped(candidate)?,
            }
        }

        Ok(records)
    }

    /// Convert extracted text lines into ledger directives.
    ///
    /// This is the whole importer below the PDF text extraction, so tests
    /// can feed statement lines directly.
    pub fn extract_lines(
        &self,
        lines: &[String],
        period_tag: &str,
        source: &str,
    ) -> Result<Vec<Directive<'static>>> {
        let records = self.extract_records(lines)?;
        let mut results = Vec::with_capacity(records.len());

        for record in &records {
            let currency = self
                .currency_map
                .resolve(&record.settlement_currency)
                .with_context(|| format!("in transaction line {:?}", record.raw_line))?;

            // Statement convention: spend is positive. The liability posting
            // is the inverse.
            let amount = -record.settlement_amount;
            let posting = make_posting(&self.account, amount, currency)?;

            let meta = vec![
                ("source".to_string(), source.to_string()),
                (
                    "booking-date".to_string(),
                    record.booking_date.format("%Y-%m-%d").to_string(),
                ),
                ("card".to_string(), record.card_last4.clone()),
                (
                    "trans-amount".to_string(),
                    format!("{}/{}", record.trans_currency, record.trans_amount),
                ),
                ("raw".to_string(), record.raw_line.clone()),
            ];

            results.push(Directive::Transaction(make_transaction(
                record.trade_date,
                TxnFlag::Cleared,
                None,
                record.description.clone(),
                &[period_tag.to_string()],
                meta,
                vec![posting],
            )));
        }

        Ok(results)
    }
}

/// Billing-cycle tag derived from the statement file name.
pub fn period_tag_from_name(name: &str) -> Result<String> {
    let (year, month) = period::year_month_from_name(name, name_year_month_re())
        .ok_or_else(|| anyhow!("cannot infer year-month from file name {:?}", name))?;
    Ok(format!("credit-ccb-{:04}-{:02}", year, month))
}

/// Text lines of the PDF in page order then vertical order.
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

impl Importer for CcbCreditPdfImporter {
    fn name(&self) -> &'static str {
        PARSER_NAME
    }

    fn account(&self) -> &str {
        &self.account
    }

    fn identify(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|s| s.to_str())
            .map(|name| name.starts_with("ccb-credit-") && name.ends_with(".pdf"))
            .unwrap_or(false)
    }

    fn extract(&self, path: &Path) -> Result<Vec<Directive<'static>>> {
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow!("invalid file name: {}", path.display()))?;
        let period_tag = period_tag_from_name(name)?;
        let lines = extracted_lines(path)?;
        self.extract_lines(&lines, &period_tag, &path.to_string_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beancount_core::{Flag, Tag};
    use std::str::FromStr;

    const HEADER: &str = "交易日 银行记账日 卡号后四位 交易描述 交易币/金额 结算币/金额";

    fn lines(rows: &[&str]) -> Vec<String> {
        let mut out = vec!["中国建设银行信用卡对账单".to_string(), HEADER.to_string()];
        out.extend(rows.iter().map(|r| r.to_string()));
        out.push("*** 结束 ***".to_string());
        out
    }

    fn importer() -> CcbCreditPdfImporter {
        CcbCreditPdfImporter::new("Liabilities:CreditCard:CCB")
    }

    #[test]
    fn test_two_line_statement_end_to_end() {
        let lines = lines(&["2024-01-05 2024-01-06 1234 GROCERY STORE CNY 88.00 CNY 88.00"]);
        let entries = importer()
            .extract_lines(&lines, "credit-ccb-2024-01", "test.pdf")
            .unwrap();

        assert_eq!(entries.len(), 1);
        let Directive::Transaction(txn) = &entries[0] else {
            panic!("expected a transaction");
        };
        assert_eq!(txn.narration, "GROCERY STORE");
        assert_eq!(txn.flag, Flag::Okay);
        assert!(txn.tags.contains(&Tag::from("credit-ccb-2024-01".to_string())));
        assert_eq!(txn.postings.len(), 1);
        assert_eq!(txn.postings[0].units.num, Some("-88.00".parse().unwrap()));
        assert_eq!(txn.postings[0].units.currency.as_deref(), Some("CNY"));
    }

    #[test]
    fn test_record_fields() {
        let lines = lines(&["2024-01-05 2024-01-06 1234 COFFEE HOUSE US 12.00 CNY 86.40"]);
        let importer = importer();
        let records = importer.extract_records(&lines).unwrap();

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.trade_date, NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());
        assert_eq!(record.booking_date, NaiveDate::from_ymd_opt(2024, 1, 6).unwrap());
        assert_eq!(record.card_last4, "1234");
        assert_eq!(record.description, "COFFEE HOUSE");
        assert_eq!(record.trans_currency, "US");
        assert_eq!(record.trans_amount, Decimal::from_str("12.00").unwrap());
        assert_eq!(record.settlement_currency, "CNY");
        assert_eq!(record.settlement_amount, Decimal::from_str("86.40").unwrap());
    }

    #[test]
    fn test_wrapped_description_lines_are_dropped_by_default() {
        let lines = lines(&[
            "2024-01-05 2024-01-06 1234 SOME VERY LONG MERCHANT CNY 88.00 CNY 88.00",
            "NAME CONTINUED FROM ABOVE",
            "2024-01-07 2024-01-07 1234 OTHER SHOP CNY 20.00 CNY 20.00",
        ]);
        let records = importer().extract_records(&lines).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_wrapped_lines_raise_under_raise_policy() {
        let lines = lines(&[
            "2024-01-05 2024-01-06 1234 SHOP CNY 88.00 CNY 88.00",
            "NAME CONTINUED FROM ABOVE",
        ]);
        let err = importer()
            .with_malformed_policy(MalformedLinePolicy::Raise)
            .extract_records(&lines)
            .unwrap_err();
        assert!(err.to_string().contains("NAME CONTINUED FROM ABOVE"));
    }

    #[test]
    fn test_seven_token_row_shape_is_an_error() {
        // Leading dates and last4 match, but one trailing field is missing:
        // this is a malformed row, not wrapped text.
        let lines = lines(&["2024-01-05 2024-01-06 1234 CNY 88.00 CNY 88.00"]);
        let err = importer().extract_records(&lines).unwrap_err();
        assert!(err.to_string().contains("unexpected transaction line"));
    }

    #[test]
    fn test_unknown_settlement_currency_fails_loudly() {
        let lines = lines(&["2024-01-05 2024-01-06 1234 TOKYO SHOP JPY 1200 JPY 1200"]);
        let err = importer()
            .extract_lines(&lines, "credit-ccb-2024-01", "test.pdf")
            .unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("JPY"));
        assert!(message.contains("CNY"));
    }

    #[test]
    fn test_lines_after_footer_are_ignored() {
        let mut all = lines(&["2024-01-05 2024-01-06 1234 SHOP CNY 88.00 CNY 88.00"]);
        all.push("2024-01-09 2024-01-09 1234 AFTER END CNY 1.00 CNY 1.00".to_string());
        let records = importer().extract_records(&all).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_period_tag_from_name() {
        assert_eq!(
            period_tag_from_name("ccb-credit-202401.pdf").unwrap(),
            "credit-ccb-2024-01"
        );
        assert!(period_tag_from_name("statement.pdf").is_err());
    }

    #[test]
    fn test_identify() {
        let importer = importer();
        assert!(importer.identify(Path::new("in/ccb-credit-202401.pdf")));
        assert!(!importer.identify(Path::new("CreditCardReckoning-2024-01.pdf")));
        assert!(!importer.identify(Path::new("ccb-credit-202401.csv")));
    }
}
