use std::path::Path;
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use beancount_core::Directive;
use chrono::{Datelike, NaiveDate};
use mailparse::{parse_mail, MailHeaderMap, ParsedMail};
use regex::Regex;
use rust_decimal::Decimal;
use scraper::{ElementRef, Html, Selector};

use ledger::{make_posting, make_transaction, Importer, TxnFlag};
use statement::period;
use statement::token;

pub const PARSER_NAME: &str = "ccb_credit_eml";

const SUBJECT_MARKER: &str = "中国建设银行信用卡";
const TABLE_MARKER: &str = "【交易明细】";

/// One row of the e-mail's transaction table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub trade_date: NaiveDate,
    pub description: String,
    pub currency: String,
    pub amount: Decimal,
}

/// Importer for CCB credit-card statements delivered as HTML e-mail.
pub struct CcbCreditEmlImporter {
    pub account: String,
    pub currency: String,
}

fn name_year_month_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-(\d{4})-(\d{2})\.eml$").expect("file name regex"))
}

fn table_selector() -> &'static Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    SEL.get_or_init(|| Selector::parse("table").expect("table selector"))
}

fn tr_selector() -> &'static Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    SEL.get_or_init(|| Selector::parse("tr").expect("tr selector"))
}

fn cell_text(cell: ElementRef) -> String {
    cell.text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Collect every `text/html` part of the message, decoded.
fn html_parts(mail: &ParsedMail) -> Vec<String> {
    fn walk(mail: &ParsedMail, out: &mut Vec<String>) {
        if mail.ctype.mimetype.eq_ignore_ascii_case("text/html") {
            if let Ok(body) = mail.get_body() {
                out.push(body);
            }
        }
        for part in &mail.subparts {
            walk(part, out);
        }
    }

    let mut out = Vec::new();
    walk(mail, &mut out);
    out
}

impl CcbCreditEmlImporter {
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

    fn parse_records(&self, table: ElementRef) -> Result<Vec<Record>> {
        let mut records = Vec::new();

        for row in table.select(tr_selector()) {
            let cells: Vec<ElementRef> = row
                .children()
                .filter_map(ElementRef::wrap)
                .filter(|c| c.value().name().eq_ignore_ascii_case("td"))
                .collect();
            if cells.len() != 8 {
                continue;
            }

            let date_raw = cell_text(cells[0]);
            let description = cell_text(cells[3]);
            let currency_raw = cell_text(cells[6]);
            let amount_raw = cell_text(cells[7]);

            let trade_date = parse_cell_date(&date_raw)
                .with_context(|| format!("invalid trade date {:?} in e-mail table", date_raw))?;
            if description.is_empty() {
                return Err(anyhow!("empty description in e-mail table row"));
            }
            let amount = token::parse_amount(&amount_raw)
                .with_context(|| format!("invalid amount {:?} in e-mail table", amount_raw))?;

            records.push(Record {
                trade_date,
                description,
                currency: if currency_raw.is_empty() {
                    self.currency.clone()
                } else {
                    currency_raw
                },
                amount,
            });
        }

        Ok(records)
    }

    /// Import from the raw message bytes. `file_name` supplies the billing
    /// period fallback when the statement text has none.
    pub fn extract_mail(
        &self,
        raw: &[u8],
        file_name: &str,
        source: &str,
    ) -> Result<Vec<Directive<'static>>> {
        let mail = parse_mail(raw).context("cannot parse e-mail message")?;

        let subject = mail
            .headers
            .get_first_value("Subject")
            .unwrap_or_default();
        if !subject.contains(SUBJECT_MARKER) {
            return Err(anyhow!("not a CCB credit card e-mail: subject {:?}", subject));
        }

        let parts = html_parts(&mail);
        if parts.is_empty() {
            return Err(anyhow!("no HTML part found in e-mail"));
        }
        let document = Html::parse_document(&parts.join("\n"));

        let text = document
            .root_element()
            .text()
            .collect::<Vec<_>>()
            .join(" ");
        let period_tag = period_tag_for(&text, file_name)?;

        // The transaction table is the innermost table that carries the
        // marker text.
        let table = document
            .select(table_selector())
            .find(|t| {
                t.text().any(|s| s.contains(TABLE_MARKER))
                    && t.select(table_selector()).next().is_none()
            })
            .ok_or_else(|| anyhow!("cannot locate transaction table in e-mail"))?;

        let records = self.parse_records(table)?;
        if records.is_empty() {
            tracing::warn!(source, "no transaction rows parsed");
        }

        let mut results = Vec::with_capacity(records.len());
        for record in &records {
            let amount = -record.amount;
            let posting = make_posting(&self.account, amount, &record.currency)?;

            let meta = vec![
                ("source".to_string(), source.to_string()),
                (
                    "trade-date".to_string(),
                    record.trade_date.format("%Y-%m-%d").to_string(),
                ),
                ("statement-amount".to_string(), record.amount.to_string()),
            ];

            results.push(Directive::Transaction(make_transaction(
                record.trade_date,
                TxnFlag::Cleared,
                None,
                record.description.clone(),
                &[period_tag.clone()],
                meta,
                vec![posting],
            )));
        }

        Ok(results)
    }
}

fn parse_cell_date(raw: &str) -> Result<NaiveDate> {
    let s = raw.trim();
    let head = s.get(..10).unwrap_or(s);
    token::parse_iso_date(head)
}

/// Billing-cycle tag, preferring the statement's own period text over the
/// file name. Refusing to guess: no period anywhere is a hard error.
fn period_tag_for(text: &str, file_name: &str) -> Result<String> {
    if let Some(period) = period::billing_period(text) {
        return Ok(format!(
            "credit-ccb-{:04}-{:02}",
            period.start.year(),
            period.start.month()
        ));
    }

    if let Some((year, month)) = period::year_month_from_name(file_name, name_year_month_re()) {
        return Ok(format!("credit-ccb-{:04}-{:02}", year, month));
    }

    Err(anyhow!(
        "cannot determine billing period from statement text or file name {:?}",
        file_name
    ))
}

impl Importer for CcbCreditEmlImporter {
    fn name(&self) -> &'static str {
        PARSER_NAME
    }

    fn account(&self) -> &str {
        &self.account
    }

    fn identify(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|s| s.to_str())
            .map(|name| name.to_lowercase().ends_with(".eml") && name.contains(SUBJECT_MARKER))
            .unwrap_or(false)
    }

    fn extract(&self, path: &Path) -> Result<Vec<Directive<'static>>> {
        let raw = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
        let name = path.file_name().and_then(|s| s.to_str()).unwrap_or_default();
        self.extract_mail(&raw, name, &path.to_string_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beancount_core::Tag;

    fn eml(subject: &str, html: &str) -> Vec<u8> {
        format!(
            "Subject: {subject}\r\nContent-Type: text/html; charset=utf-8\r\n\r\n{html}"
        )
        .into_bytes()
    }

    fn statement_html(period_line: &str, rows: &str) -> String {
        format!(
            "<html><body><p>{period_line}</p>\
             <table><tr><td colspan=\"8\">{TABLE_MARKER}</td></tr>{rows}</table>\
             </body></html>"
        )
    }

    fn row(date: &str, description: &str, currency: &str, amount: &str) -> String {
        format!(
            "<tr><td>{date}</td><td>{}</td><td>1234</td><td>{description}</td>\
             <td></td><td></td><td>{currency}</td><td>{amount}</td></tr>",
            date
        )
    }

    fn importer() -> CcbCreditEmlImporter {
        CcbCreditEmlImporter::new("Liabilities:CreditCard:CCB")
    }

    #[test]
    fn test_extracts_rows_from_statement_table() {
        let html = statement_html(
            "账单周期 2024年1月1日 至 2024年1月31日",
            &[
                row("2024-01-05", "GROCERY STORE", "CNY", "88.00"),
                row("2024-01-09", "REFUND SHOP", "", "(12.50)"),
            ]
            .join(""),
        );
        let raw = eml("中国建设银行信用卡电子账单", &html);
        let entries = importer().extract_mail(&raw, "bill.eml", "bill.eml").unwrap();

        assert_eq!(entries.len(), 2);
        let Directive::Transaction(first) = &entries[0] else {
            panic!("expected a transaction");
        };
        assert_eq!(first.narration, "GROCERY STORE");
        assert_eq!(first.postings[0].units.num, Some("-88.00".parse().unwrap()));
        assert!(first.tags.contains(&Tag::from("credit-ccb-2024-01".to_string())));

        // Blank currency cell falls back to the importer default, and the
        // parenthesized refund flips to a positive posting.
        let Directive::Transaction(second) = &entries[1] else {
            panic!("expected a transaction");
        };
        assert_eq!(second.postings[0].units.currency.as_deref(), Some("CNY"));
        assert_eq!(second.postings[0].units.num, Some("12.50".parse().unwrap()));
    }

    #[test]
    fn test_period_prefers_range_matching_statement_date() {
        let html = statement_html(
            "上一账单周期 2023年11月21日 至 2023年12月20日 \
             本期 2023年12月21日 至 2024年1月20日 Statement Date 2024-01-20",
            &row("2024-01-05", "SHOP", "CNY", "10.00"),
        );
        let raw = eml("中国建设银行信用卡电子账单", &html);
        let entries = importer().extract_mail(&raw, "bill.eml", "bill.eml").unwrap();

        let Directive::Transaction(txn) = &entries[0] else {
            panic!("expected a transaction");
        };
        assert!(txn.tags.contains(&Tag::from("credit-ccb-2023-12".to_string())));
    }

    #[test]
    fn test_period_falls_back_to_file_name() {
        let html = statement_html("没有周期信息", &row("2024-01-05", "SHOP", "CNY", "10.00"));
        let raw = eml("中国建设银行信用卡电子账单", &html);
        let entries = importer()
            .extract_mail(&raw, "中国建设银行信用卡-2024-01.eml", "x.eml")
            .unwrap();
        let Directive::Transaction(txn) = &entries[0] else {
            panic!("expected a transaction");
        };
        assert!(txn.tags.contains(&Tag::from("credit-ccb-2024-01".to_string())));
    }

    #[test]
    fn test_missing_period_everywhere_is_an_error() {
        let html = statement_html("没有周期信息", &row("2024-01-05", "SHOP", "CNY", "10.00"));
        let raw = eml("中国建设银行信用卡电子账单", &html);
        let err = importer()
            .extract_mail(&raw, "statement.eml", "x.eml")
            .unwrap_err();
        assert!(err.to_string().contains("billing period"));
    }

    #[test]
    fn test_wrong_subject_is_rejected() {
        let raw = eml("weekly newsletter", "<html><body></body></html>");
        let err = importer().extract_mail(&raw, "x.eml", "x.eml").unwrap_err();
        assert!(err.to_string().contains("subject"));
    }

    #[test]
    fn test_message_without_html_part_is_rejected() {
        let raw = b"Subject: \xe4\xb8\xad\xe5\x9b\xbd\xe5\xbb\xba\xe8\xae\xbe\xe9\x93\xb6\xe8\xa1\x8c\xe4\xbf\xa1\xe7\x94\xa8\xe5\x8d\xa1\r\nContent-Type: text/plain\r\n\r\nhello".to_vec();
        let err = importer().extract_mail(&raw, "x.eml", "x.eml").unwrap_err();
        assert!(err.to_string().contains("no HTML part"));
    }

    #[test]
    fn test_identify() {
        let importer = importer();
        assert!(importer.identify(Path::new("mail/中国建设银行信用卡-2024-01.eml")));
        assert!(!importer.identify(Path::new("中国建设银行信用卡-2024-01.pdf")));
        assert!(!importer.identify(Path::new("invoice-2024-01.eml")));
    }
}
