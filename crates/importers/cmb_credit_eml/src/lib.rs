use std::path::Path;
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use beancount_core::Directive;
use chrono::{Datelike, NaiveDate};
use mailparse::{parse_mail, ParsedMail};
use regex::Regex;
use rust_decimal::Decimal;
use scraper::{ElementRef, Html, Selector};

use ledger::{make_posting, make_transaction, Importer, TxnFlag};

pub const PARSER_NAME: &str = "cmb_credit_eml";

const NAME_MARKER: &str = "招商银行信用卡电子账单";
const INSTALLMENT_PAYEE: &str = "消费分期";

/// One row of the e-mail statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub date: NaiveDate,
    pub payee: String,
    pub narration: String,
    pub amount: Decimal,
    pub trade_date_raw: String,
}

/// Importer for CMB credit-card statements delivered as HTML e-mail.
pub struct CmbCreditEmlImporter {
    pub account: String,
    pub currency: String,
}

fn date_range_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d{4}/\d{1,2}/\d{1,2})-(\d{4}/\d{1,2}/\d{1,2})").expect("date range regex")
    })
}

fn band_selector() -> &'static Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    SEL.get_or_init(|| {
        Selector::parse("#fixBand29 #loopBand2>table>tbody>tr").expect("band selector")
    })
}

fn cell_selector() -> &'static Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    SEL.get_or_init(|| Selector::parse("td #fixBand15 table table td").expect("cell selector"))
}

fn cell_text(cell: ElementRef) -> String {
    cell.text()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('\u{00a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn first_html_part(mail: &ParsedMail) -> Option<String> {
    if mail.ctype.mimetype.eq_ignore_ascii_case("text/html") {
        if let Ok(body) = mail.get_body() {
            return Some(body);
        }
    }
    for part in &mail.subparts {
        if let Some(body) = first_html_part(part) {
            return Some(body);
        }
    }
    None
}

impl CmbCreditEmlImporter {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            currency: "CNY".to_string(),
        }
    }

    /// Resolve a 4-digit `mmdd` row date against the statement date, rolling
    /// into the previous year when the month lies after the statement month.
    fn resolve_row_date(&self, raw: &str, statement_date: NaiveDate) -> Result<NaiveDate> {
        if raw.len() != 4 || !raw.chars().all(|c| c.is_ascii_digit()) {
            return Err(anyhow!("unexpected row date {:?}", raw));
        }
        let month: u32 = raw[0..2].parse()?;
        let day: u32 = raw[2..4].parse()?;
        let year = if month > statement_date.month() {
            statement_date.year() - 1
        } else {
            statement_date.year()
        };
        NaiveDate::from_ymd_opt(year, month, day)
            .ok_or_else(|| anyhow!("invalid calendar date {:?}", raw))
    }

    fn parse_records(&self, document: &Html, statement_date: NaiveDate) -> Result<Vec<Record>> {
        let mut records = Vec::new();

        for band in document.select(band_selector()) {
            let cells: Vec<ElementRef> = band.select(cell_selector()).collect();
            if cells.is_empty() {
                continue;
            }
            if cells.len() < 5 {
                return Err(anyhow!(
                    "unexpected statement band with {} cells",
                    cells.len()
                ));
            }

            let description = cell_text(cells[3]);
            let mut pieces = description.splitn(2, '-');
            let payee = pieces.next().unwrap_or_default().trim().to_string();
            let narration = pieces.next().unwrap_or_default().trim().to_string();
            if payee.is_empty() {
                return Err(anyhow!("empty description in statement band"));
            }

            // Installment rows leave the trade-date cell blank; the booking
            // date is the usable one.
            let mut trade_raw = cell_text(cells[1]);
            if trade_raw.is_empty() || payee == INSTALLMENT_PAYEE {
                trade_raw = cell_text(cells[2]);
            }
            let date = self
                .resolve_row_date(&trade_raw, statement_date)
                .with_context(|| format!("in statement band for {:?}", description))?;

            let amount_raw = cell_text(cells[4]).replace(['￥', '¥'], "");
            let amount_raw = amount_raw.trim().replace(',', "");
            let amount: Decimal = amount_raw
                .parse()
                .map_err(|_| anyhow!("invalid amount {:?} in statement band", amount_raw))?;

            records.push(Record {
                date,
                payee,
                narration,
                amount,
                trade_date_raw: trade_raw,
            });
        }

        Ok(records)
    }

    /// Import from the raw message bytes.
    pub fn extract_mail(&self, raw: &[u8], source: &str) -> Result<Vec<Directive<'static>>> {
        let mail = parse_mail(raw).context("cannot parse e-mail message")?;
        let html = first_html_part(&mail).ok_or_else(|| anyhow!("no HTML part found in e-mail"))?;
        let document = Html::parse_document(&html);

        let text = document
            .root_element()
            .text()
            .collect::<Vec<_>>()
            .join(" ");
        let caps = date_range_re()
            .captures(&text)
            .ok_or_else(|| anyhow!("cannot find statement date range in e-mail"))?;
        let statement_date = NaiveDate::parse_from_str(&caps[2], "%Y/%m/%d")
            .with_context(|| format!("invalid statement date {:?}", &caps[2]))?;

        let period_tag = format!(
            "credit-cmb-{:04}-{:02}",
            statement_date.year(),
            statement_date.month()
        );

        let records = self.parse_records(&document, statement_date)?;
        if records.is_empty() {
            tracing::warn!(source, "no transaction rows parsed");
        }

        let mut results = Vec::with_capacity(records.len());
        for record in &records {
            let amount = -record.amount;
            let posting = make_posting(&self.account, amount, &self.currency)?;

            let meta = vec![
                ("source".to_string(), source.to_string()),
                ("trade-date-raw".to_string(), record.trade_date_raw.clone()),
                (
                    "statement-date".to_string(),
                    statement_date.format("%Y-%m-%d").to_string(),
                ),
            ];

            results.push(Directive::Transaction(make_transaction(
                record.date,
                TxnFlag::Cleared,
                Some(record.payee.clone()),
                record.narration.clone(),
                &[period_tag.clone()],
                meta,
                vec![posting],
            )));
        }

        Ok(results)
    }
}

impl Importer for CmbCreditEmlImporter {
    fn name(&self) -> &'static str {
        PARSER_NAME
    }

    fn account(&self) -> &str {
        &self.account
    }

    fn identify(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|s| s.to_str())
            .map(|name| name.contains(NAME_MARKER) && name.contains("eml"))
            .unwrap_or(false)
    }

    fn extract(&self, path: &Path) -> Result<Vec<Directive<'static>>> {
        let raw = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
        self.extract_mail(&raw, &path.to_string_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beancount_core::Tag;

    fn band(trade: &str, post: &str, description: &str, amount: &str) -> String {
        format!(
            "<tr><td><div id=\"fixBand15\"><table><tr><td><table><tr>\
             <td>1</td><td>{trade}</td><td>{post}</td><td>{description}</td><td>{amount}</td>\
             </tr></table></td></tr></table></div></td></tr>"
        )
    }

    fn eml(range: &str, bands: &str) -> Vec<u8> {
        let html = format!(
            "<html><body><p>{range}</p>\
             <div id=\"fixBand29\"><div id=\"loopBand2\"><table><tbody>{bands}</tbody></table>\
             </div></div></body></html>"
        );
        format!("Subject: statement\r\nContent-Type: text/html; charset=utf-8\r\n\r\n{html}")
            .into_bytes()
    }

    fn importer() -> CmbCreditEmlImporter {
        CmbCreditEmlImporter::new("Liabilities:CreditCard:CMB")
    }

    #[test]
    fn test_extracts_bands_with_payee_and_narration() {
        let raw = eml(
            "2024/1/1-2024/1/20(还款日)",
            &band("0105", "0106", "超市-GROCERY STORE", "￥88.00"),
        );
        let entries = importer().extract_mail(&raw, "bill.eml").unwrap();

        assert_eq!(entries.len(), 1);
        let Directive::Transaction(txn) = &entries[0] else {
            panic!("expected a transaction");
        };
        assert_eq!(txn.payee.as_deref(), Some("超市"));
        assert_eq!(txn.narration, "GROCERY STORE");
        assert_eq!(
            txn.date,
            beancount_core::Date::from_string_unchecked("2024-01-05".to_string())
        );
        assert_eq!(txn.postings[0].units.num, Some("-88.00".parse().unwrap()));
        assert!(txn.tags.contains(&Tag::from("credit-cmb-2024-01".to_string())));
    }

    #[test]
    fn test_blank_trade_date_falls_back_to_post_date() {
        let raw = eml(
            "2024/1/1-2024/1/20",
            &band("", "0106", "消费分期-手机 12 期", "￥200.00"),
        );
        let entries = importer().extract_mail(&raw, "bill.eml").unwrap();
        let Directive::Transaction(txn) = &entries[0] else {
            panic!("expected a transaction");
        };
        assert_eq!(
            txn.date,
            beancount_core::Date::from_string_unchecked("2024-01-06".to_string())
        );
    }

    #[test]
    fn test_row_month_after_statement_month_rolls_into_previous_year() {
        let raw = eml(
            "2023/12/21-2024/1/20",
            &band("1228", "1229", "商户-年末消费", "￥10.00"),
        );
        let entries = importer().extract_mail(&raw, "bill.eml").unwrap();
        let Directive::Transaction(txn) = &entries[0] else {
            panic!("expected a transaction");
        };
        assert_eq!(
            txn.date,
            beancount_core::Date::from_string_unchecked("2023-12-28".to_string())
        );
    }

    #[test]
    fn test_missing_date_range_is_an_error() {
        let raw = eml("没有日期范围", &band("0105", "0106", "超市-X", "￥1.00"));
        let err = importer().extract_mail(&raw, "bill.eml").unwrap_err();
        assert!(err.to_string().contains("date range"));
    }

    #[test]
    fn test_identify() {
        let importer = importer();
        assert!(importer.identify(Path::new("招商银行信用卡电子账单-2024-01.eml")));
        assert!(!importer.identify(Path::new("statement-2024-01.eml")));
    }
}
