use std::collections::HashSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use beancount_core::Directive;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use encoding_rs::GB18030;
use rust_decimal::Decimal;

use ledger::{make_balance, make_posting, make_transaction, Importer, TxnFlag};

pub const PARSER_NAME: &str = "alipay";

/// Line introducing the transaction table in the export preamble.
const TABLE_START: &str = "-------收支明细列表-----";
/// QR-code payment comment prefix, stripped from payees.
const COMMENTS_PREFIX: &str = "收款方备注:二维码收款付款方留言:";

/// Importer for Alipay account-log CSV exports (`*_ACCLOG.csv`).
pub struct AlipayImporter {
    pub account: String,
    pub currency: String,
}

/// Decode export bytes into text.
///
/// The exports are commonly GB18030, but newer ones can be UTF-8.
fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF][..]).unwrap_or(bytes);

    if let Ok(s) = std::str::from_utf8(bytes) {
        if s.contains("收支明细") || s.contains("时间") {
            return s.to_string();
        }
    }

    let (decoded, _, _) = GB18030.decode(bytes);
    decoded.into_owned()
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

fn parse_time(raw: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%d %H:%M:%S")
        .with_context(|| format!("invalid datetime {:?}", raw))
}

impl AlipayImporter {
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

    /// Convert the decoded export text into directives.
    pub fn extract_text(&self, text: &str, source: &str) -> Result<Vec<Directive<'static>>> {
        let start = text
            .lines()
            .position(|line| line.contains(TABLE_START))
            .with_context(|| format!("missing {:?} marker in {}", TABLE_START, source))?;
        let table = text
            .lines()
            .skip(start + 1)
            .collect::<Vec<_>>()
            .join("\n");

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(table.as_bytes());
        let headers = reader.headers().context("missing CSV headers")?.clone();

        let c_time = find_col(&headers, "时间")?;
        let c_channel = find_col(&headers, "资金渠道")?;
        let c_outcome = find_col(&headers, "支出")?;
        let c_income = find_col(&headers, "收入")?;
        let c_item = find_col(&headers, "商品说明")?;
        let c_note = find_col(&headers, "备注")?;
        let c_name = find_col(&headers, "名称")?;
        let c_balance = headers.iter().position(|h| h.trim() == "账户余额（元）");

        let mut results = Vec::new();
        let mut seen_days: HashSet<NaiveDate> = HashSet::new();

        for (row_idx, record) in reader.records().enumerate() {
            let record =
                record.with_context(|| format!("CSV read error at row {}", row_idx + 2))?;
            let get = |idx: usize| record.get(idx).unwrap_or("").trim();

            let datetime = parse_time(get(c_time))
                .with_context(|| format!("in row {} of {}", row_idx + 2, source))?;
            let date = datetime.date();

            let outcome = get(c_outcome);
            let income = get(c_income);
            let amount_raw = if outcome.is_empty() { income } else { outcome };
            let amount = parse_decimal(amount_raw)
                .with_context(|| format!("invalid amount in row {} of {}", row_idx + 2, source))?;

            let mut payee = [get(c_item), get(c_note), get(c_name)]
                .into_iter()
                .find(|s| !s.is_empty())
                .unwrap_or("")
                .to_string();
            if let Some(stripped) = payee.strip_prefix(COMMENTS_PREFIX) {
                payee = stripped.to_string();
            }
            if payee == "/" {
                payee.clear();
            }

            let meta = vec![
                ("source".to_string(), source.to_string()),
                ("time".to_string(), datetime.time().to_string()),
                ("funding-channel".to_string(), get(c_channel).to_string()),
            ];

            let balance_raw = c_balance
                .map(|idx| get(idx).replace(',', ""))
                .unwrap_or_default();
            if !balance_raw.is_empty() && seen_days.insert(date) {
                let balance = parse_decimal(&balance_raw).with_context(|| {
                    format!("invalid balance in row {} of {}", row_idx + 2, source)
                })?;
                results.push(Directive::Balance(make_balance(
                    date + Duration::days(1),
                    &self.account,
                    balance,
                    &self.currency,
                    meta.clone(),
                )?));
            }

            let posting = make_posting(&self.account, amount, &self.currency)?;
            results.push(Directive::Transaction(make_transaction(
                date,
                TxnFlag::Cleared,
                None,
                payee,
                &["alipay".to_string()],
                meta,
                vec![posting],
            )));
        }

        if results.is_empty() {
            tracing::warn!(source, "no transaction rows parsed");
        }

        Ok(results)
    }
}

impl Importer for AlipayImporter {
    fn name(&self) -> &'static str {
        PARSER_NAME
    }

    fn account(&self) -> &str {
        &self.account
    }

    fn identify(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|s| s.to_str())
            .map(|name| name.ends_with("_ACCLOG.csv"))
            .unwrap_or(false)
    }

    fn extract(&self, path: &Path) -> Result<Vec<Directive<'static>>> {
        let bytes =
            std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
        self.extract_text(&decode_text(&bytes), &path.to_string_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beancount_core::Tag;

    fn export(rows: &[&str]) -> String {
        let mut lines = vec![
            "支付宝交易记录明细查询".to_string(),
            "账号:[xxx]".to_string(),
            "-------收支明细列表-----".to_string(),
            "时间,名称,资金渠道,商品说明,备注,收入,支出,账户余额（元）".to_string(),
        ];
        lines.extend(rows.iter().map(|r| r.to_string()));
        lines.join("\n")
    }

    fn importer() -> AlipayImporter {
        AlipayImporter::new("Assets:Alipay")
    }

    #[test]
    fn test_rows_become_tagged_transactions() {
        let text = export(&[
            "2023-08-30 20:46:41,转账,余额,奶茶店,备注,,-15.00,985.00",
            "2023-08-31 09:00:00,收款,余额,,,20.00,,1005.00",
        ]);
        let entries = importer().extract_text(&text, "test_ACCLOG.csv").unwrap();

        // One balance assertion and one transaction per day here.
        assert_eq!(entries.len(), 4);
        let Directive::Transaction(first) = &entries[1] else {
            panic!("expected a transaction");
        };
        assert_eq!(first.narration, "奶茶店");
        assert_eq!(first.postings[0].units.num, Some("-15.00".parse().unwrap()));
        assert!(first.tags.contains(&Tag::from("alipay".to_string())));
    }

    #[test]
    fn test_payee_fallback_chain_and_placeholder() {
        let text = export(&[
            "2023-08-30 10:00:00,名称兜底,余额,,,,-1.00,10.00",
            "2023-08-30 11:00:00,转账,余额,/,,,-2.00,8.00",
            "2023-08-30 12:00:00,转账,余额,收款方备注:二维码收款付款方留言:咖啡,,,-3.00,5.00",
        ]);
        let entries = importer().extract_text(&text, "test_ACCLOG.csv").unwrap();

        let narrations: Vec<String> = entries
            .iter()
            .filter_map(|e| match e {
                Directive::Transaction(t) => Some(t.narration.to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(narrations, vec!["名称兜底", "", "咖啡"]);
    }

    #[test]
    fn test_one_balance_per_day_from_first_row() {
        let text = export(&[
            "2023-08-30 10:00:00,转账,余额,甲,,,-1.00,99.00",
            "2023-08-30 11:00:00,转账,余额,乙,,,-2.00,97.00",
        ]);
        let entries = importer().extract_text(&text, "test_ACCLOG.csv").unwrap();

        let balances: Vec<_> = entries
            .iter()
            .filter_map(|e| match e {
                Directive::Balance(b) => Some(b),
                _ => None,
            })
            .collect();
        assert_eq!(balances.len(), 1);
        assert_eq!(balances[0].amount.num, "99.00".parse().unwrap());
        assert_eq!(
            balances[0].date,
            beancount_core::Date::from_string_unchecked("2023-08-31".to_string())
        );
    }

    #[test]
    fn test_missing_table_marker_is_an_error() {
        let err = importer()
            .extract_text("时间,名称\n2023-08-30,转账", "test_ACCLOG.csv")
            .unwrap_err();
        assert!(err.to_string().contains("收支明细列表"));
    }

    #[test]
    fn test_decode_text_handles_gb18030() {
        let (encoded, _, _) = encoding_rs::GB18030.encode("-------收支明细列表-----\n时间,名称");
        let decoded = decode_text(&encoded);
        assert!(decoded.contains("收支明细列表"));
    }

    #[test]
    fn test_identify() {
        let importer = importer();
        assert!(importer.identify(Path::new("20240101_ACCLOG.csv")));
        assert!(!importer.identify(Path::new("alipay_record.csv")));
    }
}
