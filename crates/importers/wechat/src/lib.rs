use std::path::Path;
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use beancount_core::Directive;
use chrono::NaiveDateTime;
use regex::Regex;
use rust_decimal::Decimal;

use ledger::{make_posting, make_transaction, Importer, TxnFlag};

pub const PARSER_NAME: &str = "wechat";

/// Lines of export preamble before the CSV header.
const PREAMBLE_LINES: usize = 16;
/// QR-code payment comment prefix, stripped from narrations.
const COMMENTS_PREFIX: &str = "收款方备注:二维码收款付款方留言:";
/// Placeholder posted against payment methods with no configured account.
const UNMAPPED_ACCOUNT: &str = "Assets:FIXME";

/// Importer for WeChat Pay CSV exports (`微信支付账单(YYYYMMDD-YYYYMMDD).csv`).
///
/// `account_map` links substrings of the 支付方式 column to ledger accounts;
/// the wallet itself (零钱) is always mapped to `account`. Rows whose payment
/// method matches nothing post to a placeholder account and are flagged for
/// review instead of being dropped.
pub struct WechatImporter {
    pub account: String,
    pub currency: String,
    pub account_map: Vec<(String, String)>,
}

fn file_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^微信支付账单\(\d{8}-\d{8}\)\.csv$").expect("file name regex"))
}

fn parse_amount(raw: &str) -> Result<Decimal> {
    let s = raw.trim().trim_start_matches(['¥', '￥']).replace(',', "");
    if s.is_empty() {
        return Err(anyhow!("empty amount"));
    }
    s.parse()
        .map_err(|_| anyhow!("cannot parse amount from {:?}", raw))
}

fn find_col(headers: &csv::StringRecord, name: &str) -> Result<usize> {
    headers
        .iter()
        .position(|h| h.trim() == name)
        .ok_or_else(|| anyhow!("Missing column: {}", name))
}

impl WechatImporter {
    pub fn new(account: impl Into<String>) -> Self {
        let account = account.into();
        Self {
            currency: "CNY".to_string(),
            account_map: vec![
                ("零钱".to_string(), account.clone()),
                ("/".to_string(), account.clone()),
            ],
            account,
        }
    }

    /// Add a payment-method mapping. Entries added later win when several
    /// substrings match the same 支付方式 text.
    pub fn with_account(mut self, method: impl Into<String>, account: impl Into<String>) -> Self {
        self.account_map.push((method.into(), account.into()));
        self
    }

    fn funding_account(&self, method: &str) -> Option<&str> {
        self.account_map
            .iter()
            .rev()
            .find(|(key, _)| method.contains(key.as_str()))
            .map(|(_, account)| account.as_str())
    }

    /// Convert the export text into directives.
    pub fn extract_text(&self, text: &str, source: &str) -> Result<Vec<Directive<'static>>> {
        let table = text
            .lines()
            .skip(PREAMBLE_LINES)
            .collect::<Vec<_>>()
            .join("\n");
        if table.is_empty() {
            return Err(anyhow!("unexpected export layout in {}", source));
        }

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(table.as_bytes());
        let headers = reader.headers().context("missing CSV headers")?.clone();

        let c_time = find_col(&headers, "交易时间")?;
        let c_counterparty = find_col(&headers, "交易对方")?;
        let c_product = find_col(&headers, "商品")?;
        let c_inout = find_col(&headers, "收/支")?;
        let c_amount = find_col(&headers, "金额(元)")?;
        let c_method = find_col(&headers, "支付方式")?;
        let c_status = find_col(&headers, "当前状态")?;

        let mut results = Vec::new();

        for (row_idx, record) in reader.records().enumerate() {
            let record =
                record.with_context(|| format!("CSV read error at row {}", row_idx + 2))?;
            let get = |idx: usize| record.get(idx).unwrap_or("").trim();

            let datetime = NaiveDateTime::parse_from_str(get(c_time), "%Y-%m-%d %H:%M:%S")
                .with_context(|| format!("invalid datetime {:?} in {}", get(c_time), source))?;

            let mut amount = parse_amount(get(c_amount))
                .with_context(|| format!("invalid amount in row {} of {}", row_idx + 2, source))?;
            if matches!(get(c_inout), "支出" | "/") {
                amount = -amount;
            }

            let mut payee = Some(get(c_counterparty).to_string());
            let mut narration = get(c_product).to_string();
            if let Some(stripped) = narration.strip_prefix(COMMENTS_PREFIX) {
                narration = stripped.to_string();
            }
            if narration == "/" {
                narration.clear();
            }

            let method = get(c_method);
            let (funding_account, mut flag) = match self.funding_account(method) {
                Some(account) => (account.to_string(), TxnFlag::Cleared),
                None => (UNMAPPED_ACCOUNT.to_string(), TxnFlag::Pending),
            };

            let mut postings = vec![make_posting(&funding_account, amount, &self.currency)?];

            // Wallet top-ups move money from the funding account into the
            // wallet itself.
            if get(c_status) == "充值完成" {
                postings.insert(0, make_posting(&self.account, -amount, &self.currency)?);
                narration = "微信零钱充值".to_string();
                payee = None;
                flag = TxnFlag::Cleared;
            }

            let meta = vec![
                ("source".to_string(), source.to_string()),
                ("time".to_string(), datetime.time().to_string()),
                ("payment-method".to_string(), method.to_string()),
                ("status".to_string(), get(c_status).to_string()),
            ];

            results.push(Directive::Transaction(make_transaction(
                datetime.date(),
                flag,
                payee,
                narration,
                &["wechat".to_string()],
                meta,
                postings,
            )));
        }

        if results.is_empty() {
            tracing::warn!(source, "no transaction rows parsed");
        }

        Ok(results)
    }
}

impl Importer for WechatImporter {
    fn name(&self) -> &'static str {
        PARSER_NAME
    }

    fn account(&self) -> &str {
        &self.account
    }

    fn identify(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|s| s.to_str())
            .map(|name| file_name_re().is_match(name))
            .unwrap_or(false)
    }

    fn extract(&self, path: &Path) -> Result<Vec<Directive<'static>>> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        self.extract_text(&text, &path.to_string_lossy())
    }
}
