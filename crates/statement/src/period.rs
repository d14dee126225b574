use std::sync::OnceLock;

use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use regex::Regex;

/// The date range one statement covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

fn cn_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?P<y>\d{4})年(?P<m>\d{1,2})月(?P<d>\d{1,2})日").expect("cn date regex")
    })
}

fn cn_date_range_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?P<s>\d{4}年\d{1,2}月\d{1,2}日)\s*(?:至|-|—|~|～)\s*(?P<e>\d{4}年\d{1,2}月\d{1,2}日)",
        )
        .expect("cn date range regex")
    })
}

fn iso_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d{4}-\d{2}-\d{2}\b").expect("iso date regex"))
}

/// Parse a Chinese-notation date like `2024年1月5日`.
pub fn parse_cn_date(raw: &str) -> Result<NaiveDate> {
    let caps = cn_date_re()
        .captures(raw)
        .ok_or_else(|| anyhow!("cannot parse chinese date from {:?}", raw))?;
    let year: i32 = caps["y"].parse()?;
    let month: u32 = caps["m"].parse()?;
    let day: u32 = caps["d"].parse()?;
    NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| anyhow!("invalid calendar date in {:?}", raw))
}

/// The ISO date printed near a "Statement Date" label, if any.
pub fn statement_date(text: &str) -> Option<NaiveDate> {
    let haystack = match text.find("Statement Date") {
        Some(idx) => {
            let mut end = (idx + 300).min(text.len());
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            &text[idx..end]
        }
        None => text,
    };
    let found = iso_date_re().find(haystack)?;
    NaiveDate::parse_from_str(found.as_str(), "%Y-%m-%d").ok()
}

/// Extract the billing period from free-running statement text.
///
/// Statements often print more than one date range (the current and the
/// previous cycle). The range whose end equals the statement's own date wins;
/// otherwise the first range not introduced by 上一 ("previous"), otherwise
/// the first range found.
pub fn billing_period(text: &str) -> Option<BillingPeriod> {
    let stmt_date = statement_date(text);

    let mut candidates: Vec<(usize, BillingPeriod)> = Vec::new();
    for caps in cn_date_range_re().captures_iter(text) {
        let Ok(start) = parse_cn_date(&caps["s"]) else {
            continue;
        };
        let Ok(end) = parse_cn_date(&caps["e"]) else {
            continue;
        };
        if start <= end {
            let offset = caps.get(0).map(|m| m.start()).unwrap_or(0);
            candidates.push((offset, BillingPeriod { start, end }));
        }
    }

    if candidates.is_empty() {
        return None;
    }

    if let Some(stmt_date) = stmt_date {
        for (_, period) in &candidates {
            if period.end == stmt_date {
                return Some(*period);
            }
        }
    }

    for (offset, period) in &candidates {
        let mut from = offset.saturating_sub(72);
        while !text.is_char_boundary(from) {
            from += 1;
        }
        if text[from..*offset].contains("上一") {
            continue;
        }
        return Some(*period);
    }

    Some(candidates[0].1)
}

/// Extract `(year, month)` from a file name with a regex whose first two
/// capture groups are the year and the month.
pub fn year_month_from_name(name: &str, re: &Regex) -> Option<(i32, u32)> {
    let caps = re.captures(name)?;
    let year: i32 = caps.get(1)?.as_str().parse().ok()?;
    let month: u32 = caps.get(2)?.as_str().parse().ok()?;
    if (1..=12).contains(&month) {
        Some((year, month))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_parse_cn_date() {
        assert_eq!(parse_cn_date("2024年1月5日").unwrap(), d(2024, 1, 5));
        assert_eq!(parse_cn_date("2023年12月28日").unwrap(), d(2023, 12, 28));
        assert!(parse_cn_date("一月五日").is_err());
    }

    #[test]
    fn test_statement_date_prefers_labelled_anchor() {
        let text = "对账单 2024-02-01 发出 Statement Date 2024-01-20 其他内容";
        assert_eq!(statement_date(text), Some(d(2024, 1, 20)));
    }

    #[test]
    fn test_billing_period_matches_statement_date() {
        // Two ranges; only the second ends on the statement date.
        let text = "上一账单周期 2023年11月21日 至 2023年12月20日 \
                    本期账单周期 2023年12月21日 至 2024年1月20日 \
                    Statement Date 2024-01-20";
        let period = billing_period(text).unwrap();
        assert_eq!(period.start, d(2023, 12, 21));
        assert_eq!(period.end, d(2024, 1, 20));
    }

    #[test]
    fn test_billing_period_skips_previous_cycle_without_statement_date() {
        let text = "上一账单周期 2023年11月21日 至 2023年12月20日 \
                    本期账单周期 2023年12月21日 至 2024年1月20日";
        let period = billing_period(text).unwrap();
        assert_eq!(period.start, d(2023, 12, 21));
        assert_eq!(period.end, d(2024, 1, 20));
    }

    #[test]
    fn test_billing_period_falls_back_to_first_range() {
        let text = "账单周期 2024年1月21日 ~ 2024年2月20日";
        let period = billing_period(text).unwrap();
        assert_eq!(period.start, d(2024, 1, 21));
        assert_eq!(period.end, d(2024, 2, 20));
    }

    #[test]
    fn test_billing_period_absent() {
        assert_eq!(billing_period("没有任何日期范围"), None);
    }

    #[test]
    fn test_year_month_from_name() {
        let re = Regex::new(r"(\d{4})(\d{2})\.pdf$").unwrap();
        assert_eq!(
            year_month_from_name("ccb-credit-202401.pdf", &re),
            Some((2024, 1))
        );
        assert_eq!(year_month_from_name("ccb-credit-202413.pdf", &re), None);
        assert_eq!(year_month_from_name("statement.pdf", &re), None);
    }
}
