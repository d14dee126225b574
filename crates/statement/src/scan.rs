use regex::Regex;

/// Where the scanner currently is within one statement document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Nothing before the column header is table content.
    BeforeTable,
    /// Between the column header and the statement footer.
    InTable,
    /// A stop marker was seen; the rest of the document is ignored.
    Done,
}

/// Classification of a single text line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    /// The column header line; switches the scanner into the table.
    Header,
    /// A single-token category line (消费, 分期, ...) opening a new section.
    SectionMarker(String),
    /// Boilerplate, pagination or carry-over text inside the table.
    Noise,
    /// A line to hand to the token parser, with the section active at
    /// that point in the document.
    Candidate { section: Option<String> },
    /// The statement footer; terminates scanning.
    Stop,
    /// A line outside the table (before the header or after the footer).
    Ignored,
}

/// Table grammar for one statement layout.
///
/// Every bank export is its own mini-grammar; the scanner only needs the
/// vocabulary, not the token shapes.
#[derive(Debug, Default)]
pub struct TableLayout {
    /// Substrings identifying the column header line.
    pub header_contains: Vec<String>,
    /// Prefixes of the footer lines that end the table.
    pub stop_prefixes: Vec<String>,
    /// Substrings of the footer lines that end the table.
    pub stop_contains: Vec<String>,
    /// Lines matching exactly are dropped.
    pub noise_exact: Vec<String>,
    /// Lines starting with any of these are dropped.
    pub noise_prefixes: Vec<String>,
    /// Lines containing any of these are dropped.
    pub noise_contains: Vec<String>,
    /// Lines matching any of these from the start are dropped.
    pub noise_patterns: Vec<Regex>,
    /// Section-marker vocabulary. A line equal to one of these updates the
    /// running section for all following candidates.
    pub sections: Vec<String>,
}

impl TableLayout {
    fn is_header(&self, text: &str) -> bool {
        self.header_contains.iter().any(|h| text.contains(h.as_str()))
    }

    fn is_stop(&self, text: &str) -> bool {
        self.stop_prefixes.iter().any(|p| text.starts_with(p.as_str()))
            || self.stop_contains.iter().any(|s| text.contains(s.as_str()))
    }

    fn is_noise(&self, text: &str) -> bool {
        self.noise_exact.iter().any(|e| text == e)
            || self.noise_prefixes.iter().any(|p| text.starts_with(p.as_str()))
            || self.noise_contains.iter().any(|s| text.contains(s.as_str()))
            || self.noise_patterns.iter().any(|re| {
                re.find(text).map(|m| m.start() == 0).unwrap_or(false)
            })
    }

    fn section_of(&self, text: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|s| s.as_str() == text)
            .map(|s| s.as_str())
    }
}

/// Stateful line classifier for one document.
///
/// States progress `BeforeTable -> InTable -> Done`; no transition leaves
/// `Done`, so a line is never reconsidered once the footer was seen.
pub struct TableScanner {
    layout: TableLayout,
    state: ScanState,
    section: Option<String>,
}

/// A candidate transaction line together with its section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateLine {
    pub text: String,
    pub section: Option<String>,
}

impl TableScanner {
    pub fn new(layout: TableLayout) -> Self {
        Self {
            layout,
            state: ScanState::BeforeTable,
            section: None,
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Classify the next line of the document.
    pub fn push(&mut self, line: &str) -> Classified {
        let text = line.trim();

        match self.state {
            ScanState::Done => Classified::Ignored,
            ScanState::BeforeTable => {
                if self.layout.is_header(text) {
                    self.state = ScanState::InTable;
                    Classified::Header
                } else {
                    Classified::Ignored
                }
            }
            ScanState::InTable => {
                if text.is_empty() {
                    return Classified::Noise;
                }
                if self.layout.is_stop(text) {
                    self.state = ScanState::Done;
                    return Classified::Stop;
                }
                // Page breaks repeat the column header mid-table.
                if self.layout.is_header(text) || self.layout.is_noise(text) {
                    return Classified::Noise;
                }
                if let Some(section) = self.layout.section_of(text) {
                    let section = section.to_string();
                    self.section = Some(section.clone());
                    return Classified::SectionMarker(section);
                }
                Classified::Candidate {
                    section: self.section.clone(),
                }
            }
        }
    }
}

/// Run a full document through the scanner and collect the candidate lines.
pub fn scan<'a, I>(layout: TableLayout, lines: I) -> Vec<CandidateLine>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut scanner = TableScanner::new(layout);
    let mut out = Vec::new();

    for line in lines {
        match scanner.push(line) {
            Classified::Candidate { section } => out.push(CandidateLine {
                text: line.trim().to_string(),
                section,
            }),
            Classified::Stop => break,
            _ => {}
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> TableLayout {
        TableLayout {
            header_contains: vec!["交易日 记账日 交易摘要".to_string()],
            stop_prefixes: vec!["本期还款总额".to_string()],
            stop_contains: vec!["New Balance".to_string()],
            noise_exact: vec!["承前页".to_string()],
            noise_prefixes: vec!["T-Date P-Date".to_string()],
            noise_contains: vec!["上期账单余额".to_string()],
            noise_patterns: vec![Regex::new(r"人民币账户 RMB A/C").unwrap()],
            sections: vec!["消费".to_string(), "分期".to_string()],
        }
    }

    #[test]
    fn test_lines_before_header_are_ignored() {
        let mut scanner = TableScanner::new(layout());
        assert_eq!(scanner.push("01/05 GROCERY 88.00"), Classified::Ignored);
        assert_eq!(scanner.state(), ScanState::BeforeTable);
    }

    #[test]
    fn test_state_order_is_header_then_table_then_done() {
        let mut scanner = TableScanner::new(layout());
        assert_eq!(scanner.state(), ScanState::BeforeTable);

        assert_eq!(
            scanner.push("交易日 记账日 交易摘要 人民币金额"),
            Classified::Header
        );
        assert_eq!(scanner.state(), ScanState::InTable);

        assert_eq!(
            scanner.push("01/05 01/06 GROCERY 88.00 1234 88.00"),
            Classified::Candidate { section: None }
        );

        assert_eq!(scanner.push("本期还款总额 1,000.00"), Classified::Stop);
        assert_eq!(scanner.state(), ScanState::Done);
    }

    #[test]
    fn test_nothing_after_stop_is_reconsidered() {
        let mut scanner = TableScanner::new(layout());
        scanner.push("交易日 记账日 交易摘要");
        scanner.push("Total New Balance 1,000.00");
        assert_eq!(scanner.state(), ScanState::Done);

        // Even a line that looks exactly like a transaction stays ignored.
        assert_eq!(
            scanner.push("01/05 01/06 GROCERY 88.00 1234 88.00"),
            Classified::Ignored
        );
        assert_eq!(scanner.push("交易日 记账日 交易摘要"), Classified::Ignored);
        assert_eq!(scanner.state(), ScanState::Done);
    }

    #[test]
    fn test_section_marker_attaches_to_following_candidates() {
        let layout = layout();
        let lines = [
            "对账单抬头",
            "交易日 记账日 交易摘要",
            "01/05 01/06 GROCERY 88.00 1234 88.00",
            "分期",
            "01/10 01/11 手机分期 200.00 1234 200.00",
            "消费",
            "01/12 01/13 咖啡 30.00 1234 30.00",
            "本期还款总额 318.00",
            "01/31 01/31 IGNORED 1.00 1234 1.00",
        ];
        let candidates = scan(layout, lines);

        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0].section, None);
        assert_eq!(candidates[1].section.as_deref(), Some("分期"));
        assert_eq!(candidates[2].section.as_deref(), Some("消费"));
    }

    #[test]
    fn test_noise_and_repeated_headers_are_dropped_in_table() {
        let mut scanner = TableScanner::new(layout());
        scanner.push("交易日 记账日 交易摘要");

        assert_eq!(scanner.push("承前页"), Classified::Noise);
        assert_eq!(scanner.push("T-Date P-Date Description"), Classified::Noise);
        assert_eq!(scanner.push("本期 上期账单余额 123.00"), Classified::Noise);
        assert_eq!(scanner.push("人民币账户 RMB A/C"), Classified::Noise);
        assert_eq!(scanner.push(""), Classified::Noise);
        // The header repeats after a page break.
        assert_eq!(scanner.push("交易日 记账日 交易摘要"), Classified::Noise);
        assert_eq!(scanner.state(), ScanState::InTable);
    }
}
