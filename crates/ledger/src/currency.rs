use std::collections::BTreeMap;

use anyhow::{anyhow, Result};

/// Mapping from statement currency labels (人民币元, `US`, ...) to ledger
/// currency codes.
///
/// The mapping is not total: a label the caller did not declare is a
/// configuration error, never a fallback to the statement's native currency.
#[derive(Debug, Clone, Default)]
pub struct CurrencyMap {
    map: BTreeMap<String, String>,
}

impl CurrencyMap {
    pub fn new<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            map: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn insert(&mut self, label: impl Into<String>, code: impl Into<String>) {
        self.map.insert(label.into(), code.into());
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Look up the ledger currency for a statement label. Unknown labels fail
    /// with the full set of known labels, so the configuration can be fixed.
    pub fn resolve(&self, label: &str) -> Result<&str> {
        self.map.get(label).map(String::as_str).ok_or_else(|| {
            let known = self
                .map
                .keys()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            anyhow!("currency {:?} not in currency map; known: {}", label, known)
        })
    }
}
