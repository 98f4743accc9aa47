//! Label selectors used as application identity.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ResourceError;

/// A single constraint over a label set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Requirement {
    /// `key=value`
    Equals { key: String, value: String },
    /// `key` must be present with any value.
    Exists { key: String },
}

impl Requirement {
    pub fn key(&self) -> &str {
        match self {
            Requirement::Equals { key, .. } | Requirement::Exists { key } => key,
        }
    }

    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals { key, value } => labels.get(key) == Some(value),
            Requirement::Exists { key } => labels.contains_key(key),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Equals { key, value } => write!(f, "{}={}", key, value),
            Requirement::Exists { key } => write!(f, "{}", key),
        }
    }
}

/// Conjunction of label requirements.
///
/// Requirements are kept sorted by key so that the string form is canonical:
/// two selectors built in a different order print identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    /// Selector without requirements. Listing with it is rejected.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(Requirement::Equals {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn with_exists(mut self, key: impl Into<String>) -> Self {
        self.push(Requirement::Exists { key: key.into() });
        self
    }

    fn push(&mut self, req: Requirement) {
        if !self.requirements.contains(&req) {
            self.requirements.push(req);
            self.requirements.sort();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    /// Returns true if every requirement holds for `labels`.
    ///
    /// An empty selector matches nothing here; callers that want
    /// "everything" must say so explicitly.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        !self.is_empty() && self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

fn valid_label_part(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
}

impl FromStr for LabelSelector {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut selector = LabelSelector::new();
        for raw in s.split(',') {
            let part = raw.trim();
            if part.is_empty() {
                continue;
            }
            match part.split_once('=') {
                Some((key, value)) => {
                    let key = key.trim();
                    let value = value.trim_start_matches('=').trim();
                    if !valid_label_part(key) || (!value.is_empty() && !valid_label_part(value)) {
                        return Err(ResourceError::InvalidSelector(s.to_string()));
                    }
                    selector = selector.with_equals(key, value);
                }
                None => {
                    if !valid_label_part(part) {
                        return Err(ResourceError::InvalidSelector(s.to_string()));
                    }
                    selector = selector.with_exists(part);
                }
            }
        }
        Ok(selector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_canonical_string_is_sorted() {
        let a = LabelSelector::new()
            .with_equals("tier", "web")
            .with_exists("app");
        let b = LabelSelector::new()
            .with_exists("app")
            .with_equals("tier", "web");
        assert_eq!(a.to_string(), "app,tier=web");
        assert_eq!(a, b);
    }

    #[test]
    fn test_parse_equals_and_exists() {
        let sel: LabelSelector = "app=external, team".parse().unwrap();
        assert_eq!(sel.requirements().len(), 2);
        assert_eq!(sel.to_string(), "app=external,team");

        let double: LabelSelector = "app==external".parse().unwrap();
        assert_eq!(double.to_string(), "app=external");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("app=ext ernal".parse::<LabelSelector>().is_err());
        assert!("=value".parse::<LabelSelector>().is_err());
    }

    #[test]
    fn test_matches_conjunction() {
        let sel = LabelSelector::new()
            .with_equals("app", "external")
            .with_exists("team");
        assert!(sel.matches(&labels(&[("app", "external"), ("team", "a")])));
        assert!(!sel.matches(&labels(&[("app", "external")])));
        assert!(!sel.matches(&labels(&[("app", "other"), ("team", "a")])));
    }

    #[test]
    fn test_empty_selector_matches_nothing() {
        let sel = LabelSelector::new();
        assert!(sel.is_empty());
        assert!(!sel.matches(&labels(&[("app", "x")])));
        assert_eq!(sel.to_string(), "");
    }
}
