//! Equality-based label selectors (`app=web,tier!=db,canary,!legacy`).

use std::collections::BTreeMap;

use smallvec::SmallVec;
use tessera_core::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Op {
    Eq(String),
    NotEq(String),
    Exists,
    NotExists,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Requirement {
    key: String,
    op: Op,
}

impl Requirement {
    fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let v = labels.and_then(|l| l.get(&self.key));
        match &self.op {
            Op::Eq(want) => v == Some(want),
            // Absent keys satisfy `!=`.
            Op::NotEq(want) => v != Some(want),
            Op::Exists => v.is_some(),
            Op::NotExists => v.is_none(),
        }
    }
}

/// Conjunction of label requirements. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    reqs: SmallVec<[Requirement; 4]>,
}

impl LabelSelector {
    pub fn is_empty(&self) -> bool { self.reqs.is_empty() }

    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.reqs.iter().all(|r| r.matches(labels))
    }
}

impl std::str::FromStr for LabelSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut reqs = SmallVec::new();
        for term in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (key, op) = if let Some((k, v)) = term.split_once("!=") {
                (k, Op::NotEq(v.trim().to_string()))
            } else if let Some((k, v)) = term.split_once("==") {
                (k, Op::Eq(v.trim().to_string()))
            } else if let Some((k, v)) = term.split_once('=') {
                (k, Op::Eq(v.trim().to_string()))
            } else if let Some(k) = term.strip_prefix('!') {
                (k, Op::NotExists)
            } else {
                (term, Op::Exists)
            };
            let key = key.trim();
            if !valid_label_key(key) {
                return Err(Error::InvalidInput(format!("invalid label selector term {:?}", term)));
            }
            if let Op::Eq(v) | Op::NotEq(v) = &op {
                if v.contains(['=', '!']) {
                    return Err(Error::InvalidInput(format!("invalid label selector term {:?}", term)));
                }
            }
            reqs.push(Requirement { key: key.to_string(), op });
        }
        Ok(Self { reqs })
    }
}

fn valid_label_key(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    #[test]
    fn parses_and_matches() {
        let sel: LabelSelector = "app=web, tier!=db,canary,!legacy".parse().unwrap();
        assert!(sel.matches(Some(&labels(&[("app", "web"), ("canary", "")]))));
        assert!(!sel.matches(Some(&labels(&[("app", "web"), ("canary", ""), ("tier", "db")]))));
        assert!(!sel.matches(Some(&labels(&[("app", "web"), ("canary", ""), ("legacy", "1")]))));
        assert!(!sel.matches(Some(&labels(&[("app", "api"), ("canary", "")]))));
        assert!(!sel.matches(None));
    }

    #[test]
    fn double_equals_and_prefixed_keys() {
        let sel: LabelSelector = "app.kubernetes.io/name==web".parse().unwrap();
        assert!(sel.matches(Some(&labels(&[("app.kubernetes.io/name", "web")]))));
    }

    #[test]
    fn empty_selector_matches_everything() {
        let sel: LabelSelector = "".parse().unwrap();
        assert!(sel.is_empty());
        assert!(sel.matches(None));
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["=web", "a b=c", "a=b=c", "!"] {
            assert!(bad.parse::<LabelSelector>().is_err(), "{:?}", bad);
        }
    }
}
