//! Label selectors.
//!
//! A selector is the conjunction of its `match_labels` pairs and its
//! `match_expressions` requirements. The `Display` form is canonical
//! (requirements sorted by key), so it can be stored in status fields.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

static LABEL_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9]([-A-Za-z0-9_.]{0,61}[A-Za-z0-9])?)?$").unwrap()
});

static DNS_SUBDOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap()
});

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl LabelSelector {
    /// Selector matching exactly the given label pairs.
    pub fn from_labels<I, K, V>(labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            match_labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            match_expressions: Vec::new(),
        }
    }

    /// An empty selector matches everything.
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
            && self.match_expressions.iter().all(|r| r.matches(labels))
    }

    /// Check keys, values and operator arity.
    pub fn validate(&self) -> StateResult<()> {
        for (k, v) in &self.match_labels {
            validate_label_key(k)?;
            validate_label_value(v)?;
        }
        for req in &self.match_expressions {
            validate_label_key(&req.key)?;
            match req.operator {
                SelectorOperator::In | SelectorOperator::NotIn if req.values.is_empty() => {
                    return Err(StateError::Invalid(format!(
                        "selector requirement on {:?} needs values for {:?}",
                        req.key, req.operator
                    )));
                }
                SelectorOperator::Exists | SelectorOperator::DoesNotExist
                    if !req.values.is_empty() =>
                {
                    return Err(StateError::Invalid(format!(
                        "selector requirement on {:?} must not have values for {:?}",
                        req.key, req.operator
                    )));
                }
                _ => {}
            }
            for v in &req.values {
                validate_label_value(v)?;
            }
        }
        Ok(())
    }
}

impl LabelSelectorRequirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            SelectorOperator::In => value.is_some_and(|v| self.values.contains(v)),
            SelectorOperator::NotIn => value.is_none_or(|v| !self.values.contains(v)),
            SelectorOperator::Exists => value.is_some(),
            SelectorOperator::DoesNotExist => value.is_none(),
        }
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<(String, String)> = self
            .match_labels
            .iter()
            .map(|(k, v)| (k.clone(), format!("{k}={v}")))
            .collect();
        for req in &self.match_expressions {
            let mut values = req.values.clone();
            values.sort();
            let rendered = match req.operator {
                SelectorOperator::In => format!("{} in ({})", req.key, values.join(",")),
                SelectorOperator::NotIn => format!("{} notin ({})", req.key, values.join(",")),
                SelectorOperator::Exists => req.key.clone(),
                SelectorOperator::DoesNotExist => format!("!{}", req.key),
            };
            parts.push((req.key.clone(), rendered));
        }
        parts.sort();
        let rendered: Vec<String> = parts.into_iter().map(|(_, s)| s).collect();
        f.write_str(&rendered.join(","))
    }
}

/// Label keys are an optional DNS subdomain prefix plus a name segment.
pub fn validate_label_key(key: &str) -> StateResult<()> {
    let (prefix, name) = match key.rsplit_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };
    if let Some(prefix) = prefix
        && (prefix.is_empty() || prefix.len() > 253 || !DNS_SUBDOMAIN.is_match(prefix))
    {
        return Err(StateError::Invalid(format!("invalid label key prefix in {key:?}")));
    }
    if name.is_empty() || !LABEL_NAME.is_match(name) {
        return Err(StateError::Invalid(format!("invalid label key {key:?}")));
    }
    Ok(())
}

/// Label values may be empty, otherwise they follow the name grammar.
pub fn validate_label_value(value: &str) -> StateResult<()> {
    if LABEL_NAME.is_match(value) {
        Ok(())
    } else {
        Err(StateError::Invalid(format!("invalid label value {value:?}")))
    }
}
