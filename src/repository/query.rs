use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::Cid;

use super::{Asset, RepositoryError, UnexpectedResultSnafu};

/// Filter expression over the object hierarchy.
///
/// Attribute paths are `/`-separated keys into an asset document, e.g.
/// `meta/dicom-series/uid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Filter {
    /// The object is the scope itself or anywhere below it
    CidWithin { cid: Cid },
    /// The object is a direct child of `cid`
    ChildOf { cid: Cid },
    Equals { path: String, value: String },
    HasValue { path: String },
    HasNoValue { path: String },
    And { filters: Vec<Filter> },
}

impl Filter {
    pub fn cid_within(cid: &Cid) -> Self {
        Filter::CidWithin { cid: cid.clone() }
    }

    pub fn child_of(cid: &Cid) -> Self {
        Filter::ChildOf { cid: cid.clone() }
    }

    pub fn equals(path: &str, value: impl Into<String>) -> Self {
        Filter::Equals {
            path: path.to_string(),
            value: value.into(),
        }
    }

    pub fn has_value(path: &str) -> Self {
        Filter::HasValue {
            path: path.to_string(),
        }
    }

    pub fn has_no_value(path: &str) -> Self {
        Filter::HasNoValue {
            path: path.to_string(),
        }
    }

    /// Conjunction, flattening nested `And`s.
    pub fn and(self, other: Filter) -> Self {
        let mut filters = match self {
            Filter::And { filters } => filters,
            f => vec![f],
        };
        match other {
            Filter::And { filters: more } => filters.extend(more),
            f => filters.push(f),
        }
        Filter::And { filters }
    }

    /// Evaluates the filter against an asset.
    pub fn matches(&self, asset: &Asset) -> bool {
        match self {
            Filter::CidWithin { cid } => asset.cid.is_within(cid),
            Filter::ChildOf { cid } => asset.cid.is_child_of(cid),
            Filter::Equals { path, value } => asset
                .value(path)
                .and_then(scalar_string)
                .is_some_and(|v| v == *value),
            Filter::HasValue { path } => asset.value(path).is_some_and(has_value),
            Filter::HasNoValue { path } => !asset.value(path).is_some_and(has_value),
            Filter::And { filters } => filters.iter().all(|f| f.matches(asset)),
        }
    }
}

fn has_value(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        _ => true,
    }
}

/// Renders scalars the way they compare in a where-expression.
pub(crate) fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::CidWithin { cid } => write!(f, "cid starts with '{}'", cid),
            Filter::ChildOf { cid } => write!(f, "cid in '{}'", cid),
            Filter::Equals { path, value } => {
                write!(f, "xpath({})='{}'", path, value.replace('\'', "\\'"))
            }
            Filter::HasValue { path } => write!(f, "{} has value", path),
            Filter::HasNoValue { path } => write!(f, "{} hasno value", path),
            Filter::And { filters } => {
                for (i, filter) in filters.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" and ")?;
                    }
                    write!(f, "{}", filter)?;
                }
                Ok(())
            }
        }
    }
}

/// What a query returns for the matching objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Action {
    Count,
    GetCid,
    GetMeta,
    GetValue { paths: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub filter: Filter,
    pub action: Action,
    /// Maximum number of results, unbounded if `None`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
}

impl Query {
    pub fn new(filter: Filter, action: Action) -> Self {
        Query {
            filter,
            action,
            size: None,
        }
    }

    pub fn size(mut self, size: u32) -> Self {
        self.size = Some(size);
        self
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match &self.action {
            Action::Count => "count",
            Action::GetCid => "get-cid",
            Action::GetMeta => "get-meta",
            Action::GetValue { .. } => "get-value",
        };
        write!(f, "{} [action={}", self.filter, action)?;
        if let Some(size) = self.size {
            write!(f, ", size={}", size)?;
        }
        f.write_str("]")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "result", rename_all = "kebab-case")]
pub enum QueryResult {
    Count(u64),
    Cids(Vec<Cid>),
    Assets(Vec<Asset>),
    /// One row per matching object, one entry per requested path
    Values(Vec<Vec<Option<Value>>>),
}

impl QueryResult {
    fn shape(&self) -> &'static str {
        match self {
            QueryResult::Count(_) => "count",
            QueryResult::Cids(_) => "cids",
            QueryResult::Assets(_) => "assets",
            QueryResult::Values(_) => "values",
        }
    }

    /// Cids of the matched objects; fails on a result of another shape.
    pub fn into_cids(self) -> Result<Vec<Cid>, RepositoryError> {
        match self {
            QueryResult::Cids(cids) => Ok(cids),
            QueryResult::Assets(assets) => Ok(assets.into_iter().map(|a| a.cid).collect()),
            other => UnexpectedResultSnafu {
                expected: "cids",
                found: other.shape(),
            }
            .fail(),
        }
    }

    pub fn into_assets(self) -> Result<Vec<Asset>, RepositoryError> {
        match self {
            QueryResult::Assets(assets) => Ok(assets),
            other => UnexpectedResultSnafu {
                expected: "assets",
                found: other.shape(),
            }
            .fail(),
        }
    }

    pub fn count(&self) -> u64 {
        match self {
            QueryResult::Count(n) => *n,
            QueryResult::Cids(cids) => cids.len() as u64,
            QueryResult::Assets(assets) => assets.len() as u64,
            QueryResult::Values(rows) => rows.len() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn asset(cid: &str, meta: Value) -> Asset {
        Asset {
            id: 1,
            cid: cid.parse().unwrap(),
            meta,
            lock: false,
        }
    }

    #[test]
    fn test_filter_display() {
        let scope: Cid = "1.5".parse().unwrap();
        let filter = Filter::cid_within(&scope)
            .and(Filter::equals("meta/dicom-series/uid", "1.2.3"))
            .and(Filter::has_value("meta/note"));
        assert_eq!(
            filter.to_string(),
            "cid starts with '1.5' and xpath(meta/dicom-series/uid)='1.2.3' and meta/note has value"
        );
    }

    #[test]
    fn test_filter_matches() {
        let a = asset(
            "1.5.1.1",
            json!({"dicom-series": {"uid": "1.2.3", "id": 4}, "note": {"note": ""}}),
        );
        assert!(Filter::cid_within(&"1.5".parse().unwrap()).matches(&a));
        assert!(!Filter::cid_within(&"1.55".parse().unwrap()).matches(&a));
        assert!(Filter::equals("meta/dicom-series/uid", "1.2.3").matches(&a));
        assert!(Filter::equals("meta/dicom-series/id", "4").matches(&a));
        assert!(Filter::has_no_value("meta/note/note").matches(&a));
        assert!(Filter::has_no_value("meta/missing").matches(&a));
        assert!(!Filter::has_value("meta/note/note").matches(&a));
        assert!(Filter::child_of(&"1.5.1".parse().unwrap()).matches(&a));
    }

    #[test]
    fn test_result_shape_mismatch() {
        let a = asset("1.5.1.1", json!({}));
        assert_eq!(
            QueryResult::Assets(vec![a.clone()]).into_cids().unwrap(),
            vec!["1.5.1.1".parse::<Cid>().unwrap()]
        );
        assert_eq!(QueryResult::Assets(vec![a]).into_assets().unwrap().len(), 1);

        let err = QueryResult::Count(3).into_cids().unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::UnexpectedResult {
                expected: "cids",
                found: "count"
            }
        ));
        assert!(QueryResult::Cids(Vec::new()).into_assets().is_err());
        assert!(QueryResult::Values(Vec::new()).into_assets().is_err());
    }
}
