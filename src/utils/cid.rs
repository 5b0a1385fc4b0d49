use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::prelude::*;

/// Error parsing a citable identifier
#[derive(Debug, Snafu)]
#[snafu(display("invalid citable identifier '{value}'"))]
pub struct InvalidCid {
    value: String,
}

/// Citable identifier of a remote object, e.g. `1.5.12.3.1`.
///
/// Stripping the last segment yields the identifier of the containing object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cid(String);

impl Cid {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of segments.
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// The containing object, or `None` for a root identifier.
    pub fn parent(&self) -> Option<Cid> {
        self.0
            .rsplit_once('.')
            .map(|(parent, _)| Cid(parent.to_string()))
    }

    /// Walks `depth` levels up the hierarchy.
    pub fn ancestor(&self, depth: usize) -> Option<Cid> {
        let mut cid = self.clone();
        for _ in 0..depth {
            cid = cid.parent()?;
        }
        Some(cid)
    }

    /// Child identifier `self.n`.
    pub fn child(&self, n: u64) -> Cid {
        Cid(format!("{}.{}", self.0, n))
    }

    /// True if `self` is `scope` itself or lies anywhere below it.
    ///
    /// `1.55` is not within `1.5`.
    pub fn is_within(&self, scope: &Cid) -> bool {
        self.0 == scope.0
            || (self.0.len() > scope.0.len()
                && self.0.starts_with(scope.as_str())
                && self.0.as_bytes()[scope.0.len()] == b'.')
    }

    /// True if `self` is a direct child of `parent`.
    pub fn is_child_of(&self, parent: &Cid) -> bool {
        self.parent().as_ref() == Some(parent)
    }

    /// Last segment as a number.
    pub fn ordinal(&self) -> u64 {
        self.segments()
            .last()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }
}

impl FromStr for Cid {
    type Err = InvalidCid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let valid = !s.is_empty()
            && s.split('.')
                .all(|seg| !seg.is_empty() && seg.bytes().all(|b| b.is_ascii_digit()));
        ensure!(valid, InvalidCidSnafu { value: s });
        Ok(Cid(s.to_string()))
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Ord for Cid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.depth().cmp(&other.depth()).then_with(|| {
            for (a, b) in self.segments().zip(other.segments()) {
                let a: u64 = a.parse().unwrap_or_default();
                let b: u64 = b.parse().unwrap_or_default();
                match a.cmp(&b) {
                    Ordering::Equal => continue,
                    ord => return ord,
                }
            }
            Ordering::Equal
        })
    }
}

impl PartialOrd for Cid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for Cid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(s: &str) -> Cid {
        s.parse().unwrap()
    }

    #[test]
    fn test_parent_and_ancestor() {
        assert_eq!(cid("1.5.2.1").parent(), Some(cid("1.5.2")));
        assert_eq!(cid("1").parent(), None);
        assert_eq!(cid("1.5.2.1").ancestor(2), Some(cid("1.5")));
        assert_eq!(cid("1.5").ancestor(3), None);
    }

    #[test]
    fn test_within_is_segment_aware() {
        assert!(cid("1.5.3").is_within(&cid("1.5")));
        assert!(cid("1.5").is_within(&cid("1.5")));
        assert!(!cid("1.55.3").is_within(&cid("1.5")));
        assert!(cid("1.5.3").is_child_of(&cid("1.5")));
        assert!(!cid("1.5.3.1").is_child_of(&cid("1.5")));
    }

    #[test]
    fn test_numeric_ordering() {
        assert!(cid("1.5.10") > cid("1.5.9"));
        assert!(cid("1.5") < cid("1.4.1"));
        assert_eq!(cid("1.5.2").cmp(&cid("1.5.2")), Ordering::Equal);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!("".parse::<Cid>().is_err());
        assert!("1..2".parse::<Cid>().is_err());
        assert!("1.a".parse::<Cid>().is_err());
        assert_eq!(" 1.2 ".parse::<Cid>().unwrap().as_str(), "1.2");
    }
}
