use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// An opaque child key. Two reserved forms: an ordinary string key, and a
/// "numeric-in-string" key (an array-index-like name). Numerics sort before
/// non-numerics; within numerics, by integer value; otherwise, by the raw
/// string.
#[derive(Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Name(String);

impl Name {
    pub fn new(s: impl Into<String>) -> Self {
        Name(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `Some(n)` if this name is the canonical decimal rendering of a
    /// non-negative i64 (no leading zero except the literal "0").
    fn numeric_value(&self) -> Option<i64> {
        let s = self.0.as_str();
        if s.is_empty() {
            return None;
        }
        if s == "0" {
            return Some(0);
        }
        let bytes = s.as_bytes();
        if bytes[0] == b'0' || !bytes.iter().all(u8::is_ascii_digit) {
            return None;
        }
        s.parse::<i64>().ok()
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({:?})", self.0)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Ord for Name {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric_value(), other.numeric_value()) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for Name {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<&str> for Name {
    fn from(s: &str) -> Self {
        Name::new(s)
    }
}

impl From<String> for Name {
    fn from(s: String) -> Self {
        Name::new(s)
    }
}

#[cfg(test)]
mod test {
    use super::Name;

    #[test]
    fn numeric_sorts_before_string() {
        let mut names = vec![Name::new("b"), Name::new("10"), Name::new("2"), Name::new("a")];
        names.sort();
        assert_eq!(
            names.iter().map(Name::as_str).collect::<Vec<_>>(),
            vec!["2", "10", "a", "b"]
        );
    }

    #[test]
    fn leading_zero_is_not_numeric() {
        // "01" fails the numeric-name test, so it sorts as an ordinary
        // string (before "a" lexicographically), not among the numerics.
        assert!(Name::new("01") < Name::new("a"));
        assert!(Name::new("2") < Name::new("01"));
        assert_eq!(Name::new("0"), Name::new("0"));
    }

    #[test]
    fn total_order_is_transitive() {
        let a = Name::new("1");
        let b = Name::new("2");
        let c = Name::new("x");
        assert!(a < b && b < c && a < c);
    }
}
