use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use submerge_base::Error;

use crate::name::Name;
use crate::tsd::{Priority, Tsd};

/// What a [`QueryFilter`] orders children by (spec.md §3).
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum OrderBy {
    Priority,
    Key,
    Value,
    Child(Name),
}

/// The projected `(name, projectedValue)` pair's value side, normalized so
/// a single `Ord` impl can express "nil sorts first" uniformly across all
/// four `OrderBy` modes (spec.md §4.1).
#[derive(Clone, Debug, Hash, PartialEq, Serialize, Deserialize)]
pub enum Extracted {
    Nil,
    Priority(Priority),
    Scalar(Tsd),
}

impl Eq for Extracted {}
impl Ord for Extracted {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Extracted::Nil, Extracted::Nil) => Ordering::Equal,
            (Extracted::Nil, _) => Ordering::Less,
            (_, Extracted::Nil) => Ordering::Greater,
            (Extracted::Priority(a), Extracted::Priority(b)) => a.cmp(b),
            (Extracted::Scalar(a), Extracted::Scalar(b)) => a.cmp(b),
            (Extracted::Priority(_), Extracted::Scalar(_))
            | (Extracted::Scalar(_), Extracted::Priority(_)) => {
                unreachable!("a single QueryFilter never mixes Extracted variants")
            }
        }
    }
}
impl PartialOrd for Extracted {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A `startAt`/`endAt` threshold: a projected value plus an optional name
/// tie-break, both inclusive (spec.md §4.1).
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub extracted: Extracted,
    pub name: Option<Name>,
}

impl Bound {
    pub fn new(extracted: Extracted, name: Option<Name>) -> Bound {
        Bound { extracted, name }
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    pub order_by: OrderBy,
    pub start_at: Option<Bound>,
    pub end_at: Option<Bound>,
    pub limit: Option<usize>,
    pub reverse: bool,
}

impl QueryFilter {
    pub fn unfiltered() -> QueryFilter {
        QueryFilter {
            order_by: OrderBy::Key,
            start_at: None,
            end_at: None,
            limit: None,
            reverse: false,
        }
    }

    pub fn is_unfiltered(&self) -> bool {
        self == &QueryFilter::unfiltered()
    }

    /// `extract(name, tsd)` from spec.md §3: the comparable projection of one
    /// child entry under this filter's `orderBy`.
    pub fn extract(&self, _name: &Name, tsd: &Tsd) -> Extracted {
        match &self.order_by {
            OrderBy::Key => Extracted::Nil,
            OrderBy::Priority => match tsd.priority() {
                Some(p) => Extracted::Priority(p.clone()),
                None => Extracted::Nil,
            },
            OrderBy::Value => Extracted::Scalar(tsd.clone()),
            OrderBy::Child(child) => Extracted::Scalar(tsd.child(child)),
        }
    }

    /// Total order over `(name, tsd)` entries: compare projected values,
    /// tie-break by name ascending (spec.md §4.1).
    pub fn compare(&self, a: (&Name, &Tsd), b: (&Name, &Tsd)) -> Ordering {
        self.extract(a.0, a.1)
            .cmp(&self.extract(b.0, b.1))
            .then_with(|| a.0.cmp(b.0))
    }

    fn bound_cmp(&self, name: &Name, tsd: &Tsd, bound: &Bound) -> Ordering {
        self.extract(name, tsd).cmp(&bound.extracted).then_with(|| match &bound.name {
            Some(n) => name.cmp(n),
            None => Ordering::Equal,
        })
    }

    /// `isValid(entry)`: both bounds (when present) are inclusive.
    pub fn is_valid(&self, name: &Name, tsd: &Tsd) -> bool {
        if let Some(start) = &self.start_at {
            if self.bound_cmp(name, tsd, start) == Ordering::Less {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if self.bound_cmp(name, tsd, end) == Ordering::Greater {
                return false;
            }
        }
        true
    }

    /// Sort `entries` ascending under this filter, then window by
    /// `limit`/`reverse`: the first `limit` entries if not reversed, the
    /// last `limit` if reversed (spec.md §4.1).
    pub fn window<'a>(&self, mut entries: Vec<(&'a Name, &'a Tsd)>) -> Vec<(&'a Name, &'a Tsd)> {
        entries.sort_by(|a, b| self.compare(*a, *b));
        if let Some(limit) = self.limit {
            if entries.len() > limit {
                if self.reverse {
                    entries = entries.split_off(entries.len() - limit);
                } else {
                    entries.truncate(limit);
                }
            }
        }
        entries
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_wire(buf: &[u8]) -> Result<QueryFilter, Error> {
        Ok(rmp_serde::from_slice(buf)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tsd::Scalar;
    use ordered_float::OrderedFloat;

    fn num(n: f64) -> Tsd {
        Tsd::leaf(Scalar::Num(OrderedFloat(n)))
    }

    #[test]
    fn compare_is_a_total_order() {
        let f = QueryFilter { order_by: OrderBy::Value, ..QueryFilter::unfiltered() };
        let a = (Name::new("a"), num(3.0));
        let b = (Name::new("b"), num(1.0));
        assert_eq!(
            f.compare((&a.0, &a.1), (&b.0, &b.1)),
            f.compare((&b.0, &b.1), (&a.0, &a.1)).reverse()
        );
    }

    #[test]
    fn window_by_value_ascending_with_limit() {
        let f = QueryFilter { order_by: OrderBy::Value, limit: Some(2), ..QueryFilter::unfiltered() };
        let entries = vec![
            (Name::new("a"), num(3.0)),
            (Name::new("b"), num(1.0)),
            (Name::new("c"), num(2.0)),
            (Name::new("d"), num(4.0)),
        ];
        let refs: Vec<_> = entries.iter().map(|(n, t)| (n, t)).collect();
        let windowed = f.window(refs);
        let names: Vec<_> = windowed.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn window_reverse_keeps_last_limit_entries() {
        let f = QueryFilter {
            order_by: OrderBy::Value,
            limit: Some(2),
            reverse: true,
            ..QueryFilter::unfiltered()
        };
        let entries = vec![
            (Name::new("a"), num(3.0)),
            (Name::new("b"), num(1.0)),
            (Name::new("c"), num(2.0)),
            (Name::new("d"), num(4.0)),
        ];
        let refs: Vec<_> = entries.iter().map(|(n, t)| (n, t)).collect();
        let windowed = f.window(refs);
        let mut names: Vec<_> = windowed.iter().map(|(n, _)| n.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["c", "d"]);
    }

    #[test]
    fn key_order_forbids_value_side() {
        let f = QueryFilter {
            order_by: OrderBy::Key,
            start_at: Some(Bound::new(Extracted::Nil, Some(Name::new("b")))),
            ..QueryFilter::unfiltered()
        };
        assert!(!f.is_valid(&Name::new("a"), &num(1.0)));
        assert!(f.is_valid(&Name::new("b"), &num(1.0)));
        assert!(f.is_valid(&Name::new("c"), &num(1.0)));
    }
}
