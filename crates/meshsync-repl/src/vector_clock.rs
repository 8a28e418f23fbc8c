//! Vector clocks and replica identifiers.
//!
//! A clock maps replica ids to counters; ids never seen count as 0. The canonical text
//! form sorts ids lexicographically: `{B:5, A:4}` is `(A4,B5)`.

use crate::error::{ReplError, ReplResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Identifier of one participating replica.
///
/// ASCII alphanumerics plus `-` and `_`, not ending in a digit, so that the clock
/// encoding `(<id><counter>,...)` is unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReplicaId(String);

impl ReplicaId {
    /// Validate and wrap an identifier.
    pub fn new(id: impl Into<String>) -> ReplResult<Self> {
        let id = id.into();
        let reject = |reason| ReplError::InvalidReplicaId {
            id: id.clone(),
            reason,
        };
        if id.is_empty() {
            return Err(reject("empty"));
        }
        if !id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(reject("only ASCII letters, digits, '-' and '_' are allowed"));
        }
        if id.bytes().last().is_some_and(|b| b.is_ascii_digit()) {
            return Err(reject("must not end in a digit"));
        }
        Ok(Self(id))
    }

    /// The identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ReplicaId {
    type Error = ReplError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ReplicaId::new(value)
    }
}

impl From<ReplicaId> for String {
    fn from(id: ReplicaId) -> Self {
        id.0
    }
}

impl FromStr for ReplicaId {
    type Err = ReplError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReplicaId::new(s)
    }
}

/// Causal relation between two clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    /// Every coordinate equal.
    Equal,
    /// Every coordinate ≤, at least one <.
    Smaller,
    /// Every coordinate ≥, at least one >.
    Greater,
    /// Neither dominates: concurrent edits.
    Simultaneous,
}

/// Per-replica logical clock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct VectorClock {
    clocks: BTreeMap<ReplicaId, u64>,
}

impl VectorClock {
    /// Empty clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one coordinate.
    pub fn set_clock(&mut self, id: ReplicaId, value: u64) {
        self.clocks.insert(id, value);
    }

    /// Increment one coordinate, starting from 0 for unknown ids; returns the new value.
    pub fn increment_clock(&mut self, id: &ReplicaId) -> u64 {
        let value = self.clocks.entry(id.clone()).or_insert(0);
        *value += 1;
        *value
    }

    /// Read one coordinate (0 if unknown).
    pub fn get_clock(&self, id: &ReplicaId) -> u64 {
        self.clocks.get(id).copied().unwrap_or(0)
    }

    /// Coordinates in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, u64)> {
        self.clocks.iter().map(|(id, v)| (id, *v))
    }

    /// True if no coordinate is set.
    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    /// Sum of all coordinates; strictly larger for every causal successor.
    pub fn total(&self) -> u64 {
        self.clocks.values().sum()
    }

    /// Pointwise comparison over the union of both clocks' ids.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut smaller = false;
        let mut greater = false;
        for id in self.clocks.keys().chain(other.clocks.keys()) {
            let a = self.get_clock(id);
            let b = other.get_clock(id);
            if a < b {
                smaller = true;
            } else if a > b {
                greater = true;
            }
            if smaller && greater {
                return ClockOrdering::Simultaneous;
            }
        }
        match (smaller, greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Smaller,
            (false, true) => ClockOrdering::Greater,
            (true, true) => ClockOrdering::Simultaneous,
        }
    }

    /// Pointwise maximum.
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut merged = self.clone();
        for (id, value) in other.iter() {
            let entry = merged.clocks.entry(id.clone()).or_insert(0);
            *entry = (*entry).max(value);
        }
        merged
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, (id, value)) in self.clocks.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}{}", id, value)?;
        }
        f.write_str(")")
    }
}

impl FromStr for VectorClock {
    type Err = ReplError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ReplError::InvalidVectorClock {
            input: s.to_string(),
        };
        let inner = s
            .strip_prefix('(')
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(invalid)?;

        let mut clock = VectorClock::new();
        if inner.is_empty() {
            return Ok(clock);
        }
        for entry in inner.split(',') {
            // the counter is the trailing run of digits
            let split = entry
                .rfind(|c: char| !c.is_ascii_digit())
                .map(|i| i + 1)
                .ok_or_else(invalid)?;
            if split == entry.len() {
                return Err(invalid());
            }
            let (id, digits) = entry.split_at(split);
            let id = ReplicaId::new(id).map_err(|_| invalid())?;
            let value = digits.parse::<u64>().map_err(|_| invalid())?;
            if clock.clocks.insert(id, value).is_some() {
                return Err(invalid());
            }
        }
        Ok(clock)
    }
}

impl Serialize for VectorClock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for VectorClock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(s: &str) -> ReplicaId {
        ReplicaId::new(s).unwrap()
    }

    fn clock(entries: &[(&str, u64)]) -> VectorClock {
        let mut c = VectorClock::new();
        for (k, v) in entries {
            c.set_clock(id(k), *v);
        }
        c
    }

    #[test]
    fn increment_starts_at_zero() {
        let mut c = VectorClock::new();
        assert_eq!(c.get_clock(&id("A")), 0);
        assert_eq!(c.increment_clock(&id("A")), 1);
        assert_eq!(c.increment_clock(&id("A")), 2);
        assert_eq!(c.get_clock(&id("A")), 2);
    }

    #[test]
    fn compare_examples() {
        let a = clock(&[("A", 4), ("B", 5)]);
        let b = clock(&[("A", 4), ("B", 100_000)]);
        let c = clock(&[("A", 4), ("B", 5), ("C", 100_000)]);
        let d = clock(&[("C", 1), ("D", 2)]);
        assert_eq!(a.compare(&a), ClockOrdering::Equal);
        assert_eq!(a.compare(&b), ClockOrdering::Smaller);
        assert_eq!(b.compare(&a), ClockOrdering::Greater);
        assert_eq!(c.compare(&a), ClockOrdering::Greater);
        assert_eq!(a.compare(&d), ClockOrdering::Simultaneous);
    }

    #[test]
    fn missing_ids_count_as_zero() {
        let a = clock(&[("A", 0)]);
        assert_eq!(a.compare(&VectorClock::new()), ClockOrdering::Equal);
    }

    #[test]
    fn canonical_string() {
        let c = clock(&[("B", 5), ("A", 4)]);
        assert_eq!(c.to_string(), "(A4,B5)");
        assert_eq!("(A4,B5)".parse::<VectorClock>().unwrap(), c);
        assert_eq!(VectorClock::new().to_string(), "()");
        let mixed = clock(&[("node2a", 17)]);
        assert_eq!(mixed.to_string().parse::<VectorClock>().unwrap(), mixed);
        assert_eq!("()".parse::<VectorClock>().unwrap(), VectorClock::new());
    }

    #[test]
    fn malformed_clocks_are_rejected() {
        for bad in ["A4,B5", "(A)", "(4)", "(A4,A5)", "(A4,,B5)", "(A-4x)", "(A4"] {
            assert!(bad.parse::<VectorClock>().is_err(), "{bad} parsed");
        }
    }

    #[test]
    fn replica_id_rules() {
        assert!(ReplicaId::new("laptop-a").is_ok());
        assert!(ReplicaId::new("").is_err());
        assert!(ReplicaId::new("host2").is_err());
        assert!(ReplicaId::new("a,b").is_err());
        assert!(serde_json::from_str::<ReplicaId>("\"bad id\"").is_err());
    }

    #[test]
    fn merge_is_pointwise_max() {
        let a = clock(&[("A", 4), ("B", 1)]);
        let b = clock(&[("B", 3), ("C", 2)]);
        assert_eq!(a.merge(&b), clock(&[("A", 4), ("B", 3), ("C", 2)]));
    }

    fn arb_clock() -> impl Strategy<Value = VectorClock> {
        prop::collection::btree_map("[a-z][a-z0-9_-]{0,5}[a-z]", 0u64..1000, 0..6).prop_map(|m| {
            let mut c = VectorClock::new();
            for (k, v) in m {
                c.set_clock(ReplicaId::new(k).unwrap(), v);
            }
            c
        })
    }

    proptest! {
        #[test]
        fn prop_string_roundtrip(c in arb_clock()) {
            prop_assert_eq!(c.to_string().parse::<VectorClock>().unwrap(), c);
        }

        #[test]
        fn prop_compare_is_antisymmetric(a in arb_clock(), b in arb_clock()) {
            let ab = a.compare(&b);
            let ba = b.compare(&a);
            prop_assert_eq!(ab == ClockOrdering::Smaller, ba == ClockOrdering::Greater);
            prop_assert_eq!(ab == ClockOrdering::Equal, ba == ClockOrdering::Equal);
            prop_assert_eq!(a.compare(&a), ClockOrdering::Equal);
        }

        #[test]
        fn prop_merge_dominates(a in arb_clock(), b in arb_clock()) {
            let m = a.merge(&b);
            prop_assert!(matches!(m.compare(&a), ClockOrdering::Greater | ClockOrdering::Equal));
            prop_assert!(matches!(m.compare(&b), ClockOrdering::Greater | ClockOrdering::Equal));
        }
    }
}
