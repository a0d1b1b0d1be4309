use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// Separates a base key from its generation suffix in a derived key (`base-123`).
pub const GENERATION_SEPARATOR: char = '-';

/// Base identity of a ranking computation. Definitions and reference sets are
/// ingested under a base key; every computation run derives a generation from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GraphKey(String);

impl GraphKey {
    pub fn new(base: impl AsRef<str>) -> Result<Self, ValidationError> {
        let base = base.as_ref().trim();
        if base.is_empty() {
            return Err(ValidationError::EmptyGraphKey);
        }
        if base
            .chars()
            .any(|ch| ch == GENERATION_SEPARATOR || ch.is_whitespace())
        {
            return Err(ValidationError::InvalidGraphKey(base.to_owned()));
        }

        Ok(Self(base.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn derive(&self, generation: u64) -> DerivedGraphKey {
        DerivedGraphKey::new(self.clone(), generation)
    }
}

impl fmt::Display for GraphKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for GraphKey {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::new(value)
    }
}

impl TryFrom<String> for GraphKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<GraphKey> for String {
    fn from(value: GraphKey) -> Self {
        value.0
    }
}

/// One generation of a base key. Generations of the same base are totally
/// ordered by their numeric suffix; keys of different bases are incomparable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DerivedGraphKey {
    base: GraphKey,
    generation: u64,
}

impl DerivedGraphKey {
    pub fn new(base: GraphKey, generation: u64) -> Self {
        Self { base, generation }
    }

    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        let invalid = || ValidationError::InvalidDerivedGraphKey(trimmed.to_owned());

        let (base, suffix) = trimmed
            .rsplit_once(GENERATION_SEPARATOR)
            .ok_or_else(invalid)?;
        if suffix.is_empty() || !suffix.bytes().all(|byte| byte.is_ascii_digit()) {
            return Err(invalid());
        }

        let generation = suffix.parse::<u64>().map_err(|_| invalid())?;
        let base = GraphKey::new(base).map_err(|_| invalid())?;

        Ok(Self { base, generation })
    }

    pub fn base(&self) -> &GraphKey {
        &self.base
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_sibling_of(&self, other: &DerivedGraphKey) -> bool {
        self.base == other.base
    }

    /// True when both keys share a base and `self` is a strictly newer generation.
    pub fn supersedes(&self, other: &DerivedGraphKey) -> bool {
        self.is_sibling_of(other) && self.generation > other.generation
    }
}

impl PartialOrd for DerivedGraphKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if !self.is_sibling_of(other) {
            return None;
        }

        Some(self.generation.cmp(&other.generation))
    }
}

impl fmt::Display for DerivedGraphKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.base, GENERATION_SEPARATOR, self.generation)
    }
}

impl FromStr for DerivedGraphKey {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl TryFrom<String> for DerivedGraphKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DerivedGraphKey> for String {
    fn from(value: DerivedGraphKey) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_key_round_trips_through_display() {
        let key = DerivedGraphKey::parse("mockDev-123").expect("parse derived key");
        assert_eq!(key.base().as_str(), "mockDev");
        assert_eq!(key.generation(), 123);
        assert_eq!(key.to_string(), "mockDev-123");
        assert_eq!(GraphKey::new("mockDev").expect("base").derive(123), key);
    }

    #[test]
    fn base_key_rejects_separator_and_blank_input() {
        assert_eq!(GraphKey::new("   "), Err(ValidationError::EmptyGraphKey));
        assert!(matches!(
            GraphKey::new("mock-dev"),
            Err(ValidationError::InvalidGraphKey(_))
        ));
        assert!(matches!(
            GraphKey::new("mock dev"),
            Err(ValidationError::InvalidGraphKey(_))
        ));
        assert_eq!(GraphKey::new(" dev ").expect("trimmed").as_str(), "dev");
    }

    #[test]
    fn derived_key_requires_numeric_suffix_and_valid_base() {
        for raw in ["mockDev", "mockDev-", "mockDev-12a", "-12", "a-b-12", "mockDev-+1"] {
            assert!(
                DerivedGraphKey::parse(raw).is_err(),
                "expected {raw} to be rejected"
            );
        }
    }

    #[test]
    fn generations_order_numerically_not_lexically() {
        let nine = DerivedGraphKey::parse("dev-9").expect("dev-9");
        let ten = DerivedGraphKey::parse("dev-10").expect("dev-10");

        assert!(ten > nine);
        assert!(ten.supersedes(&nine));
        assert!(!nine.supersedes(&ten));
        assert!(!ten.supersedes(&ten));
    }

    #[test]
    fn keys_serialize_as_plain_strings() {
        let key = DerivedGraphKey::parse("dev-42").expect("dev-42");
        let json = serde_json::to_string(&key).expect("serialize");
        assert_eq!(json, "\"dev-42\"");

        let parsed: DerivedGraphKey = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, key);
        assert!(serde_json::from_str::<GraphKey>("\"dev-42\"").is_err());
    }

    #[test]
    fn keys_of_different_bases_are_incomparable() {
        let left = DerivedGraphKey::parse("alpha-1").expect("alpha-1");
        let right = DerivedGraphKey::parse("beta-2").expect("beta-2");

        assert_eq!(left.partial_cmp(&right), None);
        assert!(!right.supersedes(&left));
        assert!(!left.is_sibling_of(&right));
    }
}
