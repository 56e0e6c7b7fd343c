use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// One of the two physical namespaces inside a driver.
///
/// Exactly one bucket is active at any time. Writes target the active
/// bucket; the garbage collector relocates live objects into the other one
/// and then flips.
#[derive(Clone, Copy, Debug, PartialEq, Eq, std::hash::Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    #[default]
    A,
    B,
}

impl Bucket {
    /// Both buckets, in declaration order.
    pub const ALL: [Bucket; 2] = [Bucket::A, Bucket::B];

    /// The opposite bucket.
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    /// Lowercase name, used as table name and directory name by drivers.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "a",
            Self::B => "b",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Bucket {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "a" | "A" => Ok(Self::A),
            "b" | "B" => Ok(Self::B),
            other => Err(TypeError::UnknownBucket(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn other_flips() {
        assert_eq!(Bucket::A.other(), Bucket::B);
        assert_eq!(Bucket::B.other(), Bucket::A);
        assert_eq!(Bucket::A.other().other(), Bucket::A);
    }

    #[test]
    fn default_is_a() {
        assert_eq!(Bucket::default(), Bucket::A);
    }

    #[test]
    fn names() {
        assert_eq!(Bucket::A.to_string(), "a");
        assert_eq!("B".parse::<Bucket>().unwrap(), Bucket::B);
        assert!("c".parse::<Bucket>().is_err());
    }

    #[test]
    fn serde_lowercase() {
        assert_eq!(serde_json::to_string(&Bucket::B).unwrap(), "\"b\"");
        let parsed: Bucket = serde_json::from_str("\"a\"").unwrap();
        assert_eq!(parsed, Bucket::A);
    }
}
