use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Parsed `"major.minor.patch"` version, ordered the way the original's
/// `BucketVersion` (`@total_ordering`) compared metadata schema versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl BucketVersion {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let mut parts = s.split('.');
        let mut next = || -> anyhow::Result<u32> {
            parts
                .next()
                .ok_or_else(|| anyhow::anyhow!("version {s:?} has too few components"))?
                .parse::<u32>()
                .map_err(|e| anyhow::anyhow!("bad version component in {s:?}: {e}"))
        };
        let major = next()?;
        let minor = next()?;
        let patch = next()?;
        Ok(BucketVersion {
            major,
            minor,
            patch,
        })
    }
}

impl std::fmt::Display for BucketVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl PartialOrd for BucketVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BucketVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

pub const CURRENT_META_VERSION: BucketVersion = BucketVersion {
    major: 1,
    minor: 0,
    patch: 0,
};

/// Identity of the chain that *produced* the records flowing into a bucket
/// (the upstream side), used by the rewrite-skip decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDataVersion {
    pub chain_hash: String,
    pub data_hash: String,
}

/// Identity of the chain reading *out of* a bucket (the downstream side).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkDataVersion {
    pub chain_hash: String,
    pub data_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_compare_componentwise() {
        let a = BucketVersion::parse("1.2.3").unwrap();
        let b = BucketVersion::parse("1.10.0").unwrap();
        assert!(a < b, "1.2.3 should sort before 1.10.0 (numeric, not lexical)");
    }

    #[test]
    fn parse_roundtrips_through_display() {
        let v = BucketVersion::parse("2.4.6").unwrap();
        assert_eq!(v.to_string(), "2.4.6");
    }
}
