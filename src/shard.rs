//! Deterministic test sharding.
//!
//! A shard is one of `count` disjoint slices of the flattened catalog
//! (suite order, then method order). Position `i` belongs to shard
//! `i % count`, so membership only depends on the catalog and the shard
//! spec, and neighbouring methods of a large suite land on different
//! shards.
//!
//! # Example
//!
//! ```
//! use shardline::catalog::{Catalog, Suite};
//! use shardline::shard::{partition, ShardSpec};
//!
//! let catalog = Catalog::new(vec![
//!     Suite::new("A", ["m1", "m2"]),
//!     Suite::new("B", ["m3"]),
//! ]);
//!
//! let shard: ShardSpec = "0/2".parse()?;
//! let ids: Vec<String> = partition(&catalog, shard)
//!     .test_ids(&catalog)
//!     .map(|id| id.to_string())
//!     .collect();
//! assert_eq!(ids, vec!["A#m1", "B#m3"]);
//! # Ok::<(), shardline::shard::ShardError>(())
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, TestId};

/// Errors for malformed or out-of-range shard specs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShardError {
    #[error("Invalid shard spec '{0}': expected <index>/<count>")]
    Malformed(String),

    #[error("Shard count must be at least 1")]
    ZeroCount,

    #[error("Shard index {index} out of range for {count} shards")]
    IndexOutOfRange { index: usize, count: usize },
}

/// Which shard of how many this run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShardSpec {
    index: usize,
    count: usize,
}

impl ShardSpec {
    /// Creates a shard spec, checking `index < count`.
    pub fn new(index: usize, count: usize) -> Result<Self, ShardError> {
        if count == 0 {
            return Err(ShardError::ZeroCount);
        }
        if index >= count {
            return Err(ShardError::IndexOutOfRange { index, count });
        }
        Ok(Self { index, count })
    }

    /// The single shard covering everything.
    pub fn all() -> Self {
        Self { index: 0, count: 1 }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns true if the flattened position belongs to this shard.
    pub fn owns(&self, position: usize) -> bool {
        position % self.count == self.index
    }
}

impl Default for ShardSpec {
    fn default() -> Self {
        Self::all()
    }
}

impl FromStr for ShardSpec {
    type Err = ShardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (index, count) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| ShardError::Malformed(s.to_string()))?;
        let index = index
            .trim()
            .parse()
            .map_err(|_| ShardError::Malformed(s.to_string()))?;
        let count = count
            .trim()
            .parse()
            .map_err(|_| ShardError::Malformed(s.to_string()))?;
        ShardSpec::new(index, count)
    }
}

impl TryFrom<String> for ShardSpec {
    type Error = ShardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ShardSpec> for String {
    fn from(spec: ShardSpec) -> Self {
        spec.to_string()
    }
}

impl fmt::Display for ShardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.count)
    }
}

/// The methods of one suite assigned to a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteAssignment {
    /// Position of the suite in the catalog.
    pub suite: usize,
    /// Assigned method positions, ascending.
    pub methods: Vec<usize>,
}

/// The subset of a catalog assigned to one shard.
///
/// Every catalog suite has an entry, possibly with no methods, so
/// callers can still account for suites this shard does not execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardAssignment {
    shard: ShardSpec,
    suites: Vec<SuiteAssignment>,
}

impl ShardAssignment {
    pub fn shard(&self) -> ShardSpec {
        self.shard
    }

    /// Per-suite assignments in catalog order, including empty ones.
    pub fn suites(&self) -> &[SuiteAssignment] {
        &self.suites
    }

    /// Number of assigned methods.
    pub fn len(&self) -> usize {
        self.suites.iter().map(|s| s.methods.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates the assigned `(suite, method)` positions in flattened order.
    pub fn positions(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.suites
            .iter()
            .flat_map(|s| s.methods.iter().map(move |&m| (s.suite, m)))
    }

    /// Iterates the assigned test identifiers in flattened order.
    pub fn test_ids<'a>(&'a self, catalog: &'a Catalog) -> impl Iterator<Item = TestId> + 'a {
        self.positions().map(|(s, m)| catalog.test_id(s, m))
    }
}

/// Computes the methods of `catalog` that belong to `shard`.
pub fn partition(catalog: &Catalog, shard: ShardSpec) -> ShardAssignment {
    let mut suites: Vec<SuiteAssignment> = catalog
        .suites()
        .iter()
        .enumerate()
        .map(|(suite, _)| SuiteAssignment {
            suite,
            methods: Vec::new(),
        })
        .collect();

    for (position, (suite, method)) in catalog.flatten().enumerate() {
        if shard.owns(position) {
            suites[suite].methods.push(method);
        }
    }

    ShardAssignment { shard, suites }
}
