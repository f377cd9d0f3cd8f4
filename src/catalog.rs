//! The test catalog: an ordered list of suites and their methods.
//!
//! The catalog is produced by a discovery collaborator and is read-only
//! once loaded. Everything downstream (sharding, scheduling, reporting)
//! addresses units by their position in the catalog, so suite order and
//! method order within a suite are significant.
//!
//! # File Format
//!
//! Catalogs can be loaded from JSON or TOML. Methods may be given as
//! plain names or as tables carrying per-method flags:
//!
//! ```json
//! {
//!   "suites": [
//!     { "name": "com.example.MathTest", "methods": ["add", "sub"] },
//!     {
//!       "name": "com.example.IoTest",
//!       "concurrency": "parallel_methods",
//!       "methods": ["read", { "name": "missing_file", "expect_failure": true }]
//!     }
//!   ]
//! }
//! ```
//!
//! # Example
//!
//! ```
//! use shardline::catalog::{Catalog, Suite};
//!
//! let catalog = Catalog::new(vec![
//!     Suite::new("A", ["m1", "m2"]),
//!     Suite::new("B", ["m3"]),
//! ]);
//!
//! assert_eq!(catalog.len(), 3);
//! assert_eq!(catalog.suites()[1].methods[0].name, "m3");
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Errors raised while loading or narrowing a catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// The catalog file could not be read.
    #[error("Failed to read catalog {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The catalog content is not valid JSON or TOML for the schema.
    #[error("Failed to parse catalog: {0}")]
    Parse(String),

    /// A unit selector names a suite or method that does not exist.
    #[error("Unknown test unit: {0}")]
    UnknownUnit(String),

    /// Two suites share a name, or a suite declares a method twice.
    #[error("Duplicate test unit: {0}")]
    Duplicate(String),
}

/// Per-suite concurrency opt-in.
///
/// Overrides the run-level granularity for a single suite. See
/// [`ExecutionPlan::dispatch_mode`](crate::plan::ExecutionPlan::dispatch_mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuiteConcurrency {
    /// Never run concurrently with other serial units.
    Serial,
    /// Safe to run as a whole alongside other suites.
    Parallel,
    /// Safe to run individual methods concurrently.
    ParallelMethods,
}

/// A single test method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "MethodSpec")]
pub struct Method {
    /// Name, unique within its suite.
    pub name: String,

    /// Whether a failure of this method is the declared expectation.
    ///
    /// This is metadata for the unit runner; the orchestrator only looks
    /// at the `expected_failure` flag the runner puts on the outcome.
    #[serde(default)]
    pub expect_failure: bool,
}

impl Method {
    /// Creates a method with no expectation flags.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expect_failure: false,
        }
    }

    /// Marks the method as expecting a failure.
    pub fn expecting_failure(mut self) -> Self {
        self.expect_failure = true;
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MethodSpec {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        expect_failure: bool,
    },
}

impl From<MethodSpec> for Method {
    fn from(spec: MethodSpec) -> Self {
        match spec {
            MethodSpec::Name(name) => Method::new(name),
            MethodSpec::Full {
                name,
                expect_failure,
            } => Method {
                name,
                expect_failure,
            },
        }
    }
}

/// A suite: a fully-qualified name and its ordered methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suite {
    /// Fully-qualified suite identifier (JUnit `classname`).
    pub name: String,

    /// Methods in declaration order.
    #[serde(default)]
    pub methods: Vec<Method>,

    /// Optional concurrency opt-in for this suite.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<SuiteConcurrency>,

    /// Whether the whole suite is ignored.
    #[serde(default)]
    pub ignored: bool,
}

impl Suite {
    /// Creates a suite with the given method names.
    pub fn new<I, S>(name: impl Into<String>, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            methods: methods.into_iter().map(Method::new).collect(),
            concurrency: None,
            ignored: false,
        }
    }

    /// Sets the suite's concurrency opt-in.
    pub fn with_concurrency(mut self, concurrency: SuiteConcurrency) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Replaces the method list.
    pub fn with_methods(mut self, methods: Vec<Method>) -> Self {
        self.methods = methods;
        self
    }

    /// Marks the suite as ignored.
    pub fn set_ignored(mut self) -> Self {
        self.ignored = true;
        self
    }

    /// Returns the position of a method by name.
    pub fn method_index(&self, name: &str) -> Option<usize> {
        self.methods.iter().position(|m| m.name == name)
    }
}

/// Identifies one test case: the suite it belongs to plus its name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestId {
    /// Suite identifier.
    pub suite: String,
    /// Method name (or the suite name for suite-level synthetic cases).
    pub name: String,
}

impl TestId {
    /// Creates an identifier.
    pub fn new(suite: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            suite: suite.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.suite, self.name)
    }
}

/// The ordered, read-only collection of suites for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    suites: Vec<Suite>,
}

impl Catalog {
    /// Creates a catalog from suites in discovery order.
    pub fn new(suites: Vec<Suite>) -> Self {
        Self { suites }
    }

    /// Parses a JSON catalog.
    pub fn from_json(content: &str) -> Result<Self, CatalogError> {
        let catalog: Catalog =
            serde_json::from_str(content).map_err(|e| CatalogError::Parse(e.to_string()))?;
        catalog.validate()
    }

    /// Parses a TOML catalog (`[[suites]]` tables).
    pub fn from_toml(content: &str) -> Result<Self, CatalogError> {
        let catalog: Catalog =
            toml::from_str(content).map_err(|e| CatalogError::Parse(e.to_string()))?;
        catalog.validate()
    }

    /// Builds a catalog from `Suite#method` lines.
    ///
    /// Suites appear in first-seen order. Blank lines and lines starting
    /// with `#` are ignored. A line without `#` names a suite with no
    /// methods of its own yet.
    pub fn from_lines(content: &str) -> Result<Self, CatalogError> {
        let mut suites: Vec<Suite> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (suite_name, method) = match line.split_once('#') {
                Some((suite, method)) => (suite.trim(), Some(method.trim())),
                None => (line, None),
            };

            let idx = *positions.entry(suite_name.to_string()).or_insert_with(|| {
                suites.push(Suite::new(suite_name, Vec::<String>::new()));
                suites.len() - 1
            });

            if let Some(method) = method.filter(|m| !m.is_empty()) {
                suites[idx].methods.push(Method::new(method));
            }
        }

        Catalog::new(suites).validate()
    }

    /// Returns the suites in discovery order.
    pub fn suites(&self) -> &[Suite] {
        &self.suites
    }

    /// Looks up a suite position by name.
    pub fn suite_index(&self, name: &str) -> Option<usize> {
        self.suites.iter().position(|s| s.name == name)
    }

    /// Total number of methods across all suites.
    pub fn len(&self) -> usize {
        self.suites.iter().map(|s| s.methods.len()).sum()
    }

    /// Returns true if the catalog holds no methods.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates `(suite_index, method_index)` pairs in flattened order:
    /// suite order first, then method order within each suite.
    pub fn flatten(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.suites
            .iter()
            .enumerate()
            .flat_map(|(s, suite)| (0..suite.methods.len()).map(move |m| (s, m)))
    }

    /// Returns the identifier of a method by position.
    pub fn test_id(&self, suite: usize, method: usize) -> TestId {
        let suite = &self.suites[suite];
        TestId::new(&suite.name, &suite.methods[method].name)
    }

    /// Narrows the catalog to the given unit selectors.
    ///
    /// A selector is either a suite name (`Suite`) or a single method
    /// (`Suite#method`). Suites are ordered by first selection, methods
    /// keep their declaration order. An empty selector list keeps
    /// everything.
    pub fn select(&self, selectors: &[String]) -> Result<Catalog, CatalogError> {
        if selectors.is_empty() {
            return Ok(self.clone());
        }

        // Per selected suite: None means "all methods".
        let mut order: Vec<usize> = Vec::new();
        let mut picked: HashMap<usize, Option<Vec<usize>>> = HashMap::new();

        for selector in selectors {
            let (suite_name, method_name) = match selector.split_once('#') {
                Some((s, m)) => (s, Some(m)),
                None => (selector.as_str(), None),
            };
            let suite_idx = self
                .suite_index(suite_name)
                .ok_or_else(|| CatalogError::UnknownUnit(selector.clone()))?;

            if !picked.contains_key(&suite_idx) {
                order.push(suite_idx);
            }

            match method_name {
                None => {
                    picked.insert(suite_idx, None);
                }
                Some(method_name) => {
                    let method_idx = self.suites[suite_idx]
                        .method_index(method_name)
                        .ok_or_else(|| CatalogError::UnknownUnit(selector.clone()))?;
                    let entry = picked.entry(suite_idx).or_insert_with(|| Some(Vec::new()));
                    if let Some(methods) = entry
                        && !methods.contains(&method_idx)
                    {
                        methods.push(method_idx);
                    }
                }
            }
        }

        let suites = order
            .into_iter()
            .map(|idx| {
                let suite = &self.suites[idx];
                match &picked[&idx] {
                    None => suite.clone(),
                    Some(methods) => {
                        let mut methods = methods.clone();
                        methods.sort_unstable();
                        let kept = methods.iter().map(|&m| suite.methods[m].clone()).collect();
                        suite.clone().with_methods(kept)
                    }
                }
            })
            .collect();

        Ok(Catalog::new(suites))
    }

    fn validate(self) -> Result<Self, CatalogError> {
        let mut seen_suites = std::collections::HashSet::new();
        for suite in &self.suites {
            if !seen_suites.insert(suite.name.as_str()) {
                return Err(CatalogError::Duplicate(suite.name.clone()));
            }
            let mut seen_methods = std::collections::HashSet::new();
            for method in &suite.methods {
                if !seen_methods.insert(method.name.as_str()) {
                    return Err(CatalogError::Duplicate(format!(
                        "{}#{}",
                        suite.name, method.name
                    )));
                }
            }
        }
        Ok(self)
    }
}

/// Loads a catalog from a file, choosing the format by extension.
///
/// `.toml` files are parsed as TOML, `.txt`/`.lst` files as
/// `Suite#method` lines, everything else as JSON.
pub fn load_catalog(path: &Path) -> Result<Catalog, CatalogError> {
    let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
        path: path.display().to_string(),
        source,
    })?;

    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Catalog::from_toml(&content),
        Some("txt") | Some("lst") => Catalog::from_lines(&content),
        _ => Catalog::from_json(&content),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Catalog {
        Catalog::new(vec![
            Suite::new("MockTest1", ["test11", "test12", "test13"]),
            Suite::new("MockTest2", ["test21", "test22"]),
            Suite::new("MockTest3", ["test31", "test32"]),
        ])
    }

    #[test]
    fn test_flatten_order() {
        let catalog = sample();
        let flat: Vec<_> = catalog.flatten().collect();
        assert_eq!(flat.len(), 7);
        assert_eq!(flat[0], (0, 0));
        assert_eq!(flat[3], (1, 0));
        assert_eq!(flat[6], (2, 1));
    }

    #[test]
    fn test_from_json_mixed_methods() {
        let catalog = Catalog::from_json(
            r#"{"suites": [
                {"name": "A", "methods": ["m1", {"name": "m2", "expect_failure": true}]},
                {"name": "B", "concurrency": "parallel_methods", "ignored": true}
            ]}"#,
        )
        .unwrap();

        assert_eq!(catalog.suites().len(), 2);
        assert!(!catalog.suites()[0].methods[0].expect_failure);
        assert!(catalog.suites()[0].methods[1].expect_failure);
        assert_eq!(
            catalog.suites()[1].concurrency,
            Some(SuiteConcurrency::ParallelMethods)
        );
        assert!(catalog.suites()[1].ignored);
        assert!(catalog.suites()[1].methods.is_empty());
    }

    #[test]
    fn test_from_toml() {
        let catalog = Catalog::from_toml(
            r#"
            [[suites]]
            name = "A"
            methods = ["m1", "m2"]
            concurrency = "serial"
            "#,
        )
        .unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(
            catalog.suites()[0].concurrency,
            Some(SuiteConcurrency::Serial)
        );
    }

    #[test]
    fn test_from_lines() {
        let catalog = Catalog::from_lines(
            "# comment\nA#m1\nB#m3\n\nA#m2\nC\n",
        )
        .unwrap();
        let names: Vec<_> = catalog.suites().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
        assert_eq!(catalog.suites()[0].methods.len(), 2);
        assert!(catalog.suites()[2].methods.is_empty());
    }

    #[test]
    fn test_duplicate_method_rejected() {
        let err = Catalog::from_lines("A#m1\nA#m1\n").unwrap_err();
        assert!(matches!(err, CatalogError::Duplicate(ref id) if id == "A#m1"));
    }

    #[test]
    fn test_select_suites_in_selection_order() {
        let catalog = sample();
        let selected = catalog
            .select(&["MockTest3".to_string(), "MockTest1".to_string()])
            .unwrap();
        let names: Vec<_> = selected.suites().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["MockTest3", "MockTest1"]);
        assert_eq!(selected.len(), 5);
    }

    #[test]
    fn test_select_methods_keep_declaration_order() {
        let catalog = sample();
        let selected = catalog
            .select(&[
                "MockTest1#test13".to_string(),
                "MockTest1#test11".to_string(),
            ])
            .unwrap();
        let methods: Vec<_> = selected.suites()[0]
            .methods
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        assert_eq!(methods, vec!["test11", "test13"]);
    }

    #[test]
    fn test_select_whole_suite_wins_over_method() {
        let catalog = sample();
        let selected = catalog
            .select(&["MockTest2#test22".to_string(), "MockTest2".to_string()])
            .unwrap();
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn test_select_unknown() {
        let catalog = sample();
        assert!(matches!(
            catalog.select(&["Nope".to_string()]),
            Err(CatalogError::UnknownUnit(_))
        ));
        assert!(matches!(
            catalog.select(&["MockTest1#nope".to_string()]),
            Err(CatalogError::UnknownUnit(_))
        ));
    }

    #[test]
    fn test_test_id_display() {
        let catalog = sample();
        assert_eq!(catalog.test_id(1, 1).to_string(), "MockTest2#test22");
    }
}
