use std::collections::btree_map::{self, BTreeMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A nested key/value description of a system's configuration.
///
/// Keys are unique and carry no ordering semantics, so two trees are equal
/// whenever they hold the same keys with structurally equal values. Trees
/// serialize as plain JSON objects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentTree(BTreeMap<String, Component>);

/// A single value inside a [`ComponentTree`].
///
/// JSON objects always deserialize as [`Component::Tree`]; every other JSON
/// value is a [`Scalar`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Component {
    Tree(ComponentTree),
    Scalar(Scalar),
}

/// Leaf values. Integers and floats are distinct, so `1` and `1.0` are not equal.
/// Integers above `i64::MAX` are kept as [`Scalar::Unsigned`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Integer(i64),
    Unsigned(u64),
    Float(f64),
    Text(String),
    List(Vec<Component>),
}

impl ComponentTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Component> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Component>) -> Option<Component> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Component> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Component> {
        self.0.iter()
    }

    /// Builder-style insert, handy for literals.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Component>) -> Self {
        self.insert(key, value);
        self
    }

    /// Look up the subtree at `scope`. The root scope returns `self`.
    pub fn subtree(&self, scope: &ScopePath) -> Option<&ComponentTree> {
        let mut node = self;
        for segment in scope.segments() {
            match node.0.get(segment) {
                Some(Component::Tree(child)) => node = child,
                _ => return None,
            }
        }
        Some(node)
    }

    /// Returns a copy of `self` where the top-level keys of `patch` are written
    /// into the subtree at `scope`.
    ///
    /// Missing scope segments are created as empty trees. Keys absent from
    /// `patch` keep their value, and a patched key takes the patch's value
    /// wholesale (no recursion below the merge point).
    ///
    /// Fails with [`Error::Validation`] when a scope segment names a scalar.
    pub fn deep_merge(&self, patch: &ComponentTree, scope: &ScopePath) -> Result<ComponentTree> {
        let mut merged = self.clone();
        let mut node = &mut merged;
        let mut walked: Vec<&str> = Vec::new();

        for segment in scope.segments() {
            walked.push(segment);
            let entry = node
                .0
                .entry(segment.to_string())
                .or_insert_with(|| Component::Tree(ComponentTree::new()));
            node = match entry {
                Component::Tree(child) => child,
                Component::Scalar(_) => {
                    return Err(Error::Validation(format!(
                        "scope '{}' refers to a scalar value",
                        walked.join("/")
                    )));
                }
            };
        }

        for (key, value) in patch.iter() {
            node.0.insert(key.clone(), value.clone());
        }

        Ok(merged)
    }

    /// Returns a copy of `self` where every top-level key of `overrides`
    /// replaces the corresponding key outright.
    pub fn apply_override(&self, overrides: &ComponentTree) -> ComponentTree {
        let mut result = self.clone();
        for (key, value) in overrides.iter() {
            result.0.insert(key.clone(), value.clone());
        }
        result
    }
}

impl<'a> IntoIterator for &'a ComponentTree {
    type Item = (&'a String, &'a Component);
    type IntoIter = btree_map::Iter<'a, String, Component>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl<K: Into<String>, V: Into<Component>> FromIterator<(K, V)> for ComponentTree {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl From<ComponentTree> for Component {
    fn from(tree: ComponentTree) -> Self {
        Component::Tree(tree)
    }
}

impl From<Scalar> for Component {
    fn from(scalar: Scalar) -> Self {
        Component::Scalar(scalar)
    }
}

impl From<i64> for Component {
    fn from(v: i64) -> Self {
        Component::Scalar(Scalar::Integer(v))
    }
}

impl From<i32> for Component {
    fn from(v: i32) -> Self {
        Component::Scalar(Scalar::Integer(v.into()))
    }
}

impl From<u64> for Component {
    fn from(v: u64) -> Self {
        match i64::try_from(v) {
            Ok(i) => Component::Scalar(Scalar::Integer(i)),
            Err(_) => Component::Scalar(Scalar::Unsigned(v)),
        }
    }
}

impl From<f64> for Component {
    fn from(v: f64) -> Self {
        Component::Scalar(Scalar::Float(v))
    }
}

impl From<bool> for Component {
    fn from(v: bool) -> Self {
        Component::Scalar(Scalar::Bool(v))
    }
}

impl From<&str> for Component {
    fn from(v: &str) -> Self {
        Component::Scalar(Scalar::Text(v.to_string()))
    }
}

impl From<String> for Component {
    fn from(v: String) -> Self {
        Component::Scalar(Scalar::Text(v))
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => f.write_str("null"),
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Integer(i) => write!(f, "{}", i),
            Scalar::Unsigned(u) => write!(f, "{}", u),
            Scalar::Float(x) => write!(f, "{}", x),
            Scalar::Text(s) => write!(f, "{:?}", s),
            Scalar::List(items) => {
                let json = serde_json::to_string(items).map_err(|_| fmt::Error)?;
                f.write_str(&json)
            }
        }
    }
}

/// A `/`-separated path into a [`ComponentTree`].
///
/// Empty segments are dropped, so `""`, `"/"` and `"a//b/"` parse as the root,
/// the root, and `a/b` respectively. Other segments are taken verbatim,
/// surrounding whitespace included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopePath(Vec<String>);

impl ScopePath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn parse(path: &str) -> Self {
        Self(
            path.split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl FromStr for ScopePath {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<Option<&str>> for ScopePath {
    fn from(path: Option<&str>) -> Self {
        path.map(Self::parse).unwrap_or_default()
    }
}

impl fmt::Display for ScopePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}
