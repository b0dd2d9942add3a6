//! Named counters reported by stores and caches.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An ordered bag of named integer counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CounterSet(BTreeMap<String, i64>);

impl CounterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, value: i64) {
        *self.0.entry(name.into()).or_insert(0) += value;
    }

    pub fn set(&mut self, name: impl Into<String>, value: i64) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        self.0.get(name).copied()
    }

    /// Merge `other` into `self`, prefixing each of its names.
    pub fn merge_prefixed(&mut self, prefix: &str, other: &CounterSet) {
        for (name, value) in &other.0 {
            self.add(format!("{prefix}{name}"), *value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
