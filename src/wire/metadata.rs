//! Per-call metadata: a multi-map of lowercase keys to string values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Peers the caller wants the call fanned out to.
pub const NODES: &str = "nodes";
/// Single peer the call is relayed to without fan-out tagging.
pub const NODE: &str = "node";
/// Set by a proxy when it forwards a call; forces local routing on arrival.
pub const PROXY_FROM: &str = "proxyfrom";
/// Authority the caller dialled, filled in by the server from the connection.
pub const AUTHORITY: &str = ":authority";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, Vec<String>>", into = "BTreeMap<String, Vec<String>>")]
pub struct Metadata(BTreeMap<String, Vec<String>>);

/// Keys differing only in case are merged in key order.
impl From<BTreeMap<String, Vec<String>>> for Metadata {
    fn from(raw: BTreeMap<String, Vec<String>>) -> Self {
        let mut md = Metadata::new();
        for (key, values) in raw {
            md.0.entry(key.to_ascii_lowercase()).or_default().extend(values);
        }
        md
    }
}

impl From<Metadata> for BTreeMap<String, Vec<String>> {
    fn from(md: Metadata) -> Self {
        md.0
    }
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the first value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(&key.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Returns every value stored under `key`, empty when absent.
    pub fn get_all(&self, key: &str) -> &[String] {
        self.0
            .get(&key.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(&key.to_ascii_lowercase())
    }

    /// Replaces all values under `key`.
    pub fn set<I, S>(&mut self, key: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0.insert(
            key.to_ascii_lowercase(),
            values.into_iter().map(Into::into).collect(),
        );
    }

    pub fn append(&mut self, key: &str, value: impl Into<String>) {
        self.0
            .entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.0.remove(&key.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Peer targets named by the `nodes` header. Comma-separated values are
    /// split so `nodes: a,b` and two `nodes` entries mean the same thing.
    pub fn nodes(&self) -> Vec<String> {
        self.get_all(NODES)
            .iter()
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|target| !target.is_empty())
            .map(str::to_owned)
            .collect()
    }
}
