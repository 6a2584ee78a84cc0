//! Anchor map: key to sorted live message indices.
//!
//! Every splice into the message list must be mirrored by [`AnchorMap::shift_from`]
//! so that recorded positions keep pointing at the same messages.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnchorMap {
    positions: BTreeMap<String, Vec<usize>>,
}

impl AnchorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `index` under `key`, keeping the list sorted.
    pub fn record(&mut self, key: impl Into<String>, index: usize) {
        let list = self.positions.entry(key.into()).or_default();
        let at = list.partition_point(|&p| p <= index);
        list.insert(at, index);
    }

    /// A message was inserted at `index`: every position `>= index` moves up by one.
    pub fn shift_from(&mut self, index: usize) {
        for list in self.positions.values_mut() {
            for p in list.iter_mut().filter(|p| **p >= index) {
                *p += 1;
            }
        }
    }

    pub fn get(&self, key: &str) -> &[usize] {
        self.positions.get(key).map_or(&[], Vec::as_slice)
    }

    pub fn first(&self, key: &str) -> Option<usize> {
        self.get(key).first().copied()
    }

    pub fn last(&self, key: &str) -> Option<usize> {
        self.get(key).last().copied()
    }

    /// 0-based.
    pub fn nth(&self, key: &str, n: usize) -> Option<usize> {
        self.get(key).get(n).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        !self.get(key).is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.positions.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}
