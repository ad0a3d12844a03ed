//! Case-insensitive, order-preserving, multi-valued HTTP header map.
//!
//! Header *names* are matched case-insensitively (per RFC 7230) but the
//! original casing of each inserted value is kept for re-emission, and
//! multiple values for the same name keep their insertion order.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeaderMultiMap {
    entries: Vec<(String, String)>,
}

impl HeaderMultiMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn get_first(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Size-accounting convention from spec §4.7: `len(name) + len(value) + 4`
    /// bytes per header, used to compute observable `bytes_in`/`bytes_out`.
    pub fn accounted_size(&self) -> usize {
        self.entries
            .iter()
            .map(|(n, v)| n.len() + v.len() + 4)
            .sum()
    }
}

impl FromIterator<(String, String)> for HeaderMultiMap {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_lookup_preserves_casing() {
        let mut h = HeaderMultiMap::new();
        h.insert("Content-Type", "text/plain");
        assert_eq!(h.get_first("content-type"), Some("text/plain"));
        assert_eq!(h.iter().next().unwrap().0, "Content-Type");
    }

    #[test]
    fn multi_values_preserve_order() {
        let mut h = HeaderMultiMap::new();
        h.insert("Set-Cookie", "a=1");
        h.insert("Set-Cookie", "b=2");
        let values: Vec<&str> = h.get_all("set-cookie").collect();
        assert_eq!(values, vec!["a=1", "b=2"]);
    }

    #[test]
    fn accounted_size_matches_convention() {
        let mut h = HeaderMultiMap::new();
        h.insert("ab", "cd");
        assert_eq!(h.accounted_size(), 2 + 2 + 4);
    }
}
