//! The header map carried by every envelope and wire record.
//!
//! Keys are case-sensitive strings, values are raw UTF-8 bytes. Insertion
//! order is preserved so a header snapshot written to the outbox replays
//! byte-for-byte.

/// Registered type identifier of the message.
pub const TYPE_HEADER: &str = "$type";
/// Concrete variant tag when the wire contract allows subtypes.
pub const RUNTIME_TYPE_HEADER: &str = "$runtimeType";
/// W3C trace context parent.
pub const TRACEPARENT_HEADER: &str = "traceparent";
/// W3C trace context state.
pub const TRACESTATE_HEADER: &str = "tracestate";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, Vec<u8>)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a header. Replacing keeps the original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// Value as UTF-8, when the header exists and is valid UTF-8.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Lossy string snapshot, as frozen into an outbox row.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).into_owned()))
            .collect()
    }

    /// Rebuild a map from an outbox row snapshot.
    pub fn from_snapshot(snapshot: &[(String, String)]) -> Self {
        let mut map = Self::new();
        for (k, v) in snapshot {
            map.insert(k.clone(), v.as_bytes().to_vec());
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_replaces_in_place() {
        let mut map = HeaderMap::new();
        map.insert("a", b"1".to_vec());
        map.insert("b", b"2".to_vec());
        map.insert("a", b"3".to_vec());

        let keys: Vec<&str> = map.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(map.get_str("a"), Some("3"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn keys_are_case_sensitive() {
        let mut map = HeaderMap::new();
        map.insert("Region", b"emea".to_vec());
        assert!(map.contains_key("Region"));
        assert!(!map.contains_key("region"));
    }

    #[test]
    fn snapshot_round_trips() {
        let mut map = HeaderMap::new();
        map.insert(TYPE_HEADER, b"order-created".to_vec());
        map.insert("region", b"emea".to_vec());

        let rebuilt = HeaderMap::from_snapshot(&map.snapshot());
        assert_eq!(rebuilt, map);
    }
}
