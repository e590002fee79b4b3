//! Hash bucketing of routing keys.
//!
//! With `--buckets N` the key space is collapsed to `N` destinations named
//! `bucket=<id>`. The id is the SHA-224 digest of the key, read as a
//! big-endian integer, modulo `N`, so the same key lands in the same bucket
//! in every run. The original key of every bucketed record is kept in a
//! [`BucketMap`] and written out as the bucket list when the run finishes.

use std::collections::BTreeMap;
use std::num::NonZeroU64;

use sha2::{Digest, Sha224};

use crate::record::{Record, Value};

/// Destination name of the bucket list.
pub const BUCKET_LIST_DESTINATION: &str = "bucketlist";

/// `type` field of bucket-list records; real messages never carry a
/// negative type.
pub const BUCKET_LIST_TYPE: i64 = -1;

/// Bucket index of `key` among `count` buckets.
pub fn bucket_index(key: &str, count: NonZeroU64) -> u64 {
    let digest = Sha224::digest(key.as_bytes());
    let n = u128::from(count.get());
    // Horner's rule over the digest bytes keeps the remainder below n
    let rem = digest
        .iter()
        .fold(0u128, |rem, &byte| (rem * 256 + u128::from(byte)) % n);
    rem as u64
}

/// Key-to-bucket mapping accumulated over one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketMap {
    entries: BTreeMap<String, String>,
}

impl BucketMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `key -> bucket`; the first assignment of a key is kept.
    pub fn insert(&mut self, key: &str, bucket: &str) {
        if !self.entries.contains_key(key) {
            self.entries.insert(key.to_string(), bucket.to_string());
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, b)| (k.as_str(), b.as_str()))
    }

    /// One `{"type": -1, "splitkey": K, "bucket": B}` record per entry, in
    /// key order.
    pub fn to_records(&self) -> Vec<Record> {
        self.iter()
            .map(|(key, bucket)| {
                Record::from_pairs([
                    ("type", Value::Int(BUCKET_LIST_TYPE)),
                    ("splitkey", Value::from(key)),
                    ("bucket", Value::from(bucket)),
                ])
            })
            .collect()
    }
}

/// Maps routing keys to bucket destinations and remembers the mapping.
#[derive(Debug, Clone)]
pub struct BucketAssigner {
    count: NonZeroU64,
    map: BucketMap,
}

impl BucketAssigner {
    pub fn new(count: NonZeroU64) -> Self {
        Self {
            count,
            map: BucketMap::new(),
        }
    }

    pub fn count(&self) -> NonZeroU64 {
        self.count
    }

    /// Bucket id of `key` as a decimal string, recorded in the bucket map.
    pub fn assign(&mut self, key: &str) -> String {
        let bucket = bucket_index(key, self.count).to_string();
        self.map.insert(key, &bucket);
        bucket
    }

    /// The destination a bucketed record is routed to: `bucket=<id>`.
    pub fn destination(&mut self, key: &str) -> String {
        format!("bucket={}", self.assign(key))
    }

    pub fn map(&self) -> &BucketMap {
        &self.map
    }

    pub fn into_map(self) -> BucketMap {
        self.map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(count: u64) -> NonZeroU64 {
        NonZeroU64::new(count).unwrap()
    }

    #[test]
    fn test_known_bucket_indexes() {
        // Reference values: int(sha224(key).hexdigest(), 16) % N
        assert_eq!(bucket_index("mmsi=123", n(2)), 1);
        assert_eq!(bucket_index("mmsi=456", n(2)), 0);
        assert_eq!(bucket_index("mmsi=789", n(2)), 1);
        assert_eq!(bucket_index("mmsi=123", n(3)), 1);
        assert_eq!(bucket_index("mmsi=456", n(3)), 2);
        assert_eq!(bucket_index("mmsi=123", n(7)), 0);
        assert_eq!(bucket_index("mmsi=789", n(10)), 7);
        assert_eq!(bucket_index("a", n(4)), 1);
        assert_eq!(bucket_index("", n(10)), 5);
    }

    #[test]
    fn test_single_bucket() {
        assert_eq!(bucket_index("anything", n(1)), 0);
    }

    #[test]
    fn test_large_bucket_count_in_range() {
        let count = n(u64::MAX);
        for key in ["mmsi=1", "mmsi=2", "mmsi=3"] {
            assert!(bucket_index(key, count) < u64::MAX);
        }
    }

    #[test]
    fn test_assign_is_deterministic() {
        let mut first = BucketAssigner::new(n(5));
        let mut second = BucketAssigner::new(n(5));
        for key in ["mmsi=1", "mmsi=22", "mmsi=333"] {
            let a = first.assign(key);
            assert_eq!(a, first.assign(key));
            assert_eq!(a, second.assign(key));
        }
    }

    #[test]
    fn test_destination_and_map() {
        let mut assigner = BucketAssigner::new(n(2));
        assert_eq!(assigner.destination("mmsi=123"), "bucket=1");
        assert_eq!(assigner.destination("mmsi=456"), "bucket=0");
        assert_eq!(assigner.destination("mmsi=123"), "bucket=1");

        let map = assigner.into_map();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("mmsi=123"), Some("1"));
        assert_eq!(map.get("mmsi=456"), Some("0"));
    }

    #[test]
    fn test_first_insert_wins() {
        let mut map = BucketMap::new();
        map.insert("k", "1");
        map.insert("k", "3");
        assert_eq!(map.get("k"), Some("1"));
    }

    #[test]
    fn test_bucket_list_records_sorted() {
        let mut assigner = BucketAssigner::new(n(2));
        assigner.assign("mmsi=456");
        assigner.assign("mmsi=123");

        let records = assigner.map().to_records();
        let lines: Vec<String> = records.iter().map(Record::to_json).collect();
        assert_eq!(
            lines,
            vec![
                r#"{"type":-1,"splitkey":"mmsi=123","bucket":"1"}"#,
                r#"{"type":-1,"splitkey":"mmsi=456","bucket":"0"}"#,
            ]
        );
    }
}
