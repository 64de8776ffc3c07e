//! Pure-result cache.
//!
//! Entries are keyed by the op name and the realized input values (with their
//! tags), never by node identity, so a rebuilt graph hits the cache as long as
//! its inputs evaluate to the same values.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};

use crate::boxed::{Boxed, TagMap};
use crate::value::Value;

/// Content address of one pure op invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    /// `None` if an input cannot be serialized canonically.
    pub fn new(op: &str, inputs: &[Boxed]) -> Option<Self> {
        let mut hasher = Sha256::new();
        hasher.update(op.as_bytes());
        for input in inputs {
            hasher.update([0u8]);
            hasher.update(serde_json::to_vec(input.value()).ok()?);
            // Tag insertion order is not part of a value's identity.
            let tags: BTreeMap<&str, &Value> =
                input.tags().iter().map(|(k, v)| (k.as_ref(), v)).collect();
            hasher.update(serde_json::to_vec(&tags).ok()?);
        }
        Some(CacheKey(hasher.finalize().into()))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Output of a pure op as produced by its implementation, before any tags
/// flowed onto it.
#[derive(Clone, Debug)]
pub struct CachedResult {
    pub value: Value,
    pub tags: TagMap,
}

impl CachedResult {
    pub fn to_boxed(&self) -> Boxed {
        Boxed::with_tags(self.value.clone(), self.tags.clone())
    }
}

/// Shared, unbounded result cache. Concurrent writers racing on one key all
/// store equal results, so the last write wins harmlessly.
#[derive(Debug, Default)]
pub struct ResultCache {
    entries: RwLock<FxHashMap<CacheKey, CachedResult>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<CachedResult> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).cloned()
    }

    pub fn insert(&self, key: CacheKey, result: CachedResult) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key, result);
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_values_not_boxes() {
        let a = CacheKey::new("count", &[Boxed::new(Value::number(1.0))]).unwrap();
        let b = CacheKey::new("count", &[Boxed::new(Value::number(1.0))]).unwrap();
        assert_eq!(a, b);
        let other_op = CacheKey::new("len", &[Boxed::new(Value::number(1.0))]).unwrap();
        assert_ne!(a, other_op);
    }

    #[test]
    fn tags_are_part_of_the_key() {
        let plain = CacheKey::new("t", &[Boxed::new(Value::None)]).unwrap();
        let tagged = CacheKey::new(
            "t",
            &[Boxed::new(Value::None).tagged([("a", Value::number(1.0))])],
        )
        .unwrap();
        assert_ne!(plain, tagged);
    }

    #[test]
    fn tag_order_does_not_change_the_key() {
        let (a, b) = (("a", Value::number(1.0)), ("b", Value::number(2.0)));
        let ab = Boxed::new(Value::None).tagged([a.clone(), b.clone()]);
        let ba = Boxed::new(Value::None).tagged([b, a]);
        assert_eq!(CacheKey::new("t", &[ab]), CacheKey::new("t", &[ba]));
    }

    #[test]
    fn input_boundaries_are_unambiguous() {
        let split = CacheKey::new(
            "add",
            &[Boxed::new(Value::string("ab")), Boxed::new(Value::string("c"))],
        );
        let joined = CacheKey::new(
            "add",
            &[Boxed::new(Value::string("a")), Boxed::new(Value::string("bc"))],
        );
        assert_ne!(split, joined);
    }

    #[test]
    fn cache_stores_and_returns_results() {
        let cache = ResultCache::new();
        let key = CacheKey::new("x", &[]).unwrap();
        assert!(cache.get(&key).is_none());
        cache.insert(
            key,
            CachedResult {
                value: Value::number(2.0),
                tags: TagMap::new(),
            },
        );
        assert_eq!(cache.get(&key).unwrap().value, Value::number(2.0));
        assert_eq!(cache.len(), 1);
    }
}
