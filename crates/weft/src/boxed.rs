//! Boxing and tags.
//!
//! A [`Boxed`] gives a value its own identity token and carries the tag
//! mapping attached to that identity. It compares and hashes exactly like the
//! value it wraps, so boxing never changes what a value equals; only tag
//! lookups see the difference.

use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

use indexmap::IndexMap;
use ulid::Ulid;

use crate::value::Value;

/// Ordered tag name -> tag value mapping.
pub type TagMap = IndexMap<Arc<str>, Value>;

/// Identity of one boxing. Two boxes of equal values still have distinct
/// tokens.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BoxToken(Ulid);

impl BoxToken {
    fn fresh() -> Self {
        BoxToken(Ulid::new())
    }
}

impl std::fmt::Display for BoxToken {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug)]
pub struct Boxed {
    token: BoxToken,
    value: Value,
    tags: TagMap,
}

/// Box a value, giving it an identity that tags can attach to.
pub fn box_value(value: Value) -> Boxed {
    Boxed::new(value)
}

/// Merge `tags` into the box's mapping; later keys overwrite earlier ones.
pub fn add_tags<K: Into<Arc<str>>>(
    boxed: &mut Boxed,
    tags: impl IntoIterator<Item = (K, Value)>,
) {
    boxed.add_tags(tags)
}

/// The box's tags; empty when none were recorded.
pub fn get_tags(boxed: &Boxed) -> &TagMap {
    boxed.tags()
}

impl Boxed {
    pub fn new(value: Value) -> Self {
        Self {
            token: BoxToken::fresh(),
            value,
            tags: TagMap::new(),
        }
    }

    pub fn with_tags(value: Value, tags: TagMap) -> Self {
        Self {
            token: BoxToken::fresh(),
            value,
            tags,
        }
    }

    pub fn none() -> Self {
        Self::new(Value::None)
    }

    pub fn token(&self) -> BoxToken {
        self.token
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn into_parts(self) -> (Value, TagMap) {
        (self.value, self.tags)
    }

    pub fn tags(&self) -> &TagMap {
        &self.tags
    }

    pub fn is_tagged(&self) -> bool {
        !self.tags.is_empty()
    }

    pub fn get_tag(&self, name: &str) -> Option<&Value> {
        self.tags.get(name)
    }

    pub fn add_tags<K: Into<Arc<str>>>(&mut self, tags: impl IntoIterator<Item = (K, Value)>) {
        for (name, value) in tags {
            self.tags.insert(name.into(), value);
        }
    }

    /// Builder form of [`Boxed::add_tags`].
    pub fn tagged<K: Into<Arc<str>>>(mut self, tags: impl IntoIterator<Item = (K, Value)>) -> Self {
        self.add_tags(tags);
        self
    }

    /// Adds `tags` without overwriting names this box already carries.
    pub(crate) fn inherit_tags(&mut self, tags: &TagMap) {
        for (name, value) in tags {
            if !self.tags.contains_key(name) {
                self.tags.insert(name.clone(), value.clone());
            }
        }
    }

    /// Tags as a dict value, the shape a tagged value type describes.
    pub fn tags_as_value(&self) -> Value {
        Value::dict(self.tags.iter().map(|(k, v)| (k.clone(), v.clone())))
    }
}

impl Deref for Boxed {
    type Target = Value;

    fn deref(&self) -> &Value {
        &self.value
    }
}

impl PartialEq for Boxed {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for Boxed {}

impl PartialEq<Value> for Boxed {
    fn eq(&self, other: &Value) -> bool {
        &self.value == other
    }
}

impl PartialEq<Boxed> for Value {
    fn eq(&self, other: &Boxed) -> bool {
        self == &other.value
    }
}

impl Hash for Boxed {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state)
    }
}

impl From<Value> for Boxed {
    fn from(value: Value) -> Self {
        Boxed::new(value)
    }
}
