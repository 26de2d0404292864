use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    slice::Iter,
};

use rapidhash::fast::RapidHasher;

use crate::Hashable;
use crate::KeyHasher;

/// A metric tag.
///
/// Tags are key/value pairs. A tag with an empty value is a "bare" tag, and is rendered as just its
/// key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag {
    key: String,
    value: String,
}

impl Tag {
    /// Creates a new `Tag`.
    pub fn new<K, V>(key: K, value: V) -> Tag
    where
        K: Into<String>,
        V: Into<String>,
    {
        Tag { key: key.into(), value: value.into() }
    }

    /// Creates a bare tag, which has no value.
    pub fn bare<K>(key: K) -> Tag
    where
        K: Into<String>,
    {
        Tag { key: key.into(), value: String::new() }
    }

    /// Key of this tag.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Value of this tag, empty for a bare tag.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Returns `true` if this tag has no value.
    pub fn is_bare(&self) -> bool {
        self.value.is_empty()
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_bare() {
            f.write_str(&self.key)
        } else {
            write!(f, "{}={}", self.key, self.value)
        }
    }
}

/// A metric key.
///
/// A key always includes a name, and optionally a set of tags. Tags are kept sorted by key, and a
/// tag key appears at most once: when the same tag key is given more than once, the last value
/// wins. This means two keys built from the same tags in a different order are equal, and render
/// the same way.
///
/// The hash of the key is computed once, when the key is created.
#[derive(Clone, Debug)]
pub struct MetricKey {
    name: String,
    tags: Vec<Tag>,
    hash: u64,
}

impl MetricKey {
    /// Creates a `MetricKey` from a name and a set of tags.
    pub fn new<N, I>(name: N, tags: I) -> MetricKey
    where
        N: Into<String>,
        I: IntoIterator<Item = Tag>,
    {
        let name = name.into();
        let tags = normalize_tags(tags.into_iter().collect());
        let hash = compute_hash(&name, &tags);
        MetricKey { name, tags, hash }
    }

    /// Creates a `MetricKey` with no tags.
    pub fn from_name<N>(name: N) -> MetricKey
    where
        N: Into<String>,
    {
        Self::new(name, std::iter::empty())
    }

    /// Name of this key.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tags of this key, sorted by tag key.
    pub fn tags(&self) -> Iter<'_, Tag> {
        self.tags.iter()
    }

    /// Returns `true` if this key has no tags.
    pub fn is_untagged(&self) -> bool {
        self.tags.is_empty()
    }
}

fn normalize_tags(mut tags: Vec<Tag>) -> Vec<Tag> {
    // Stable sort, so duplicate keys stay in arrival order and the last one can win.
    tags.sort_by(|a, b| a.key.cmp(&b.key));

    let mut normalized: Vec<Tag> = Vec::with_capacity(tags.len());
    for tag in tags {
        match normalized.last_mut() {
            Some(last) if last.key == tag.key => *last = tag,
            _ => normalized.push(tag),
        }
    }
    normalized
}

fn compute_hash(name: &str, tags: &[Tag]) -> u64 {
    let mut hasher = RapidHasher::default();
    name.hash(&mut hasher);
    tags.hash(&mut hasher);
    hasher.finish()
}

impl PartialEq for MetricKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.name == other.name && self.tags == other.tags
    }
}

impl Eq for MetricKey {}

impl PartialOrd for MetricKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MetricKey {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.name, &self.tags).cmp(&(&other.name, &other.tags))
    }
}

impl Hash for MetricKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl Hashable for MetricKey {
    type Hasher = KeyHasher;

    #[inline]
    fn hashable(&self) -> u64 {
        self.hash
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tags.is_empty() {
            write!(f, "MetricKey({})", self.name)
        } else {
            let tags = self.tags.iter().map(ToString::to_string).collect::<Vec<_>>();
            write!(f, "MetricKey({}, [{}])", self.name, tags.join(", "))
        }
    }
}

impl From<&str> for MetricKey {
    fn from(name: &str) -> MetricKey {
        MetricKey::from_name(name)
    }
}

impl From<String> for MetricKey {
    fn from(name: String) -> MetricKey {
        MetricKey::from_name(name)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{MetricKey, Tag};
    use crate::Hashable;

    #[test]
    fn tag_order_does_not_matter() {
        let a = MetricKey::new("latency", vec![Tag::new("host", "a"), Tag::new("az", "1")]);
        let b = MetricKey::new("latency", vec![Tag::new("az", "1"), Tag::new("host", "a")]);

        assert_eq!(a, b);
        assert_eq!(a.hashable(), b.hashable());

        let keys = a.tags().map(Tag::key).collect::<Vec<_>>();
        assert_eq!(keys, vec!["az", "host"]);
    }

    #[test]
    fn duplicate_tag_keys_keep_last_value() {
        let key = MetricKey::new(
            "latency",
            vec![Tag::new("host", "a"), Tag::bare("canary"), Tag::new("host", "b")],
        );

        let tags = key.tags().cloned().collect::<Vec<_>>();
        assert_eq!(tags, vec![Tag::bare("canary"), Tag::new("host", "b")]);
    }

    #[test]
    fn different_tags_are_different_keys() {
        let a = MetricKey::new("latency", vec![Tag::new("host", "a")]);
        let b = MetricKey::new("latency", vec![Tag::new("host", "b")]);
        let c = MetricKey::from_name("latency");

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!(c.is_untagged());
    }

    #[test]
    fn display() {
        let key = MetricKey::new("latency", vec![Tag::new("host", "a"), Tag::bare("canary")]);
        assert_eq!(key.to_string(), "MetricKey(latency, [canary, host=a])");
        assert_eq!(MetricKey::from("plain").to_string(), "MetricKey(plain)");
    }

    proptest! {
        #[test]
        fn shuffled_tags_build_equal_keys(
            tags in proptest::collection::btree_map("[a-z]{1,4}", "[a-z0-9]{0,4}", 0..8),
            seed in any::<u64>(),
        ) {
            let ordered = tags.iter().map(|(k, v)| Tag::new(k.clone(), v.clone())).collect::<Vec<_>>();

            // Rotate by a random amount so the input order differs from the sorted one.
            let mut rotated = ordered.clone();
            if !rotated.is_empty() {
                let by = (seed as usize) % rotated.len();
                rotated.rotate_left(by);
            }

            let a = MetricKey::new("metric", ordered);
            let b = MetricKey::new("metric", rotated);
            prop_assert_eq!(a.hashable(), b.hashable());
            prop_assert_eq!(a, b);
        }
    }
}
