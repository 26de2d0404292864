use std::hash::{Hash, Hasher};

/// A type that can hash itself.
///
/// Metric keys are looked up on every datagram, so they pre-compute their hash once at
/// construction time. Rather than the standard library `Hash` trait, `Hashable` exposes an
/// interface that forces objects to hash themselves entirely, providing only the resulting 8-byte
/// hash.
///
/// As a key may sometimes need to be rehashed, we need to ensure that the same hashing algorithm
/// used to pre-generate the hash for this value is used when rehashing it. All implementors must
/// define the hashing algorithm used by specifying the `Hasher` associated type.
pub trait Hashable: Hash {
    /// The hasher implementation used internally.
    type Hasher: Hasher + Default;

    /// Generate the hash of this object.
    #[inline]
    fn hashable(&self) -> u64 {
        let mut hasher = Self::Hasher::default();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// A pass-through hasher for pre-hashed [`MetricKey`][crate::MetricKey] values.
///
/// `MetricKey` writes its pre-computed hash via `write_u64()` when hashed, and `finish()` simply
/// returns that value, so maps built with `BuildHasherDefault<KeyHasher>` never hash a key twice.
///
/// # Panics
///
/// Panics if any write method other than `write_u64()` is called.
#[derive(Debug, Default)]
pub struct KeyHasher {
    hash: u64,
}

impl Hasher for KeyHasher {
    #[inline(always)]
    fn finish(&self) -> u64 {
        self.hash
    }

    fn write(&mut self, _bytes: &[u8]) {
        panic!("KeyHasher::write() called; KeyHasher only supports write_u64() for pre-hashed keys");
    }

    #[inline(always)]
    fn write_u64(&mut self, i: u64) {
        self.hash = i;
    }
}

#[cfg(test)]
mod tests {
    use std::hash::{BuildHasher, BuildHasherDefault};

    use super::{Hashable, KeyHasher};
    use crate::{MetricKey, Tag};

    #[test]
    fn key_hasher_passes_precomputed_hash_through() {
        let key = MetricKey::new("requests", vec![Tag::new("route", "index")]);
        let build = BuildHasherDefault::<KeyHasher>::default();
        assert_eq!(build.hash_one(&key), key.hashable());
    }
}
