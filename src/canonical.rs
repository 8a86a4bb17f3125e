//! Canonical serialization for deterministic hashing.
//!
//! Used to fingerprint schema definitions and query plans, and to derive
//! stable ids for merged entities.
//!
//! ## Determinism Guarantees
//!
//! - Stable field order: Struct fields serialize in declaration order
//! - Stable Vec order: Vectors serialize in index order
//! - No HashMap allowed: Use BTreeMap for maps in hashed data
//! - Stable float format: f32/f64 serialize consistently

use serde::Serialize;
use xxhash_rust::xxh64::{xxh64, Xxh64};

use crate::error::{GraphError, Result};

/// Serialize a value to canonical JSON bytes for hashing.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| GraphError::validation("", format!("canonical serialization failed: {}", e)))
}

/// Compute canonical hash of a serializable value.
pub fn canonical_hash<T: Serialize>(value: &T) -> Result<u64> {
    let bytes = to_canonical_bytes(value)?;
    Ok(xxh64(&bytes, 0))
}

/// Compute canonical hash and return as hex string.
pub fn canonical_hash_hex<T: Serialize>(value: &T) -> Result<String> {
    Ok(format!("{:016x}", canonical_hash(value)?))
}

/// Order-independent hash of a set of string keys.
///
/// Keys are sorted and de-duplicated before hashing, and each key is
/// length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn hash_key_set<I, S>(keys: I) -> u64
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut keys: Vec<String> = keys.into_iter().map(|k| k.as_ref().to_string()).collect();
    keys.sort();
    keys.dedup();

    let mut hasher = Xxh64::new(0);
    for key in &keys {
        hasher.update(&(key.len() as u64).to_le_bytes());
        hasher.update(key.as_bytes());
    }
    hasher.digest()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct TestStruct {
        name: String,
        value: i32,
    }

    #[test]
    fn test_determinism() {
        let s = TestStruct {
            name: "test".to_string(),
            value: 42,
        };

        let h1 = canonical_hash(&s).unwrap();
        let h2 = canonical_hash(&s).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(canonical_hash_hex(&s).unwrap().len(), 16);
    }

    #[test]
    fn test_key_set_is_order_independent() {
        assert_eq!(hash_key_set(["b", "a", "c"]), hash_key_set(["c", "b", "a", "a"]));
        assert_ne!(hash_key_set(["ab", "c"]), hash_key_set(["a", "bc"]));
    }
}
