//! Deterministic cache keys for query results.
//!
//! A key is the lowercase hex SHA-256 of `query_text ++ entity_type ++
//! result_type`, followed by `-` and the entity type:
//!
//! ```text
//! 3f1c…9ab2-shop::Order
//! ```
//!
//! The suffix names the invalidation group the key belongs to and makes keys
//! readable in logs.

use std::fmt;

use keel_core::Entity;
use sha2::{Digest, Sha256};

/// Hex length of a SHA-256 digest.
const DIGEST_HEX_LEN: usize = 64;

/// Key identifying one query result in the result cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for a rendered query.
    pub fn generate(query_text: &str, entity_type: &str, result_type: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(query_text.as_bytes());
        hasher.update(entity_type.as_bytes());
        hasher.update(result_type.as_bytes());
        let digest = hex::encode(hasher.finalize());
        CacheKey(format!("{}-{}", digest, entity_type))
    }

    /// Key for a query over `T` whose terminal returns `R`.
    pub fn for_query<T: Entity, R>(query_text: &str) -> Self {
        Self::generate(query_text, T::entity_type(), std::any::type_name::<R>())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hex digest part.
    pub fn digest(&self) -> &str {
        &self.0[..DIGEST_HEX_LEN]
    }

    /// The entity type suffix, which is also the invalidation group.
    pub fn entity_type(&self) -> &str {
        &self.0[DIGEST_HEX_LEN + 1..]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let key = CacheKey::generate("FROM shop::Order", "shop::Order", "usize");
        assert_eq!(key.digest().len(), 64);
        assert!(key.digest().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(key.entity_type(), "shop::Order");
        assert_eq!(key.as_str(), format!("{}-shop::Order", key.digest()));
    }

    #[test]
    fn test_known_digest() {
        // sha256("") for the all-empty input
        let key = CacheKey::generate("", "", "");
        assert_eq!(
            key.digest(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(key.entity_type(), "");
    }

    #[test]
    fn test_result_type_separates_keys() {
        let count = CacheKey::generate("FROM shop::Order", "shop::Order", "usize");
        let exists = CacheKey::generate("FROM shop::Order", "shop::Order", "bool");
        assert_ne!(count, exists);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn text_strategy() -> impl Strategy<Value = String> {
        "[ -~]{0,64}"
    }

    fn type_strategy() -> impl Strategy<Value = String> {
        "[a-z_]{1,8}(::[A-Z][A-Za-z]{0,8}){1,3}"
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        #[test]
        fn prop_generation_is_deterministic(
            text in text_strategy(),
            entity in type_strategy(),
            result in type_strategy(),
        ) {
            let a = CacheKey::generate(&text, &entity, &result);
            let b = CacheKey::generate(&text, &entity, &result);
            prop_assert_eq!(a, b);
        }

        #[test]
        fn prop_suffix_is_entity_type(
            text in text_strategy(),
            entity in type_strategy(),
            result in type_strategy(),
        ) {
            let key = CacheKey::generate(&text, &entity, &result);
            prop_assert_eq!(key.entity_type(), entity.as_str());
            prop_assert_eq!(key.digest().len(), 64);
        }

        #[test]
        fn prop_different_text_gives_different_key(
            a in text_strategy(),
            b in text_strategy(),
            entity in type_strategy(),
        ) {
            prop_assume!(a != b);
            let ka = CacheKey::generate(&a, &entity, "usize");
            let kb = CacheKey::generate(&b, &entity, "usize");
            prop_assert_ne!(ka, kb);
        }

        #[test]
        fn prop_different_result_type_gives_different_key(
            text in text_strategy(),
            entity in type_strategy(),
            r1 in type_strategy(),
            r2 in type_strategy(),
        ) {
            prop_assume!(r1 != r2);
            let k1 = CacheKey::generate(&text, &entity, &r1);
            let k2 = CacheKey::generate(&text, &entity, &r2);
            prop_assert_ne!(k1, k2);
        }
    }
}
