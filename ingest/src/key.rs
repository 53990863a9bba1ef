use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::api::ValidationError;

/// Number of hex characters kept from the digest: 64 bits of hash.
pub const KEY_HEX_LEN: usize = 16;

/// Deterministic identity of an event, used by the store to collapse
/// duplicate writes of the same logical event.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for IdempotencyKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let well_formed = s.len() == KEY_HEX_LEN
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if well_formed {
            Ok(IdempotencyKey(s.to_owned()))
        } else {
            Err(format!(
                "idempotency key must be {KEY_HEX_LEN} lowercase hex characters, got {s:?}"
            ))
        }
    }
}

/// Derives the idempotency key of an event from its identity fields.
///
/// Each field is framed by its byte length before hashing, so that shifting
/// characters from one field to its neighbour always changes the hash input.
pub fn derive_key(
    actor_id: &str,
    event_name: &str,
    logical_timestamp: i64,
) -> Result<IdempotencyKey, ValidationError> {
    if actor_id.is_empty() {
        return Err(ValidationError::MissingField("actor_id"));
    }
    if event_name.is_empty() {
        return Err(ValidationError::MissingField("event_name"));
    }

    let timestamp = logical_timestamp.to_le_bytes();
    let mut hasher = Sha256::new();
    for field in [actor_id.as_bytes(), event_name.as_bytes(), &timestamp[..]] {
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field);
    }
    let digest = hasher.finalize();

    let mut key = hex::encode(digest);
    key.truncate(KEY_HEX_LEN);
    Ok(IdempotencyKey(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_key_is_deterministic() {
        let first = derive_key("user_1a2b3c4d", "page_view", 1_700_000_000_000_000).unwrap();
        let second = derive_key("user_1a2b3c4d", "page_view", 1_700_000_000_000_000).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.as_str().len(), KEY_HEX_LEN);
    }

    #[test]
    fn test_key_changes_with_each_field() {
        let base = derive_key("user_1", "page_view", 1_000).unwrap();

        assert_ne!(base, derive_key("user_2", "page_view", 1_000).unwrap());
        assert_ne!(base, derive_key("user_1", "purchase", 1_000).unwrap());
        assert_ne!(base, derive_key("user_1", "page_view", 1_001).unwrap());
    }

    #[test]
    fn test_key_distinct_across_samples() {
        let mut keys = HashSet::new();
        for actor in ["a", "b", "c", "user_42"] {
            for name in ["page_view", "view_item", "add_to_cart", "purchase"] {
                for ts in [0, 1, 30_000_000, 1_700_000_000_000_000] {
                    assert!(keys.insert(derive_key(actor, name, ts).unwrap()));
                }
            }
        }
        assert_eq!(keys.len(), 64);
    }

    #[test]
    fn test_field_boundaries_are_unambiguous() {
        // Same concatenation once separators are dropped
        let left = derive_key("user-page", "view", 10).unwrap();
        let right = derive_key("user", "page-view", 10).unwrap();
        assert_ne!(left, right);

        let left = derive_key("ab", "c", 1).unwrap();
        let right = derive_key("a", "bc", 1).unwrap();
        assert_ne!(left, right);
    }

    #[test]
    fn test_empty_identity_fields_rejected() {
        assert_eq!(
            derive_key("", "page_view", 1),
            Err(ValidationError::MissingField("actor_id"))
        );
        assert_eq!(
            derive_key("user_1", "", 1),
            Err(ValidationError::MissingField("event_name"))
        );
    }

    #[test]
    fn test_key_parsing() {
        let key = derive_key("user_1", "purchase", 5).unwrap();
        let parsed: IdempotencyKey = key.as_str().parse().unwrap();
        assert_eq!(key, parsed);

        assert!("short".parse::<IdempotencyKey>().is_err());
        assert!("ABCDEF0123456789".parse::<IdempotencyKey>().is_err());
        assert!("0123456789abcdefff".parse::<IdempotencyKey>().is_err());
    }
}
