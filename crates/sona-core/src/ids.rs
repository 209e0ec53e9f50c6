//! Prefixed random id generation for wire envelopes and items.

use rand::Rng;

/// Base58-flavored alphabet — no `0`, `O`, `I`, or `l`, so ids survive being
/// read back over voice channels and copied from logs.
const ALPHABET: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Total id length including the prefix.
const ID_LENGTH: usize = 21;

/// Generate a random id of the form `<prefix><random>`, 21 characters total.
///
/// Matches the id shape used on the realtime wire (`evt_…`, `item_…`).
/// Prefixes of 21 characters or more are returned unchanged.
#[must_use]
pub fn generate_id(prefix: &str) -> String {
    let mut rng = rand::rng();
    let mut id = String::with_capacity(ID_LENGTH);
    id.push_str(prefix);
    while id.len() < ID_LENGTH {
        let idx = rng.random_range(0..ALPHABET.len());
        id.push(char::from(ALPHABET[idx]));
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_has_prefix_and_length() {
        let id = generate_id("evt_");
        assert!(id.starts_with("evt_"));
        assert_eq!(id.len(), 21);
    }

    #[test]
    fn id_uses_only_alphabet_chars() {
        let id = generate_id("evt_");
        for c in id["evt_".len()..].bytes() {
            assert!(ALPHABET.contains(&c), "unexpected char {c}");
        }
    }

    #[test]
    fn ids_are_unique_enough() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(generate_id("evt_")));
        }
    }

    #[test]
    fn long_prefix_is_preserved() {
        let prefix = "a".repeat(30);
        let id = generate_id(&prefix);
        assert_eq!(id, prefix);
    }

    #[test]
    fn empty_prefix_still_full_length() {
        assert_eq!(generate_id("").len(), 21);
    }
}
