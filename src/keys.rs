//! Key layout for the three keyspaces on the ordered substrate.
//!
//! Primary:    `e:<ulid>`
//! Type index: `y:<type>:<ulid>`
//! Tag index:  `t:<key>=<value>:<ulid>`
//!
//! The identifier always occupies the trailing 26 bytes of a key, so any
//! index key recovers it by direct slicing.

use crate::ulid::{Ulid, ENCODED_LEN};

pub(crate) const EVENT_PREFIX: &[u8] = b"e:";
pub(crate) const TYPE_PREFIX: &[u8] = b"y:";
pub(crate) const TAG_PREFIX: &[u8] = b"t:";

const EVENT_KEY_LEN: usize = EVENT_PREFIX.len() + ENCODED_LEN;

pub(crate) fn event_key(id: Ulid) -> Vec<u8> {
    let mut key = Vec::with_capacity(EVENT_KEY_LEN);
    key.extend_from_slice(EVENT_PREFIX);
    key.extend_from_slice(id.to_string().as_bytes());
    key
}

pub(crate) fn decode_event_key(key: &[u8]) -> Option<Ulid> {
    if key.len() < EVENT_KEY_LEN {
        return None;
    }
    decode_trailing_id(key)
}

pub(crate) fn type_index_prefix(event_type: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(TYPE_PREFIX.len() + event_type.len() + 1);
    prefix.extend_from_slice(TYPE_PREFIX);
    prefix.extend_from_slice(event_type.as_bytes());
    prefix.push(b':');
    prefix
}

pub(crate) fn type_index_key(event_type: &str, id: Ulid) -> Vec<u8> {
    let mut key = type_index_prefix(event_type);
    key.extend_from_slice(id.to_string().as_bytes());
    key
}

pub(crate) fn tag_index_prefix(tag_key: &str, tag_value: &str) -> Vec<u8> {
    let mut prefix =
        Vec::with_capacity(TAG_PREFIX.len() + tag_key.len() + 1 + tag_value.len() + 1);
    prefix.extend_from_slice(TAG_PREFIX);
    prefix.extend_from_slice(tag_key.as_bytes());
    prefix.push(b'=');
    prefix.extend_from_slice(tag_value.as_bytes());
    prefix.push(b':');
    prefix
}

pub(crate) fn tag_index_key(tag_key: &str, tag_value: &str, id: Ulid) -> Vec<u8> {
    let mut key = tag_index_prefix(tag_key, tag_value);
    key.extend_from_slice(id.to_string().as_bytes());
    key
}

/// Recovers the identifier from the trailing 26 bytes of any index key.
pub(crate) fn decode_index_key(key: &[u8]) -> Option<Ulid> {
    decode_trailing_id(key)
}

fn decode_trailing_id(key: &[u8]) -> Option<Ulid> {
    if key.len() < ENCODED_LEN {
        return None;
    }
    let tail = &key[key.len() - ENCODED_LEN..];
    std::str::from_utf8(tail).ok()?.parse().ok()
}

/// The smallest byte string strictly greater than every key sharing `prefix`.
///
/// Returns `None` when no such string exists (all bytes 0xFF), in which case
/// a reverse scan starts from the end of the keyspace.
pub(crate) fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return Some(end);
        }
        end.pop();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_id() -> Ulid {
        Ulid::from_parts(1_700_000_000_000, 99)
    }

    #[test]
    fn event_key_roundtrip() {
        let id = sample_id();
        let key = event_key(id);
        assert!(key.starts_with(EVENT_PREFIX));
        assert_eq!(key.len(), EVENT_KEY_LEN);
        assert_eq!(decode_event_key(&key), Some(id));
    }

    #[test]
    fn decode_event_key_rejects_short_keys() {
        assert_eq!(decode_event_key(b"e:"), None);
        assert_eq!(decode_event_key(b""), None);
    }

    #[test]
    fn index_keys_carry_trailing_id() {
        let id = sample_id();
        let type_key = type_index_key("request", id);
        assert!(type_key.starts_with(b"y:request:"));
        assert_eq!(decode_index_key(&type_key), Some(id));

        let tag_key = tag_index_key("service", "api", id);
        assert!(tag_key.starts_with(b"t:service=api:"));
        assert_eq!(decode_index_key(&tag_key), Some(id));
    }

    #[test]
    fn index_key_extends_its_prefix() {
        let id = sample_id();
        assert!(type_index_key("request", id).starts_with(&type_index_prefix("request")));
        assert!(tag_index_key("env", "prod", id).starts_with(&tag_index_prefix("env", "prod")));
    }

    #[test]
    fn primary_keys_sort_chronologically() {
        let earlier = event_key(Ulid::from_parts(1_000, u128::MAX));
        let later = event_key(Ulid::from_parts(1_001, 0));
        assert!(earlier < later);
    }

    #[test]
    fn prefix_end_increments_last_byte() {
        assert_eq!(prefix_end(b"y:request:"), Some(b"y:request;".to_vec()));
        assert_eq!(prefix_end(b"e:"), Some(b"e;".to_vec()));
    }

    #[test]
    fn prefix_end_carries_past_max_bytes() {
        assert_eq!(prefix_end(&[b'a', 0xFF]), Some(vec![b'b']));
        assert_eq!(prefix_end(&[0xFF, 0xFF]), None);
    }

    #[test]
    fn prefix_end_bounds_the_prefix_range() {
        let prefix = type_index_prefix("request");
        let end = prefix_end(&prefix).unwrap();
        let key = type_index_key("request", sample_id());
        assert!(prefix.as_slice() < key.as_slice());
        assert!(key.as_slice() < end.as_slice());
    }
}
