use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const TIME_BITS: u32 = 48;
const RANDOM_BITS: u32 = 80;
const TIME_MASK: u128 = (1 << TIME_BITS) - 1;
const RANDOM_MASK: u128 = (1 << RANDOM_BITS) - 1;

/// Length of the canonical Crockford base32 text form.
pub(crate) const ENCODED_LEN: usize = 26;

/// Crockford base32, excluding I, L, O and U.
const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// 128-bit, time-prefixed event identifier.
///
/// The high 48 bits encode milliseconds since the Unix epoch, the low 80 bits
/// carry entropy. Both the numeric order and the byte order of the 26-character
/// text form equal chronological order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ulid(u128);

impl Ulid {
    pub(crate) fn from_parts(timestamp_ms: u64, random: u128) -> Self {
        Self(((timestamp_ms as u128 & TIME_MASK) << RANDOM_BITS) | (random & RANDOM_MASK))
    }

    /// Milliseconds since the Unix epoch encoded in the identifier.
    pub fn timestamp_ms(&self) -> u64 {
        (self.0 >> RANDOM_BITS) as u64
    }

    /// The encoded timestamp as a wall-clock instant.
    pub fn datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.timestamp_ms() as i64).unwrap_or_default()
    }
}

impl fmt::Display for Ulid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = [0u8; ENCODED_LEN];
        for (i, slot) in buf.iter_mut().enumerate() {
            let shift = 125 - 5 * i;
            *slot = ALPHABET[((self.0 >> shift) & 0x1F) as usize];
        }
        f.write_str(std::str::from_utf8(&buf).expect("alphabet is ascii"))
    }
}

impl fmt::Debug for Ulid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ulid").field(&self.to_string()).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseUlidError;

impl fmt::Display for ParseUlidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid ulid encoding")
    }
}

impl std::error::Error for ParseUlidError {}

impl FromStr for Ulid {
    type Err = ParseUlidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != ENCODED_LEN {
            return Err(ParseUlidError);
        }
        // The first character carries only 3 significant bits; a digit above
        // 7 would overflow 128 bits.
        if decode_char(bytes[0]).ok_or(ParseUlidError)? > 7 {
            return Err(ParseUlidError);
        }
        let mut value: u128 = 0;
        for &b in bytes {
            let digit = decode_char(b).ok_or(ParseUlidError)?;
            value = (value << 5) | digit as u128;
        }
        Ok(Self(value))
    }
}

fn decode_char(c: u8) -> Option<u8> {
    let upper = c.to_ascii_uppercase();
    ALPHABET.iter().position(|&a| a == upper).map(|idx| idx as u8)
}

impl Serialize for Ulid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Ulid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value
            .parse::<Ulid>()
            .map_err(|err| serde::de::Error::custom(err.to_string()))
    }
}

/// Monotonic identifier generator.
///
/// Within a single millisecond the entropy component is incremented rather
/// than redrawn, so successive calls with an identical timestamp still yield
/// strictly increasing identifiers.
#[derive(Debug)]
pub(crate) struct UlidSource {
    state: Mutex<SourceState>,
}

#[derive(Debug)]
struct SourceState {
    last_ms: u64,
    last_random: u128,
}

impl UlidSource {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SourceState {
                last_ms: u64::MAX,
                last_random: 0,
            }),
        }
    }

    pub(crate) fn next(&self, at: DateTime<Utc>) -> Ulid {
        let ms = at.timestamp_millis().max(0) as u64 & TIME_MASK as u64;
        let mut state = self.state.lock();
        if ms == state.last_ms {
            state.last_random = (state.last_random + 1) & RANDOM_MASK;
        } else {
            state.last_ms = ms;
            state.last_random = rand::random::<u128>() & RANDOM_MASK;
        }
        Ulid::from_parts(ms, state.last_random)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_roundtrip() {
        let id = Ulid::from_parts(1_700_000_000_000, 0x1234_5678_9abc_def0_1234);
        let text = id.to_string();
        assert_eq!(text.len(), ENCODED_LEN);
        assert_eq!(text.parse::<Ulid>().unwrap(), id);
    }

    #[test]
    fn timestamp_is_recoverable() {
        let at = Utc::now();
        let source = UlidSource::new();
        let id = source.next(at);
        assert_eq!(id.timestamp_ms() as i64, at.timestamp_millis());
        assert_eq!(id.datetime().timestamp_millis(), at.timestamp_millis());
    }

    #[test]
    fn text_order_matches_time_order() {
        let earlier = Ulid::from_parts(1_000, RANDOM_MASK);
        let later = Ulid::from_parts(1_001, 0);
        assert!(earlier < later);
        assert!(earlier.to_string() < later.to_string());
    }

    #[test]
    fn same_millisecond_is_strictly_increasing() {
        let source = UlidSource::new();
        let at = Utc::now();
        let mut previous = source.next(at);
        for _ in 0..1_000 {
            let id = source.next(at);
            assert!(id > previous);
            assert_eq!(id.timestamp_ms(), previous.timestamp_ms());
            previous = id;
        }
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert!("".parse::<Ulid>().is_err());
        assert!("0123456789".parse::<Ulid>().is_err());
        // 'U' is excluded from the alphabet.
        assert!("0123456789ABCDEFGHJKMNPQRU".parse::<Ulid>().is_err());
        // First digit above 7 overflows 128 bits.
        assert!("8ZZZZZZZZZZZZZZZZZZZZZZZZZ".parse::<Ulid>().is_err());
        assert!("7ZZZZZZZZZZZZZZZZZZZZZZZZZ".parse::<Ulid>().is_ok());
    }

    #[test]
    fn parse_accepts_lowercase() {
        let id = Ulid::from_parts(42, 42);
        let lower = id.to_string().to_ascii_lowercase();
        assert_eq!(lower.parse::<Ulid>().unwrap(), id);
    }

    #[test]
    fn serde_uses_text_form() {
        let id = Ulid::from_parts(1_700_000_000_000, 7);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let back: Ulid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
