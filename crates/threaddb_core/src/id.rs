//! Time-sortable document identifiers.
//!
//! Identifiers follow the ULID layout: a 48-bit millisecond timestamp
//! followed by 80 random bits, written as 26 Crockford base32 characters.
//! Ids generated in the same millisecond increment the random part, so ids
//! from one process sort in generation order.

use parking_lot::Mutex;
use rand::Rng;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const LEN: usize = 26;
const RANDOM_BITS: u32 = 80;
const RANDOM_MASK: u128 = (1 << RANDOM_BITS) - 1;
const MAX_TIMESTAMP: u64 = (1 << 48) - 1;

/// A 128-bit sortable identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ulid(u128);

#[derive(Debug)]
struct Generator {
    last: u128,
}

static GENERATOR: Mutex<Generator> = parking_lot::const_mutex(Generator { last: 0 });

impl Ulid {
    /// Generates a new id, strictly greater than every id previously
    /// generated by this process.
    #[must_use]
    pub fn generate() -> Self {
        let now = now_ms();
        let mut generator = GENERATOR.lock();
        let candidate = compose(now, rand::thread_rng().gen::<u128>() & RANDOM_MASK);
        let next = if candidate > generator.last {
            candidate
        } else {
            // Same (or earlier) millisecond: step the previous id. Overflowing
            // the random part carries into the timestamp.
            generator.last + 1
        };
        generator.last = next;
        Self(next)
    }

    /// Builds an id from its parts.
    #[must_use]
    pub fn from_parts(timestamp_ms: u64, random: u128) -> Self {
        Self(compose(timestamp_ms, random & RANDOM_MASK))
    }

    /// Milliseconds since the Unix epoch encoded in the id.
    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        (self.0 >> RANDOM_BITS) as u64
    }

    /// The random part.
    #[must_use]
    pub fn random(&self) -> u128 {
        self.0 & RANDOM_MASK
    }

    /// Returns true if `text` is a well-formed id.
    #[must_use]
    pub fn is_valid(text: &str) -> bool {
        text.parse::<Ulid>().is_ok()
    }
}

/// Generates a new id in text form.
#[must_use]
pub fn new_id() -> String {
    Ulid::generate().to_string()
}

fn compose(timestamp_ms: u64, random: u128) -> u128 {
    (u128::from(timestamp_ms.min(MAX_TIMESTAMP)) << RANDOM_BITS) | random
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl fmt::Display for Ulid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = [0u8; LEN];
        for (i, slot) in out.iter_mut().enumerate() {
            let shift = 5 * (LEN - 1 - i);
            *slot = ALPHABET[((self.0 >> shift) & 0x1f) as usize];
        }
        // Every byte comes from ALPHABET, which is ASCII.
        f.write_str(std::str::from_utf8(&out).map_err(|_| fmt::Error)?)
    }
}

/// Error returned when parsing a malformed id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid id: {0}")]
pub struct ParseUlidError(String);

impl FromStr for Ulid {
    type Err = ParseUlidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseUlidError(s.to_string());
        if s.len() != LEN {
            return Err(invalid());
        }
        let mut value: u128 = 0;
        for (i, c) in s.bytes().enumerate() {
            let digit = decode_char(c).ok_or_else(invalid)?;
            // The first character only carries three bits.
            if i == 0 && digit > 7 {
                return Err(invalid());
            }
            value = (value << 5) | u128::from(digit);
        }
        Ok(Self(value))
    }
}

fn decode_char(c: u8) -> Option<u8> {
    let c = c.to_ascii_uppercase();
    let c = match c {
        b'O' => b'0',
        b'I' | b'L' => b'1',
        other => other,
    };
    ALPHABET.iter().position(|&a| a == c).map(|p| p as u8)
}
