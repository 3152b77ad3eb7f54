//! Snowflake-style identifiers with a compact base58 text form.
//!
//! Layout of the 63 usable bits: milliseconds since 2022-01-01 UTC, then a
//! 10-bit node number, then a 12-bit per-millisecond step.

use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// 2022-01-01T00:00:00Z in Unix milliseconds.
const EPOCH_MILLIS: u64 = 1_640_995_200_000;

const NODE_BITS: u32 = 10;
const STEP_BITS: u32 = 12;
const NODE_MAX: i64 = (1 << NODE_BITS) - 1;
const STEP_MASK: i64 = (1 << STEP_BITS) - 1;
const TIME_SHIFT: u32 = NODE_BITS + STEP_BITS;
const NODE_SHIFT: u32 = STEP_BITS;

/// Longest canonical encoding of an i64.
pub const MAX_ENCODED_LEN: usize = 11;

const ALPHABET: &[u8; 58] = b"123456789abcdefghijkmnopqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ";

static DECODE_MAP: Lazy<[u8; 256]> = Lazy::new(|| {
    let mut map = [0xFF; 256];
    for (i, b) in ALPHABET.iter().enumerate() {
        map[*b as usize] = i as u8;
    }
    map
});

static DEFAULT_GENERATOR: Lazy<Generator> = Lazy::new(|| {
    let node = rand::random::<u16>() as i64 & NODE_MAX;
    Generator::with_node(node).unwrap_or_else(|_| Generator::unchecked(0))
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseIdError {
    #[error("invalid base58: not in canonical form")]
    NotCanonical,
    #[error("invalid base58: too long")]
    TooLong,
    #[error("invalid base58: byte {0} is out of range")]
    OutOfRange(usize),
    #[error("invalid base58: value too large")]
    Overflow,
}

/// A monotonic identifier. Zero is the "unset" value and encodes as "".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type)]
#[sqlx(transparent)]
pub struct Id(i64);

impl Id {
    pub const fn from_i64(value: i64) -> Self {
        Self(value)
    }

    pub const fn as_i64(self) -> i64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Generate a new ID from the process-wide generator.
    pub fn generate() -> Self {
        DEFAULT_GENERATOR.generate()
    }

    pub fn encode(self) -> String {
        let mut id = self.0;
        if id <= 0 {
            return String::new();
        }

        let mut buf = Vec::with_capacity(MAX_ENCODED_LEN);
        while id >= 58 {
            buf.push(ALPHABET[(id % 58) as usize]);
            id /= 58;
        }
        buf.push(ALPHABET[id as usize]);
        buf.reverse();

        // the alphabet is ASCII
        buf.into_iter().map(char::from).collect()
    }

    pub fn parse(s: &str) -> Result<Self, ParseIdError> {
        let bytes = s.as_bytes();
        if bytes.first() == Some(&b'1') {
            return Err(ParseIdError::NotCanonical);
        }
        if bytes.len() > MAX_ENCODED_LEN {
            return Err(ParseIdError::TooLong);
        }

        let mut id: i64 = 0;
        for (i, b) in bytes.iter().enumerate() {
            let digit = DECODE_MAP[*b as usize];
            if digit == 0xFF {
                return Err(ParseIdError::OutOfRange(i));
            }
            id = id
                .checked_mul(58)
                .and_then(|shifted| shifted.checked_add(digit as i64))
                .ok_or(ParseIdError::Overflow)?;
        }
        Ok(Self(id))
    }

    /// Wall-clock milliseconds encoded in the ID.
    pub fn timestamp_millis(self) -> i64 {
        (self.0 >> TIME_SHIFT) + EPOCH_MILLIS as i64
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for Id {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<i64> for Id {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.0 < 0 {
            return Err(serde::ser::Error::custom("invalid base58: negative value"));
        }
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Id::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Default)]
struct GeneratorState {
    time: i64,
    step: i64,
}

/// Serializes ID generation for one node.
#[derive(Debug)]
pub struct Generator {
    node: i64,
    state: Mutex<GeneratorState>,
}

impl Generator {
    pub fn with_node(node: i64) -> Result<Self, anyhow::Error> {
        if !(0..=NODE_MAX).contains(&node) {
            anyhow::bail!("node number must be between 0 and {}", NODE_MAX);
        }
        Ok(Self::unchecked(node))
    }

    fn unchecked(node: i64) -> Self {
        Self {
            node,
            state: Mutex::new(GeneratorState::default()),
        }
    }

    pub fn node(&self) -> i64 {
        self.node
    }

    pub fn generate(&self) -> Id {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        // a clock that steps backwards keeps counting within the last millisecond
        let mut now = since_epoch_millis().max(state.time);

        if now == state.time {
            state.step = (state.step + 1) & STEP_MASK;
            if state.step == 0 {
                while now <= state.time {
                    std::hint::spin_loop();
                    now = since_epoch_millis();
                }
            }
        } else {
            state.step = 0;
        }

        state.time = now;
        Id(now << TIME_SHIFT | self.node << NODE_SHIFT | state.step)
    }
}

fn since_epoch_millis() -> i64 {
    let since_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    since_unix.as_millis() as i64 - EPOCH_MILLIS as i64
}
