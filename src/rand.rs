//! Small self-contained PRNG
//!
//! Used for TCP initial sequence numbers, ephemeral ports and IPv6 fragment
//! identifiers. Not cryptographically secure; the seed only has to differ
//! between runs to avoid port/sequence collisions.

use std::time::{SystemTime, UNIX_EPOCH};

/// xorshift64* generator.
#[derive(Debug, Clone)]
pub struct Rand {
    state: u64,
}

impl Rand {
    pub fn new(seed: u64) -> Self {
        Rand {
            // A zero state would stay zero forever.
            state: seed | 1,
        }
    }

    /// Seed from the wall clock.
    pub fn from_clock() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x9e3779b97f4a7c15);
        Rand::new(nanos)
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x.wrapping_mul(0x2545f4914f6cdd1d)
    }

    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    pub fn next_u16(&mut self) -> u16 {
        (self.next_u64() >> 48) as u16
    }
}
