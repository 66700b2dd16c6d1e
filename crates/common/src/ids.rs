//! Typed identifiers shared across relay components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Globally unique query identifier, stored as two 64-bit halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryId {
    /// Most significant half.
    pub part1: u64,
    /// Least significant half.
    pub part2: u64,
}

impl QueryId {
    pub fn new(part1: u64, part2: u64) -> Self {
        Self { part1, part2 }
    }

    fn as_u128(&self) -> u128 {
        (u128::from(self.part1) << 64) | u128::from(self.part2)
    }
}

/// Canonical 8-4-4-4-12 lowercase hex rendering; used as the registry key.
impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.as_u128();
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
            (v >> 96) as u32,
            (v >> 80) as u16,
            (v >> 64) as u16,
            (v >> 48) as u16,
            (v & 0xffff_ffff_ffff) as u64,
        )
    }
}
