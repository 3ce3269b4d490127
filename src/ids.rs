//! Stable identifiers for weight dimensions and rate limits.
//!
//! Ids are derived with a fixed FNV-1a based scheme so the same logical limit
//! maps to the same key on every platform and across process restarts:
//!
//! - `scope_hash(s)`: 64-bit FNV-1a over the UTF-8 bytes of `s`.
//! - `combine(h, v) = (h ^ v) * FNV_PRIME` (wrapping).
//! - `dimension_id(scope, kind) = combine(scope_hash(scope), kind.code())`.
//! - `limit_id(dim, interval) = combine(dim, ticks)`, `ticks` in 100ns units.
//!
//! These constants are part of the contract; do not change them.

use crate::types::RateLimitKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
const NANOS_PER_TICK: u128 = 100;

/// A bucket of capacity shared by every endpoint in the same scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DimensionId(pub u64);

/// One window (reset interval) on a dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LimitId(pub u64);

impl fmt::Display for DimensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl fmt::Display for LimitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

pub fn scope_hash(scope: &str) -> u64 {
    scope.as_bytes().iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

fn combine(hash: u64, value: u64) -> u64 {
    (hash ^ value).wrapping_mul(FNV_PRIME)
}

pub fn dimension_id(scope: &str, kind: RateLimitKind) -> DimensionId {
    DimensionId(combine(scope_hash(scope), u64::from(kind.code())))
}

pub fn limit_id(dimension: DimensionId, reset_interval: Duration) -> LimitId {
    let ticks = reset_interval.as_nanos() / NANOS_PER_TICK;
    let ticks = u64::try_from(ticks).unwrap_or(u64::MAX);
    LimitId(combine(dimension.0, ticks))
}
