//! Single-byte rate deltas

/// Steps per unit: one compact step is 0.1% of the base rate
pub const COMPACT_RESOLUTION: u128 = 1000;

/// Result of compacting a target rate against its base.
///
/// When `overflow` is set the value is meaningless and the target must be
/// submitted as a new full-precision base rate instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactRate {
    pub value: i8,
    pub overflow: bool,
}

impl CompactRate {
    const OVERFLOW: CompactRate = CompactRate {
        value: 0,
        overflow: true,
    };
}

/// Encode `target` as a delta against `base`, truncating toward the base
/// resolution step below.
pub fn to_compact(target: u128, base: u128) -> CompactRate {
    if base == 0 {
        return CompactRate::OVERFLOW;
    }

    let scaled = match target.checked_mul(COMPACT_RESOLUTION) {
        Some(v) => v / base,
        None => return CompactRate::OVERFLOW,
    };

    let upper = COMPACT_RESOLUTION + i8::MAX as u128;
    let lower = COMPACT_RESOLUTION - i8::MIN.unsigned_abs() as u128;
    if scaled > upper || scaled < lower {
        return CompactRate::OVERFLOW;
    }

    CompactRate {
        value: (scaled as i128 - COMPACT_RESOLUTION as i128) as i8,
        overflow: false,
    }
}

/// Rate the contract derives from a base and its compact delta
pub fn from_compact(base: u128, compact: i8) -> u128 {
    let factor = (COMPACT_RESOLUTION as i128 + compact as i128) as u128;
    base.saturating_mul(factor) / COMPACT_RESOLUTION
}
