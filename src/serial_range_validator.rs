//! Shape and watermark checks for a requested serial range.

use std::ops::RangeInclusive;

/// A validated, inclusive serial range. `start < end` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialRange {
    start: u64,
    end: u64,
}

impl SerialRange {
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Splits the range into consecutive sub-ranges of at most `size` serials.
    pub fn chunks(&self, size: u64) -> impl Iterator<Item = RangeInclusive<u64>> {
        let size = size.max(1);
        let end = self.end;
        let mut next = Some(self.start);
        std::iter::from_fn(move || {
            let lo = next?;
            let hi = lo.saturating_add(size - 1).min(end);
            next = if hi < end { Some(hi + 1) } else { None };
            Some(lo..=hi)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("start and end serial numbers are both required")]
    MissingBounds,

    #[error("start serial {start} must be less than end serial {end}")]
    StartNotBeforeEnd { start: i64, end: i64 },

    #[error(
        "start serial {} must exceed the current maximum ({}); the lowest acceptable start is {}",
        .start,
        .watermark,
        .watermark + 1
    )]
    StartNotAboveWatermark { start: i64, watermark: u64 },
}

/// Checks a requested range against the factory's watermark, the highest end
/// serial committed so far (0 for a factory without batches).
///
/// Rules are applied in order and the first failure is returned: both bounds
/// present, `start < end`, then `start > watermark`.
pub fn validate(
    start: Option<i64>,
    end: Option<i64>,
    watermark: u64,
) -> Result<SerialRange, RangeError> {
    let (start, end) = match (start, end) {
        (Some(start), Some(end)) => (start, end),
        _ => return Err(RangeError::MissingBounds),
    };

    if start >= end {
        return Err(RangeError::StartNotBeforeEnd { start, end });
    }

    // A negative start can never clear a non-negative watermark.
    match u64::try_from(start) {
        Ok(s) if s > watermark => Ok(SerialRange {
            start: s,
            end: end as u64,
        }),
        _ => Err(RangeError::StartNotAboveWatermark { start, watermark }),
    }
}
