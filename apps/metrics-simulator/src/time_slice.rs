//! Deterministic time-slice math for the rollup tiers.
//!
//! Every granularity floors a timestamp to a natural origin (the enclosing
//! minute or hour) and then advances by whole multiples of a fixed window
//! width. The width always divides the origin span evenly, so buckets never
//! straddle an origin boundary.

use crate::error::TimeSliceError;
use std::fmt;
use std::str::FromStr;

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 60 * MINUTE_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Granularity {
    Raw,
    Mid,
    Coarse,
}

impl Granularity {
    pub const ALL: [Granularity; 3] = [Granularity::Raw, Granularity::Mid, Granularity::Coarse];

    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Raw => "raw",
            Granularity::Mid => "mid",
            Granularity::Coarse => "coarse",
        }
    }

    fn index(self) -> usize {
        match self {
            Granularity::Raw => 0,
            Granularity::Mid => 1,
            Granularity::Coarse => 2,
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Selects the absolute window widths. `Seconds` compresses long-range
/// rollups so they can be exercised in a short wall-clock run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalType {
    Minutes,
    Seconds,
}

impl FromStr for IntervalType {
    type Err = TimeSliceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "minutes" | "standard" => Ok(IntervalType::Minutes),
            "seconds" | "compressed" => Ok(IntervalType::Seconds),
            _ => Err(TimeSliceError::UnknownIntervalType(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Minute,
    Hour,
}

impl Origin {
    pub fn millis(self) -> i64 {
        match self {
            Origin::Minute => MINUTE_MS,
            Origin::Hour => HOUR_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceSpec {
    pub origin: Origin,
    pub width_ms: i64,
}

impl SliceSpec {
    const fn new(origin: Origin, width_ms: i64) -> Self {
        Self { origin, width_ms }
    }
}

const STANDARD: [SliceSpec; 3] = [
    SliceSpec::new(Origin::Minute, MINUTE_MS),
    SliceSpec::new(Origin::Hour, 6 * MINUTE_MS),
    SliceSpec::new(Origin::Hour, HOUR_MS),
];

const COMPRESSED: [SliceSpec; 3] = [
    SliceSpec::new(Origin::Minute, 2_500),
    SliceSpec::new(Origin::Hour, 15_000),
    SliceSpec::new(Origin::Hour, HOUR_MS),
];

/// Quantizer parameterized by a {granularity -> (origin, width)} table.
/// Pure and `Copy`; safe to share across threads without locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSlices {
    specs: [SliceSpec; 3],
}

impl TimeSlices {
    pub fn standard() -> Self {
        Self { specs: STANDARD }
    }

    pub fn compressed() -> Self {
        Self { specs: COMPRESSED }
    }

    pub fn for_interval_type(interval_type: IntervalType) -> Self {
        match interval_type {
            IntervalType::Minutes => Self::standard(),
            IntervalType::Seconds => Self::compressed(),
        }
    }

    pub fn spec(&self, granularity: Granularity) -> SliceSpec {
        self.specs[granularity.index()]
    }

    pub fn width(&self, granularity: Granularity) -> i64 {
        self.spec(granularity).width_ms
    }

    /// Start of the bucket containing `timestamp_ms`.
    pub fn quantize(&self, timestamp_ms: i64, granularity: Granularity) -> i64 {
        let spec = self.spec(granularity);
        let origin_ms = spec.origin.millis();
        let origin = timestamp_ms.div_euclid(origin_ms) * origin_ms;
        let offset = timestamp_ms - origin;
        origin + (offset / spec.width_ms) * spec.width_ms
    }
}

impl Default for TimeSlices {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    fn at(h: u32, m: u32, s: u32, ms: u32) -> i64 {
        Utc.with_ymd_and_hms(2024, 3, 14, h, m, s)
            .unwrap()
            .timestamp_millis()
            + ms as i64
    }

    fn any_slices() -> impl Strategy<Value = TimeSlices> {
        prop_oneof![Just(TimeSlices::standard()), Just(TimeSlices::compressed())]
    }

    fn any_granularity() -> impl Strategy<Value = Granularity> {
        prop::sample::select(Granularity::ALL.to_vec())
    }

    // Keeps the floored bucket and its end representable as i64.
    fn any_timestamp() -> impl Strategy<Value = i64> {
        (i64::MIN / 2)..(i64::MAX / 2)
    }

    proptest! {
        #[test]
        fn quantize_is_idempotent(
            slices in any_slices(),
            g in any_granularity(),
            t in any_timestamp(),
        ) {
            let q = slices.quantize(t, g);
            prop_assert_eq!(slices.quantize(q, g), q);
        }

        #[test]
        fn quantize_is_monotonic(
            slices in any_slices(),
            g in any_granularity(),
            a in any_timestamp(),
            b in any_timestamp(),
        ) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(slices.quantize(lo, g) <= slices.quantize(hi, g));
        }

        #[test]
        fn bucket_contains_timestamp(
            slices in any_slices(),
            g in any_granularity(),
            t in any_timestamp(),
        ) {
            let q = slices.quantize(t, g);
            prop_assert!(q <= t && t < q + slices.width(g), "t={} g={} q={}", t, g, q);
        }
    }

    #[test]
    fn widths_divide_their_origin() {
        for slices in [TimeSlices::standard(), TimeSlices::compressed()] {
            for g in Granularity::ALL {
                let spec = slices.spec(g);
                assert_eq!(spec.origin.millis() % spec.width_ms, 0, "{g} width");
            }
        }
    }

    #[test]
    fn boundaries_floor_to_themselves() {
        let slices = TimeSlices::compressed();
        assert_eq!(slices.quantize(at(13, 7, 40, 0), Granularity::Raw), at(13, 7, 40, 0));
        assert_eq!(slices.quantize(at(13, 7, 45, 0), Granularity::Mid), at(13, 7, 45, 0));
        assert_eq!(slices.quantize(at(13, 0, 0, 0), Granularity::Coarse), at(13, 0, 0, 0));
    }

    #[test]
    fn compressed_raw_advances_in_two_and_a_half_second_steps() {
        let slices = TimeSlices::compressed();
        let t = at(13, 7, 42, 0);
        let bucket = slices.quantize(t, Granularity::Raw);
        assert_eq!(bucket, at(13, 7, 40, 0));
        assert_eq!(slices.quantize(bucket, Granularity::Raw), bucket);
        assert_eq!(slices.quantize(at(13, 7, 42, 499), Granularity::Raw), at(13, 7, 40, 0));
        assert_eq!(slices.quantize(at(13, 7, 42, 500), Granularity::Raw), at(13, 7, 42, 500));
    }

    #[test]
    fn standard_tiers() {
        let slices = TimeSlices::standard();
        let t = at(13, 7, 42, 0);
        assert_eq!(slices.quantize(t, Granularity::Raw), at(13, 7, 0, 0));
        assert_eq!(slices.quantize(t, Granularity::Mid), at(13, 6, 0, 0));
        assert_eq!(slices.quantize(t, Granularity::Coarse), at(13, 0, 0, 0));
        assert_eq!(slices.width(Granularity::Mid), 6 * MINUTE_MS);
    }

    #[test]
    fn compressed_mid_and_coarse() {
        let slices = TimeSlices::compressed();
        let t = at(13, 7, 42, 0);
        assert_eq!(slices.quantize(t, Granularity::Mid), at(13, 7, 30, 0));
        assert_eq!(slices.quantize(t, Granularity::Coarse), at(13, 0, 0, 0));
    }

    #[test]
    fn pre_epoch_timestamps_floor_downwards() {
        let slices = TimeSlices::standard();
        assert_eq!(slices.quantize(-1, Granularity::Raw), -MINUTE_MS);
        assert_eq!(slices.quantize(-1, Granularity::Coarse), -HOUR_MS);
    }

    #[test]
    fn unknown_interval_type_fails_fast() {
        assert_eq!("seconds".parse::<IntervalType>(), Ok(IntervalType::Seconds));
        assert_eq!("Standard".parse::<IntervalType>(), Ok(IntervalType::Minutes));
        assert!(matches!(
            "fortnights".parse::<IntervalType>(),
            Err(TimeSliceError::UnknownIntervalType(_))
        ));
        assert_eq!(
            TimeSlices::for_interval_type(IntervalType::Seconds),
            TimeSlices::compressed()
        );
    }
}
