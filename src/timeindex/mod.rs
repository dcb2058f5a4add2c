/// Timestamp sequence generation, naming and recency classification
use crate::domain::SatellitePattern;
use crate::errors::{ApiError, ApiResult};
use chrono::{DateTime, Duration, Timelike, Utc};
use std::collections::{BTreeSet, HashMap};
use tracing::warn;

pub const DEFAULT_INTERVAL_MINUTES: i64 = 10;
pub const DEFAULT_RECENT_WINDOW_DAYS: i64 = 7;
pub const MAX_RECENT_WINDOW_DAYS: i64 = 3650;
/// Upper bound on one expected set; about nine years of 10-minute frames
pub const MAX_EXPECTED_TIMESTAMPS: i64 = 500_000;

/// Drop sub-second precision; timestamps compare at whole seconds
pub fn truncate(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_nanosecond(0).unwrap_or(ts)
}

/// Expected timestamps from `start` to `end` inclusive in `interval_minutes` steps.
///
/// An inverted range is swapped with a warning rather than rejected.
pub fn generate_sequence(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    interval_minutes: i64,
) -> ApiResult<Vec<DateTime<Utc>>> {
    if interval_minutes <= 0 {
        return Err(ApiError::InvalidRange(format!(
            "interval must be positive, got {} minutes",
            interval_minutes
        )));
    }

    let (start, end) = normalize_range(start, end);
    let count = (end - start).num_minutes() / interval_minutes + 1;
    if count > MAX_EXPECTED_TIMESTAMPS {
        return Err(ApiError::InvalidRange(format!(
            "{} expected timestamps exceeds the limit of {}; narrow the range or widen the interval",
            count, MAX_EXPECTED_TIMESTAMPS
        )));
    }
    let step = Duration::try_minutes(interval_minutes).ok_or_else(|| {
        ApiError::InvalidRange(format!("interval of {} minutes is too large", interval_minutes))
    })?;

    let mut sequence = Vec::with_capacity(count as usize);
    let mut current = Some(start);
    while let Some(ts) = current.filter(|ts| *ts <= end) {
        sequence.push(ts);
        current = ts.checked_add_signed(step);
    }

    Ok(sequence)
}

/// Truncate both ends and swap them when `start > end`
pub fn normalize_range(start: DateTime<Utc>, end: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let (start, end) = (truncate(start), truncate(end));
    if start > end {
        warn!(%start, %end, "Start is after end, swapping range");
        (end, start)
    } else {
        (start, end)
    }
}

/// Best-effort guess of the sampling interval from observed timestamps.
///
/// Returns the most frequent positive gap in whole minutes (smallest wins a tie),
/// or the default when there is nothing to measure.
pub fn detect_interval<'a, I>(observed: I) -> i64
where
    I: IntoIterator<Item = &'a DateTime<Utc>>,
{
    let sorted: BTreeSet<DateTime<Utc>> = observed.into_iter().map(|t| truncate(*t)).collect();
    if sorted.len() < 2 {
        return DEFAULT_INTERVAL_MINUTES;
    }

    let mut counts: HashMap<i64, usize> = HashMap::new();
    for (a, b) in sorted.iter().zip(sorted.iter().skip(1)) {
        let minutes = (*b - *a).num_minutes();
        if minutes > 0 {
            *counts.entry(minutes).or_default() += 1;
        }
    }

    counts
        .into_iter()
        .max_by(|(gap_a, n_a), (gap_b, n_b)| n_a.cmp(n_b).then(gap_b.cmp(gap_a)))
        .map(|(gap, _)| gap)
        .unwrap_or(DEFAULT_INTERVAL_MINUTES)
}

/// Local filename a satellite image for `ts` is stored under
pub fn expected_filename(ts: DateTime<Utc>, satellite: SatellitePattern) -> String {
    match satellite {
        SatellitePattern::Goes16 | SatellitePattern::Goes18 => format!(
            "{}_{}_band13.png",
            satellite.short_name(),
            ts.format("%Y%m%d_%H%M%S")
        ),
        SatellitePattern::Generic => format!("image_{}Z.png", ts.format("%Y%m%dT%H%M%S")),
    }
}

/// `now - ts < window` is recent; anything at or past the window is archival
pub fn is_recent(ts: DateTime<Utc>, now: DateTime<Utc>, window_days: i64) -> bool {
    Duration::try_days(window_days).map_or(true, |window| now - ts < window)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, h, m, 0).unwrap()
    }

    #[test]
    fn test_generate_sequence_inclusive() {
        let seq = generate_sequence(at(0, 0), at(1, 0), 10).unwrap();
        assert_eq!(seq.len(), 7);
        assert_eq!(seq.first(), Some(&at(0, 0)));
        assert_eq!(seq.last(), Some(&at(1, 0)));
    }

    #[test]
    fn test_generate_sequence_length_and_spacing() {
        let cases = [(0, 0, 0, 0, 10), (0, 0, 0, 59, 10), (0, 5, 3, 17, 15), (0, 0, 23, 59, 1)];
        for (sh, sm, eh, em, interval) in cases {
            let (start, end) = (at(sh, sm), at(eh, em));
            let seq = generate_sequence(start, end, interval).unwrap();
            let expected_len = ((end - start).num_minutes() / interval) as usize + 1;
            assert_eq!(seq.len(), expected_len);
            assert_eq!(seq[0], start);
            assert!(seq.windows(2).all(|w| w[1] - w[0] == Duration::minutes(interval)));
            let last = *seq.last().unwrap();
            assert!(last <= end && end - last < Duration::minutes(interval));
        }
    }

    #[test]
    fn test_generate_sequence_swaps_inverted_range() {
        let seq = generate_sequence(at(1, 0), at(0, 0), 30).unwrap();
        assert_eq!(seq, vec![at(0, 0), at(0, 30), at(1, 0)]);
    }

    #[test]
    fn test_generate_sequence_rejects_non_positive_interval() {
        assert!(matches!(
            generate_sequence(at(0, 0), at(1, 0), 0),
            Err(ApiError::InvalidRange(_))
        ));
        assert!(generate_sequence(at(0, 0), at(1, 0), -5).is_err());
    }

    #[test]
    fn test_generate_sequence_caps_length() {
        let start = at(0, 0);
        let end = start + Duration::days(365 * 20);
        assert!(matches!(generate_sequence(start, end, 1), Err(ApiError::InvalidRange(_))));
        assert!(matches!(
            generate_sequence(start, end, i64::MAX),
            Err(ApiError::InvalidRange(_))
        ));
    }

    #[test]
    fn test_generate_sequence_near_max_datetime() {
        let end = DateTime::<Utc>::MAX_UTC.with_nanosecond(0).unwrap();
        let start = end - Duration::minutes(25);
        let seq = generate_sequence(start, end, 10).unwrap();
        assert_eq!(seq.len(), 3);
    }

    #[test]
    fn test_detect_interval_modal_gap() {
        let observed = [at(0, 0), at(0, 10), at(0, 20), at(0, 30), at(1, 0)];
        assert_eq!(detect_interval(observed.iter()), 10);
    }

    #[test]
    fn test_detect_interval_tie_prefers_smaller() {
        let observed = [at(0, 0), at(0, 15), at(0, 45)];
        assert_eq!(detect_interval(observed.iter()), 15);
    }

    #[test]
    fn test_detect_interval_default_with_single_point() {
        assert_eq!(detect_interval([at(0, 0)].iter()), DEFAULT_INTERVAL_MINUTES);
        assert_eq!(detect_interval(std::iter::empty()), DEFAULT_INTERVAL_MINUTES);
    }

    #[test]
    fn test_expected_filename_per_satellite() {
        let ts = Utc.with_ymd_and_hms(2023, 6, 15, 12, 30, 0).unwrap();
        assert_eq!(
            expected_filename(ts, SatellitePattern::Goes16),
            "goes16_20230615_123000_band13.png"
        );
        assert_eq!(
            expected_filename(ts, SatellitePattern::Goes18),
            "goes18_20230615_123000_band13.png"
        );
        assert_eq!(
            expected_filename(ts, SatellitePattern::Generic),
            "image_20230615T123000Z.png"
        );
    }

    #[test]
    fn test_is_recent_boundary() {
        let now = at(12, 0);
        assert!(is_recent(now - Duration::days(6), now, 7));
        assert!(is_recent(now - Duration::days(7) + Duration::seconds(1), now, 7));
        assert!(!is_recent(now - Duration::days(7), now, 7));
        assert!(!is_recent(now - Duration::days(30), now, 7));
        assert!(is_recent(now + Duration::hours(1), now, 7));
        assert!(is_recent(now - Duration::days(30), now, i64::MAX));
    }
}
