//! Time ranges and zero-filled bucket series.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use serde::Serialize;
use std::iter::Peekable;
use std::slice;
use std::sync::OnceLock;

use crate::db::{BucketSum, EntityRef};
use crate::error::{Error, Result};

const MINUTE: i64 = 60;
const HOUR: i64 = 3600;
const DAY: i64 = 86400;

/// Longest range a series may cover.
const MAX_RANGE_SECS: i64 = 366 * DAY;

/// A half-open window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        let secs = (end - start).num_seconds();
        if end <= start {
            return Err(Error::Validation("time range must end after it starts".to_string()));
        }
        if secs > MAX_RANGE_SECS {
            return Err(Error::Validation("time range cannot exceed 366 days".to_string()));
        }
        Ok(Self { start, end })
    }

    /// Parse `<n>m`, `<n>h` or `<n>d`, ending at `now`.
    pub fn parse(spec: &str, now: DateTime<Utc>) -> Result<Self> {
        static RANGE_RE: OnceLock<Regex> = OnceLock::new();
        let re = RANGE_RE.get_or_init(|| Regex::new(r"^(\d{1,6})([mhd])$").unwrap());

        let caps = re.captures(spec.trim()).ok_or_else(|| {
            Error::Validation(format!("invalid timeRange '{}', expected e.g. 30m, 1h or 7d", spec))
        })?;
        let amount: i64 = caps[1]
            .parse()
            .map_err(|_| Error::Validation(format!("invalid timeRange '{}'", spec)))?;
        let unit = match &caps[2] {
            "m" => MINUTE,
            "h" => HOUR,
            _ => DAY,
        };

        Self::new(now - ChronoDuration::seconds(amount * unit), now)
    }

    pub fn duration_secs(&self) -> i64 {
        (self.end - self.start).num_seconds()
    }

    /// Bucket width in seconds for this range.
    pub fn bucket_secs(&self) -> i64 {
        match self.duration_secs() {
            d if d <= HOUR => MINUTE,
            d if d <= DAY => HOUR,
            _ => DAY,
        }
    }

    /// First bucket boundary at or before `start`.
    pub fn origin(&self) -> DateTime<Utc> {
        truncate_to_window(self.start, self.bucket_secs())
    }

    /// Number of buckets needed to cover the range.
    pub fn bucket_count(&self) -> i64 {
        let width_ms = self.bucket_secs() * 1000;
        let span_ms = (self.end - self.origin()).num_milliseconds();
        (span_ms + width_ms - 1) / width_ms
    }
}

/// Truncate a datetime to the start of its containing window.
pub fn truncate_to_window(dt: DateTime<Utc>, window_seconds: i64) -> DateTime<Utc> {
    let ts = dt.timestamp();
    let truncated = ts - ts.rem_euclid(window_seconds);
    DateTime::from_timestamp(truncated, 0).unwrap_or(dt)
}

/// One bucket of a traffic series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficBucket {
    pub time: DateTime<Utc>,
    pub bytes_in: i64,
    pub bytes_out: i64,
}

/// Traffic of one entity over a range.
///
/// Holds only the non-empty sums; [`TrafficSeries::iter`] expands them into
/// the full zero-filled sequence on demand and can be called any number of
/// times.
#[derive(Debug, Clone)]
pub struct TrafficSeries {
    /// `None` for the sum over every tunnel.
    pub entity: Option<EntityRef>,
    pub range: TimeRange,
    sums: Vec<BucketSum>,
}

impl TrafficSeries {
    /// `sums` must be sorted by index.
    pub fn new(entity: EntityRef, range: TimeRange, sums: Vec<BucketSum>) -> Self {
        Self {
            entity: Some(entity),
            range,
            sums,
        }
    }

    pub fn all_tunnels(range: TimeRange, sums: Vec<BucketSum>) -> Self {
        Self {
            entity: None,
            range,
            sums,
        }
    }

    pub fn bucket_secs(&self) -> i64 {
        self.range.bucket_secs()
    }

    pub fn len(&self) -> usize {
        self.range.bucket_count() as usize
    }

    pub fn iter(&self) -> Buckets<'_> {
        Buckets {
            origin: self.range.origin(),
            width: self.range.bucket_secs(),
            count: self.range.bucket_count(),
            next: 0,
            sums: self.sums.iter().peekable(),
        }
    }

    /// Totals across the whole range.
    pub fn totals(&self) -> (i64, i64) {
        self.sums
            .iter()
            .fold((0, 0), |(i, o), b| (i + b.bytes_in, o + b.bytes_out))
    }
}

impl<'a> IntoIterator for &'a TrafficSeries {
    type Item = TrafficBucket;
    type IntoIter = Buckets<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the buckets of a [`TrafficSeries`].
pub struct Buckets<'a> {
    origin: DateTime<Utc>,
    width: i64,
    count: i64,
    next: i64,
    sums: Peekable<slice::Iter<'a, BucketSum>>,
}

impl Iterator for Buckets<'_> {
    type Item = TrafficBucket;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.count {
            return None;
        }
        let index = self.next;
        self.next += 1;

        // Skip anything before this bucket; the store never returns such rows
        // but the series must stay monotonic regardless.
        while self.sums.next_if(|s| s.index < index).is_some() {}

        let (bytes_in, bytes_out) = match self.sums.next_if(|s| s.index == index) {
            Some(sum) => (sum.bytes_in, sum.bytes_out),
            None => (0, 0),
        };

        Some(TrafficBucket {
            time: self.origin + ChronoDuration::seconds(index * self.width),
            bytes_in,
            bytes_out,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.count - self.next).max(0) as usize;
        (left, Some(left))
    }
}

impl ExactSizeIterator for Buckets<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_truncate_to_window() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 56).unwrap();
        assert_eq!(
            truncate_to_window(dt, 60),
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 0).unwrap()
        );
        assert_eq!(
            truncate_to_window(dt, 3600),
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
        );
        assert_eq!(
            truncate_to_window(dt, 86400),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_and_widths() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        let hour = TimeRange::parse("1h", now).unwrap();
        assert_eq!(hour.bucket_secs(), 60);
        assert_eq!(hour.bucket_count(), 60);

        let day = TimeRange::parse("24h", now).unwrap();
        assert_eq!(day.bucket_secs(), 3600);
        assert_eq!(day.bucket_count(), 24);

        let week = TimeRange::parse("7d", now).unwrap();
        assert_eq!(week.bucket_secs(), 86400);

        assert_eq!(TimeRange::parse("30m", now).unwrap().bucket_count(), 30);
        assert!(TimeRange::parse("1w", now).is_err());
        assert!(TimeRange::parse("0h", now).is_err());
        assert!(TimeRange::parse("999d", now).is_err());
    }

    #[test]
    fn test_unaligned_range_covers_both_edges() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 30).unwrap();
        let range = TimeRange::new(start, start + ChronoDuration::hours(1)).unwrap();
        assert_eq!(range.origin(), Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        assert_eq!(range.bucket_count(), 61);
    }

    #[test]
    fn test_series_zero_fills_and_restarts() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let range = TimeRange::new(start, start + ChronoDuration::minutes(5)).unwrap();
        let series = TrafficSeries::new(
            EntityRef::advanced(1),
            range,
            vec![
                BucketSum { index: 1, bytes_in: 10, bytes_out: 1 },
                BucketSum { index: 3, bytes_in: 20, bytes_out: 2 },
            ],
        );

        let first: Vec<_> = series.iter().collect();
        assert_eq!(first.len(), 5);
        assert_eq!(
            first.iter().map(|b| b.bytes_in).collect::<Vec<_>>(),
            vec![0, 10, 0, 20, 0]
        );
        assert!(first.windows(2).all(|w| w[1].time - w[0].time == ChronoDuration::minutes(1)));

        let second: Vec<_> = series.iter().collect();
        assert_eq!(first, second);
        assert_eq!(series.totals(), (30, 3));
    }
}
