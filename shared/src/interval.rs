use chrono::{DateTime, Utc};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Half-open instant range `[start, stop)`.
///
/// This is the duration attached to every normalized usage event. It prints
/// in the same text form Postgres uses for a `tstzrange`, e.g.
/// `["2001-01-01 00:00:00+00","2001-01-01 01:00:00+00")`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
}

impl Interval {
    pub fn new(start: DateTime<Utc>, stop: DateTime<Utc>) -> Self {
        Interval { start, stop }
    }

    /// An interval where `stop <= start` contains no instants.
    pub fn is_empty(&self) -> bool {
        self.stop <= self.start
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.stop && other.start < self.stop
    }

    /// Intersection with `window`, or `None` when the ranges share no instant.
    pub fn clip(&self, window: &Interval) -> Option<Interval> {
        let clipped = Interval {
            start: self.start.max(window.start),
            stop: self.stop.min(window.stop),
        };
        if clipped.is_empty() {
            None
        } else {
            Some(clipped)
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.stop
    }

    /// Whole seconds between start and stop.
    pub fn seconds(&self) -> i64 {
        (self.stop - self.start).num_seconds()
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[\"{}\",\"{}\")",
            self.start.format("%Y-%m-%d %H:%M:%S+00"),
            self.stop.format("%Y-%m-%d %H:%M:%S+00"),
        )
    }
}

impl std::str::FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = s
            .strip_prefix("[\"")
            .and_then(|rest| rest.strip_suffix("\")"))
            .ok_or_else(|| format!("not a half-open interval: {s}"))?;
        let (start, stop) = inner
            .split_once("\",\"")
            .ok_or_else(|| format!("not a half-open interval: {s}"))?;
        let parse = |part: &str| {
            DateTime::parse_from_str(part, "%Y-%m-%d %H:%M:%S%#z")
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| format!("bad instant {part:?} in interval: {e}"))
        };
        Ok(Interval {
            start: parse(start)?,
            stop: parse(stop)?,
        })
    }
}

impl Serialize for Interval {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(DeError::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn empty_when_stop_not_after_start() {
        let t = Utc.with_ymd_and_hms(2001, 1, 1, 0, 0, 0).unwrap();
        assert!(Interval::new(t, t).is_empty());
        assert!(Interval::new(t + chrono::Duration::hours(1), t).is_empty());
        assert!(!Interval::new(t, t + chrono::Duration::seconds(1)).is_empty());
    }

    #[test]
    fn clip_to_window() {
        let iv = Interval::new(at("2001-01-01T00:00:00Z"), at("2001-03-01T00:00:00Z"));
        let window = Interval::new(at("2001-02-01T00:00:00Z"), at("2001-04-01T00:00:00Z"));
        let clipped = iv.clip(&window).unwrap();
        assert_eq!(clipped.start, at("2001-02-01T00:00:00Z"));
        assert_eq!(clipped.stop, at("2001-03-01T00:00:00Z"));

        let disjoint = Interval::new(at("2002-01-01T00:00:00Z"), at("2002-02-01T00:00:00Z"));
        assert!(iv.clip(&disjoint).is_none());
    }

    #[test]
    fn adjacent_intervals_do_not_overlap() {
        let a = Interval::new(at("2001-01-01T00:00:00Z"), at("2001-01-01T01:00:00Z"));
        let b = Interval::new(at("2001-01-01T01:00:00Z"), at("2001-01-01T02:00:00Z"));
        assert!(!a.overlaps(&b));
        assert!(!b.overlaps(&a));
    }

    #[test]
    fn renders_like_a_tstzrange() {
        let iv = Interval::new(at("2001-01-01T00:00:00Z"), at("2001-01-01T01:00:00Z"));
        assert_eq!(
            iv.to_string(),
            "[\"2001-01-01 00:00:00+00\",\"2001-01-01 01:00:00+00\")"
        );
        let parsed: Interval = iv.to_string().parse().unwrap();
        assert_eq!(parsed, iv);
    }

    #[test]
    fn seconds_spans_the_range() {
        let iv = Interval::new(at("2001-01-01T00:00:00Z"), at("2001-01-01T01:00:00Z"));
        assert_eq!(iv.seconds(), 3600);
    }
}
