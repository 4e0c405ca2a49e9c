use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Utc};

/// Calendar-month arithmetic, always in UTC. Reference data versions and
/// consolidation are keyed to month starts, so these helpers are used by the
/// loader validation, the consolidator, and the version-split pricing logic.

/// First instant of the UTC month containing `t`.
pub fn month_start(t: DateTime<Utc>) -> DateTime<Utc> {
    utc_month(t.year(), t.month())
}

/// Whether `t` is exactly the first instant of a UTC month.
pub fn is_month_start(t: DateTime<Utc>) -> bool {
    t == month_start(t)
}

/// First instant of the month after the one containing `t`.
pub fn next_month(t: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = match t.month() {
        12 => (t.year() + 1, 1),
        m => (t.year(), m + 1),
    };
    utc_month(year, month)
}

/// Month starts of every calendar month fully contained in `[start, stop)`.
pub fn month_starts_within(
    start: DateTime<Utc>,
    stop: DateTime<Utc>,
) -> impl Iterator<Item = DateTime<Utc>> {
    let mut cursor = if is_month_start(start) {
        start
    } else {
        next_month(start)
    };
    std::iter::from_fn(move || {
        if next_month(cursor) > stop {
            return None;
        }
        let m = cursor;
        cursor = next_month(cursor);
        Some(m)
    })
}

/// Month starts for every month intersecting `[start, stop)`, including a
/// leading partial month.
pub fn months_touching(
    start: DateTime<Utc>,
    stop: DateTime<Utc>,
) -> impl Iterator<Item = DateTime<Utc>> {
    let mut cursor = month_start(start);
    std::iter::from_fn(move || {
        if cursor >= stop {
            return None;
        }
        let m = cursor;
        cursor = next_month(cursor);
        Some(m)
    })
}

/// The `date` key used for a month in the consolidation tables.
pub fn month_date(t: DateTime<Utc>) -> NaiveDate {
    month_start(t).date_naive()
}

fn utc_month(year: i32, month: u32) -> DateTime<Utc> {
    // Day 1 at midnight exists in every month, so the Option never misses.
    let date = NaiveDate::from_ymd_opt(year, month, 1)
        .expect("first day of month is a valid date");
    DateTime::from_naive_utc_and_offset(NaiveDateTime::new(date, NaiveTime::MIN), Utc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn month_start_truncates() {
        assert_eq!(month_start(at("2017-04-19T13:37:21Z")), at("2017-04-01T00:00:00Z"));
        assert_eq!(month_start(at("2017-04-01T00:00:00Z")), at("2017-04-01T00:00:00Z"));
    }

    #[test]
    fn month_alignment_checks() {
        assert!(is_month_start(at("2017-04-01T00:00:00Z")));
        assert!(!is_month_start(at("2017-04-04T00:00:00Z")));
        assert!(!is_month_start(at("2017-04-01T01:00:00Z")));
        assert!(!is_month_start(at("2017-04-01T00:01:00Z")));
        assert!(!is_month_start(at("2017-04-01T01:00:01Z")));
        // Midnight in a non-UTC zone is not a UTC month start.
        assert!(!is_month_start(
            "2017-04-01T00:00:00+01:00".parse::<DateTime<Utc>>().unwrap()
        ));
    }

    #[test]
    fn next_month_rolls_over_years() {
        assert_eq!(next_month(at("2019-12-15T10:00:00Z")), at("2020-01-01T00:00:00Z"));
        assert_eq!(next_month(at("2020-01-01T00:00:00Z")), at("2020-02-01T00:00:00Z"));
    }

    #[test]
    fn months_fully_within_a_range() {
        let months: Vec<_> =
            month_starts_within(at("2020-01-01T00:00:00Z"), at("2020-03-01T00:00:00Z")).collect();
        assert_eq!(months, vec![at("2020-01-01T00:00:00Z"), at("2020-02-01T00:00:00Z")]);

        // Partial leading and trailing months are skipped.
        let months: Vec<_> =
            month_starts_within(at("2020-01-15T00:00:00Z"), at("2020-03-20T00:00:00Z")).collect();
        assert_eq!(months, vec![at("2020-02-01T00:00:00Z")]);
    }

    #[test]
    fn months_touching_includes_partials() {
        let months: Vec<_> =
            months_touching(at("2020-01-15T00:00:00Z"), at("2020-02-10T00:00:00Z")).collect();
        assert_eq!(months, vec![at("2020-01-01T00:00:00Z"), at("2020-02-01T00:00:00Z")]);
    }
}
