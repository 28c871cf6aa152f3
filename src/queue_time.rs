use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

const QUEUE_HEADERS: [&str; 2] = ["X-Request-Start", "X-Queue-Start"];
const INTERMEDIARY_PREFIX: &str = "x-newrelic-timestamp-";

// Sanity window for frontend timestamps: Jan-2000 .. Jan-2050.
const EARLIEST_SECS: f64 = 946_684_800.0;
const LATEST_SECS: f64 = 2_524_608_000.0;

/// Time spent queued in front of the application, derived from frontend
/// headers, plus any named per-intermediary marks.
#[derive(Debug, Default)]
pub(crate) struct QueueTiming {
    pub duration: Duration,
    pub intermediaries: Vec<(String, Duration)>,
}

/// Parse a frontend mark: optional `t=` prefix, then a number whose unit is
/// guessed as microseconds, milliseconds or seconds — the first reading that
/// lands inside the sanity window wins.
fn parse_mark(value: &str) -> Option<DateTime<Utc>> {
    let raw = value.trim().strip_prefix("t=").unwrap_or(value.trim());
    let number: f64 = raw.parse().ok()?;
    for divisor in [1e6, 1e3, 1.0] {
        let secs = number / divisor;
        if (EARLIEST_SECS..LATEST_SECS).contains(&secs) {
            let micros = (secs * 1e6) as i64;
            return DateTime::from_timestamp_micros(micros);
        }
    }
    None
}

fn since(mark: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - mark).to_std().unwrap_or(Duration::ZERO)
}

pub(crate) fn parse_queue_times(headers: &HashMap<String, String>, now: DateTime<Utc>) -> QueueTiming {
    let mut timing = QueueTiming::default();

    let mut earliest: Option<DateTime<Utc>> = None;
    for (name, value) in headers {
        if QUEUE_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name)) {
            if let Some(mark) = parse_mark(value) {
                earliest = Some(match earliest {
                    Some(current) if current <= mark => current,
                    _ => mark,
                });
            }
        } else if let Some(intermediary) = strip_prefix_ignore_case(name, INTERMEDIARY_PREFIX) {
            if let Some(mark) = parse_mark(value) {
                timing
                    .intermediaries
                    .push((intermediary.to_string(), since(mark, now)));
            }
        }
    }
    if let Some(mark) = earliest {
        timing.duration = since(mark, now);
    }
    timing
}

fn strip_prefix_ignore_case<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    if name.len() >= prefix.len()
        && name.is_char_boundary(prefix.len())
        && name[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        Some(&name[prefix.len()..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_577_836_800, 0).unwrap() // 2020-01-01
    }

    #[test]
    fn parses_seconds_millis_micros() {
        let base = 1_577_836_790.0; // ten seconds before `now`
        for (value, label) in [
            (format!("{base}"), "seconds"),
            (format!("{}", base * 1e3), "millis"),
            (format!("{}", base * 1e6), "micros"),
        ] {
            let t = parse_queue_times(&headers(&[("X-Request-Start", &value)]), now());
            assert_eq!(t.duration, Duration::from_secs(10), "unit {label}");
        }
    }

    #[test]
    fn t_prefix_and_queue_start_header() {
        let t = parse_queue_times(&headers(&[("X-Queue-Start", "t=1577836795")]), now());
        assert_eq!(t.duration, Duration::from_secs(5));
    }

    #[test]
    fn earliest_valid_mark_wins() {
        let t = parse_queue_times(
            &headers(&[
                ("X-Request-Start", "1577836795"),
                ("X-Queue-Start", "1577836780"),
            ]),
            now(),
        );
        assert_eq!(t.duration, Duration::from_secs(20));
    }

    #[test]
    fn nonsense_yields_zero() {
        for bad in ["", "t=", "banana", "12", "99999999999999999999"] {
            let t = parse_queue_times(&headers(&[("X-Request-Start", bad)]), now());
            assert_eq!(t.duration, Duration::ZERO, "value {bad:?}");
        }
    }

    #[test]
    fn future_marks_clamp_to_zero() {
        let t = parse_queue_times(&headers(&[("X-Request-Start", "1577836900")]), now());
        assert_eq!(t.duration, Duration::ZERO);
    }

    #[test]
    fn intermediary_headers_contribute_named_durations() {
        let t = parse_queue_times(
            &headers(&[
                ("X-Request-Start", "1577836790"),
                ("X-Newrelic-Timestamp-lb", "1577836792"),
                ("X-Newrelic-Timestamp-proxy", "t=1577836798"),
            ]),
            now(),
        );
        assert_eq!(t.duration, Duration::from_secs(10));
        let mut named = t.intermediaries.clone();
        named.sort();
        assert_eq!(
            named,
            vec![
                ("lb".to_string(), Duration::from_secs(8)),
                ("proxy".to_string(), Duration::from_secs(2)),
            ]
        );
    }
}
