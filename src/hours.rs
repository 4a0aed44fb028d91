//! Per-channel active-hour windows.
//!
//! A channel's `broadcast_hours` column holds a small spec string:
//!
//! ```text
//! "9-18"        09:00 through 18:59
//! "8,12,17"     three single hours
//! "22-2"        wraps midnight: 22, 23, 0, 1, 2
//! ""            never (fully blocked)
//! NULL          always (unrestricted)
//! ```
//!
//! Unparseable tokens are skipped one by one; a typo in one token never
//! disables the rest of the window.

use chrono::Timelike;
use std::collections::BTreeSet;

/// Parse a spec into the set of allowed hours (0..=23).
///
/// ```rust
/// use paper_relay::hours::parse_hours;
///
/// let hours: Vec<u8> = parse_hours("22-2").into_iter().collect();
/// assert_eq!(hours, vec![0, 1, 2, 22, 23]);
/// ```
pub fn parse_hours(spec: &str) -> BTreeSet<u8> {
    let mut hours = BTreeSet::new();

    for token in spec.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }

        match token.split_once('-') {
            Some((start, end)) => {
                let (Some(start), Some(end)) = (parse_hour(start), parse_hour(end)) else {
                    tracing::debug!(token, "ignoring invalid broadcast hours range");
                    continue;
                };
                if start <= end {
                    hours.extend(start..=end);
                } else {
                    hours.extend(start..=23);
                    hours.extend(0..=end);
                }
            }
            None => match parse_hour(token) {
                Some(hour) => {
                    hours.insert(hour);
                }
                None => tracing::debug!(token, "ignoring invalid broadcast hour"),
            },
        }
    }

    hours
}

fn parse_hour(text: &str) -> Option<u8> {
    text.trim().parse::<u8>().ok().filter(|h| *h <= 23)
}

/// Whether dispatch may run at `time` under `spec`.
///
/// `None` means no restriction. `Some("")` allows nothing.
pub fn is_allowed<T: Timelike>(spec: Option<&str>, time: &T) -> bool {
    match spec {
        None => true,
        Some(spec) => {
            let hour = time.hour() as u8;
            parse_hours(spec).contains(&hour)
        }
    }
}

/// Render an hour set in minimal comma/range notation.
///
/// Consecutive hours collapse into `a-b` ranges; ranges never wrap, so
/// `{0, 1, 22, 23}` renders as `"0-1,22-23"`.
pub fn format_hours(hours: &BTreeSet<u8>) -> String {
    let mut parts = Vec::new();
    let mut iter = hours.iter().copied().filter(|h| *h <= 23);

    let Some(first) = iter.next() else {
        return String::new();
    };
    let (mut start, mut prev) = (first, first);

    for hour in iter {
        if hour == prev + 1 {
            prev = hour;
            continue;
        }
        parts.push(render_run(start, prev));
        start = hour;
        prev = hour;
    }
    parts.push(render_run(start, prev));

    parts.join(",")
}

fn render_run(start: u8, end: u8) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{}-{}", start, end)
    }
}

/// Canonical form of a spec: `format_hours(parse_hours(spec))`.
pub fn canonical(spec: &str) -> String {
    format_hours(&parse_hours(spec))
}
