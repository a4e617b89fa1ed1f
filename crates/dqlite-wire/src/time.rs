//! ISO-8601 conversion for `Value::Timestamp`.
//!
//! dqlite sends DATETIME columns as ISO-8601 text. Timestamps are carried
//! as microseconds since the Unix epoch, always in UTC.

#![allow(clippy::cast_possible_truncation)]

const MICROS_PER_SEC: i64 = 1_000_000;
const SECS_PER_DAY: i64 = 86_400;

/// Format microseconds since the epoch as `YYYY-MM-DD HH:MM:SS.ffffff+00:00`.
pub fn format_timestamp(micros: i64) -> String {
    let secs = micros.div_euclid(MICROS_PER_SEC);
    let frac = micros.rem_euclid(MICROS_PER_SEC);
    let days = secs.div_euclid(SECS_PER_DAY);
    let tod = secs.rem_euclid(SECS_PER_DAY);
    let (y, m, d) = civil_from_days(days);
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}+00:00",
        y,
        m,
        d,
        tod / 3600,
        (tod / 60) % 60,
        tod % 60,
        frac
    )
}

/// Parse an ISO-8601 date or date-time into microseconds since the epoch.
///
/// Accepts `YYYY-MM-DD`, optionally followed by `T` or a space and
/// `HH:MM[:SS[.fraction]]`, optionally followed by `Z` or `+HH:MM`/`-HH:MM`.
/// Fractions beyond microseconds are truncated.
pub fn parse_timestamp(s: &str) -> Option<i64> {
    let s = s.trim();
    let (date, rest) = if s.len() > 10 {
        (s.get(0..10)?, s.get(10..)?)
    } else {
        (s, "")
    };
    let year: i64 = date.get(0..4)?.parse().ok()?;
    if date.as_bytes().get(4) != Some(&b'-') || date.as_bytes().get(7) != Some(&b'-') {
        return None;
    }
    let month: u32 = date.get(5..7)?.parse().ok()?;
    let day: u32 = date.get(8..10)?.parse().ok()?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    let mut micros = days_from_civil(year, month, day) * SECS_PER_DAY * MICROS_PER_SEC;
    if rest.is_empty() {
        return Some(micros);
    }

    let rest = rest.strip_prefix(['T', ' '])?;
    let (clock, offset) = split_offset(rest);
    let mut parts = clock.splitn(3, ':');
    let hour: i64 = parts.next()?.parse().ok()?;
    let minute: i64 = parts.next()?.parse().ok()?;
    let (second, fraction) = match parts.next() {
        Some(sec) => match sec.split_once('.') {
            Some((whole, frac)) => (whole.parse::<i64>().ok()?, parse_fraction(frac)?),
            None => (sec.parse::<i64>().ok()?, 0),
        },
        None => (0, 0),
    };
    if hour > 23 || minute > 59 || second > 60 {
        return None;
    }
    micros += ((hour * 60 + minute) * 60 + second) * MICROS_PER_SEC + fraction;
    micros -= offset? * 60 * MICROS_PER_SEC;
    Some(micros)
}

/// Split a trailing zone designator off a clock string, returning the
/// offset in minutes east of UTC.
fn split_offset(s: &str) -> (&str, Option<i64>) {
    if let Some(clock) = s.strip_suffix('Z') {
        return (clock, Some(0));
    }
    if let Some(pos) = s.rfind(['+', '-']) {
        let (clock, zone) = s.split_at(pos);
        let sign = if zone.starts_with('-') { -1 } else { 1 };
        let offset = zone[1..].split_once(':').and_then(|(h, m)| {
            let h: i64 = h.parse().ok()?;
            let m: i64 = m.parse().ok()?;
            Some(sign * (h * 60 + m))
        });
        return (clock, offset);
    }
    (s, Some(0))
}

fn parse_fraction(frac: &str) -> Option<i64> {
    if frac.is_empty() || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let digits: String = frac.chars().chain(std::iter::repeat('0')).take(6).collect();
    digits.parse().ok()
}

/// Days since 1970-01-01 for a proleptic Gregorian date.
fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y.rem_euclid(400);
    let m = i64::from(month);
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + i64::from(day) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Proleptic Gregorian date for a count of days since 1970-01-01.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}
