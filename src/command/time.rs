use chrono::NaiveDate;

/// Substituted for a time field that failed its shape check.
pub const TIME_SENTINEL: &str = "00:00";

/// Accept `HH:MM` or `H:MM` on a 24-hour clock and return the zero-padded form.
pub fn normalize_time(raw: &str) -> Option<String> {
    let (hours, minutes) = raw.trim().split_once(':')?;
    if hours.is_empty()
        || hours.len() > 2
        || minutes.len() != 2
        || !hours.bytes().all(|b| b.is_ascii_digit())
        || !minutes.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    let h: u32 = hours.parse().ok()?;
    let m: u32 = minutes.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(format!("{h:02}:{m:02}"))
}

/// Strict `YYYY-MM-DD` that is also a real calendar date.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let shaped = raw.len() == 10
        && raw.bytes().enumerate().all(|(i, b)| match i {
            4 | 7 => b == b'-',
            _ => b.is_ascii_digit(),
        });
    if !shaped {
        return None;
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

/// Minutes since midnight of a well-formed `HH:MM`.
pub fn minutes_of_day(hhmm: &str) -> Option<u32> {
    let normalized = normalize_time(hhmm)?;
    let (h, m) = normalized.split_once(':')?;
    Some(h.parse::<u32>().ok()? * 60 + m.parse::<u32>().ok()?)
}

/// Worked minutes between two times minus the break, never negative.
pub fn worked_minutes(start: &str, end: &str, break_minutes: u32) -> Option<u32> {
    let span = minutes_of_day(end)?.saturating_sub(minutes_of_day(start)?);
    Some(span.saturating_sub(break_minutes))
}

pub fn worked_hours(start: &str, end: &str, break_minutes: u32) -> Option<f64> {
    worked_minutes(start, end, break_minutes).map(|m| f64::from(m) / 60.0)
}
