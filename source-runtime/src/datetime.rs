//! Datetime parsing and formatting with strftime-style formats, plus
//! ISO-8601 durations with calendar months.

use anyhow::{anyhow, bail, Result};
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use std::fmt;

/// Formats tried after the declared ones when a value must be read as a
/// datetime (config start dates, record cursor fields).
const FALLBACK_FORMATS: [&str; 6] = [
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M:%S%.fZ",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d",
];

/// `%f` means microseconds in manifests; chrono spells that `%6f`.
fn translate(format: &str) -> String {
    format.replace("%f", "%6f")
}

/// Parse `value` with one strftime format. Accepts the epoch pseudo-formats
/// `%s`, `%ms` and `%s_as_float`.
pub fn parse_with_format(value: &str, format: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    match format {
        "%s" => return Utc.timestamp_opt(value.parse::<i64>().ok()?, 0).single(),
        "%ms" => return Utc.timestamp_millis_opt(value.parse::<i64>().ok()?).single(),
        "%s_as_float" => {
            let secs = value.parse::<f64>().ok()?;
            return Utc.timestamp_millis_opt((secs * 1000.0).round() as i64).single();
        }
        _ => {}
    }

    let format = translate(format);
    if let Ok(dt) = DateTime::parse_from_str(value, &format) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(value, &format) {
        return Some(Utc.from_utc_datetime(&ndt));
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, &format) {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    None
}

/// Parse with the declared formats first, then RFC 3339 and common shapes.
pub fn parse_datetime(value: &str, formats: &[String]) -> Option<DateTime<Utc>> {
    for format in formats {
        if let Some(dt) = parse_with_format(value, format) {
            return Some(dt);
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value.trim()) {
        return Some(dt.with_timezone(&Utc));
    }
    FALLBACK_FORMATS
        .iter()
        .find_map(|format| parse_with_format(value, format))
}

/// Read a JSON value as a datetime: strings are parsed, numbers are epoch
/// seconds (or milliseconds when a `%ms` format is declared).
pub fn value_to_datetime(value: &Value, formats: &[String]) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_datetime(s, formats),
        Value::Number(n) => {
            if formats.iter().any(|f| f == "%ms") {
                Utc.timestamp_millis_opt(n.as_i64()?).single()
            } else if let Some(secs) = n.as_i64() {
                Utc.timestamp_opt(secs, 0).single()
            } else {
                let secs = n.as_f64()?;
                Utc.timestamp_millis_opt((secs * 1000.0).round() as i64).single()
            }
        }
        _ => None,
    }
}

pub fn format_datetime(dt: &DateTime<Utc>, format: &str) -> Result<String> {
    match format {
        "%s" => return Ok(dt.timestamp().to_string()),
        "%ms" => return Ok(dt.timestamp_millis().to_string()),
        "%s_as_float" => return Ok((dt.timestamp_millis() as f64 / 1000.0).to_string()),
        _ => {}
    }
    let format = translate(format);
    if StrftimeItems::new(&format).any(|item| matches!(item, Item::Error)) {
        bail!("invalid datetime format '{}'", format);
    }
    Ok(dt.format(&format).to_string())
}

/// An ISO-8601 duration. Years and months are kept apart from the fixed part
/// so that `P1M` steps by calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoDuration {
    pub months: i32,
    pub fixed: Duration,
}

impl IsoDuration {
    pub fn zero() -> Self {
        Self {
            months: 0,
            fixed: Duration::zero(),
        }
    }

    pub fn from_fixed(fixed: Duration) -> Self {
        Self { months: 0, fixed }
    }

    pub fn is_zero(&self) -> bool {
        self.months == 0 && self.fixed.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.months > 0 || (self.months == 0 && self.fixed > Duration::zero())
    }

    pub fn negated(&self) -> Self {
        Self {
            months: -self.months,
            fixed: -self.fixed,
        }
    }

    /// Parse `[-]PnYnMnWnDTnHnMnS`; seconds may carry a fraction.
    pub fn parse(text: &str) -> Result<Self> {
        let raw = text.trim();
        let (negative, body) = match raw.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let body = body
            .strip_prefix('P')
            .ok_or_else(|| anyhow!("invalid ISO-8601 duration '{}'", text))?;
        if body.is_empty() || body == "T" {
            bail!("invalid ISO-8601 duration '{}'", text);
        }

        let (date_part, time_part) = match body.split_once('T') {
            Some((d, t)) => (d, Some(t)),
            None => (body, None),
        };

        let mut months: i64 = 0;
        let mut micros: f64 = 0.0;

        for (amount, unit) in components(date_part, text)? {
            match unit {
                'Y' => months += (amount * 12.0) as i64,
                'M' => months += amount as i64,
                'W' => micros += amount * 7.0 * 86_400e6,
                'D' => micros += amount * 86_400e6,
                _ => bail!("invalid ISO-8601 duration '{}'", text),
            }
        }
        if let Some(time_part) = time_part {
            if time_part.is_empty() {
                bail!("invalid ISO-8601 duration '{}'", text);
            }
            for (amount, unit) in components(time_part, text)? {
                match unit {
                    'H' => micros += amount * 3_600e6,
                    'M' => micros += amount * 60e6,
                    'S' => micros += amount * 1e6,
                    _ => bail!("invalid ISO-8601 duration '{}'", text),
                }
            }
        }

        let sign = if negative { -1 } else { 1 };
        Ok(Self {
            months: (months * sign) as i32,
            fixed: Duration::microseconds(micros.round() as i64 * sign),
        })
    }

    pub fn add_to(&self, dt: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let shifted = match self.months {
            0 => dt,
            m if m > 0 => dt.checked_add_months(Months::new(m as u32))?,
            m => dt.checked_sub_months(Months::new(m.unsigned_abs()))?,
        };
        shifted.checked_add_signed(self.fixed)
    }

    pub fn sub_from(&self, dt: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.negated().add_to(dt)
    }

    /// Round `dt` down to a multiple of this duration (epoch-aligned), or to
    /// the start of the month for calendar durations.
    pub fn floor(&self, dt: DateTime<Utc>) -> DateTime<Utc> {
        if self.months != 0 {
            return Utc
                .with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0)
                .single()
                .unwrap_or(dt);
        }
        match self.fixed.num_microseconds() {
            Some(step) if step > 0 => {
                let offset = dt.timestamp_micros().rem_euclid(step);
                dt - Duration::microseconds(offset)
            }
            _ => dt,
        }
    }
}

fn components(part: &str, original: &str) -> Result<Vec<(f64, char)>> {
    let mut out = Vec::new();
    let mut number = String::new();
    for c in part.chars() {
        if c.is_ascii_digit() || c == '.' || c == ',' {
            number.push(if c == ',' { '.' } else { c });
        } else {
            let amount: f64 = number
                .parse()
                .map_err(|_| anyhow!("invalid ISO-8601 duration '{}'", original))?;
            out.push((amount, c));
            number.clear();
        }
    }
    if !number.is_empty() {
        bail!("invalid ISO-8601 duration '{}'", original);
    }
    Ok(out)
}

impl fmt::Display for IsoDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return write!(f, "PT0S");
        }
        let negative = self.months < 0 || (self.months == 0 && self.fixed < Duration::zero());
        let months = self.months.unsigned_abs();
        let micros = self.fixed.num_microseconds().unwrap_or(0).unsigned_abs();
        let days = micros / 86_400_000_000;
        let rest = micros % 86_400_000_000;
        let hours = rest / 3_600_000_000;
        let minutes = rest % 3_600_000_000 / 60_000_000;
        let secs = rest % 60_000_000;

        if negative {
            write!(f, "-")?;
        }
        write!(f, "P")?;
        if months / 12 > 0 {
            write!(f, "{}Y", months / 12)?;
        }
        if months % 12 > 0 {
            write!(f, "{}M", months % 12)?;
        }
        if days > 0 {
            write!(f, "{}D", days)?;
        }
        if rest > 0 {
            write!(f, "T")?;
            if hours > 0 {
                write!(f, "{}H", hours)?;
            }
            if minutes > 0 {
                write!(f, "{}M", minutes)?;
            }
            if secs > 0 {
                if secs % 1_000_000 == 0 {
                    write!(f, "{}S", secs / 1_000_000)?;
                } else {
                    write!(f, "{}S", secs as f64 / 1e6)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_durations() {
        assert_eq!(IsoDuration::parse("P15D").unwrap().fixed, Duration::days(15));
        assert_eq!(IsoDuration::parse("PT1H30M").unwrap().fixed, Duration::minutes(90));
        assert_eq!(IsoDuration::parse("P1W").unwrap().fixed, Duration::days(7));
        assert_eq!(
            IsoDuration::parse("PT0.000001S").unwrap().fixed,
            Duration::microseconds(1)
        );
        let month = IsoDuration::parse("P1Y2M").unwrap();
        assert_eq!(month.months, 14);
        assert!(month.fixed.is_zero());
        assert_eq!(IsoDuration::parse("-P1D").unwrap().fixed, Duration::days(-1));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "P", "PT", "15D", "P1X", "P1", "PT1D"] {
            assert!(IsoDuration::parse(bad).is_err(), "{} should not parse", bad);
        }
    }

    #[test]
    fn test_calendar_months() {
        let step = IsoDuration::parse("P1M").unwrap();
        assert_eq!(step.add_to(utc(2024, 1, 31)), Some(utc(2024, 2, 29)));
        assert_eq!(step.sub_from(utc(2024, 3, 15)), Some(utc(2024, 2, 15)));
    }

    #[test]
    fn test_floor() {
        let day = IsoDuration::parse("P1D").unwrap();
        let dt = Utc.with_ymd_and_hms(2024, 9, 4, 13, 5, 0).unwrap();
        assert_eq!(day.floor(dt), utc(2024, 9, 4));
        let month = IsoDuration::parse("P1M").unwrap();
        assert_eq!(month.floor(dt), utc(2024, 9, 1));
    }

    #[test]
    fn test_display_round_trips() {
        for text in ["P15D", "PT1H", "P1M", "P1Y", "P1DT2H3M4S", "PT0S"] {
            assert_eq!(IsoDuration::parse(text).unwrap().to_string(), text);
        }
    }

    #[test]
    fn test_parse_datetime_formats() {
        let formats = vec!["%Y-%m-%d".to_string()];
        assert_eq!(parse_datetime("2024-07-10", &formats), Some(utc(2024, 7, 10)));
        assert_eq!(
            parse_datetime("2024-07-10T12:00:00.000+0000", &[]),
            Some(Utc.with_ymd_and_hms(2024, 7, 10, 12, 0, 0).unwrap())
        );
        assert_eq!(
            parse_datetime("2024-07-10T12:00:00Z", &[]),
            Some(Utc.with_ymd_and_hms(2024, 7, 10, 12, 0, 0).unwrap())
        );
        assert_eq!(
            parse_datetime("2024-07-10 12:00:00", &[]),
            Some(Utc.with_ymd_and_hms(2024, 7, 10, 12, 0, 0).unwrap())
        );
        assert_eq!(parse_datetime("yesterday", &formats), None);
    }

    #[test]
    fn test_epoch_formats() {
        let dt = utc(2024, 9, 10);
        assert_eq!(format_datetime(&dt, "%s").unwrap(), "1725926400");
        assert_eq!(format_datetime(&dt, "%ms").unwrap(), "1725926400000");
        assert_eq!(parse_with_format("1725926400", "%s"), Some(dt));
        assert_eq!(
            value_to_datetime(&serde_json::json!(1725926400), &[]),
            Some(dt)
        );
    }

    #[test]
    fn test_microsecond_format() {
        let dt = Utc.with_ymd_and_hms(2024, 9, 10, 1, 2, 3).unwrap();
        assert_eq!(
            format_datetime(&dt, "%Y-%m-%dT%H:%M:%S.%fZ").unwrap(),
            "2024-09-10T01:02:03.000000Z"
        );
        assert_eq!(
            parse_with_format("2024-09-10T01:02:03.000000Z", "%Y-%m-%dT%H:%M:%S.%fZ"),
            Some(dt)
        );
    }

    #[test]
    fn test_invalid_format_is_an_error() {
        assert!(format_datetime(&utc(2024, 1, 1), "%Q").is_err());
    }
}
