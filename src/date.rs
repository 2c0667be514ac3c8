use anyhow::Context as _;
use anyhow::Result;
use anyhow::bail;
use chrono::DateTime;
use chrono::FixedOffset;
use chrono::Offset as _;
use chrono::Utc;

/// A timestamp with a UTC offset, parsed from either the git raw form
/// `<epoch-seconds> <+/-hhmm>` or RFC3339. Emission uses the raw form,
/// which is what fast-import streams carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Date(DateTime<FixedOffset>);

impl Date {
    pub fn from_epoch(seconds: i64, offset_seconds: i32) -> Result<Self> {
        let offset = FixedOffset::east_opt(offset_seconds)
            .with_context(|| format!("UTC offset {offset_seconds}s out of range"))?;
        let utc = DateTime::from_timestamp(seconds, 0)
            .with_context(|| format!("timestamp {seconds} out of range"))?;
        Ok(Date(utc.with_timezone(&offset)))
    }

    /// Parses `<epoch> <+/-hhmm>` or an RFC3339 timestamp.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some((epoch, offset)) = s.split_once(' ') {
            let seconds: i64 = epoch
                .parse()
                .with_context(|| format!("bad epoch seconds {epoch:?}"))?;
            return Self::from_epoch(seconds, parse_hhmm_offset(offset)?);
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(Date(dt));
        }
        bail!("undecipherable date {s:?}");
    }

    pub fn timestamp(&self) -> i64 {
        self.0.timestamp()
    }

    pub fn offset_seconds(&self) -> i32 {
        self.0.offset().fix().local_minus_utc()
    }

    /// Git raw form, e.g. `1600000000 +0000`.
    pub fn raw(&self) -> String {
        let offset = self.offset_seconds();
        let sign = if offset < 0 { '-' } else { '+' };
        let abs = offset.abs();
        format!(
            "{} {}{:02}{:02}",
            self.0.timestamp(),
            sign,
            abs / 3600,
            (abs % 3600) / 60
        )
    }

    pub fn rfc3339(&self) -> String {
        self.0.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    }

    /// The UTC ISO8601 form used in action stamps, e.g. `2020-09-13T12:26:40Z`.
    pub fn utc_iso(&self) -> String {
        self.0
            .with_timezone(&Utc)
            .format("%Y-%m-%dT%H:%M:%SZ")
            .to_string()
    }

    /// The calendar day in UTC, e.g. `2020-09-13`, for date-valued selection
    /// terms.
    pub fn utc_day(&self) -> String {
        self.0.with_timezone(&Utc).format("%Y-%m-%d").to_string()
    }

    /// Svn dump property form, e.g. `2020-09-13T12:26:40.000000Z`.
    pub fn svn_form(&self) -> String {
        self.0
            .with_timezone(&Utc)
            .format("%Y-%m-%dT%H:%M:%S.%6fZ")
            .to_string()
    }

    /// Parses the `svn:date` property form (RFC3339 with fractional seconds
    /// and a literal Z).
    pub fn parse_svn(s: &str) -> Result<Self> {
        let dt = DateTime::parse_from_rfc3339(s)
            .with_context(|| format!("undecipherable svn date {s:?}"))?;
        // Subversion dates are UTC; drop sub-second precision, which gitspace
        // cannot carry.
        let seconds = dt.timestamp();
        Self::from_epoch(seconds, 0)
    }

    pub fn with_offset(&self, offset_seconds: i32) -> Result<Self> {
        Self::from_epoch(self.timestamp(), offset_seconds)
    }
}

impl std::fmt::Display for Date {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw())
    }
}

fn parse_hhmm_offset(s: &str) -> Result<i32> {
    let (sign, digits) = match s.as_bytes().first() {
        Some(b'+') => (1, &s[1..]),
        Some(b'-') => (-1, &s[1..]),
        _ => bail!("bad UTC offset {s:?}"),
    };
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        bail!("bad UTC offset {s:?}");
    }
    let hours: i32 = digits[..2].parse()?;
    let minutes: i32 = digits[2..].parse()?;
    if minutes >= 60 {
        bail!("bad UTC offset minutes in {s:?}");
    }
    Ok(sign * (hours * 3600 + minutes * 60))
}

/// Composes the `<ISO8601-UTC>!<email>` action stamp that identifies a
/// commit or tag independently of marks.
pub fn action_stamp(date: &Date, email: &str) -> String {
    format!("{}!{}", date.utc_iso(), email)
}

/// Splits an action stamp into its date, email and optional `#N` collision
/// ordinal.
pub fn parse_action_stamp(stamp: &str) -> Result<(Date, String, Option<usize>)> {
    let Some((date_part, rest)) = stamp.split_once('!') else {
        bail!("action stamp {stamp:?} lacks a '!' separator");
    };
    let date = Date::parse(date_part)?;
    let (email, ordinal) = match rest.rsplit_once('#') {
        Some((email, n)) if n.bytes().all(|b| b.is_ascii_digit()) && !n.is_empty() => {
            (email.to_owned(), Some(n.parse()?))
        }
        _ => (rest.to_owned(), None),
    };
    Ok((date, email, ordinal))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_raw() {
        let date = Date::parse("1600000000 +0100").unwrap();
        assert_eq!(date.timestamp(), 1600000000);
        assert_eq!(date.offset_seconds(), 3600);
        assert_eq!(date.raw(), "1600000000 +0100");
    }

    #[test]
    fn test_parse_negative_offset() {
        let date = Date::parse("1600000000 -0730").unwrap();
        assert_eq!(date.offset_seconds(), -(7 * 3600 + 30 * 60));
        assert_eq!(date.raw(), "1600000000 -0730");
    }

    #[test]
    fn test_parse_rfc3339() {
        let date = Date::parse("2020-09-13T12:26:40+00:00").unwrap();
        assert_eq!(date.timestamp(), 1600000000);
        assert_eq!(date.utc_iso(), "2020-09-13T12:26:40Z");
    }

    #[test]
    fn test_parse_garbage() {
        assert!(Date::parse("yesterday").is_err());
        assert!(Date::parse("1600000000 0100").is_err());
        assert!(Date::parse("1600000000 +01000").is_err());
    }

    #[test]
    fn test_svn_date() {
        let date = Date::parse_svn("2020-09-13T12:26:40.123456Z").unwrap();
        assert_eq!(date.timestamp(), 1600000000);
        assert_eq!(date.svn_form(), "2020-09-13T12:26:40.000000Z");
    }

    #[test]
    fn test_action_stamp_round_trip() {
        let date = Date::parse("1600000000 +0000").unwrap();
        let stamp = action_stamp(&date, "a@x");
        assert_eq!(stamp, "2020-09-13T12:26:40Z!a@x");
        let (parsed, email, ordinal) = parse_action_stamp(&stamp).unwrap();
        assert_eq!(parsed.timestamp(), 1600000000);
        assert_eq!(email, "a@x");
        assert_eq!(ordinal, None);

        let (_, email, ordinal) = parse_action_stamp("2020-09-13T12:26:40Z!a@x#2").unwrap();
        assert_eq!(email, "a@x");
        assert_eq!(ordinal, Some(2));
    }
}
