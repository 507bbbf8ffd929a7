use arrayvec::ArrayString;
use core::fmt::Write;

/// Represents a timestamp in seconds since the epoch.
///
/// Also used for plain durations (uptime, cooldowns), which share the same
/// ISO 8601 duration rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timestamp {
    pub seconds: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimestampError {
    /// The timestamp is earlier than one already processed.
    OutOfOrder,
}

impl Timestamp {
    pub const fn from_seconds(seconds: u32) -> Self {
        Self { seconds }
    }

    /// Seconds elapsed between `earlier` and `self`.
    pub fn seconds_since(&self, earlier: Timestamp) -> Result<u32, TimestampError> {
        self.seconds
            .checked_sub(earlier.seconds)
            .ok_or(TimestampError::OutOfOrder)
    }

    /// Create an an ISO 8601 Duration string.
    pub fn create_iso8601_str(&self) -> ArrayString<32> {
        let (days, hours, minutes, remaining_seconds) = self.to_dhms();
        let mut result = ArrayString::<32>::new();
        // The longest value, "P49710DT6H28M15S", always fits.
        if days > 0 {
            let _ = write!(&mut result, "P{}D", days);
        } else {
            result.push_str("P0D");
        }
        if hours > 0 || minutes > 0 || remaining_seconds > 0 {
            let _ = write!(&mut result, "T{}H{}M{}S", hours, minutes, remaining_seconds);
        } else {
            result.push_str("T0S");
        }
        result
    }

    /// Converts seconds since the epoch to days, hours, minutes, and seconds.
    pub fn to_dhms(&self) -> (u32, u32, u32, u32) {
        let days = self.seconds / 86400;
        let seconds_of_day = self.seconds - days * 86400;
        let hours = seconds_of_day / 3600;
        let remaining_seconds = seconds_of_day - hours * 3600;
        let minutes = remaining_seconds / 60;
        let remaining_seconds = remaining_seconds - minutes * 60;
        (days, hours, minutes, remaining_seconds)
    }

    /// Parses an ISO 8601 Duration string and returns the number of days, hours, minutes, and seconds.
    /// Accepts the forms produced by `create_iso8601_str`.
    pub fn parse_duration(input: &str) -> Option<(u32, u32, u32, u32)> {
        let input = input.strip_prefix('P')?;
        let (days_str, rest) = input.split_once("DT")?;
        let days = days_str.parse().ok()?;
        if rest == "0S" {
            return Some((days, 0, 0, 0));
        }
        let (hours_str, rest) = rest.split_once('H')?;
        let (minutes_str, rest) = rest.split_once('M')?;
        let seconds_str = rest.strip_suffix('S')?;
        Some((
            days,
            hours_str.parse().ok()?,
            minutes_str.parse().ok()?,
            seconds_str.parse().ok()?
        ))
    }

    /// Parses an ISO 8601 Duration string into a total number of seconds.
    pub fn duration_from_iso8601(input: &str) -> Option<Timestamp> {
        let (days, hours, minutes, seconds) = Self::parse_duration(input)?;
        let total = days
            .checked_mul(86400)?
            .checked_add(hours.checked_mul(3600)?)?
            .checked_add(minutes.checked_mul(60)?)?
            .checked_add(seconds)?;
        Some(Timestamp { seconds: total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_dhms() {
        let ts = Timestamp { seconds: 93784 };
        assert_eq!(ts.to_dhms(), (1, 2, 3, 4));
    }

    #[test]
    fn test_create_iso8601_str() {
        let ts = Timestamp { seconds: 93784 };
        assert_eq!(ts.create_iso8601_str().as_str(), "P1DT2H3M4S");
        let ts = Timestamp { seconds: 0 };
        assert_eq!(ts.create_iso8601_str().as_str(), "P0DT0S");
        let ts = Timestamp { seconds: 300 };
        assert_eq!(ts.create_iso8601_str().as_str(), "P0DT0H5M0S");
    }

    #[test]
    fn test_parse_duration() {
        let parsed = Timestamp::parse_duration("P1DT2H3M4S");
        assert_eq!(parsed, Some((1, 2, 3, 4)));
        let parsed = Timestamp::parse_duration("P0DT0S");
        assert_eq!(parsed, Some((0, 0, 0, 0)));
        let parsed = Timestamp::parse_duration("P2DT3H4M5");
        assert_eq!(parsed, None); // Invalid format, missing seconds.
    }

    #[test]
    fn test_whole_days_parse_back() {
        let ts = Timestamp { seconds: 2 * 86400 };
        let text = ts.create_iso8601_str();
        assert_eq!(text.as_str(), "P2DT0S");
        assert_eq!(Timestamp::duration_from_iso8601(&text), Some(ts));
    }

    #[test]
    fn test_duration_from_iso8601() {
        assert_eq!(Timestamp::duration_from_iso8601("P0DT0H5M0S"), Some(Timestamp { seconds: 300 }));
        assert_eq!(Timestamp::duration_from_iso8601("P0DT0S"), Some(Timestamp { seconds: 0 }));
        assert_eq!(Timestamp::duration_from_iso8601("5 minutes"), None);
        // Overflows u32 seconds.
        assert_eq!(Timestamp::duration_from_iso8601("P50000DT0S"), None);
    }

    #[test]
    fn test_seconds_since() {
        let earlier = Timestamp { seconds: 100 };
        let later = Timestamp { seconds: 400 };
        assert_eq!(later.seconds_since(earlier), Ok(300));
        assert_eq!(later.seconds_since(later), Ok(0));
        assert_eq!(earlier.seconds_since(later), Err(TimestampError::OutOfOrder));
    }
}
