use chrono::{Datelike, NaiveDate, NaiveTime, Timelike};

use super::{EncodingError, Result};

/// Octet value meaning "any" in date and time fields
pub const UNSPECIFIED: u8 = 0xFF;

/// BACnet date. Fields keep their wire form so wildcard and special values
/// (odd/even months, last day of month) survive decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Date {
    /// Years since 1900
    pub year: u8,
    /// 1-12, 13 odd months, 14 even months
    pub month: u8,
    /// 1-31, 32 last day, 33 odd days, 34 even days
    pub day: u8,
    /// 1 Monday through 7 Sunday
    pub weekday: u8,
}

impl Date {
    pub const ANY: Date = Date {
        year: UNSPECIFIED,
        month: UNSPECIFIED,
        day: UNSPECIFIED,
        weekday: UNSPECIFIED,
    };

    /// Build a date from a calendar year (1900-2154)
    pub fn new(year: u16, month: u8, day: u8, weekday: u8) -> Result<Self> {
        if !(1900..=2154).contains(&year) {
            return Err(EncodingError::ValueOutOfRange(format!("year {}", year)));
        }
        Ok(Self {
            year: (year - 1900) as u8,
            month,
            day,
            weekday,
        })
    }

    /// Calendar year, `None` when unspecified
    pub fn calendar_year(&self) -> Option<u16> {
        (self.year != UNSPECIFIED).then(|| 1900 + self.year as u16)
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        [self.year, self.month, self.day, self.weekday]
    }

    pub fn decode_content(content: &[u8]) -> Result<Self> {
        match content {
            [year, month, day, weekday] => Ok(Self {
                year: *year,
                month: *month,
                day: *day,
                weekday: *weekday,
            }),
            _ => Err(EncodingError::InvalidLength {
                what: "date",
                length: content.len(),
            }),
        }
    }
}

impl TryFrom<NaiveDate> for Date {
    type Error = EncodingError;

    fn try_from(date: NaiveDate) -> Result<Self> {
        let year = u16::try_from(date.year())
            .map_err(|_| EncodingError::ValueOutOfRange(format!("year {}", date.year())))?;
        Date::new(
            year,
            date.month() as u8,
            date.day() as u8,
            date.weekday().number_from_monday() as u8,
        )
    }
}

impl TryFrom<Date> for NaiveDate {
    type Error = EncodingError;

    fn try_from(date: Date) -> Result<Self> {
        let year = date
            .calendar_year()
            .ok_or_else(|| EncodingError::ValueOutOfRange("unspecified year".into()))?;
        NaiveDate::from_ymd_opt(year as i32, date.month as u32, date.day as u32).ok_or_else(|| {
            EncodingError::ValueOutOfRange(format!(
                "{}-{}-{} is not a calendar date",
                year, date.month, date.day
            ))
        })
    }
}

/// BACnet time of day, 255 in any field means unspecified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Time {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub hundredths: u8,
}

impl Time {
    pub const ANY: Time = Time {
        hour: UNSPECIFIED,
        minute: UNSPECIFIED,
        second: UNSPECIFIED,
        hundredths: UNSPECIFIED,
    };

    pub fn new(hour: u8, minute: u8, second: u8, hundredths: u8) -> Self {
        Self {
            hour,
            minute,
            second,
            hundredths,
        }
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        [self.hour, self.minute, self.second, self.hundredths]
    }

    pub fn decode_content(content: &[u8]) -> Result<Self> {
        match content {
            [hour, minute, second, hundredths] => Ok(Self::new(*hour, *minute, *second, *hundredths)),
            _ => Err(EncodingError::InvalidLength {
                what: "time",
                length: content.len(),
            }),
        }
    }
}

impl From<NaiveTime> for Time {
    fn from(time: NaiveTime) -> Self {
        // Leap seconds report nanoseconds past 1e9.
        let hundredths = (time.nanosecond() / 10_000_000).min(99) as u8;
        Time::new(
            time.hour() as u8,
            time.minute() as u8,
            time.second() as u8,
            hundredths,
        )
    }
}

impl TryFrom<Time> for NaiveTime {
    type Error = EncodingError;

    fn try_from(time: Time) -> Result<Self> {
        let hundredths = if time.hundredths == UNSPECIFIED {
            0
        } else {
            time.hundredths as u32
        };
        NaiveTime::from_hms_milli_opt(
            time.hour as u32,
            time.minute as u32,
            time.second as u32,
            hundredths * 10,
        )
        .ok_or_else(|| EncodingError::ValueOutOfRange(format!("{:?} is not a time of day", time)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_from_chrono() {
        let date = Date::try_from(NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()).unwrap();
        assert_eq!(date.to_bytes(), [124, 3, 15, 5]);
        assert_eq!(date.calendar_year(), Some(2024));
        assert_eq!(
            NaiveDate::try_from(date).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
        );
    }

    #[test]
    fn test_wildcards() {
        assert_eq!(Date::ANY.calendar_year(), None);
        assert!(NaiveDate::try_from(Date::ANY).is_err());
        assert_eq!(Date::decode_content(&[0xFF; 4]).unwrap(), Date::ANY);
        assert!(NaiveTime::try_from(Time::ANY).is_err());
        assert!(Date::new(1899, 1, 1, 7).is_err());
    }

    #[test]
    fn test_time_conversions() {
        let time = Time::from(NaiveTime::from_hms_milli_opt(14, 30, 45, 500).unwrap());
        assert_eq!(time.to_bytes(), [14, 30, 45, 50]);
        assert_eq!(
            NaiveTime::try_from(time).unwrap(),
            NaiveTime::from_hms_milli_opt(14, 30, 45, 500).unwrap()
        );
        assert!(Time::decode_content(&[1, 2, 3]).is_err());
    }
}
