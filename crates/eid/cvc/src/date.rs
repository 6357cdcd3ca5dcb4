use time::{Date, Month};

use crate::{CvcError, Result};

/// Decode a six digit unpacked BCD date (`YYMMDD`, one digit per byte)
///
/// Years are interpreted in the 21st century.
pub fn decode_date(bytes: &[u8]) -> Result<Date> {
    let digits: [u8; 6] = bytes
        .try_into()
        .map_err(|_| CvcError::InvalidDate("expected six digits"))?;
    if digits.iter().any(|digit| *digit > 9) {
        return Err(CvcError::InvalidDate("digit out of range"));
    }

    let pair = |index: usize| digits[index] * 10 + digits[index + 1];
    let year = 2000 + i32::from(pair(0));
    let month = Month::try_from(pair(2)).map_err(|_| CvcError::InvalidDate("invalid month"))?;

    Date::from_calendar_date(year, month, pair(4))
        .map_err(|_| CvcError::InvalidDate("invalid day"))
}

/// Encode a date as six unpacked BCD digits
pub fn encode_date(date: Date) -> Result<[u8; 6]> {
    let year = date.year() - 2000;
    if !(0..100).contains(&year) {
        return Err(CvcError::InvalidDate("year outside 2000..2099"));
    }
    // range checked above
    let year = year as u8;
    let month = u8::from(date.month());
    let day = date.day();

    Ok([year / 10, year % 10, month / 10, month % 10, day / 10, day % 10])
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn decode_valid_dates() {
        assert_eq!(decode_date(&[1, 4, 0, 3, 2, 1]).unwrap(), date!(2014 - 03 - 21));
        assert_eq!(decode_date(&[2, 9, 1, 2, 3, 1]).unwrap(), date!(2029 - 12 - 31));
    }

    #[test]
    fn reject_invalid_dates() {
        assert!(decode_date(&[1, 4, 0, 3, 2]).is_err());
        assert!(decode_date(&[1, 4, 1, 3, 0, 1]).is_err());
        assert!(decode_date(&[1, 4, 0, 2, 3, 0]).is_err());
        assert!(decode_date(&[1, 0x0A, 0, 1, 0, 1]).is_err());
    }

    #[test]
    fn encode_matches_decode() {
        let day = date!(2025 - 07 - 04);
        let encoded = encode_date(day).unwrap();
        assert_eq!(encoded, [2, 5, 0, 7, 0, 4]);
        assert_eq!(decode_date(&encoded).unwrap(), day);
        assert!(encode_date(date!(1999 - 01 - 01)).is_err());
    }
}
