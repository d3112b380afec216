//! Little helpers to decode on-disk fields from byte buffers.
//!
//! The integer readers index a slice the caller already sized for the structure
//! being decoded; they panic if the slice is too short.

use chrono::{DateTime, NaiveDate, NaiveDateTime};

/// Extracts a little-endian 32-bit unsigned integer from a buffer at a given offset.
///
/// # Panics
///
/// Panics if the slice does not contain enough bytes starting from the offset.
pub fn u32_at(buffer: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(
        buffer[offset..offset + 4]
            .try_into()
            .expect("invalid slice"),
    )
}

/// Extracts a little-endian 16-bit unsigned integer from a buffer at a given offset.
///
/// # Panics
///
/// Panics if the slice does not contain enough bytes starting from the offset.
pub fn u16_at(buffer: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(
        buffer[offset..offset + 2]
            .try_into()
            .expect("invalid slice"),
    )
}

/// Decodes a NUL- or space-padded single-byte string.
pub fn padded_str(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).trim_end().to_string()
}

/// Decodes UTF-16LE code units, stopping at the first NUL or 0xFFFF padding unit.
pub fn utf16_str(units: &[u16]) -> String {
    let end = units
        .iter()
        .position(|&u| u == 0x0000 || u == 0xFFFF)
        .unwrap_or(units.len());
    String::from_utf16_lossy(&units[..end])
}

/// Converts a FAT date/time pair into a timestamp.
///
/// `tenths` carries the 10 ms creation-time refinement (0..=199).
/// Returns `None` for an empty date or a field combination that is not a real date.
pub fn fat_datetime(date: u16, time: u16, tenths: u8) -> Option<NaiveDateTime> {
    if date == 0 {
        return None;
    }
    let day = (date & 0x1F) as u32;
    let month = ((date >> 5) & 0x0F) as u32;
    let year = ((date >> 9) & 0x7F) as i32 + 1980;
    let second = (time & 0x1F) as u32 * 2 + tenths as u32 / 100;
    let minute = ((time >> 5) & 0x3F) as u32;
    let hour = ((time >> 11) & 0x1F) as u32;
    let millis = (tenths as u32 % 100) * 10;

    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_milli_opt(hour, minute, second, millis)
}

/// Converts a Unix timestamp (seconds, plus optional nanoseconds) into a UTC timestamp.
///
/// Zero means "unset" on every filesystem handled here and yields `None`.
pub fn unix_datetime(seconds: i64, nanos: u32) -> Option<NaiveDateTime> {
    if seconds == 0 && nanos == 0 {
        return None;
    }
    DateTime::from_timestamp(seconds, nanos).map(|dt| dt.naive_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_readers_are_little_endian() {
        let buf = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert_eq!(u16_at(&buf, 0), 0x0201);
        assert_eq!(u32_at(&buf, 4), 0x0807_0605);
    }

    #[test]
    fn padded_strings() {
        assert_eq!(padded_str(b"NO NAME    "), "NO NAME");
        assert_eq!(padded_str(b"ext\0\0\0"), "ext");
    }

    #[test]
    fn utf16_stops_at_padding() {
        let units = [0x0061, 0x0062, 0x0000, 0xFFFF];
        assert_eq!(utf16_str(&units), "ab");
    }

    #[test]
    fn fat_timestamps() {
        // 2021-03-14 15:09:26
        let date = ((2021 - 1980) << 9) | (3 << 5) | 14;
        let time = (15 << 11) | (9 << 5) | 13;
        let ts = fat_datetime(date, time, 0).unwrap();
        assert_eq!(ts.to_string(), "2021-03-14 15:09:26");

        assert!(fat_datetime(0, time, 0).is_none());
        // Month 13 does not exist
        assert!(fat_datetime((41 << 9) | (13 << 5) | 1, 0, 0).is_none());
    }

    #[test]
    fn unix_timestamps() {
        assert!(unix_datetime(0, 0).is_none());
        assert_eq!(
            unix_datetime(86_400, 0).unwrap().to_string(),
            "1970-01-02 00:00:00"
        );
    }
}
