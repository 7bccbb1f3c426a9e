//! HTTP date handling.
//!
//! Outgoing dates use the IMF-fixdate form (`Sun, 06 Nov 1994 08:49:37 GMT`).
//! Incoming dates additionally accept the obsolete RFC 850 and asctime forms.
//! HTTP dates carry whole seconds, so comparisons against file timestamps go
//! through [`truncate_to_seconds`].

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

const IMF_FIXDATE: &str = "%a, %d %b %Y %H:%M:%S GMT";
const RFC850_DATE: &str = "%A, %d-%b-%y %H:%M:%S GMT";
const ASCTIME_DATE: &str = "%a %b %d %H:%M:%S %Y";

/// Format a timestamp as an IMF-fixdate.
pub fn format_http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).format(IMF_FIXDATE).to_string()
}

/// Parse any of the three HTTP date forms.
///
/// Returns `None` for anything unparseable; a bad conditional header is
/// treated as absent.
pub fn parse_http_date(value: &str) -> Option<SystemTime> {
    let value = value.trim();

    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date.with_timezone(&Utc).into());
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(value, RFC850_DATE) {
        return Some(Utc.from_utc_datetime(&naive).into());
    }

    // asctime pads single-digit days with a space
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&collapsed, ASCTIME_DATE)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive).into())
}

/// Drop sub-second precision.
pub fn truncate_to_seconds(time: SystemTime) -> SystemTime {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => UNIX_EPOCH + Duration::from_secs(elapsed.as_secs()),
        Err(_) => time,
    }
}
