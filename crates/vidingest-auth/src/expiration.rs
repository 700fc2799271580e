//! IoT credential expiration parsing.
//!
//! Certificate-exchange endpoints report expirations as `YYYY-MM-DDTHH:MM:SSZ`
//! in UTC. The layout is checked position by position before the calendar
//! fields are handed to chrono, so separators and field widths are exact.

use chrono::{NaiveDateTime, TimeZone, Utc};

use crate::error::{AuthError, AuthResult};
use crate::time::{Timestamp, HUNDREDS_OF_NANOS_IN_A_SECOND};

/// chrono layout of an IoT expiration string.
pub const IOT_EXPIRATION_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
/// Exact length of an IoT expiration string.
pub const IOT_EXPIRATION_LEN: usize = 20;

/// Multiplier applied to the remaining lifetime of a fetched credential.
pub const EARLY_EXPIRATION_FACTOR: f64 = 1.0;

fn layout_matches(text: &[u8]) -> bool {
    text.len() == IOT_EXPIRATION_LEN
        && text.iter().enumerate().all(|(i, &b)| match i {
            4 | 7 => b == b'-',
            10 => b == b'T',
            13 | 16 => b == b':',
            19 => b == b'Z',
            _ => b.is_ascii_digit(),
        })
}

/// Convert an IoT expiration string into an absolute instant.
///
/// An expiration equal to `now` (at whole-second resolution) is accepted;
/// anything earlier fails with `IotExpirationOccursInPast`.
pub fn parse_iot_expiration(text: &str, now: Timestamp) -> AuthResult<Timestamp> {
    if text.is_empty() {
        return Err(AuthError::EmptyString);
    }

    let parsing_failed = || AuthError::IotExpirationParsingFailed {
        value: text.to_string(),
    };

    if !layout_matches(text.as_bytes()) {
        return Err(parsing_failed());
    }

    let naive =
        NaiveDateTime::parse_from_str(text, IOT_EXPIRATION_FORMAT).map_err(|_| parsing_failed())?;
    let expiration_secs = Utc.from_utc_datetime(&naive).timestamp();

    let now_secs = now.as_unix_secs();
    let remaining_secs = u64::try_from(expiration_secs)
        .ok()
        .and_then(|secs| secs.checked_sub(now_secs))
        .ok_or(AuthError::IotExpirationOccursInPast {
            expiration_secs,
            now_secs,
        })?;

    let remaining = (remaining_secs as f64
        * HUNDREDS_OF_NANOS_IN_A_SECOND as f64
        * EARLY_EXPIRATION_FACTOR) as u64;
    Ok(Timestamp::from_unix_secs(now_secs)
        .saturating_add(crate::time::units_to_duration(remaining)))
}
