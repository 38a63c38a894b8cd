//! Conversions between the row timestamp type (`time::OffsetDateTime`)
//! and the cron math type (`chrono::DateTime<Utc>`).

use chrono::{DateTime, Utc};
use time::OffsetDateTime;

pub fn offset_to_utc(dt: OffsetDateTime) -> Option<DateTime<Utc>> {
    let seconds = dt.unix_timestamp();
    let nanos = dt.nanosecond();
    DateTime::<Utc>::from_timestamp(seconds, nanos)
}

pub fn utc_to_offset(dt: DateTime<Utc>) -> Option<OffsetDateTime> {
    let seconds = dt.timestamp();
    let nanos = dt.timestamp_subsec_nanos();
    let base = OffsetDateTime::from_unix_timestamp(seconds).ok()?;
    base.replace_nanosecond(nanos).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_preserve_the_instant() {
        let now = OffsetDateTime::now_utc();
        let chrono_now = offset_to_utc(now).expect("convertible");
        let back = utc_to_offset(chrono_now).expect("convertible");
        assert_eq!(back.unix_timestamp(), now.unix_timestamp());
        assert_eq!(back.nanosecond(), now.nanosecond());
    }
}
