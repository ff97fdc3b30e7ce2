//! IRC wire codec and protocol helpers shared by the bouncer's upstream and
//! downstream sides.

pub mod ctcp;
pub mod isupport;
pub mod message;
pub mod modes;
pub mod numeric;
pub mod split;

pub use isupport::{CaseMapping, Isupport};
pub use message::{Message, MessageParseError, Prefix, Tag, MAX_MESSAGE_LEN};
pub use modes::{
    std_channel_modes, ChannelModeType, ChannelModes, ChannelStatus, Membership, Memberships,
    UserModes, STD_MEMBERSHIPS,
};

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

/// The server-time layout, as defined in the IRCv3 spec: UTC with
/// millisecond precision.
pub fn format_server_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_server_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Build a `server-time` tag for a message received at `t`
pub fn server_time_tag(t: DateTime<Utc>) -> Tag {
    Tag::new("time", Some(format_server_time(t)))
}

/// Millisecond-precision "now", for stamping inbound messages
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Timestamp helper for RPL_TOPICWHOTIME and friends
pub fn unix_time(t: DateTime<Utc>) -> i64 {
    t.timestamp()
}

/// Reconstruct a `DateTime` from a unix timestamp, clamping out-of-range
/// values to the epoch
pub fn from_unix_time(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_time_round_trip() {
        let t = Utc.with_ymd_and_hms(2021, 6, 1, 12, 30, 45).unwrap()
            + chrono::Duration::milliseconds(123);
        let formatted = format_server_time(t);
        assert_eq!(formatted, "2021-06-01T12:30:45.123Z");
        assert_eq!(parse_server_time(&formatted), Some(t));
    }
}
