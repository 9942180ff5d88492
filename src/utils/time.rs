use chrono::{DateTime, Local, TimeZone};

/// Marker that changes once per local wall-clock hour, e.g. `2018-07-04-13`.
pub fn day_hour_marker<Tz: TimeZone>(date: DateTime<Tz>) -> String {
    date.with_timezone(&Local).format("%Y-%m-%d-%H").to_string()
}

/// UTC offset of the local timezone, e.g. `+02:00`.
pub fn local_utc_offset() -> String {
    Local::now().offset().to_string()
}
