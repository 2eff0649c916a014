/// Log formatting helpers
use time::{format_description, OffsetDateTime};

/// Day-first rendering of a timestamp for the shutdown log line,
/// e.g. `14.11.2023 - 22:13:20`. Uses `Display` when the format cannot be applied.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    match format_description::parse("[day].[month].[year] - [hour]:[minute]:[second]") {
        Ok(format) => dt.format(&format).unwrap_or_else(|_| dt.to_string()),
        Err(_) => dt.to_string(),
    }
}
