/// Return the current UTC timestamp in ISO 8601 format.
pub fn utc_now() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Current epoch time in whole seconds.
pub fn epoch_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Compact timestamp suitable for file suffixes (no separators).
pub fn file_stamp() -> String {
    chrono::Utc::now().format("%Y%m%d%H%M%S").to_string()
}
