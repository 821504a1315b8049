/// Current Unix timestamp in seconds.
///
/// Falls back to 0 if the system clock is before the epoch, which only
/// happens on badly misconfigured hosts.
#[must_use]
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
