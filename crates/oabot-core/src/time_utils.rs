/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Returns true when `expires_unix_ms` is absent or lies within `skew_ms` of `now_unix_ms`.
///
/// Token records treat a missing expiry as already expired so callers always
/// re-validate rather than trusting an unbounded credential.
pub fn is_expired_with_skew_ms(expires_unix_ms: Option<u64>, now_unix_ms: u64, skew_ms: u64) -> bool {
    match expires_unix_ms {
        Some(value) => now_unix_ms >= value.saturating_sub(skew_ms),
        None => true,
    }
}
