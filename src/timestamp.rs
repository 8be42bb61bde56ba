use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use time::OffsetDateTime;

const BUILD_ID_SALT_BITS: u32 = 32;
/// Stand-in for timeouts too large to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);
static BUILD_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// `20240131T235959Z`, used in directory names.
pub fn now_utc_compact() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

/// `2024-01-31T23:59:59.123Z`, used in records and events.
pub fn now_utc_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        now.millisecond()
    )
}

/// `start + timeout`, saturating at a deadline a century out.
pub fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

/// Sortable, unique-per-process build identifier.
pub fn generate_build_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let pid_component = (std::process::id() as u128) << (BUILD_ID_SALT_BITS - 16);
    let seq_component = (BUILD_ID_COUNTER.fetch_add(1, Ordering::Relaxed) as u128) & 0xFFFF;
    let entropy = (nanos << BUILD_ID_SALT_BITS) | pid_component | seq_component;
    let suffix = base62_encode_u128(entropy);
    let suffix = suffix.trim_start_matches('0');
    if suffix.is_empty() {
        return "0".to_string();
    }
    suffix.to_string()
}

fn base62_encode_u128(mut value: u128) -> String {
    const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut bytes = Vec::new();
    while value > 0 {
        let idx = (value % 62) as usize;
        bytes.push(ALPHABET[idx] as char);
        value /= 62;
    }
    bytes.iter().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_ids_are_unique_and_safe() {
        let a = generate_build_id();
        let b = generate_build_id();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn huge_timeouts_do_not_overflow_the_deadline() {
        let start = Instant::now();
        let deadline = deadline_after(start, Duration::from_secs(u64::MAX));
        assert!(deadline > start + Duration::from_secs(3600));
        assert_eq!(
            deadline_after(start, Duration::from_secs(5)),
            start + Duration::from_secs(5)
        );
    }

    #[test]
    fn compact_timestamp_shape() {
        let ts = now_utc_compact();
        assert_eq!(ts.len(), 16);
        assert!(ts.ends_with('Z'));
        assert_eq!(&ts[8..9], "T");
    }
}
