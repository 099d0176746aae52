//! Usage: Wall-clock helpers for wire timestamps and trace ids.

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock seconds since the epoch; 0 if the clock is before it.
pub(crate) fn now_unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_and_seconds_agree() {
        let secs = now_unix_seconds();
        let millis = now_unix_millis();
        assert!(secs > 0);
        assert!(millis / 1000 >= secs);
        assert!(millis / 1000 - secs <= 1);
    }
}
