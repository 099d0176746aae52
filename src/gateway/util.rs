use std::sync::atomic::{AtomicU64, Ordering};
use crate::shared::clock::now_unix_millis;
use std::time::Duration;

static TRACE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Process-unique request id: start time in millis plus a sequence number.
pub(super) fn new_trace_id() -> String {
    let millis = now_unix_millis();
    let seq = TRACE_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("gw-{millis:x}-{seq:06x}")
}

pub(super) fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}
