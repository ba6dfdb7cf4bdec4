use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Hands out transaction ids for outbound requests.
/// Ids increment and wrap from 0xFFFF to 1 (0 is skipped).
pub struct XidGenerator {
    // Stores the NEXT id to return
    next: AtomicU16,
}

impl XidGenerator {
    pub fn new() -> Self {
        // Seed from the clock so restarted agents do not reuse recent ids.
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        Self::starting_at((nanos % 0xFFFF) as u16)
    }

    pub fn starting_at(seed: u16) -> Self {
        XidGenerator {
            next: AtomicU16::new(if seed == 0 { 1 } else { seed }),
        }
    }

    pub fn next_xid(&self) -> u16 {
        let previous = self
            .next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(if current == 0xFFFF { 1 } else { current + 1 })
            })
            .unwrap_or(1);
        if previous == 0 { 1 } else { previous }
    }
}

impl Default for XidGenerator {
    fn default() -> Self {
        Self::new()
    }
}
