use std::sync::atomic::{AtomicU64, Ordering};

/// Allocator for exchange identity and display ordering.
///
/// `new_id` values are unique for the process lifetime (allocation counter
/// plus a random suffix; they need not be unpredictable). `next_seq` values
/// are dense and strictly increasing, even under concurrent callers.
#[derive(Debug, Default)]
pub struct ExchangeIds {
    counter: AtomicU64,
    seq: AtomicU64,
}

impl ExchangeIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a process-unique exchange id.
    pub fn new_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{:06x}-{:08x}", n, rand::random::<u32>())
    }

    /// Allocate the next display sequence number, starting at 1.
    ///
    /// Gaps may be observed when an exchange is allocated and then dropped
    /// or excluded before display.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }
}
