//! Device memory accounting, per spec.md §6: `Stats::mem_alloc(bytes)` /
//! `mem_free(bytes)` counters.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Stats {
    used: AtomicU64,
    peak: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mem_alloc(&self, bytes: u64) {
        let now = self.used.fetch_add(bytes, Ordering::AcqRel) + bytes;
        self.peak.fetch_max(now, Ordering::AcqRel);
    }

    pub fn mem_free(&self, bytes: u64) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }

    pub fn mem_used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn mem_peak(&self) -> u64 {
        self.peak.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_used_and_peak() {
        let stats = Stats::new();
        stats.mem_alloc(100);
        stats.mem_alloc(50);
        assert_eq!(stats.mem_used(), 150);
        assert_eq!(stats.mem_peak(), 150);
        stats.mem_free(120);
        assert_eq!(stats.mem_used(), 30);
        assert_eq!(stats.mem_peak(), 150);
    }
}
