//! Debug instrumentation interface.
//!
//! The engines call a [`AllocProbe`] at allocation-lifecycle points; the
//! probe decides what to record. The production probe ([`NoProbe`]) does
//! nothing and reserves no guard bytes, so the hot path pays nothing.
//! [`RecordingProbe`] keeps a live-allocation map with trailing guard bytes
//! and is what the test suites install to detect stomps, double frees and
//! leaks. The probe's own lock is never held while an engine lock is taken.

use std::collections::HashMap;
use std::ptr::NonNull;

use parking_lot::Mutex;

/// Which sub-engine served an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocSource {
    Buckets,
    Tree,
}

/// Observer of allocation lifecycle events.
pub trait AllocProbe: Send + Sync {
    /// Extra bytes reserved after every payload for guard filling. The
    /// dispatcher includes this in every size it hands to the engines.
    fn guard_size(&self) -> usize {
        0
    }

    /// A payload of `size` bytes was handed out at `ptr`.
    fn on_alloc(&self, ptr: NonNull<u8>, size: usize, source: AllocSource);

    /// The payload at `ptr` is about to be returned to `source`.
    fn on_free(&self, ptr: *mut u8, source: AllocSource);

    /// A live pointer is about to be inspected or reused (realloc/resize/size).
    fn on_check(&self, _ptr: *mut u8) {}
}

/// Probe that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProbe;

impl AllocProbe for NoProbe {
    fn on_alloc(&self, _ptr: NonNull<u8>, _size: usize, _source: AllocSource) {}
    fn on_free(&self, _ptr: *mut u8, _source: AllocSource) {}
}

#[derive(Debug, Clone, Copy)]
struct ProbeRecord {
    size: usize,
    source: AllocSource,
    guard_byte: u8,
}

/// Probe that tracks every live allocation and fills/checks guard bytes.
///
/// Guard damage, double frees and source mismatches are fatal assertions:
/// they are invariant violations, not recoverable errors.
pub struct RecordingProbe {
    records: Mutex<HashMap<usize, ProbeRecord>>,
    guard_size: usize,
    next_guard: std::sync::atomic::AtomicU8,
}

impl RecordingProbe {
    pub fn new(guard_size: usize) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            guard_size,
            next_guard: std::sync::atomic::AtomicU8::new(0x5A),
        }
    }

    /// Number of live allocations.
    pub fn live_count(&self) -> usize {
        self.records.lock().len()
    }

    /// Snapshot of live allocations as `(address, size)`, for leak reports.
    pub fn live(&self) -> Vec<(usize, usize)> {
        self.records
            .lock()
            .iter()
            .map(|(&addr, record)| (addr, record.size))
            .collect()
    }

    /// Which engine served a live allocation.
    pub fn source_of(&self, ptr: *const u8) -> Option<AllocSource> {
        self.records
            .lock()
            .get(&(ptr as usize))
            .map(|record| record.source)
    }

    fn check_guard(&self, ptr: *mut u8, record: &ProbeRecord) {
        let mut expected = record.guard_byte;
        for i in 0..self.guard_size {
            // SAFETY: the engine reserved guard_size() bytes past the payload.
            let actual = unsafe { ptr.add(record.size + i).read() };
            assert!(
                actual == expected,
                "guard byte {i} stomped at {ptr:p}: {actual:#x} != {expected:#x}"
            );
            expected = expected.wrapping_add(1);
        }
    }
}

impl AllocProbe for RecordingProbe {
    fn guard_size(&self) -> usize {
        self.guard_size
    }

    fn on_alloc(&self, ptr: NonNull<u8>, size: usize, source: AllocSource) {
        let guard_byte = self
            .next_guard
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut byte = guard_byte;
        for i in 0..self.guard_size {
            // SAFETY: the engine reserved guard_size() bytes past the payload.
            unsafe { ptr.as_ptr().add(size + i).write(byte) };
            byte = byte.wrapping_add(1);
        }
        let previous = self.records.lock().insert(
            ptr.as_ptr() as usize,
            ProbeRecord {
                size,
                source,
                guard_byte,
            },
        );
        assert!(
            previous.is_none(),
            "allocator handed out a live address twice: {ptr:p}"
        );
    }

    fn on_free(&self, ptr: *mut u8, source: AllocSource) {
        let record = self
            .records
            .lock()
            .remove(&(ptr as usize))
            .unwrap_or_else(|| panic!("double free or foreign pointer: {ptr:p}"));
        assert!(
            record.source == source,
            "pointer {ptr:p} allocated by {:?} but freed towards {source:?}",
            record.source
        );
        self.check_guard(ptr, &record);
    }

    fn on_check(&self, ptr: *mut u8) {
        let records = self.records.lock();
        let record = records
            .get(&(ptr as usize))
            .unwrap_or_else(|| panic!("checked pointer is not live: {ptr:p}"));
        self.check_guard(ptr, record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_probe_tracks_lifecycle() {
        let probe = RecordingProbe::new(0);
        let mut payload = [0u8; 32];
        let ptr = NonNull::new(payload.as_mut_ptr()).unwrap();
        probe.on_alloc(ptr, 32, AllocSource::Buckets);
        assert_eq!(probe.live_count(), 1);
        assert_eq!(probe.live(), vec![(ptr.as_ptr() as usize, 32)]);
        probe.on_free(ptr.as_ptr(), AllocSource::Buckets);
        assert_eq!(probe.live_count(), 0);
    }

    #[test]
    fn test_guard_bytes_survive_payload_writes() {
        let probe = RecordingProbe::new(4);
        let mut block = [0u8; 20]; // 16 payload + 4 guard
        let ptr = NonNull::new(block.as_mut_ptr()).unwrap();
        probe.on_alloc(ptr, 16, AllocSource::Tree);
        // Writing the payload must not trip the guard.
        block[..16].fill(0xEE);
        probe.on_check(ptr.as_ptr());
        probe.on_free(ptr.as_ptr(), AllocSource::Tree);
    }

    #[test]
    #[should_panic(expected = "stomped")]
    fn test_guard_stomp_detected() {
        let probe = RecordingProbe::new(4);
        let mut block = [0u8; 12]; // 8 payload + 4 guard
        let ptr = NonNull::new(block.as_mut_ptr()).unwrap();
        probe.on_alloc(ptr, 8, AllocSource::Tree);
        block[9] = !block[9]; // stomp inside the guard area
        probe.on_free(ptr.as_ptr(), AllocSource::Tree);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_detected() {
        let probe = RecordingProbe::new(0);
        let mut payload = [0u8; 8];
        let ptr = NonNull::new(payload.as_mut_ptr()).unwrap();
        probe.on_alloc(ptr, 8, AllocSource::Buckets);
        probe.on_free(ptr.as_ptr(), AllocSource::Buckets);
        probe.on_free(ptr.as_ptr(), AllocSource::Buckets);
    }
}
