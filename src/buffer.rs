//! Synchronized-reading data model and the coordinator's sample buffer
//! (spec.md §3, §4.F, §5).

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::provider::EnergyReading;

/// One coordinator tick: every active provider's reading, time-aligned and
/// cross-validated.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SynchronizedReading {
    pub common_timestamp_ns: u64,
    pub readings: Vec<EnergyReading>,

    /// Sum over providers flagged disjoint in the coordinator's configuration.
    pub total_system_power_watts: f64,
    pub total_system_energy_joules: f64,

    pub providers_active: Vec<String>,
    pub providers_failed: Vec<String>,
    pub temporal_alignment_valid: bool,
    pub max_provider_uncertainty: f64,

    pub cross_validation_passed: bool,
    pub max_provider_deviation: f64,
}

/// Circular buffer of [`SynchronizedReading`]s, single writer (the sampler
/// thread), read via a consistent copy-out snapshot at correlation time
/// (spec.md §4.F: "reads for the correlator take a consistent snapshot
/// (copy-out under a short lock ...)").
///
/// Readings are appended in strictly increasing `common_timestamp_ns`
/// (spec.md §5); [`SampleBuffer::push`] panics if that invariant would be
/// violated, since it would indicate a coordinator bug, not a runtime
/// condition callers can recover from.
pub struct SampleBuffer {
    capacity: usize,
    inner: Mutex<VecDeque<SynchronizedReading>>,
}

impl SampleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    /// Appends a reading, evicting the oldest slot if the buffer is full.
    pub fn push(&self, reading: SynchronizedReading) {
        let mut buf = self.inner.lock().expect("sample buffer lock poisoned");
        if let Some(last) = buf.back() {
            assert!(
                reading.common_timestamp_ns > last.common_timestamp_ns,
                "sample buffer timestamps must strictly increase: {} is not > {}",
                reading.common_timestamp_ns,
                last.common_timestamp_ns
            );
        }
        if buf.len() == self.capacity {
            buf.pop_front();
        }
        buf.push_back(reading);
    }

    /// A consistent, ordered snapshot of the buffer's current contents.
    pub fn snapshot(&self) -> Vec<SynchronizedReading> {
        let buf = self.inner.lock().expect("sample buffer lock poisoned");
        buf.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("sample buffer lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading_at(ts: u64) -> SynchronizedReading {
        SynchronizedReading {
            common_timestamp_ns: ts,
            readings: Vec::new(),
            total_system_power_watts: 0.0,
            total_system_energy_joules: 0.0,
            providers_active: Vec::new(),
            providers_failed: Vec::new(),
            temporal_alignment_valid: true,
            max_provider_uncertainty: 0.0,
            cross_validation_passed: true,
            max_provider_deviation: 0.0,
        }
    }

    #[test]
    fn evicts_oldest_when_full() {
        let buf = SampleBuffer::new(2);
        buf.push(reading_at(1));
        buf.push(reading_at(2));
        buf.push(reading_at(3));
        let snap = buf.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].common_timestamp_ns, 2);
        assert_eq!(snap[1].common_timestamp_ns, 3);
    }

    #[test]
    #[should_panic(expected = "strictly increase")]
    fn non_increasing_timestamp_panics() {
        let buf = SampleBuffer::new(4);
        buf.push(reading_at(5));
        buf.push(reading_at(5));
    }

    #[test]
    fn snapshot_is_a_copy() {
        let buf = SampleBuffer::new(4);
        buf.push(reading_at(1));
        let mut snap = buf.snapshot();
        snap.clear();
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn empty_buffer_has_empty_snapshot() {
        let buf = SampleBuffer::new(4);
        assert!(buf.is_empty());
        assert!(buf.snapshot().is_empty());
    }
}
