//! Running counters and the bounded history of recent samples.
//!
//! Counters are grouped in one `Copy` struct that is rebuilt and assigned
//! whole on every update, so a copy taken by a reader is always from one
//! side of a `record` call.

use arrayvec::ArrayVec;

use crate::config::{QUANTITY_COUNT, Quantity};
use crate::metrics::{self, Metrics, PlausibleBand, Reading};
use crate::ring::Ring;
use crate::sensor::Sample;
use crate::timestamp::Timestamp;

pub const HISTORY_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Counters {
    pub total_reads: u64,   // Every tick, valid or not.
    pub error_count: u64,   // Sensor reads that failed.
    pub rejected_count: u64, // Reads that succeeded but were implausible.
    pub last_valid_at: Option<Timestamp>,
}

/// Smallest and largest value seen.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Span {
    pub min: f32,
    pub max: f32,
}

impl Span {
    fn widened(span: Option<Span>, value: f32) -> Span {
        match span {
            Some(Span { min, max }) => Span { min: min.min(value), max: max.max(value) },
            None => Span { min: value, max: value },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
}

/// Min, max and mean of the valid samples currently in the history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSummary {
    pub samples: usize,
    pub quantities: [Summary; QUANTITY_COUNT],
}

impl SessionSummary {
    pub fn get(&self, quantity: Quantity) -> &Summary {
        &self.quantities[quantity.index()]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot<const K: usize> {
    pub counters: Counters,
    pub started_at: Timestamp,
    pub samples: ArrayVec<Sample, K>, // Oldest first.
}

#[derive(Debug, Clone)]
pub struct StatsStore<const K: usize> {
    started_at: Timestamp,
    counters: Counters,
    history: Ring<Sample, K>,
    extrema: [Option<Span>; QUANTITY_COUNT],
}

impl<const K: usize> StatsStore<K> {
    pub fn new(started_at: Timestamp) -> Self {
        Self {
            started_at,
            counters: Counters::default(),
            history: Ring::new(),
            extrema: [None; QUANTITY_COUNT],
        }
    }

    /// Count and keep one sample. Never blocks; the oldest sample is
    /// dropped once the history is full.
    pub fn record(&mut self, sample: &Sample) {
        let current = self.counters;
        let next = Counters {
            total_reads: current.total_reads.saturating_add(1),
            error_count: current.error_count.saturating_add(u64::from(!sample.valid)),
            ..current
        };
        self.history.push(*sample);
        self.counters = next;
    }

    /// Fold a plausible reading into the extrema.
    pub fn observe(&mut self, reading: &Reading) {
        for quantity in Quantity::ALL {
            let slot = &mut self.extrema[quantity.index()];
            *slot = Some(Span::widened(*slot, reading.value(quantity)));
        }
        self.counters = Counters { last_valid_at: Some(reading.computed_at), ..self.counters };
    }

    pub fn note_rejected(&mut self) {
        self.counters = Counters {
            rejected_count: self.counters.rejected_count.saturating_add(1),
            ..self.counters
        };
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    pub fn history(&self) -> impl Iterator<Item = &Sample> + '_ {
        self.history.iter()
    }

    pub fn snapshot(&self) -> StatsSnapshot<K> {
        StatsSnapshot {
            counters: self.counters,
            started_at: self.started_at,
            samples: self.history.iter().copied().collect(),
        }
    }

    /// Failed reads still held in the history.
    pub fn recent_errors(&self) -> impl Iterator<Item = &Sample> + '_ {
        self.history.iter().filter(|s| !s.valid)
    }

    pub fn uptime(&self, now: Timestamp) -> Timestamp {
        Timestamp::from_seconds(now.seconds_since(self.started_at).unwrap_or(0))
    }

    pub fn extrema(&self, quantity: Quantity) -> Option<Span> {
        self.extrema[quantity.index()]
    }

    /// Forget the all-time extrema. Counters and history are kept.
    pub fn reset_extrema(&mut self) {
        self.extrema = [None; QUANTITY_COUNT];
    }

    pub fn session_summary(&self, band: &PlausibleBand) -> Option<SessionSummary> {
        let mut spans = [None; QUANTITY_COUNT];
        let mut sums = [0.0f32; QUANTITY_COUNT];
        let mut samples = 0usize;
        for sample in self.history.iter() {
            let Metrics::Valid(reading) = metrics::derive(sample, band) else {
                continue;
            };
            for quantity in Quantity::ALL {
                let value = reading.value(quantity);
                let i = quantity.index();
                spans[i] = Some(Span::widened(spans[i], value));
                sums[i] += value;
            }
            samples += 1;
        }
        if samples == 0 {
            return None;
        }
        let mut quantities = [Summary { min: 0.0, max: 0.0, mean: 0.0 }; QUANTITY_COUNT];
        for (i, summary) in quantities.iter_mut().enumerate() {
            let span = spans[i]?;
            *summary = Summary { min: span.min, max: span.max, mean: sums[i] / samples as f32 };
        }
        Some(SessionSummary { samples, quantities })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(seconds: u32) -> Timestamp {
        Timestamp { seconds }
    }

    #[test]
    fn test_counters_are_monotonic() {
        let mut store: StatsStore<4> = StatsStore::new(at(0));
        let mut previous = store.counters();
        for i in 0..20u32 {
            let sample = if i % 3 == 0 { Sample::failed(at(i)) } else { Sample::new(at(i), 21.0, 50.0) };
            store.record(&sample);
            let current = store.counters();
            assert!(current.total_reads >= previous.total_reads);
            assert!(current.error_count >= previous.error_count);
            previous = current;
        }
        assert_eq!(previous.total_reads, 20);
        assert_eq!(previous.error_count, 7);
    }

    #[test]
    fn test_oldest_sample_evicted_after_capacity() {
        const K: usize = 5;
        let mut store: StatsStore<K> = StatsStore::new(at(0));
        let first = Sample::new(at(1), 10.0, 40.0);
        store.record(&first);
        for i in 0..K as u32 {
            store.record(&Sample::new(at(2 + i), 20.0, 50.0));
        }
        let snapshot = store.snapshot();
        assert_eq!(snapshot.samples.len(), K);
        assert!(!snapshot.samples.contains(&first));
        assert_eq!(snapshot.samples[0].timestamp, at(2));
        assert_eq!(snapshot.counters.total_reads, K as u64 + 1);
    }

    #[test]
    fn test_recent_errors_and_uptime() {
        let mut store: StatsStore<8> = StatsStore::new(at(100));
        store.record(&Sample::failed(at(105)));
        store.record(&Sample::new(at(110), 22.0, 55.0));
        store.record(&Sample::failed(at(115)));
        let errors: ArrayVec<Timestamp, 8> = store.recent_errors().map(|s| s.timestamp).collect();
        assert_eq!(errors.as_slice(), &[at(105), at(115)]);
        assert_eq!(store.uptime(at(160)), at(60));
        assert_eq!(store.uptime(at(50)), at(0));
    }

    #[test]
    fn test_extrema_and_reset() {
        let mut store: StatsStore<8> = StatsStore::new(at(0));
        for (t, temperature) in [(1, 21.0), (2, 25.5), (3, 19.0)] {
            store.observe(&Reading { temperature, humidity: 50.0, vpd: 1.0, computed_at: at(t) });
        }
        assert_eq!(store.extrema(Quantity::Temperature), Some(Span { min: 19.0, max: 25.5 }));
        assert_eq!(store.counters().last_valid_at, Some(at(3)));
        store.reset_extrema();
        assert_eq!(store.extrema(Quantity::Temperature), None);
        assert_eq!(store.counters().last_valid_at, Some(at(3)));
    }

    #[test]
    fn test_session_summary_skips_invalid_samples() {
        let band = PlausibleBand::default();
        let mut store: StatsStore<8> = StatsStore::new(at(0));
        assert_eq!(store.session_summary(&band), None);
        store.record(&Sample::new(at(1), 20.0, 40.0));
        store.record(&Sample::failed(at(2)));
        store.record(&Sample::new(at(3), 90.0, 40.0)); // Implausible.
        store.record(&Sample::new(at(4), 24.0, 60.0));
        let summary = store.session_summary(&band).unwrap();
        assert_eq!(summary.samples, 2);
        let t = summary.get(Quantity::Temperature);
        assert_eq!((t.min, t.max, t.mean), (20.0, 24.0, 22.0));
        assert_eq!(summary.get(Quantity::Humidity).mean, 50.0);
    }

    #[test]
    fn test_rejected_count() {
        let mut store: StatsStore<2> = StatsStore::new(at(0));
        store.note_rejected();
        store.note_rejected();
        assert_eq!(store.counters().rejected_count, 2);
        assert_eq!(store.counters().error_count, 0);
    }
}
