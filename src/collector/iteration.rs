//! Per-run records and their cumulative aggregate.

use std::time::{Duration, Instant};

use crate::heap::ObjectBytePair;
use crate::histogram::Histogram;

use super::{GcCause, GcType};

/// What one [`GarbageCollector::run`](super::GarbageCollector::run) did.
#[derive(Debug, Clone)]
pub struct Iteration {
    cause: GcCause,
    clear_soft_references: bool,
    gc_type: GcType,
    start: Instant,
    duration: Duration,
    pause_times: Vec<Duration>,
    freed: ObjectBytePair,
    freed_los: ObjectBytePair,
}

impl Iteration {
    pub(crate) fn new(cause: GcCause, clear_soft_references: bool, gc_type: GcType) -> Self {
        Self {
            cause,
            clear_soft_references,
            gc_type,
            start: Instant::now(),
            duration: Duration::ZERO,
            pause_times: Vec::new(),
            freed: ObjectBytePair::default(),
            freed_los: ObjectBytePair::default(),
        }
    }

    pub(crate) fn record_free(&mut self, freed: ObjectBytePair) {
        self.freed.add(freed);
    }

    pub(crate) fn record_free_los(&mut self, freed: ObjectBytePair) {
        self.freed_los.add(freed);
    }

    pub(crate) fn record_pause(&mut self, pause: Duration) {
        self.pause_times.push(pause);
    }

    pub(crate) fn finish(&mut self) {
        self.duration = self.start.elapsed();
    }

    pub fn cause(&self) -> GcCause {
        self.cause
    }

    pub fn clear_soft_references(&self) -> bool {
        self.clear_soft_references
    }

    pub fn gc_type(&self) -> GcType {
        self.gc_type
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn pause_times(&self) -> &[Duration] {
        &self.pause_times
    }

    pub fn total_pause_time(&self) -> Duration {
        self.pause_times.iter().sum()
    }

    pub fn freed(&self) -> ObjectBytePair {
        self.freed
    }

    pub fn freed_los(&self) -> ObjectBytePair {
        self.freed_los
    }

    pub fn freed_objects(&self) -> u64 {
        self.freed.objects + self.freed_los.objects
    }

    pub fn freed_bytes(&self) -> i64 {
        self.freed.bytes + self.freed_los.bytes
    }
}

/// Totals over every run since creation or the last reset.
#[derive(Debug, Clone)]
pub struct CumulativeStats {
    iterations: u64,
    total_time: Duration,
    total_freed: ObjectBytePair,
    total_freed_los: ObjectBytePair,
    pause_histogram: Histogram,
}

impl CumulativeStats {
    pub(crate) fn new() -> Self {
        Self {
            iterations: 0,
            total_time: Duration::ZERO,
            total_freed: ObjectBytePair::default(),
            total_freed_los: ObjectBytePair::default(),
            pause_histogram: Histogram::new("gc pauses"),
        }
    }

    pub(crate) fn fold(&mut self, iteration: &Iteration) {
        self.iterations += 1;
        self.total_time += iteration.duration();
        self.total_freed.add(iteration.freed());
        self.total_freed_los.add(iteration.freed_los());
        for pause in iteration.pause_times() {
            self.pause_histogram.add(*pause);
        }
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn total_time(&self) -> Duration {
        self.total_time
    }

    pub fn total_freed(&self) -> ObjectBytePair {
        self.total_freed
    }

    pub fn total_freed_los(&self) -> ObjectBytePair {
        self.total_freed_los
    }

    pub fn total_freed_objects(&self) -> u64 {
        self.total_freed.objects + self.total_freed_los.objects
    }

    pub fn total_freed_bytes(&self) -> i64 {
        self.total_freed.bytes + self.total_freed_los.bytes
    }

    pub fn pause_histogram(&self) -> &Histogram {
        &self.pause_histogram
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_accumulates_and_reset_clears() {
        let mut iteration = Iteration::new(GcCause::Explicit, false, GcType::Full);
        iteration.record_free(ObjectBytePair::new(3, 96));
        iteration.record_free_los(ObjectBytePair::new(1, 4096));
        iteration.record_pause(Duration::from_micros(200));
        iteration.record_pause(Duration::from_micros(100));
        iteration.finish();
        assert_eq!(iteration.freed_objects(), 4);
        assert_eq!(iteration.freed_bytes(), 4192);
        assert_eq!(iteration.total_pause_time(), Duration::from_micros(300));

        let mut stats = CumulativeStats::new();
        stats.fold(&iteration);
        stats.fold(&iteration);
        assert_eq!(stats.iterations(), 2);
        assert_eq!(stats.total_freed_objects(), 8);
        assert_eq!(stats.total_freed_los(), ObjectBytePair::new(2, 8192));
        assert_eq!(stats.pause_histogram().count(), 4);

        stats.reset();
        assert_eq!(stats.iterations(), 0);
        assert_eq!(stats.pause_histogram().count(), 0);
    }
}
