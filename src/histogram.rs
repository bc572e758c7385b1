//! Log-bucketed duration histogram used for pause and suspend timings.

use std::fmt;
use std::time::Duration;

const BUCKETS: usize = 40;

/// Samples are bucketed by the power of two of their length in microseconds.
#[derive(Clone, PartialEq, Eq)]
pub struct Histogram {
    name: &'static str,
    buckets: [u64; BUCKETS],
    count: u64,
    sum: Duration,
    min: Duration,
    max: Duration,
}

impl Histogram {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            buckets: [0; BUCKETS],
            count: 0,
            sum: Duration::ZERO,
            min: Duration::MAX,
            max: Duration::ZERO,
        }
    }

    fn bucket_for(sample: Duration) -> usize {
        let micros = sample.as_micros().max(1);
        (u128::BITS - micros.leading_zeros()) as usize - 1
    }

    pub fn add(&mut self, sample: Duration) {
        self.buckets[Self::bucket_for(sample).min(BUCKETS - 1)] += 1;
        self.count += 1;
        self.sum += sample;
        self.min = self.min.min(sample);
        self.max = self.max.max(sample);
    }

    pub fn merge(&mut self, other: &Histogram) {
        if other.count == 0 {
            return;
        }
        for (mine, theirs) in self.buckets.iter_mut().zip(other.buckets.iter()) {
            *mine += theirs;
        }
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.name);
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> Duration {
        self.sum
    }

    pub fn min(&self) -> Option<Duration> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<Duration> {
        (self.count > 0).then_some(self.max)
    }

    pub fn mean(&self) -> Option<Duration> {
        (self.count > 0).then(|| self.sum / self.count as u32)
    }

    /// Upper bound of the bucket holding the `fraction` quantile.
    pub fn percentile(&self, fraction: f64) -> Option<Duration> {
        if self.count == 0 {
            return None;
        }
        let target = ((self.count as f64) * fraction.clamp(0.0, 1.0)).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (index, hits) in self.buckets.iter().enumerate() {
            seen += hits;
            if seen >= target {
                let upper = Duration::from_micros(1u64 << (index + 1).min(63));
                return Some(upper.min(self.max));
            }
        }
        Some(self.max)
    }
}

impl fmt::Debug for Histogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Histogram")
            .field("name", &self.name)
            .field("count", &self.count)
            .field("sum", &self.sum)
            .field("min", &self.min())
            .field("max", &self.max())
            .finish()
    }
}

impl fmt::Display for Histogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.mean(), self.percentile(0.99), self.max()) {
            (Some(mean), Some(p99), Some(max)) => write!(
                f,
                "{}: count={} sum={:?} mean={:?} p99<={:?} max={:?}",
                self.name, self.count, self.sum, mean, p99, max
            ),
            _ => write!(f, "{}: no samples", self.name),
        }
    }
}
