//! Runtime configuration.
//!
//! Every subsystem reads its tunables from a [`RuntimeConfig`] handed to
//! [`crate::runtime::Runtime::new`]. The defaults mirror the thresholds a
//! production runtime uses for suspension diagnostics.
//!
//! # Examples
//!
//! ```
//! use managed_rt::config::RuntimeConfig;
//! use std::time::Duration;
//!
//! let config = RuntimeConfig::default()
//!     .with_heap_capacity(4 * 1024 * 1024)
//!     .with_suspend_timeout(Duration::from_secs(2))
//!     .with_concurrent_collector(true);
//!
//! assert_eq!(config.heap.capacity, 4 * 1024 * 1024);
//! assert!(config.collector_concurrent);
//! ```

use std::time::Duration;

/// Suspension and checkpoint tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadConfig {
    /// How long a single-thread suspend request waits before giving up.
    pub suspend_timeout: Duration,
    /// Suspend-all latency above which a warning is logged.
    pub long_suspend_threshold: Duration,
    /// Checkpoint barrier waits above this are reported.
    pub checkpoint_wait_warning: Duration,
    /// Interval between progress checks while waiting on an empty checkpoint.
    pub empty_checkpoint_period: Duration,
    /// Total empty checkpoint wait after which stragglers are logged as errors.
    pub empty_checkpoint_total_timeout: Duration,
    /// Upper bound on concurrently attached threads.
    pub max_thread_ids: u32,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            suspend_timeout: Duration::from_secs(10),
            long_suspend_threshold: Duration::from_millis(5),
            checkpoint_wait_warning: Duration::from_millis(1),
            empty_checkpoint_period: Duration::from_millis(100),
            empty_checkpoint_total_timeout: Duration::from_secs(600),
            max_thread_ids: 1 << 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapConfig {
    pub capacity: usize,
    /// Objects at least this large are accounted as large objects.
    pub large_object_threshold: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            capacity: 64 * 1024 * 1024, // 64MB
            large_object_threshold: 12 * 1024, // 12KB
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternConfig {
    pub initial_capacity: usize,
    /// Gate weak intern access per thread instead of through the table-wide state.
    pub use_read_barrier: bool,
}

impl Default for InternConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 256,
            use_read_barrier: false,
        }
    }
}

/// Top level configuration for a [`crate::runtime::Runtime`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub thread: ThreadConfig,
    pub heap: HeapConfig,
    pub intern: InternConfig,
    /// Run marking concurrently with mutators between two short pauses.
    pub collector_concurrent: bool,
}

impl RuntimeConfig {
    pub fn with_heap_capacity(mut self, capacity: usize) -> Self {
        self.heap.capacity = capacity;
        self
    }

    pub fn with_large_object_threshold(mut self, threshold: usize) -> Self {
        self.heap.large_object_threshold = threshold;
        self
    }

    pub fn with_suspend_timeout(mut self, timeout: Duration) -> Self {
        self.thread.suspend_timeout = timeout;
        self
    }

    pub fn with_max_thread_ids(mut self, max: u32) -> Self {
        self.thread.max_thread_ids = max;
        self
    }

    pub fn with_read_barrier(mut self, enabled: bool) -> Self {
        self.intern.use_read_barrier = enabled;
        self
    }

    pub fn with_concurrent_collector(mut self, concurrent: bool) -> Self {
        self.collector_concurrent = concurrent;
        self
    }
}
