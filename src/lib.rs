//! Managed runtime core: thread suspension, string interning and the
//! garbage collection driver.
//!
//! - [`thread`] and [`suspend`] implement the per-thread state machine and
//!   the cross-thread suspension protocol built on it.
//! - [`intern_table`] deduplicates strings into strong and weak sets that
//!   cooperate with collection.
//! - [`collector`] runs a collection cycle against live mutator threads.
//!
//! Everything hangs off an explicit [`Runtime`] context.
//!
//! ```
//! use managed_rt::{GcCause, Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::new(RuntimeConfig::default());
//! let main = runtime.attach_thread("main", false).unwrap();
//!
//! let hello = runtime
//!     .intern_table()
//!     .intern_weak_utf8(&main, runtime.heap(), "hello")
//!     .unwrap();
//! main.push_stack_root(hello.clone());
//!
//! let gc = runtime.mark_sweep_collector();
//! gc.run(Some(&main), GcCause::Explicit, false);
//! assert_eq!(runtime.intern_table().lookup_weak(&main, "hello"), Some(hello));
//! ```

pub mod barrier;
pub mod collector;
pub mod config;
pub mod error;
pub mod heap;
pub mod histogram;
pub mod intern_table;
pub mod locks;
pub mod object;
pub mod roots;
pub mod runtime;
pub mod suspend;
pub mod thread;
pub mod thread_list;

pub use collector::{CollectorHooks, CollectorPhase, GarbageCollector, GcCause, GcType, MarkSweep};
pub use config::RuntimeConfig;
pub use error::{RuntimeError, RuntimeResult};
pub use intern_table::{InternTable, WeakRootState};
pub use object::ObjectRef;
pub use runtime::Runtime;
pub use suspend::{ScopedSuspendAll, SuspendCoordinator};
pub use thread::{ManagedThread, ThreadFlags, ThreadState};
