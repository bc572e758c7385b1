//! Packed thread state and flags word.
//!
//! State and flags share one `u32` so a single compare-and-swap can check for
//! pending requests and change state at the same time: the low half holds
//! [`ThreadFlags`], the high half the [`ThreadState`] discriminant.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

/// Execution state of a managed thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ThreadState {
    /// Thread has exited and no longer runs managed code
    Terminated = 0,
    /// Thread is running managed code and holds the mutator lock shared
    Runnable = 1,
    TimedWaiting = 2,
    Sleeping = 3,
    /// Blocked on a monitor
    Blocked = 4,
    Waiting = 5,
    WaitingForGcToComplete = 6,
    WaitingForCheckpointsToRun = 7,
    WaitingPerformingGc = 8,
    WaitingWeakGcRootRead = 9,
    WaitingForSuspension = 10,
    /// Attached but not yet initialised
    Starting = 11,
    /// Running native code that does not touch the heap
    Native = 12,
    /// Parked after a suspend request
    Suspended = 13,
}

impl ThreadState {
    pub fn from_raw(raw: u16) -> ThreadState {
        match raw {
            0 => ThreadState::Terminated,
            1 => ThreadState::Runnable,
            2 => ThreadState::TimedWaiting,
            3 => ThreadState::Sleeping,
            4 => ThreadState::Blocked,
            5 => ThreadState::Waiting,
            6 => ThreadState::WaitingForGcToComplete,
            7 => ThreadState::WaitingForCheckpointsToRun,
            8 => ThreadState::WaitingPerformingGc,
            9 => ThreadState::WaitingWeakGcRootRead,
            10 => ThreadState::WaitingForSuspension,
            11 => ThreadState::Starting,
            12 => ThreadState::Native,
            13 => ThreadState::Suspended,
            other => panic!("corrupt thread state {other}"),
        }
    }

    pub fn is_runnable(self) -> bool {
        self == ThreadState::Runnable
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

bitflags! {
    /// Requests pending against a thread.
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u16 {
        /// Suspend count is non-zero.
        const SUSPEND_REQUEST = 1;
        /// A checkpoint function is pending.
        const CHECKPOINT_REQUEST = 2;
        /// An empty checkpoint is pending.
        const EMPTY_CHECKPOINT_REQUEST = 4;
        /// At least one suspend barrier is waiting for this thread.
        const ACTIVE_SUSPEND_BARRIER = 8;
    }
}

const _: () = {
    let all = [
        ThreadFlags::SUSPEND_REQUEST.bits(),
        ThreadFlags::CHECKPOINT_REQUEST.bits(),
        ThreadFlags::EMPTY_CHECKPOINT_REQUEST.bits(),
        ThreadFlags::ACTIVE_SUSPEND_BARRIER.bits(),
    ];
    let mut seen = 0u16;
    let mut i = 0;
    while i < all.len() {
        assert!(all[i].is_power_of_two());
        assert!(seen & all[i] == 0);
        seen |= all[i];
        i += 1;
    }
};

impl ThreadFlags {
    /// Flags that send a Runnable thread into its safepoint slow path.
    pub const SAFEPOINT_REQUESTS: ThreadFlags = ThreadFlags::SUSPEND_REQUEST
        .union(ThreadFlags::CHECKPOINT_REQUEST)
        .union(ThreadFlags::EMPTY_CHECKPOINT_REQUEST);
}

const STATE_SHIFT: u32 = 16;
const FLAGS_MASK: u32 = 0xFFFF;

/// One snapshot of the packed word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct StateAndFlags(u32);

impl StateAndFlags {
    pub fn new(state: ThreadState, flags: ThreadFlags) -> Self {
        Self(((state as u32) << STATE_SHIFT) | u32::from(flags.bits()))
    }

    pub fn state(self) -> ThreadState {
        ThreadState::from_raw((self.0 >> STATE_SHIFT) as u16)
    }

    pub fn flags(self) -> ThreadFlags {
        ThreadFlags::from_bits_truncate((self.0 & FLAGS_MASK) as u16)
    }

    pub fn is_any_of(self, flags: ThreadFlags) -> bool {
        self.flags().intersects(flags)
    }

    pub fn with_state(self, state: ThreadState) -> Self {
        Self::new(state, self.flags())
    }

    pub fn with_flags(self, flags: ThreadFlags) -> Self {
        Self::new(self.state(), self.flags() | flags)
    }

    pub fn without_flags(self, flags: ThreadFlags) -> Self {
        Self::new(self.state(), self.flags() - flags)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for StateAndFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateAndFlags")
            .field("state", &self.state())
            .field("flags", &self.flags())
            .finish()
    }
}

/// The atomic word itself. All updates read-modify-write the whole word.
pub struct AtomicStateAndFlags(AtomicU32);

impl AtomicStateAndFlags {
    pub fn new(state: ThreadState) -> Self {
        Self(AtomicU32::new(StateAndFlags::new(state, ThreadFlags::empty()).raw()))
    }

    pub fn load(&self) -> StateAndFlags {
        StateAndFlags(self.0.load(Ordering::Acquire))
    }

    pub fn compare_exchange(&self, current: StateAndFlags, new: StateAndFlags) -> bool {
        self.0
            .compare_exchange(current.raw(), new.raw(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn fetch_or_flags(&self, flags: ThreadFlags) -> StateAndFlags {
        StateAndFlags(self.0.fetch_or(u32::from(flags.bits()), Ordering::AcqRel))
    }

    pub fn fetch_clear_flags(&self, flags: ThreadFlags) -> StateAndFlags {
        StateAndFlags(self.0.fetch_and(!u32::from(flags.bits()), Ordering::AcqRel))
    }

    /// Replaces the state, keeping whatever flags are set concurrently.
    pub fn set_state_preserving_flags(&self, state: ThreadState) -> ThreadState {
        let mut current = self.load();
        loop {
            if self.compare_exchange(current, current.with_state(state)) {
                return current.state();
            }
            current = self.load();
        }
    }
}

impl fmt::Debug for AtomicStateAndFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load().fmt(f)
    }
}
