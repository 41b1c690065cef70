//! # Task Control Block
//!
//! Defines the task model for rtosZero. Each task owns one stack carved
//! out of the heap regions, a sub-region mask derived from that stack, and
//! the scheduling metadata the kernel mutates on every switch.

use arrayvec::ArrayString;

use crate::config::{CPU_WINDOW_TICKS, SYSTEM_CLOCK_HZ, TASK_NAME_LEN, TICK_HZ};
use crate::mpu::SrdMask;

/// Task body. Tasks never return; stopping one goes through the kernel.
pub type TaskEntry = extern "C" fn() -> !;

/// Fixed-capacity display label.
pub type TaskName = ArrayString<TASK_NAME_LEN>;

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// Execution state of a task slot.
///
/// ```text
///              create                 first dispatch
///   Invalid ──────────► Unrun ─────────────────────────► Ready ◄──┐
///                         ▲                               │  ▲    │
///                         │ restart          sleep / lock │  │    │ tick reaches 0,
///                         │ (never run)      / wait       ▼  │    │ unlock, post
///                      Stopped ◄──── stop ──── Delayed / Blocked* ┘
/// ```
///
/// The running task is simply the one the scheduler picked; it stays
/// `Ready` while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Free slot.
    Invalid,
    /// Stopped by `kill`/`pkill`; can be resumed with `restart`/`run`.
    Stopped,
    /// Created but never dispatched; has no saved context yet.
    Unrun,
    Ready,
    /// Sleeping until its tick counter reaches zero.
    Delayed,
    BlockedOnMutex,
    BlockedOnSemaphore,
}

impl TaskState {
    /// Whether the scheduler may pick a task in this state.
    #[inline]
    pub fn is_runnable(self) -> bool {
        matches!(self, TaskState::Ready | TaskState::Unrun)
    }

    /// Short label used by `ps`.
    pub fn label(self) -> &'static str {
        match self {
            TaskState::Invalid => "invalid",
            TaskState::Stopped => "stopped",
            TaskState::Unrun => "unrun",
            TaskState::Ready => "ready",
            TaskState::Delayed => "delayed",
            TaskState::BlockedOnMutex => "mutex",
            TaskState::BlockedOnSemaphore => "semaphore",
        }
    }
}

// ---------------------------------------------------------------------------
// Task handle
// ---------------------------------------------------------------------------

/// Opaque generational task handle: the slot index plus the generation
/// the slot had when the task was created. A handle to a slot that has
/// since been reclaimed no longer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    index: u8,
    generation: u16,
}

impl TaskHandle {
    /// Raw value returned by `pidof` when no task matches.
    pub const NONE_RAW: u32 = u32::MAX;

    pub const fn new(index: usize, generation: u16) -> Self {
        Self {
            index: index as u8,
            generation,
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.index as usize
    }

    #[inline]
    pub const fn generation(self) -> u16 {
        self.generation
    }

    /// Encoding used across the syscall boundary (the "PID").
    pub const fn to_raw(self) -> u32 {
        ((self.generation as u32) << 8) | self.index as u32
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        if raw == Self::NONE_RAW || raw >> 24 != 0 {
            return None;
        }
        Some(Self {
            index: (raw & 0xFF) as u8,
            generation: (raw >> 8) as u16,
        })
    }
}

// ---------------------------------------------------------------------------
// Task Control Block
// ---------------------------------------------------------------------------

/// Task Control Block (TCB).
///
/// Stored inline in the kernel's fixed table. Addresses (`stack_base`,
/// `stack_pointer`) are 32-bit target addresses, never host pointers.
#[derive(Debug, Clone, Copy)]
pub struct TaskControlBlock {
    /// Entry point. Also used to reject registering the same body twice.
    pub entry: Option<TaskEntry>,
    /// Bumped every time the slot is claimed.
    pub generation: u16,
    pub state: TaskState,

    /// Lowest address of the stack allocation.
    pub stack_base: u32,
    /// Saved PSP. Points at the software frame while the task is switched out.
    pub stack_pointer: u32,
    pub stack_size: u32,

    /// Priority as configured. 0 is the most important.
    pub base_priority: u8,
    /// Priority used by the scheduler; raised by inheritance.
    pub effective_priority: u8,
    /// Tie-breaker among equal priorities: fewer dispatches wins.
    pub scheduled_count: u32,

    /// CPU cycles consumed, double-buffered per accounting window.
    pub run_cycles: [u32; 2],

    pub name: TaskName,

    /// Remaining sleep ticks while `Delayed`.
    pub ticks: u32,
    /// Mutex this task is queued on.
    pub blocking_mutex: Option<u8>,
    /// Semaphore this task is queued on.
    pub blocking_semaphore: Option<u8>,

    /// Heap sub-regions this task may touch.
    pub srd: SrdMask,
    /// Set on first dispatch; a stopped task that never ran restarts `Unrun`.
    pub started: bool,
    /// Stopped while queued on a mutex or semaphore. The blocking call it
    /// is parked in must report `Retry` when the task resumes.
    pub wait_cancelled: bool,
}

impl TaskControlBlock {
    /// An unclaimed slot. Used to initialize the table.
    pub const EMPTY: Self = Self {
        entry: None,
        generation: 0,
        state: TaskState::Invalid,
        stack_base: 0,
        stack_pointer: 0,
        stack_size: 0,
        base_priority: 0,
        effective_priority: 0,
        scheduled_count: 0,
        run_cycles: [0; 2],
        name: TaskName::new_const(),
        ticks: 0,
        blocking_mutex: None,
        blocking_semaphore: None,
        srd: SrdMask::DENY_ALL,
        started: false,
        wait_cancelled: false,
    };

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.state != TaskState::Invalid
    }

    #[inline]
    pub fn is_runnable(&self) -> bool {
        self.state.is_runnable()
    }

    /// Whether this slot holds a task running `entry`.
    pub fn runs(&self, entry: TaskEntry) -> bool {
        self.is_valid() && self.entry.is_some_and(|own| own as usize == entry as usize)
    }

    /// Highest address of the stack allocation (exclusive).
    #[inline]
    pub fn stack_top(&self) -> u32 {
        self.stack_base + self.stack_size
    }

    /// Store `name`, truncated on a character boundary to fit.
    pub fn set_name(&mut self, name: &str) {
        self.name.clear();
        for c in name.chars() {
            if self.name.try_push(c).is_err() {
                break;
            }
        }
    }

    /// Forget any queue, delay or inheritance bookkeeping.
    pub fn clear_blocking(&mut self) {
        self.ticks = 0;
        self.blocking_mutex = None;
        self.blocking_semaphore = None;
    }

    /// CPU usage in hundredths of a percent over the last complete window.
    pub fn cpu_hundredths(&self, active_half: usize) -> u32 {
        let window = u64::from(SYSTEM_CLOCK_HZ) * u64::from(CPU_WINDOW_TICKS) / u64::from(TICK_HZ);
        let used = u64::from(self.run_cycles[active_half ^ 1]);
        (used * 10_000 / window).min(10_000) as u32
    }

    /// Snapshot of this slot for display.
    pub fn info(&self, index: usize, active_half: usize) -> TaskInfo {
        TaskInfo {
            handle: TaskHandle::new(index, self.generation),
            name: self.name,
            state: self.state,
            base_priority: self.base_priority,
            effective_priority: self.effective_priority,
            stack_base: self.stack_base,
            stack_size: self.stack_size,
            cpu_hundredths: self.cpu_hundredths(active_half),
        }
    }
}

/// Read-only copy of a task's public fields, produced by `ps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskInfo {
    pub handle: TaskHandle,
    pub name: TaskName,
    pub state: TaskState,
    pub base_priority: u8,
    pub effective_priority: u8,
    pub stack_base: u32,
    pub stack_size: u32,
    /// CPU usage over the last window, in hundredths of a percent.
    pub cpu_hundredths: u32,
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
