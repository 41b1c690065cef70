//! # rtosZero Configuration
//!
//! Compile-time limits governing the kernel tables, plus the runtime
//! [`KernelConfig`] a [`Kernel`](crate::kernel::Kernel) is built from.
//! All tables are fixed-size; there is no dynamic allocation.

use crate::scheduler::SchedulerMode;

/// Maximum number of tasks the system can manage simultaneously.
/// This bounds the static TCB array. Slots are claimed at creation time
/// and never returned.
pub const MAX_TASKS: usize = 12;

/// Number of kernel mutexes, statically allocated for the system lifetime.
pub const MAX_MUTEXES: usize = 1;

/// Number of kernel counting semaphores.
pub const MAX_SEMAPHORES: usize = 3;

/// Default bound on the number of tasks queued on one mutex or semaphore.
/// Can be overridden through [`KernelConfig::wait_queue_depth`].
pub const WAIT_QUEUE_DEPTH: usize = 2;

/// Length of the fixed display label kept in each TCB.
pub const TASK_NAME_LEN: usize = 16;

/// SysTick frequency in Hz. One tick is one millisecond, which is also
/// the unit of `sleep()`.
pub const TICK_HZ: u32 = 1000;

/// System clock frequency in Hz (TM4C123 PLL configured for 40 MHz).
pub const SYSTEM_CLOCK_HZ: u32 = 40_000_000;

/// Length of one CPU accounting window in ticks. The run-time double
/// buffer swaps halves once per window.
pub const CPU_WINDOW_TICKS: u32 = TICK_HZ;

/// Size of the scratch stack PendSV saves into when the very first task
/// is dispatched (there is no outgoing task yet).
pub const BOOT_STACK_WORDS: usize = 32;

/// Runtime kernel configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Scheduling discipline used for the first decision.
    pub scheduler: SchedulerMode,
    /// When set, every tick requests a context switch.
    pub preemption: bool,
    /// When set, mutex owners inherit the priority of blocked requesters.
    pub priority_inheritance: bool,
    /// Bound on each wait queue. Clamped to `1..=MAX_TASKS`.
    pub wait_queue_depth: usize,
}

impl KernelConfig {
    pub const fn new() -> Self {
        Self {
            scheduler: SchedulerMode::Priority,
            preemption: false,
            priority_inheritance: false,
            wait_queue_depth: WAIT_QUEUE_DEPTH,
        }
    }

    /// Wait queue depth actually used by the kernel tables.
    pub fn effective_queue_depth(&self) -> usize {
        self.wait_queue_depth.clamp(1, MAX_TASKS)
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}
