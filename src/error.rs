//! # Error Types
//!
//! Recoverable failures reported by the kernel. Fatal faults (a corrupted
//! context, no runnable task) are not represented here beyond
//! [`KernelError::NoRunnableTask`]; the port turns that into a panic.

use core::fmt;

/// Failure of the region allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No pool has a contiguous run of free sub-regions large enough.
    OutOfMemory,
    /// `release` was called with an address that is not a live allocation.
    UnknownAddress,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => f.write_str("out of heap memory"),
            Self::UnknownAddress => f.write_str("address is not a live allocation"),
        }
    }
}

/// Failure of a kernel operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Every TCB slot is in use.
    TableFull,
    /// A task with the same entry point is already registered.
    DuplicateEntry,
    /// The stack for a new task could not be allocated.
    OutOfMemory,
    /// No task matches the given handle or name.
    UnknownTask,
    /// Mutex or semaphore index out of range.
    InvalidObject,
    /// The scheduler found no READY or UNRUN task.
    NoRunnableTask,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TableFull => f.write_str("task table is full"),
            Self::DuplicateEntry => f.write_str("entry point already registered"),
            Self::OutOfMemory => f.write_str("no memory for task stack"),
            Self::UnknownTask => f.write_str("no such task"),
            Self::InvalidObject => f.write_str("no such mutex or semaphore"),
            Self::NoRunnableTask => f.write_str("no runnable task (idle task missing?)"),
        }
    }
}

impl From<AllocError> for KernelError {
    fn from(_: AllocError) -> Self {
        KernelError::OutOfMemory
    }
}
