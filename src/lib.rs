//! # rtosZero
//!
//! A small preemptive RTOS kernel for the TM4C123GH6PM (ARM Cortex-M4).
//!
//! ## Overview
//!
//! Tasks run unprivileged on the process stack. Each one gets its own stack
//! carved out of the heap regions, and the MPU grants it exactly the 1 KiB
//! sub-regions its stack covers. Every kernel service is reached through an
//! `SVC` trap:
//!
//! - **Scheduling**: strict priority (lowest number wins, round-robin inside
//!   a level) or plain round-robin, switchable at run time.
//! - **Blocking**: one mutex and three counting semaphores, each with a
//!   bounded FIFO wait queue and optional priority inheritance.
//! - **Time**: a 1 kHz SysTick drives sleep timeouts, optional preemption
//!   and per-task CPU accounting.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │            Application Tasks (unprivileged)            │
//! ├────────────────────────────────────────────────────────┤
//! │      Syscall stubs (kernel.rs) · Shell (shell.rs)      │
//! │    yield · sleep · lock · wait · post · ps · ipcs …    │
//! ├────────────────────────────────────────────────────────┤
//! │            Syscall Dispatcher (svc.rs)                 │
//! │        decode · Kernel::service · SvcReply             │
//! ├──────────────┬────────────────────┬────────────────────┤
//! │  Scheduler   │   Sync Objects     │  Context Switch    │
//! │ scheduler.rs │   sync.rs          │  context.rs        │
//! │ ─ priority   │   ─ Mutex          │  ─ InitialFrame    │
//! │ ─ round-robin│   ─ Semaphore      │  ─ switch_context  │
//! ├──────────────┴────────────────────┴────────────────────┤
//! │     Task Table (task.rs) · Kernel state (kernel.rs)    │
//! ├───────────────────────────┬────────────────────────────┤
//! │  Region Allocator (mm.rs) │  MPU masks (mpu.rs)        │
//! ├───────────────────────────┴────────────────────────────┤
//! │            Arch Port (arch/cortex_m4.rs)               │
//! │  PendSV · SVCall · SysTick · faults · MPU registers    │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Memory Model
//!
//! - **No `alloc`**: kernel state is a fixed set of arrays.
//! - **32 KiB SRAM**: the first 4 KiB belong to the OS and its stacks; the
//!   remaining 28 KiB form the task heap, split across MPU regions 3-7.
//! - **Stacks**: 512 B blocks on region seams, 1 KiB blocks elsewhere.
//!   Requests round up to whole blocks.
//!
//! Everything above the port is plain Rust and runs on the host, where the
//! unit tests drive it through a simulated [`context::Port`].

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod context;
pub mod error;
pub mod kernel;
pub mod mm;
pub mod mpu;
pub mod scheduler;
pub mod shell;
pub mod svc;
pub mod sync;
pub mod task;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod arch;
