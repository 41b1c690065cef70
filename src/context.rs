//! # Context-Switch Engine
//!
//! The portable half of PendSV. The naked handler in
//! [`arch::cortex_m4`](crate::arch::cortex_m4) pushes r4-r11 and
//! EXC_RETURN onto the outgoing process stack and hands the resulting
//! PSP to [`Kernel::switch_context`], which returns the PSP to restore.
//!
//! ## Stack Frame (full descending stack, lowest address first)
//!
//! ```text
//!   sp + 0x00  r4 .. r11        ┐ SoftwareFrame, pushed by PendSV
//!   sp + 0x20  EXC_RETURN       ┘
//!   sp + 0x24  r0 r1 r2 r3      ┐
//!   sp + 0x34  r12 lr           │ ExceptionFrame, stacked by hardware
//!   sp + 0x3C  pc               │ (8-byte aligned)
//!   sp + 0x40  xPSR             ┘
//!   sp + 0x44  stack top
//! ```
//!
//! A never-run task has no such frame, so one is fabricated at the top of
//! its stack on first dispatch.

use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::mpu::ProtectionUnit;
use crate::svc::SvcStatus;
use crate::task::TaskState;

/// EXC_RETURN: return to Thread mode, use PSP, no FP context.
pub const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

/// xPSR with only the Thumb bit set.
pub const XPSR_THUMB: u32 = 0x0100_0000;

/// Value given to every general register of a fabricated frame.
pub const REGISTER_SENTINEL: u32 = 0xFFFF_FFFF;

// ---------------------------------------------------------------------------
// Hardware seams
// ---------------------------------------------------------------------------

/// Access to task memory by target address.
pub trait StackMemory {
    fn read_word(&self, address: u32) -> u32;
    fn write_word(&mut self, address: u32, value: u32);

    /// Pointer the kernel dereferences to reach `address`. Callers check
    /// that the range belongs to the task before using it.
    fn translate(&mut self, address: u32) -> *mut u8;
}

/// Everything the switch engine needs from the processor.
pub trait Port: StackMemory + ProtectionUnit {
    /// Free-running cycle counter, used for CPU accounting.
    fn cycle_count(&self) -> u32;

    /// Make Thread mode unprivileged. Called before entering a freshly
    /// fabricated context.
    fn enter_unprivileged(&mut self);
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Registers saved by the PendSV handler.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftwareFrame {
    pub r4_r11: [u32; 8],
    pub exc_return: u32,
}

/// Registers stacked by the processor on exception entry. Also the view
/// the SVCall handler has of a caller's arguments.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionFrame {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r12: u32,
    pub lr: u32,
    pub pc: u32,
    pub xpsr: u32,
}

/// The full frame a switched-out task leaves on its stack.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialFrame {
    pub software: SoftwareFrame,
    pub hardware: ExceptionFrame,
}

impl InitialFrame {
    pub const WORDS: usize = 17;
    pub const BYTES: u32 = Self::WORDS as u32 * 4;
    /// Offset of the stacked r0 from a saved stack pointer.
    pub const R0_OFFSET: u32 = 9 * 4;

    /// Frame that "returns" to `entry` in Thread mode on the PSP.
    pub fn new(entry: u32) -> Self {
        Self {
            software: SoftwareFrame {
                r4_r11: [REGISTER_SENTINEL; 8],
                exc_return: EXC_RETURN_THREAD_PSP,
            },
            hardware: ExceptionFrame {
                r0: REGISTER_SENTINEL,
                r1: REGISTER_SENTINEL,
                r2: REGISTER_SENTINEL,
                r3: REGISTER_SENTINEL,
                r12: REGISTER_SENTINEL,
                lr: REGISTER_SENTINEL,
                pc: entry & !1,
                xpsr: XPSR_THUMB,
            },
        }
    }

    /// Words in memory order, lowest address first.
    pub fn to_words(&self) -> [u32; Self::WORDS] {
        let mut words = [0; Self::WORDS];
        words[..8].copy_from_slice(&self.software.r4_r11);
        words[8] = self.software.exc_return;
        let hw = &self.hardware;
        words[9..].copy_from_slice(&[
            hw.r0, hw.r1, hw.r2, hw.r3, hw.r12, hw.lr, hw.pc, hw.xpsr,
        ]);
        words
    }

    /// Read a frame back from `sp`.
    pub fn read(memory: &impl StackMemory, sp: u32) -> Self {
        let mut words = [0; Self::WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            *word = memory.read_word(sp + 4 * i as u32);
        }
        let mut r4_r11 = [0; 8];
        r4_r11.copy_from_slice(&words[..8]);
        Self {
            software: SoftwareFrame {
                r4_r11,
                exc_return: words[8],
            },
            hardware: ExceptionFrame {
                r0: words[9],
                r1: words[10],
                r2: words[11],
                r3: words[12],
                r12: words[13],
                lr: words[14],
                pc: words[15],
                xpsr: words[16],
            },
        }
    }

    /// Store the frame just below `stack_top` and return the new stack
    /// pointer. `stack_top` is rounded down to 8 bytes first.
    pub fn write(&self, memory: &mut impl StackMemory, stack_top: u32) -> u32 {
        let sp = (stack_top & !7) - Self::BYTES;
        for (i, word) in self.to_words().into_iter().enumerate() {
            memory.write_word(sp + 4 * i as u32, word);
        }
        sp
    }
}

// ---------------------------------------------------------------------------
// Switch
// ---------------------------------------------------------------------------

impl Kernel {
    /// Perform one scheduling decision.
    ///
    /// 1. Record `saved_sp` for the outgoing task and charge it the
    ///    cycles since its dispatch.
    /// 2. Ask the scheduler for the next task.
    /// 3. Apply that task's sub-region mask.
    /// 4. Fabricate a frame if it never ran, dropping privilege. A task
    ///    whose wait was cancelled by a stop gets `Retry` in its stacked
    ///    r0 instead.
    ///
    /// Returns the PSP to restore. `NoRunnableTask` is fatal.
    pub fn switch_context<P: Port>(
        &mut self,
        saved_sp: u32,
        port: &mut P,
    ) -> Result<u32, KernelError> {
        let now = port.cycle_count();
        if let Some(outgoing) = self.current {
            let tcb = &mut self.tasks[outgoing];
            tcb.stack_pointer = saved_sp;
            let spent = now.wrapping_sub(self.last_dispatch);
            tcb.run_cycles[self.active_half] = tcb.run_cycles[self.active_half].saturating_add(spent);
        }
        self.last_dispatch = now;

        let next = self
            .scheduler
            .select_next(&mut self.tasks)
            .ok_or(KernelError::NoRunnableTask)?;
        self.current = Some(next);

        let tcb = &mut self.tasks[next];
        port.apply(&tcb.srd);

        if tcb.state == TaskState::Unrun {
            let entry = tcb.entry.map_or(0, |f| f as usize as u32);
            tcb.stack_pointer = InitialFrame::new(entry).write(port, tcb.stack_top());
            tcb.state = TaskState::Ready;
            tcb.started = true;
            tcb.wait_cancelled = false;
            port.enter_unprivileged();
            log::debug!("first dispatch of {}", tcb.name);
        } else if tcb.wait_cancelled {
            // The lock/wait it was parked in never completed.
            tcb.wait_cancelled = false;
            port.write_word(
                tcb.stack_pointer + InitialFrame::R0_OFFSET,
                SvcStatus::Retry as u32,
            );
            log::debug!("{} resumes with its wait cancelled", tcb.name);
        }

        log::trace!("switch to {} (sp {:#010x})", tcb.name, tcb.stack_pointer);
        Ok(tcb.stack_pointer)
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::kernel::tests::{body0, body1, body2, init_logging};
    use crate::mm::{OS_REGION_BASE, SRAM_SIZE};
    use crate::mpu::SrdMask;
    use crate::scheduler::SchedulerMode;
    use crate::svc::{SvcAction, SvcRequest};

    /// Simulated processor: all of SRAM, plus recorded MPU programming and
    /// privilege drops.
    pub(crate) struct SimPort {
        /// `u64` backing keeps every 8-aligned target address 8-aligned on
        /// the host, so kernel snapshots can be written into it.
        sram: std::vec::Vec<u64>,
        pub cycles: u32,
        pub masks: std::vec::Vec<SrdMask>,
        pub privilege_drops: usize,
    }

    impl SimPort {
        pub(crate) fn new() -> Self {
            Self {
                sram: std::vec![0; SRAM_SIZE as usize / 8],
                cycles: 0,
                masks: std::vec::Vec::new(),
                privilege_drops: 0,
            }
        }

        fn offset(address: u32) -> usize {
            assert!(
                (OS_REGION_BASE..=OS_REGION_BASE + SRAM_SIZE).contains(&address),
                "{:#x} is outside SRAM",
                address
            );
            (address - OS_REGION_BASE) as usize
        }

        fn check_word(address: u32) {
            assert_eq!(address % 4, 0, "unaligned stack access {:#x}", address);
            assert!(Self::offset(address) < SRAM_SIZE as usize);
        }

        /// Copy `bytes` to `address`, as a task writing its own stack would.
        pub(crate) fn store(&mut self, address: u32, bytes: &[u8]) {
            assert!(Self::offset(address) + bytes.len() <= SRAM_SIZE as usize);
            let target = self.translate(address);
            unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), target, bytes.len()) };
        }

        /// View the `T` the kernel wrote at `address`.
        pub(crate) fn object<T>(&mut self, address: u32) -> &T {
            assert!(Self::offset(address) + core::mem::size_of::<T>() <= SRAM_SIZE as usize);
            assert_eq!(address as usize % core::mem::align_of::<T>(), 0);
            unsafe { &*self.translate(address).cast::<T>() }
        }
    }

    impl StackMemory for SimPort {
        fn read_word(&self, address: u32) -> u32 {
            Self::check_word(address);
            let offset = Self::offset(address);
            unsafe { self.sram.as_ptr().cast::<u8>().add(offset).cast::<u32>().read() }
        }

        fn write_word(&mut self, address: u32, value: u32) {
            Self::check_word(address);
            unsafe { self.translate(address).cast::<u32>().write(value) }
        }

        fn translate(&mut self, address: u32) -> *mut u8 {
            let offset = Self::offset(address);
            unsafe { self.sram.as_mut_ptr().cast::<u8>().add(offset) }
        }
    }

    impl ProtectionUnit for SimPort {
        fn apply(&mut self, mask: &SrdMask) {
            self.masks.push(*mask);
        }
    }

    impl Port for SimPort {
        fn cycle_count(&self) -> u32 {
            self.cycles
        }

        fn enter_unprivileged(&mut self) {
            self.privilege_drops += 1;
        }
    }

    #[test]
    fn test_initial_frame_layout() {
        let frame = InitialFrame::new(0x0000_1235);
        let words = frame.to_words();
        assert!(words[..8].iter().all(|&w| w == REGISTER_SENTINEL));
        assert_eq!(words[8], EXC_RETURN_THREAD_PSP);
        assert!(words[9..15].iter().all(|&w| w == REGISTER_SENTINEL));
        assert_eq!(words[15], 0x0000_1234);
        assert_eq!(words[16], XPSR_THUMB);
        assert_eq!(core::mem::size_of::<InitialFrame>(), InitialFrame::BYTES as usize);
    }

    #[test]
    fn test_frame_written_below_top() {
        let mut port = SimPort::new();
        let sp = InitialFrame::new(0x400).write(&mut port, 0x2000_1200);
        assert_eq!(sp, 0x2000_1200 - 68);
        // The hardware part must be 8-byte aligned.
        assert_eq!((sp + 36) % 8, 0);
        assert_eq!(InitialFrame::read(&port, sp), InitialFrame::new(0x400));
    }

    #[test]
    fn test_first_dispatch_fabricates_context() {
        init_logging();
        let mut kernel = Kernel::default();
        let idle = kernel.create_thread(body0, "Idle", 7, 512).unwrap();
        let mut port = SimPort::new();

        let sp = kernel.switch_context(0, &mut port).unwrap();
        assert_eq!(kernel.current(), Some(idle));
        assert_eq!(sp, 0x2000_1200 - InitialFrame::BYTES);

        let tcb = kernel.task(idle).unwrap();
        assert_eq!(tcb.state, TaskState::Ready);
        assert!(tcb.started);
        assert_eq!(tcb.stack_pointer, sp);
        assert_eq!(port.privilege_drops, 1);
        assert_eq!(port.masks, [tcb.srd]);

        let frame = InitialFrame::read(&port, sp);
        assert_eq!(frame.hardware.pc, (body0 as usize as u32) & !1);
        assert_eq!(frame.hardware.xpsr, XPSR_THUMB);
        assert_eq!(frame.software.exc_return, EXC_RETURN_THREAD_PSP);
    }

    #[test]
    fn test_resume_uses_saved_pointer() {
        let mut kernel = Kernel::new(KernelConfig {
            scheduler: SchedulerMode::RoundRobin,
            ..KernelConfig::default()
        });
        let a = kernel.create_thread(body0, "a", 1, 512).unwrap();
        let b = kernel.create_thread(body1, "b", 1, 512).unwrap();
        let mut port = SimPort::new();

        let sp_a = kernel.switch_context(0, &mut port).unwrap();
        // `a` runs for a while, pushes some more, then traps.
        port.cycles = 4000;
        let parked_a = sp_a - 16;
        let sp_b = kernel.switch_context(parked_a, &mut port).unwrap();
        assert_eq!(kernel.current(), Some(b));
        assert_ne!(sp_b, parked_a);
        assert_eq!(kernel.task(a).unwrap().stack_pointer, parked_a);
        assert_eq!(kernel.task(a).unwrap().run_cycles[0], 4000);

        port.cycles = 4500;
        let resumed = kernel.switch_context(sp_b, &mut port).unwrap();
        assert_eq!(resumed, parked_a);
        assert_eq!(kernel.task(b).unwrap().run_cycles[0], 500);
        // Only the two first dispatches dropped privilege.
        assert_eq!(port.privilege_drops, 2);
        assert_eq!(port.masks.len(), 3);
        assert_eq!(port.masks[2], kernel.task(a).unwrap().srd);
    }

    #[test]
    fn test_cancelled_lock_resumes_with_retry() {
        init_logging();
        let mut kernel = Kernel::default();
        kernel.init_mutex(0).unwrap();
        let a = kernel.create_thread(body0, "a", 1, 512).unwrap();
        let b = kernel.create_thread(body1, "b", 2, 512).unwrap();
        let idle = kernel.create_thread(body2, "Idle", 7, 512).unwrap();
        let mut port = SimPort::new();

        let sp_a = kernel.switch_context(0, &mut port).unwrap();
        assert_eq!(kernel.current(), Some(a));
        kernel.service(SvcRequest::Lock(0), &mut port);
        kernel.service(SvcRequest::Sleep(5), &mut port);

        // `b` traps on the owned mutex; the handler stores the reply in r0.
        let sp_b = kernel.switch_context(sp_a, &mut port).unwrap();
        assert_eq!(kernel.current(), Some(b));
        let reply = kernel.service(SvcRequest::Lock(0), &mut port);
        assert_eq!(reply.action, SvcAction::Reschedule);
        port.write_word(sp_b + InitialFrame::R0_OFFSET, reply.value);
        assert_eq!(reply.value, SvcStatus::Ok as u32);

        // Killed and restarted from the idle task while still queued.
        let sp_idle = kernel.switch_context(sp_b, &mut port).unwrap();
        assert_eq!(kernel.current(), Some(idle));
        kernel.stop_thread(b).unwrap();
        assert!(kernel.task(b).unwrap().wait_cancelled);
        kernel.restart_thread(b).unwrap();
        assert_eq!(kernel.task(b).unwrap().state, TaskState::Ready);

        let resumed = kernel.switch_context(sp_idle, &mut port).unwrap();
        assert_eq!(kernel.current(), Some(b));
        assert_eq!(resumed, sp_b);
        assert_eq!(
            port.read_word(resumed + InitialFrame::R0_OFFSET),
            SvcStatus::Retry as u32
        );
        assert!(!kernel.task(b).unwrap().wait_cancelled);
        assert!(kernel.mutex(0).unwrap().is_owned_by(a.index()));
        assert!(kernel.mutex(0).unwrap().queue.is_empty());

        // The next resume leaves r0 alone.
        port.write_word(resumed + InitialFrame::R0_OFFSET, 0xABCD);
        kernel.service(SvcRequest::Yield, &mut port);
        let again = kernel.switch_context(resumed, &mut port).unwrap();
        assert_eq!(kernel.current(), Some(b));
        assert_eq!(again, resumed);
        assert_eq!(port.read_word(resumed + InitialFrame::R0_OFFSET), 0xABCD);
    }

    #[test]
    fn test_cycle_counter_wraps() {
        let mut kernel = Kernel::default();
        let a = kernel.create_thread(body0, "a", 1, 512).unwrap();
        let mut port = SimPort::new();
        port.cycles = u32::MAX - 99;
        let sp = kernel.switch_context(0, &mut port).unwrap();
        port.cycles = 100;
        kernel.switch_context(sp, &mut port).unwrap();
        assert_eq!(kernel.task(a).unwrap().run_cycles[0], 200);
    }

    #[test]
    fn test_no_runnable_task_is_fatal() {
        let mut kernel = Kernel::default();
        let a = kernel.create_thread(body2, "a", 1, 512).unwrap();
        kernel.stop_thread(a).unwrap();
        let mut port = SimPort::new();
        assert_eq!(
            kernel.switch_context(0, &mut port),
            Err(KernelError::NoRunnableTask)
        );
    }

    #[test]
    fn test_masks_isolate_stacks() {
        let mut kernel = Kernel::new(KernelConfig {
            scheduler: SchedulerMode::RoundRobin,
            ..KernelConfig::default()
        });
        kernel.create_thread(body0, "a", 1, 1536).unwrap();
        kernel.create_thread(body1, "b", 1, 1024).unwrap();
        let mut port = SimPort::new();
        let sp = kernel.switch_context(0, &mut port).unwrap();
        kernel.switch_context(sp, &mut port).unwrap();

        // `a` straddles 4K1|8K1, `b` sits at the start of 4K1.
        let (mask_a, mask_b) = (port.masks[0], port.masks[1]);
        assert!(mask_a.allows(0x2000_1E00) && mask_a.allows(0x2000_2000));
        assert!(!mask_a.allows(0x2000_1000));
        assert!(mask_b.allows(0x2000_1000) && mask_b.allows(0x2000_1200));
        assert!(!mask_b.allows(0x2000_1E00));
    }
}
