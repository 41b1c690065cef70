//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the TM4C123GH6PM (ARM Cortex-M4, Thumb-2).
//! Everything that touches a core register lives here; the kernel proper
//! only sees the [`Port`] trait.
//!
//! ## Context Switch Mechanism
//!
//! - **MSP** (Main Stack Pointer): kernel, exception handlers.
//! - **PSP** (Process Stack Pointer): tasks, in unprivileged Thread mode.
//!
//! On exception entry the hardware stacks r0-r3, r12, lr, pc and xPSR
//! onto the PSP. PendSV pushes r4-r11 and EXC_RETURN below that, calls
//! [`Kernel::switch_context`](crate::kernel::Kernel::switch_context) and
//! pops the same layout from whatever PSP it returns.
//!
//! ## Interrupt Priorities
//!
//! - SVCall, SysTick: 0x80. They cannot preempt each other.
//! - PendSV: 0xFF (lowest). Runs only after the trap that pended it.

use core::arch::naked_asm;

use cortex_m::peripheral::scb::{Exception, SystemHandler};
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{DCB, DWT, MPU, SCB, SYST};
use cortex_m::register::control::{self, Npriv};
use cortex_m_rt::{exception, ExceptionFrame as FaultFrame};

use crate::config::{BOOT_STACK_WORDS, SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::context::{ExceptionFrame, Port, StackMemory};
use crate::kernel;
use crate::mm::HEAP_REGIONS;
use crate::mpu::{boot_regions, heap_rasr, ProtectionUnit, SrdMask, HEAP_REGION_NUMBER};
use crate::svc::{self, SvcAction, SvcReply};

/// Priority of SVCall and SysTick.
const TRAP_PRIORITY: u8 = 0x80;
/// Priority of PendSV.
const SWITCH_PRIORITY: u8 = 0xFF;

/// MPU_CTRL: ENABLE | PRIVDEFENA.
const MPU_CTRL_ENABLE: u32 = 0b101;

// ---------------------------------------------------------------------------
// Bring-up
// ---------------------------------------------------------------------------

/// Configure SysTick to fire at `TICK_HZ` from the core clock.
pub fn configure_systick(syst: &mut SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

pub fn set_interrupt_priorities(scb: &mut SCB) {
    unsafe {
        scb.set_priority(SystemHandler::SVCall, TRAP_PRIORITY);
        scb.set_priority(SystemHandler::SysTick, TRAP_PRIORITY);
        scb.set_priority(SystemHandler::PendSV, SWITCH_PRIORITY);
    }
}

/// Route MPU, bus and usage faults to their own handlers instead of
/// escalating to HardFault.
pub fn enable_fault_handlers(scb: &mut SCB) {
    scb.enable(Exception::MemoryManagement);
    scb.enable(Exception::BusFault);
    scb.enable(Exception::UsageFault);
}

/// Start the DWT cycle counter used for CPU accounting.
pub fn enable_cycle_counter(dcb: &mut DCB, dwt: &mut DWT) {
    dcb.enable_trace();
    dwt.enable_cycle_counter();
}

/// Program the fixed region table and turn the MPU on.
pub fn configure_mpu(mpu: &mut MPU) {
    unsafe {
        mpu.ctrl.write(0);
        for region in boot_regions() {
            mpu.rbar.write(region.rbar);
            mpu.rasr.write(region.rasr);
        }
        mpu.ctrl.write(MPU_CTRL_ENABLE);
    }
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// The real processor.
pub struct CortexM4Port;

impl StackMemory for CortexM4Port {
    fn read_word(&self, address: u32) -> u32 {
        unsafe { core::ptr::read_volatile(address as *const u32) }
    }

    fn write_word(&mut self, address: u32, value: u32) {
        unsafe { core::ptr::write_volatile(address as *mut u32, value) }
    }

    fn translate(&mut self, address: u32) -> *mut u8 {
        address as usize as *mut u8
    }
}

impl ProtectionUnit for CortexM4Port {
    fn apply(&mut self, mask: &SrdMask) {
        let mpu = unsafe { &*MPU::PTR };
        for (i, region) in HEAP_REGIONS.iter().enumerate() {
            unsafe {
                mpu.rnr.write(HEAP_REGION_NUMBER + i as u32);
                mpu.rasr.write(heap_rasr(region, mask.srd(i)));
            }
        }
        cortex_m::asm::dsb();
        cortex_m::asm::isb();
    }
}

impl Port for CortexM4Port {
    fn cycle_count(&self) -> u32 {
        DWT::cycle_count()
    }

    fn enter_unprivileged(&mut self) {
        let mut ctrl = control::read();
        ctrl.set_npriv(Npriv::Unprivileged);
        unsafe { control::write(ctrl) };
        cortex_m::asm::isb();
    }
}

// ---------------------------------------------------------------------------
// First task launch
// ---------------------------------------------------------------------------

/// PendSV saves the "outgoing" registers here on the very first switch,
/// when no task is running yet.
static mut BOOT_STACK: [u32; BOOT_STACK_WORDS] = [0; BOOT_STACK_WORDS];

/// Hand the CPU to the scheduler.
///
/// Points PSP at the boot scratch stack and pends PendSV; the first
/// switch fabricates the chosen task's context and never comes back here.
///
/// # Safety
/// Call once, from `main`, after the kernel holds at least one task.
pub unsafe fn start_first_task() -> ! {
    let base = core::ptr::addr_of_mut!(BOOT_STACK) as u32;
    let top = (base + (BOOT_STACK_WORDS * 4) as u32) & !7;
    cortex_m::register::psp::write(top);
    SCB::set_pendsv();
    cortex_m::asm::isb();
    loop {
        cortex_m::asm::wfi();
    }
}

// ---------------------------------------------------------------------------
// PendSV handler (context switch)
// ---------------------------------------------------------------------------

/// PendSV exception handler.
///
/// 1. Push r4-r11 and EXC_RETURN onto the outgoing PSP.
/// 2. `pendsv_switch(psp) -> psp` picks the incoming task.
/// 3. Pop r4-r11 and EXC_RETURN from the incoming PSP and return.
///
/// # Safety
/// Naked; entered only by the NVIC.
#[unsafe(naked)]
#[no_mangle]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11, lr}}",
        "bl {switch}",
        "ldmia r0!, {{r4-r11, lr}}",
        "msr psp, r0",
        "bx lr",
        switch = sym pendsv_switch,
    );
}

extern "C" fn pendsv_switch(saved_sp: u32) -> u32 {
    let mut port = CortexM4Port;
    match kernel::with_kernel(|k| k.switch_context(saved_sp, &mut port)) {
        Some(Ok(sp)) => sp,
        Some(Err(error)) => {
            log::error!("context switch failed: {}", error);
            panic!("{}", error)
        }
        None => panic!("PendSV before kernel::init"),
    }
}

// ---------------------------------------------------------------------------
// SVCall handler (syscalls)
// ---------------------------------------------------------------------------

/// SVCall exception handler. Passes the caller's stacked frame on.
///
/// # Safety
/// Naked; entered only by an `SVC` instruction in Thread mode.
#[unsafe(naked)]
#[no_mangle]
pub unsafe extern "C" fn SVCall() {
    naked_asm!(
        "mrs r0, psp",
        "b {entry}",
        entry = sym svcall_entry,
    );
}

extern "C" fn svcall_entry(frame: *mut ExceptionFrame) {
    let frame = unsafe { &mut *frame };
    // The immediate is the low byte of the 16-bit SVC instruction.
    let number = unsafe { core::ptr::read_volatile((frame.pc - 2) as *const u8) };
    let args = [frame.r0, frame.r1, frame.r2];

    let reply = match svc::decode(number, args) {
        Ok(request) => kernel::with_kernel(|k| k.service(request, &mut CortexM4Port)),
        Err(status) => Some(SvcReply {
            value: status as u32,
            action: SvcAction::Resume,
        }),
    };
    let Some(reply) = reply else {
        return;
    };

    frame.r0 = reply.value;
    match reply.action {
        SvcAction::Resume => {}
        SvcAction::Reschedule => SCB::set_pendsv(),
        SvcAction::Reboot => SCB::sys_reset(),
    }
}

/// Issue `SVC #number` with up to two arguments; evaluates to the
/// returned r0.
macro_rules! svc {
    ($number:expr) => {
        $crate::arch::cortex_m4::svc!($number, 0u32, 0u32)
    };
    ($number:expr, $a0:expr) => {
        $crate::arch::cortex_m4::svc!($number, $a0, 0u32)
    };
    ($number:expr, $a0:expr, $a1:expr) => {{
        let mut r0: u32 = $a0;
        let r1: u32 = $a1;
        unsafe {
            core::arch::asm!(
                "svc #{number}",
                number = const $number as u8,
                inout("r0") r0,
                in("r1") r1,
                options(nostack),
            );
        }
        r0
    }};
}
pub(crate) use svc;

// ---------------------------------------------------------------------------
// SysTick and faults
// ---------------------------------------------------------------------------

#[exception]
fn SysTick() {
    if kernel::with_kernel(|k| k.tick()).unwrap_or(false) {
        SCB::set_pendsv();
    }
}

/// A task touched memory outside its sub-regions: stop it and switch away.
#[exception]
fn MemoryManagement() {
    let scb = unsafe { &*SCB::PTR };
    let cfsr = scb.cfsr.read();
    let address = scb.mmfar.read();
    log::error!("MPU fault at {:#010x} (CFSR {:#010x})", address, cfsr);
    // MMFSR bits are write-one-to-clear.
    unsafe { scb.cfsr.write(cfsr & 0xFF) };

    kernel::with_kernel(|k| k.fault_current());
    SCB::set_pendsv();
}

#[exception]
fn BusFault() {
    let cfsr = unsafe { (*SCB::PTR).cfsr.read() };
    panic!("bus fault (CFSR {:#010x})", cfsr);
}

#[exception]
fn UsageFault() {
    let cfsr = unsafe { (*SCB::PTR).cfsr.read() };
    panic!("usage fault (CFSR {:#010x})", cfsr);
}

#[exception]
unsafe fn HardFault(frame: &FaultFrame) -> ! {
    log::error!("hard fault at pc {:#010x}", frame.pc());
    loop {
        cortex_m::asm::wfi();
    }
}
