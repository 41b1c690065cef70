//! # Kernel
//!
//! The kernel context object and the public API of rtosZero.
//!
//! [`Kernel`] owns every kernel table (TCBs, mutexes, semaphores, the
//! heap ledger and the scheduler state). It is plain data with no
//! hardware access, so host tests can build as many independent
//! instances as they like. On the target a single instance lives in a
//! global guarded by a critical section, and tasks reach it only
//! through `SVC`.
//!
//! ## Startup Sequence
//!
//! ```text
//! reset (cortex-m-rt)
//!   └─► main()
//!         ├─► kernel::init()              ← build the global Kernel
//!         ├─► kernel::init_mutex/semaphore
//!         ├─► kernel::create_thread() ×N  ← stacks from the heap regions
//!         └─► kernel::start()             ← no return
//!               ├─► SysTick, priorities, fault enables, DWT, MPU
//!               └─► pend PendSV with PSP on a scratch stack
//!                     └─► first task fabricated and entered unprivileged
//! ```

use arrayvec::ArrayVec;

use crate::config::{KernelConfig, CPU_WINDOW_TICKS, MAX_MUTEXES, MAX_SEMAPHORES, MAX_TASKS};
use crate::error::KernelError;
use crate::mm::RegionAllocator;
use crate::mpu::SrdMask;
use crate::scheduler::{Scheduler, SchedulerMode};
use crate::sync::{Mutex, Semaphore};
use crate::task::{TaskControlBlock, TaskEntry, TaskHandle, TaskInfo, TaskState};

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Mutex state as shown by `ipcs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutexInfo {
    pub index: usize,
    pub locked: bool,
    pub owner: Option<TaskHandle>,
    pub waiters: ArrayVec<TaskHandle, MAX_TASKS>,
}

/// Semaphore state as shown by `ipcs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemaphoreInfo {
    pub index: usize,
    pub count: u32,
    pub waiters: ArrayVec<TaskHandle, MAX_TASKS>,
}

/// Every synchronization object at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpcsSnapshot {
    pub mutexes: ArrayVec<MutexInfo, MAX_MUTEXES>,
    pub semaphores: ArrayVec<SemaphoreInfo, MAX_SEMAPHORES>,
}

/// Task table as shown by `ps`.
pub type PsSnapshot = ArrayVec<TaskInfo, MAX_TASKS>;

// ---------------------------------------------------------------------------
// Kernel context
// ---------------------------------------------------------------------------

/// All kernel state.
pub struct Kernel {
    pub(crate) tasks: [TaskControlBlock; MAX_TASKS],
    /// One past the highest slot ever claimed.
    pub(crate) task_count: usize,
    /// Slot of the task that was dispatched last. `None` before start.
    pub(crate) current: Option<usize>,
    pub(crate) mutexes: [Mutex; MAX_MUTEXES],
    pub(crate) semaphores: [Semaphore; MAX_SEMAPHORES],
    pub(crate) scheduler: Scheduler,
    pub(crate) heap: RegionAllocator,
    pub(crate) config: KernelConfig,

    /// Half of `run_cycles` currently being filled.
    pub(crate) active_half: usize,
    /// Ticks elapsed in the current accounting window.
    pub(crate) window_ticks: u32,
    /// Cycle counter value at the last dispatch.
    pub(crate) last_dispatch: u32,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Self {
        let depth = config.effective_queue_depth();
        Self {
            tasks: [TaskControlBlock::EMPTY; MAX_TASKS],
            task_count: 0,
            current: None,
            mutexes: core::array::from_fn(|_| Mutex::new(depth)),
            semaphores: core::array::from_fn(|_| Semaphore::new(0, depth)),
            scheduler: Scheduler::new(config.scheduler),
            heap: RegionAllocator::new(),
            config,
            active_half: 0,
            window_ticks: 0,
            last_dispatch: 0,
        }
    }

    #[inline]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    #[inline]
    pub fn heap(&self) -> &RegionAllocator {
        &self.heap
    }

    /// Reset mutex `index` to unlocked with an empty queue.
    pub fn init_mutex(&mut self, index: usize) -> Result<(), KernelError> {
        let depth = self.config.effective_queue_depth();
        let mutex = self.mutexes.get_mut(index).ok_or(KernelError::InvalidObject)?;
        *mutex = Mutex::new(depth);
        Ok(())
    }

    /// Reset semaphore `index` to `count` available units.
    pub fn init_semaphore(&mut self, index: usize, count: u32) -> Result<(), KernelError> {
        let depth = self.config.effective_queue_depth();
        let semaphore = self
            .semaphores
            .get_mut(index)
            .ok_or(KernelError::InvalidObject)?;
        *semaphore = Semaphore::new(count, depth);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Register a task. Its stack comes from the region allocator and its
    /// sub-region mask is computed from that stack. The task starts
    /// `Unrun`; its first dispatch fabricates the initial context.
    pub fn create_thread(
        &mut self,
        entry: TaskEntry,
        name: &str,
        priority: u8,
        stack_bytes: u32,
    ) -> Result<TaskHandle, KernelError> {
        if self.tasks.iter().any(|tcb| tcb.runs(entry)) {
            log::warn!("create_thread: {} is already registered", name);
            return Err(KernelError::DuplicateEntry);
        }
        let slot = self
            .tasks
            .iter()
            .position(|tcb| !tcb.is_valid())
            .ok_or(KernelError::TableFull)?;

        let stack = self.heap.allocate(stack_bytes)?;

        let tcb = &mut self.tasks[slot];
        let generation = tcb.generation.wrapping_add(1);
        *tcb = TaskControlBlock {
            entry: Some(entry),
            generation,
            state: TaskState::Unrun,
            stack_base: stack.base,
            stack_pointer: stack.end(),
            stack_size: stack.size,
            base_priority: priority,
            effective_priority: priority,
            srd: SrdMask::for_allocation(stack.base, stack.size),
            ..TaskControlBlock::EMPTY
        };
        tcb.set_name(name);
        self.task_count = self.task_count.max(slot + 1);

        log::debug!(
            "created {} in slot {} (prio {}, stack {:#010x}+{})",
            name,
            slot,
            priority,
            stack.base,
            stack.size
        );
        Ok(TaskHandle::new(slot, generation))
    }

    /// Stop a task: leave any wait queue, give away owned mutexes and
    /// forget pending delays. The stack is kept for a later restart.
    pub fn stop_thread(&mut self, handle: TaskHandle) -> Result<(), KernelError> {
        let task = self.resolve(handle)?;
        self.stop_slot(task);
        Ok(())
    }

    /// Stop every task called `name` (`pkill`).
    pub fn stop_by_name(&mut self, name: &str) -> Result<(), KernelError> {
        let mut found = false;
        for task in 0..self.task_count {
            if self.tasks[task].is_valid() && self.tasks[task].name.as_str() == name {
                self.stop_slot(task);
                found = true;
            }
        }
        if found {
            Ok(())
        } else {
            Err(KernelError::UnknownTask)
        }
    }

    /// Resume a stopped task. A task that never ran comes back `Unrun`.
    /// Tasks in any other state are left alone.
    pub fn restart_thread(&mut self, handle: TaskHandle) -> Result<(), KernelError> {
        let task = self.resolve(handle)?;
        self.restart_slot(task);
        Ok(())
    }

    /// Resume every stopped task called `name` (`run`).
    pub fn restart_by_name(&mut self, name: &str) -> Result<(), KernelError> {
        let mut found = false;
        for task in 0..self.task_count {
            if self.tasks[task].is_valid() && self.tasks[task].name.as_str() == name {
                self.restart_slot(task);
                found = true;
            }
        }
        if found {
            Ok(())
        } else {
            Err(KernelError::UnknownTask)
        }
    }

    /// Overwrite both base and effective priority. An inherited boost in
    /// effect is discarded.
    pub fn set_priority(&mut self, handle: TaskHandle, priority: u8) -> Result<(), KernelError> {
        let task = self.resolve(handle)?;
        let tcb = &mut self.tasks[task];
        tcb.base_priority = priority;
        tcb.effective_priority = priority;
        log::debug!("{} priority set to {}", tcb.name, priority);
        Ok(())
    }

    fn stop_slot(&mut self, task: usize) {
        let waiting_on = self.tasks[task].blocking_mutex.map(usize::from);
        if let Some(m) = waiting_on {
            self.mutexes[m].queue.remove(task);
        }
        if let Some(s) = self.tasks[task].blocking_semaphore.map(usize::from) {
            self.semaphores[s].queue.remove(task);
        }
        for m in 0..MAX_MUTEXES {
            if self.mutexes[m].is_owned_by(task) {
                self.hand_off(m);
            }
        }

        let tcb = &mut self.tasks[task];
        if matches!(
            tcb.state,
            TaskState::BlockedOnMutex | TaskState::BlockedOnSemaphore
        ) {
            tcb.wait_cancelled = true;
        }
        tcb.clear_blocking();
        tcb.effective_priority = tcb.base_priority;
        tcb.state = TaskState::Stopped;
        log::info!("stopped {}", tcb.name);

        // The boost this task lent to the owner it was waiting on goes away.
        if let Some(owner) = waiting_on.and_then(|m| self.mutexes[m].owner) {
            self.refresh_priority(owner);
        }
    }

    fn restart_slot(&mut self, task: usize) {
        let tcb = &mut self.tasks[task];
        if tcb.state == TaskState::Stopped {
            tcb.state = if tcb.started {
                TaskState::Ready
            } else {
                TaskState::Unrun
            };
            log::info!("restarted {}", tcb.name);
        }
    }

    // -----------------------------------------------------------------------
    // Mutex bookkeeping shared by unlock and stop
    // -----------------------------------------------------------------------

    /// Give mutex `m` to its oldest waiter, or unlock it when nobody
    /// waits. Priorities of the old and new owner are recomputed.
    pub(crate) fn hand_off(&mut self, m: usize) -> Option<usize> {
        let previous = self.mutexes[m].owner;
        let next = self.mutexes[m].queue.pop_front();
        match next {
            Some(waiter) => {
                self.mutexes[m].owner = Some(waiter);
                let tcb = &mut self.tasks[waiter];
                tcb.blocking_mutex = None;
                tcb.state = TaskState::Ready;
            }
            None => {
                self.mutexes[m].locked = false;
                self.mutexes[m].owner = None;
            }
        }
        if let Some(owner) = previous {
            self.refresh_priority(owner);
        }
        if let Some(owner) = next {
            self.refresh_priority(owner);
        }
        next
    }

    /// Effective priority = base priority, raised to the most important
    /// waiter of any mutex the task still owns while inheritance is on.
    pub(crate) fn refresh_priority(&mut self, task: usize) {
        let base = self.tasks[task].base_priority;
        let inherited = if self.config.priority_inheritance {
            self.mutexes
                .iter()
                .filter(|m| m.is_owned_by(task))
                .flat_map(|m| m.queue.iter())
                .map(|waiter| self.tasks[waiter].effective_priority)
                .min()
        } else {
            None
        };
        self.tasks[task].effective_priority = inherited.map_or(base, |p| p.min(base));
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// Advance time by one tick. Wakes sleepers whose delay ran out and
    /// rotates the CPU accounting window. Returns whether a context
    /// switch should be requested (preemptive mode).
    pub fn tick(&mut self) -> bool {
        for tcb in self
            .tasks
            .iter_mut()
            .filter(|tcb| tcb.state == TaskState::Delayed)
        {
            tcb.ticks = tcb.ticks.saturating_sub(1);
            if tcb.ticks == 0 {
                tcb.state = TaskState::Ready;
            }
        }

        self.window_ticks += 1;
        if self.window_ticks >= CPU_WINDOW_TICKS {
            self.window_ticks = 0;
            self.active_half ^= 1;
            let half = self.active_half;
            for tcb in self.tasks.iter_mut() {
                tcb.run_cycles[half] = 0;
            }
        }

        self.config.preemption
    }

    // -----------------------------------------------------------------------
    // Modes
    // -----------------------------------------------------------------------

    #[inline]
    pub fn scheduler_mode(&self) -> SchedulerMode {
        self.scheduler.mode()
    }

    pub fn set_scheduler_mode(&mut self, mode: SchedulerMode) {
        self.scheduler.set_mode(mode);
        log::info!("scheduler: {}", mode.label());
    }

    pub fn set_preemption(&mut self, on: bool) {
        self.config.preemption = on;
        log::info!("preemption: {}", if on { "on" } else { "off" });
    }

    /// Toggle inheritance. Turning it off drops every boost in effect.
    pub fn set_priority_inheritance(&mut self, on: bool) {
        self.config.priority_inheritance = on;
        for task in 0..self.task_count {
            if self.tasks[task].is_valid() {
                self.refresh_priority(task);
            }
        }
        log::info!("priority inheritance: {}", if on { "on" } else { "off" });
    }

    // -----------------------------------------------------------------------
    // Lookup and introspection
    // -----------------------------------------------------------------------

    /// Slot index of a live handle.
    pub(crate) fn resolve(&self, handle: TaskHandle) -> Result<usize, KernelError> {
        match self.tasks.get(handle.index()) {
            Some(tcb) if tcb.is_valid() && tcb.generation == handle.generation() => {
                Ok(handle.index())
            }
            _ => Err(KernelError::UnknownTask),
        }
    }

    #[inline]
    pub(crate) fn handle_of(&self, task: usize) -> TaskHandle {
        TaskHandle::new(task, self.tasks[task].generation)
    }

    /// Handle of the first task called `name` (`pidof`).
    pub fn find_by_name(&self, name: &str) -> Option<TaskHandle> {
        (0..self.task_count)
            .find(|&i| self.tasks[i].is_valid() && self.tasks[i].name.as_str() == name)
            .map(|i| self.handle_of(i))
    }

    pub fn task(&self, handle: TaskHandle) -> Option<&TaskControlBlock> {
        self.resolve(handle).ok().map(|i| &self.tasks[i])
    }

    /// Task dispatched last.
    pub fn current(&self) -> Option<TaskHandle> {
        self.current.map(|i| self.handle_of(i))
    }

    pub fn mutex(&self, index: usize) -> Option<&Mutex> {
        self.mutexes.get(index)
    }

    pub fn semaphore(&self, index: usize) -> Option<&Semaphore> {
        self.semaphores.get(index)
    }

    /// Mutex `handle` is queued on, if any.
    pub fn blocking_mutex(&self, handle: TaskHandle) -> Option<&Mutex> {
        let tcb = self.task(handle)?;
        self.mutexes.get(usize::from(tcb.blocking_mutex?))
    }

    /// Semaphore `handle` is queued on, if any.
    pub fn blocking_semaphore(&self, handle: TaskHandle) -> Option<&Semaphore> {
        let tcb = self.task(handle)?;
        self.semaphores.get(usize::from(tcb.blocking_semaphore?))
    }

    /// Snapshot of every claimed slot (`ps`).
    pub fn ps(&self) -> PsSnapshot {
        self.tasks[..self.task_count]
            .iter()
            .enumerate()
            .filter(|(_, tcb)| tcb.is_valid())
            .map(|(i, tcb)| tcb.info(i, self.active_half))
            .collect()
    }

    /// Snapshot of every mutex and semaphore (`ipcs`).
    pub fn ipcs(&self) -> IpcsSnapshot {
        let waiters = |queue: &crate::sync::WaitQueue| -> ArrayVec<TaskHandle, MAX_TASKS> {
            queue.iter().map(|t| self.handle_of(t)).collect()
        };
        IpcsSnapshot {
            mutexes: self
                .mutexes
                .iter()
                .enumerate()
                .map(|(index, m)| MutexInfo {
                    index,
                    locked: m.locked,
                    owner: m.owner.map(|t| self.handle_of(t)),
                    waiters: waiters(&m.queue),
                })
                .collect(),
            semaphores: self
                .semaphores
                .iter()
                .enumerate()
                .map(|(index, s)| SemaphoreInfo {
                    index,
                    count: s.count,
                    waiters: waiters(&s.queue),
                })
                .collect(),
        }
    }

    /// Stop the running task after it faulted. Returns its handle.
    pub fn fault_current(&mut self) -> Option<TaskHandle> {
        let task = self.current?;
        log::error!("{} faulted, stopping it", self.tasks[task].name);
        self.stop_slot(task);
        Some(self.handle_of(task))
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new(KernelConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Global instance and task-facing API (target only)
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub use self::firmware::*;

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod firmware {
    use core::cell::RefCell;

    use cortex_m::interrupt::Mutex as IrqMutex;

    use super::{IpcsSnapshot, Kernel, PsSnapshot};
    use crate::arch::cortex_m4::{self, svc};
    use crate::config::KernelConfig;
    use crate::error::KernelError;
    use crate::scheduler::SchedulerMode;
    use crate::svc::{SvcNumber, SvcStatus};
    use crate::sync;
    use crate::task::{TaskEntry, TaskHandle};

    /// The kernel instance. Only touched inside critical sections: by
    /// bring-up code before `start`, and by the SVCall, SysTick and
    /// PendSV handlers afterwards.
    static KERNEL: IrqMutex<RefCell<Option<Kernel>>> = IrqMutex::new(RefCell::new(None));

    /// Run `f` on the kernel. Returns `None` before [`init`].
    pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> Option<R> {
        sync::critical_section(|cs| KERNEL.borrow(cs).borrow_mut().as_mut().map(f))
    }

    /// Build the kernel. Must run before any other call here.
    pub fn init(config: KernelConfig) {
        sync::critical_section(|cs| {
            KERNEL.borrow(cs).replace(Some(Kernel::new(config)));
        });
        log::info!("kernel initialised: {:?}", config);
    }

    pub fn init_mutex(index: usize) -> Result<(), KernelError> {
        with_kernel(|k| k.init_mutex(index)).unwrap_or(Err(KernelError::InvalidObject))
    }

    pub fn init_semaphore(index: usize, count: u32) -> Result<(), KernelError> {
        with_kernel(|k| k.init_semaphore(index, count)).unwrap_or(Err(KernelError::InvalidObject))
    }

    pub fn create_thread(
        entry: TaskEntry,
        name: &str,
        priority: u8,
        stack_bytes: u32,
    ) -> Result<TaskHandle, KernelError> {
        with_kernel(|k| k.create_thread(entry, name, priority, stack_bytes))
            .unwrap_or(Err(KernelError::TableFull))
    }

    /// Start the scheduler. **Does not return.**
    pub fn start(mut core: cortex_m::Peripherals) -> ! {
        cortex_m4::configure_systick(&mut core.SYST);
        cortex_m4::set_interrupt_priorities(&mut core.SCB);
        cortex_m4::enable_fault_handlers(&mut core.SCB);
        cortex_m4::enable_cycle_counter(&mut core.DCB, &mut core.DWT);
        cortex_m4::configure_mpu(&mut core.MPU);
        log::info!("starting scheduler");
        unsafe { cortex_m4::start_first_task() }
    }

    // -----------------------------------------------------------------------
    // Syscalls
    // -----------------------------------------------------------------------

    /// Give up the CPU.
    pub fn yield_task() {
        svc!(SvcNumber::Yield);
    }

    /// Sleep for `ms` ticks. `sleep(0)` yields.
    pub fn sleep(ms: u32) {
        svc!(SvcNumber::Sleep, ms);
    }

    /// Lock mutex `index`, blocking while another task owns it.
    pub fn lock(index: usize) -> SvcStatus {
        retry(|| svc!(SvcNumber::Lock, index as u32))
    }

    pub fn unlock(index: usize) -> SvcStatus {
        SvcStatus::from_raw(svc!(SvcNumber::Unlock, index as u32))
    }

    /// Take one unit of semaphore `index`, blocking while none is left.
    pub fn wait(index: usize) -> SvcStatus {
        retry(|| svc!(SvcNumber::Wait, index as u32))
    }

    pub fn post(index: usize) -> SvcStatus {
        SvcStatus::from_raw(svc!(SvcNumber::Post, index as u32))
    }

    pub fn stop_thread(handle: TaskHandle) -> SvcStatus {
        SvcStatus::from_raw(svc!(SvcNumber::Stop, handle.to_raw()))
    }

    pub fn restart_thread(handle: TaskHandle) -> SvcStatus {
        SvcStatus::from_raw(svc!(SvcNumber::Restart, handle.to_raw()))
    }

    pub fn set_priority(handle: TaskHandle, priority: u8) -> SvcStatus {
        SvcStatus::from_raw(svc!(
            SvcNumber::SetPriority,
            handle.to_raw(),
            u32::from(priority)
        ))
    }

    pub fn reboot() -> ! {
        svc!(SvcNumber::Reboot);
        loop {
            cortex_m::asm::wfi();
        }
    }

    /// Fill `out` with the task table. Returns the number of entries.
    /// `out` must live on the calling task's stack.
    pub fn ps(out: &mut PsSnapshot) -> usize {
        svc!(SvcNumber::Ps, out as *mut PsSnapshot as u32) as usize
    }

    /// `out` must live on the calling task's stack.
    pub fn ipcs(out: &mut IpcsSnapshot) {
        svc!(SvcNumber::Ipcs, out as *mut IpcsSnapshot as u32);
    }

    pub fn set_scheduler(mode: SchedulerMode) {
        svc!(SvcNumber::Sched, (mode == SchedulerMode::Priority) as u32);
    }

    pub fn set_preemption(on: bool) {
        svc!(SvcNumber::Preempt, on as u32);
    }

    pub fn set_priority_inheritance(on: bool) {
        svc!(SvcNumber::Priority, on as u32);
    }

    /// `name` is read from flash or the calling task's stack; anything
    /// else is refused with `InvalidObject`.
    pub fn pidof(name: &str) -> Option<TaskHandle> {
        TaskHandle::from_raw(svc!(
            SvcNumber::Pidof,
            name.as_ptr() as u32,
            name.len() as u32
        ))
    }

    pub fn pkill(name: &str) -> SvcStatus {
        SvcStatus::from_raw(svc!(
            SvcNumber::Pkill,
            name.as_ptr() as u32,
            name.len() as u32
        ))
    }

    pub fn run(name: &str) -> SvcStatus {
        SvcStatus::from_raw(svc!(
            SvcNumber::Run,
            name.as_ptr() as u32,
            name.len() as u32
        ))
    }

    /// Repeat a blocking call while its wait queue is full.
    fn retry(mut call: impl FnMut() -> u32) -> SvcStatus {
        loop {
            match SvcStatus::from_raw(call()) {
                SvcStatus::Retry => yield_task(),
                status => return status,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::context::tests::SimPort;
    use crate::svc::SvcRequest;

    pub(crate) fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    macro_rules! bodies {
        ($($name:ident = $n:expr;)*) => {
            $(
                pub(crate) extern "C" fn $name() -> ! {
                    loop {
                        core::hint::black_box($n);
                    }
                }
            )*
            pub(crate) const BODIES: [TaskEntry; 13] = [$($name),*];
        };
    }

    bodies! {
        body0 = 0; body1 = 1; body2 = 2; body3 = 3; body4 = 4; body5 = 5; body6 = 6;
        body7 = 7; body8 = 8; body9 = 9; body10 = 10; body11 = 11; body12 = 12;
    }

    #[test]
    fn test_create_thread() {
        init_logging();
        let mut kernel = Kernel::default();
        let handle = kernel.create_thread(body0, "Idle", 7, 512).unwrap();
        let tcb = kernel.task(handle).unwrap();
        assert_eq!(tcb.state, TaskState::Unrun);
        assert_eq!(tcb.name.as_str(), "Idle");
        assert_eq!(tcb.stack_base, 0x2000_1000);
        assert_eq!(tcb.stack_size, 512);
        assert_eq!(tcb.stack_pointer, 0x2000_1200);
        assert_eq!(tcb.srd.srd(0), 0xFE);
        assert_eq!((tcb.base_priority, tcb.effective_priority), (7, 7));
    }

    #[test]
    fn test_duplicate_entry_rejected() {
        let mut kernel = Kernel::default();
        kernel.create_thread(body1, "A", 3, 512).unwrap();
        assert_eq!(
            kernel.create_thread(body1, "B", 3, 512),
            Err(KernelError::DuplicateEntry)
        );
        assert_eq!(kernel.ps().len(), 1);
    }

    #[test]
    fn test_table_capacity() {
        let mut kernel = Kernel::default();
        let mut handles = std::vec::Vec::new();
        for (i, &entry) in BODIES.iter().take(MAX_TASKS).enumerate() {
            handles.push(kernel.create_thread(entry, "t", i as u8, 512).unwrap());
        }
        for (i, a) in handles.iter().enumerate() {
            for b in &handles[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(
            kernel.create_thread(BODIES[MAX_TASKS], "extra", 0, 512),
            Err(KernelError::TableFull)
        );
    }

    #[test]
    fn test_out_of_memory_creates_nothing() {
        let mut kernel = Kernel::default();
        kernel.create_thread(body0, "big1", 0, 6 * 1024).unwrap();
        kernel.create_thread(body1, "big2", 0, 7 * 1024).unwrap();
        assert_eq!(
            kernel.create_thread(body2, "big3", 0, 7 * 1024),
            Err(KernelError::OutOfMemory)
        );
        assert_eq!(kernel.ps().len(), 2);
        assert_eq!(kernel.find_by_name("big3"), None);
    }

    #[test]
    fn test_stop_and_restart() {
        let mut kernel = Kernel::default();
        let handle = kernel.create_thread(body0, "Flash4Hz", 4, 1024).unwrap();
        kernel.stop_thread(handle).unwrap();
        assert_eq!(kernel.task(handle).unwrap().state, TaskState::Stopped);

        // Never ran: restarts as Unrun.
        kernel.restart_thread(handle).unwrap();
        assert_eq!(kernel.task(handle).unwrap().state, TaskState::Unrun);

        kernel.tasks[handle.index()].started = true;
        kernel.tasks[handle.index()].state = TaskState::Delayed;
        kernel.tasks[handle.index()].ticks = 40;
        kernel.stop_thread(handle).unwrap();
        assert_eq!(kernel.task(handle).unwrap().ticks, 0);
        kernel.restart_thread(handle).unwrap();
        assert_eq!(kernel.task(handle).unwrap().state, TaskState::Ready);

        // Restart leaves non-stopped tasks alone.
        kernel.tasks[handle.index()].state = TaskState::BlockedOnSemaphore;
        kernel.restart_thread(handle).unwrap();
        assert_eq!(
            kernel.task(handle).unwrap().state,
            TaskState::BlockedOnSemaphore
        );
    }

    #[test]
    fn test_unknown_handles() {
        let mut kernel = Kernel::default();
        let handle = kernel.create_thread(body0, "Idle", 7, 512).unwrap();
        let stale = TaskHandle::new(handle.index(), handle.generation() + 1);
        assert_eq!(kernel.stop_thread(stale), Err(KernelError::UnknownTask));
        assert_eq!(
            kernel.restart_thread(TaskHandle::new(9, 1)),
            Err(KernelError::UnknownTask)
        );
        assert_eq!(kernel.set_priority(stale, 1), Err(KernelError::UnknownTask));
        assert_eq!(kernel.stop_by_name("nobody"), Err(KernelError::UnknownTask));
        assert_eq!(kernel.task(handle).unwrap().state, TaskState::Unrun);
    }

    #[test]
    fn test_names() {
        let mut kernel = Kernel::default();
        let keys = kernel.create_thread(body0, "ReadKeys", 6, 1024).unwrap();
        kernel.create_thread(body1, "Debounce", 6, 1024).unwrap();
        assert_eq!(kernel.find_by_name("ReadKeys"), Some(keys));

        kernel.stop_by_name("ReadKeys").unwrap();
        assert_eq!(kernel.task(keys).unwrap().state, TaskState::Stopped);
        kernel.restart_by_name("ReadKeys").unwrap();
        assert_eq!(kernel.task(keys).unwrap().state, TaskState::Unrun);
    }

    #[test]
    fn test_set_priority_overwrites_inherited() {
        let mut kernel = Kernel::default();
        let handle = kernel.create_thread(body0, "LengthyFn", 6, 1024).unwrap();
        kernel.tasks[handle.index()].effective_priority = 0;
        kernel.set_priority(handle, 9).unwrap();
        let tcb = kernel.task(handle).unwrap();
        assert_eq!((tcb.base_priority, tcb.effective_priority), (9, 9));
    }

    #[test]
    fn test_tick_wakes_sleepers() {
        let mut kernel = Kernel::default();
        let a = kernel.create_thread(body0, "a", 1, 512).unwrap();
        let b = kernel.create_thread(body1, "b", 1, 512).unwrap();
        for (h, ticks) in [(a, 1), (b, 3)] {
            kernel.tasks[h.index()].state = TaskState::Delayed;
            kernel.tasks[h.index()].ticks = ticks;
        }
        assert!(!kernel.tick());
        assert_eq!(kernel.task(a).unwrap().state, TaskState::Ready);
        assert_eq!(kernel.task(b).unwrap().state, TaskState::Delayed);
        kernel.tick();
        kernel.tick();
        assert_eq!(kernel.task(b).unwrap().state, TaskState::Ready);

        kernel.set_preemption(true);
        assert!(kernel.tick());
    }

    #[test]
    fn test_accounting_window_swaps() {
        let mut kernel = Kernel::default();
        let a = kernel.create_thread(body0, "a", 1, 512).unwrap();
        kernel.tasks[a.index()].run_cycles = [1234, 99];
        for _ in 0..CPU_WINDOW_TICKS - 1 {
            kernel.tick();
        }
        assert_eq!(kernel.active_half, 0);
        kernel.tick();
        assert_eq!(kernel.active_half, 1);
        assert_eq!(kernel.tasks[a.index()].run_cycles, [1234, 0]);
    }

    #[test]
    fn test_fault_hands_mutex_to_waiter() {
        init_logging();
        let mut kernel = Kernel::default();
        kernel.init_mutex(0).unwrap();
        let a = kernel.create_thread(body0, "a", 1, 512).unwrap();
        let b = kernel.create_thread(body1, "b", 2, 512).unwrap();
        let idle = kernel.create_thread(body2, "Idle", 7, 512).unwrap();
        let mut port = SimPort::new();
        assert_eq!(kernel.fault_current(), None);

        let sp_a = kernel.switch_context(0, &mut port).unwrap();
        assert_eq!(kernel.current(), Some(a));
        kernel.service(SvcRequest::Lock(0), &mut port);
        kernel.service(SvcRequest::Sleep(2), &mut port);
        let sp_b = kernel.switch_context(sp_a, &mut port).unwrap();
        assert_eq!(kernel.current(), Some(b));
        kernel.service(SvcRequest::Lock(0), &mut port);
        kernel.tick();
        kernel.tick();
        let sp = kernel.switch_context(sp_b, &mut port).unwrap();
        assert_eq!(kernel.current(), Some(a));

        assert_eq!(kernel.fault_current(), Some(a));
        assert_eq!(kernel.task(a).unwrap().state, TaskState::Stopped);
        let mutex = kernel.mutex(0).unwrap();
        assert!(mutex.is_owned_by(b.index()));
        assert!(mutex.queue.is_empty());
        assert_eq!(kernel.task(b).unwrap().state, TaskState::Ready);

        let sp = kernel.switch_context(sp, &mut port).unwrap();
        assert_eq!(kernel.current(), Some(b));
        assert_eq!(sp, sp_b);

        // No one left waiting: the mutex is simply freed.
        assert_eq!(kernel.fault_current(), Some(b));
        let mutex = kernel.mutex(0).unwrap();
        assert!(!mutex.locked);
        assert_eq!(mutex.owner, None);
        kernel.switch_context(sp, &mut port).unwrap();
        assert_eq!(kernel.current(), Some(idle));
    }

    #[test]
    fn test_fault_while_queued_on_semaphore() {
        let mut kernel = Kernel::default();
        kernel.init_semaphore(1, 0).unwrap();
        let a = kernel.create_thread(body0, "a", 1, 512).unwrap();
        let b = kernel.create_thread(body1, "b", 2, 512).unwrap();
        let idle = kernel.create_thread(body2, "Idle", 7, 512).unwrap();
        let mut port = SimPort::new();

        let sp = kernel.switch_context(0, &mut port).unwrap();
        kernel.service(SvcRequest::Wait(1), &mut port);
        kernel.current = Some(b.index());
        kernel.service(SvcRequest::Wait(1), &mut port);
        // `a` faults before PendSV gets to switch it out.
        kernel.current = Some(a.index());

        assert_eq!(kernel.fault_current(), Some(a));
        assert_eq!(kernel.task(a).unwrap().state, TaskState::Stopped);
        assert!(kernel.blocking_semaphore(a).is_none());
        let semaphore = kernel.semaphore(1).unwrap();
        assert_eq!(
            semaphore.queue.iter().collect::<std::vec::Vec<_>>(),
            [b.index()]
        );

        kernel.switch_context(sp, &mut port).unwrap();
        assert_eq!(kernel.current(), Some(idle));
        kernel.service(SvcRequest::Post(1), &mut port);
        assert_eq!(kernel.task(b).unwrap().state, TaskState::Ready);
        assert_eq!(kernel.task(a).unwrap().state, TaskState::Stopped);
    }

    #[test]
    fn test_object_indices_checked() {
        let mut kernel = Kernel::default();
        assert_eq!(kernel.init_mutex(MAX_MUTEXES), Err(KernelError::InvalidObject));
        assert_eq!(
            kernel.init_semaphore(MAX_SEMAPHORES, 1),
            Err(KernelError::InvalidObject)
        );
        kernel.init_semaphore(2, 5).unwrap();
        assert_eq!(kernel.semaphore(2).unwrap().count, 5);
        assert_eq!(kernel.ipcs().semaphores[2].count, 5);
    }
}
