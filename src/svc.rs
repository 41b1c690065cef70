//! # Syscall Dispatcher
//!
//! Tasks run unprivileged and reach the kernel only through `SVC #n`.
//! The SVCall handler decodes the immediate and the stacked r0-r2 into an
//! [`SvcRequest`], runs it through [`Kernel::service`] and writes
//! [`SvcReply::value`] back into the caller's stacked r0.
//!
//! Pointer arguments stay raw target addresses until [`Kernel::service`]
//! has checked them against the caller: snapshots must land inside the
//! caller's own stack, and names must come from that stack or from flash.
//! Anything else is refused with `InvalidObject`, so a task cannot make
//! the privileged handler read or write memory the MPU denies it.
//!
//! The dispatcher never switches tasks itself. A state change ends with
//! [`SvcAction::Reschedule`] and the handler pends PendSV, which runs once
//! SVCall returns because it sits at a lower priority.
//!
//! | imm  | call        | r0             | r1       | result        |
//! |------|-------------|----------------|----------|---------------|
//! | 0x00 | yield       |                |          | status        |
//! | 0x01 | sleep       | ticks          |          | status        |
//! | 0x02 | lock        | mutex          |          | status        |
//! | 0x03 | unlock      | mutex          |          | status        |
//! | 0x04 | wait        | semaphore      |          | status        |
//! | 0x05 | post        | semaphore      |          | status        |
//! | 0x06 | stop        | pid            |          | status        |
//! | 0x07 | restart     | pid            |          | status        |
//! | 0x08 | reboot      |                |          | does not return |
//! | 0x09 | ps          | `*mut PsSnapshot` |       | task count    |
//! | 0x11 | sched       | 1 = priority   |          | status        |
//! | 0x12 | preempt     | on             |          | status        |
//! | 0x13 | pidof       | name ptr       | name len | pid or `!0`   |
//! | 0x14 | pkill       | name ptr       | name len | status        |
//! | 0x15 | run         | name ptr       | name len | status        |
//! | 0x16 | ipcs        | `*mut IpcsSnapshot` |     | status        |
//! | 0x17 | setpriority | pid            | priority | status        |
//! | 0x18 | inheritance | on             |          | status        |

use core::fmt;
use core::mem::{align_of, size_of};

use crate::config::TASK_NAME_LEN;
use crate::context::StackMemory;
use crate::error::KernelError;
use crate::kernel::{IpcsSnapshot, Kernel, PsSnapshot};
use crate::mpu::{FLASH_BASE, FLASH_SIZE};
use crate::scheduler::SchedulerMode;
use crate::task::{TaskHandle, TaskName, TaskState};

/// `SVC` immediates.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvcNumber {
    Yield = 0x00,
    Sleep = 0x01,
    Lock = 0x02,
    Unlock = 0x03,
    Wait = 0x04,
    Post = 0x05,
    Stop = 0x06,
    Restart = 0x07,
    Reboot = 0x08,
    Ps = 0x09,
    Sched = 0x11,
    Preempt = 0x12,
    Pidof = 0x13,
    Pkill = 0x14,
    Run = 0x15,
    Ipcs = 0x16,
    SetPriority = 0x17,
    Priority = 0x18,
}

impl TryFrom<u8> for SvcNumber {
    type Error = SvcStatus;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => Self::Yield,
            0x01 => Self::Sleep,
            0x02 => Self::Lock,
            0x03 => Self::Unlock,
            0x04 => Self::Wait,
            0x05 => Self::Post,
            0x06 => Self::Stop,
            0x07 => Self::Restart,
            0x08 => Self::Reboot,
            0x09 => Self::Ps,
            0x11 => Self::Sched,
            0x12 => Self::Preempt,
            0x13 => Self::Pidof,
            0x14 => Self::Pkill,
            0x15 => Self::Run,
            0x16 => Self::Ipcs,
            0x17 => Self::SetPriority,
            0x18 => Self::Priority,
            _ => return Err(SvcStatus::UnknownService),
        })
    }
}

/// Status written back to the caller's r0.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvcStatus {
    Ok = 0,
    /// Wait queue full; the caller should yield and try again.
    Retry = 1,
    InvalidObject = 2,
    NotOwner = 3,
    UnknownTask = 4,
    AlreadyOwner = 5,
    UnknownService = 6,
}

impl SvcStatus {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Ok,
            1 => Self::Retry,
            2 => Self::InvalidObject,
            3 => Self::NotOwner,
            4 => Self::UnknownTask,
            5 => Self::AlreadyOwner,
            _ => Self::UnknownService,
        }
    }
}

impl From<KernelError> for SvcStatus {
    fn from(error: KernelError) -> Self {
        match error {
            KernelError::InvalidObject => SvcStatus::InvalidObject,
            _ => SvcStatus::UnknownTask,
        }
    }
}

impl fmt::Display for SvcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SvcStatus::Ok => "ok",
            SvcStatus::Retry => "retry",
            SvcStatus::InvalidObject => "invalid object",
            SvcStatus::NotOwner => "not owner",
            SvcStatus::UnknownTask => "unknown task",
            SvcStatus::AlreadyOwner => "already owner",
            SvcStatus::UnknownService => "unknown service",
        })
    }
}

/// A string argument: target address and length in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserStr {
    pub address: u32,
    pub len: u32,
}

/// A decoded service call. Buffers are still unchecked target addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvcRequest {
    Yield,
    Sleep(u32),
    Lock(usize),
    Unlock(usize),
    Wait(usize),
    Post(usize),
    Stop(TaskHandle),
    Restart(TaskHandle),
    Reboot,
    /// Address of the caller's `PsSnapshot`.
    Ps(u32),
    Sched(SchedulerMode),
    Preempt(bool),
    Pidof(UserStr),
    Pkill(UserStr),
    Run(UserStr),
    /// Address of the caller's `IpcsSnapshot`.
    Ipcs(u32),
    SetPriority(TaskHandle, u8),
    Inheritance(bool),
}

/// What the SVCall handler must do after writing `value` back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvcAction {
    Resume,
    /// Pend PendSV.
    Reschedule,
    /// Request a system reset.
    Reboot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SvcReply {
    pub value: u32,
    pub action: SvcAction,
}

impl SvcReply {
    fn resume(status: SvcStatus) -> Self {
        Self {
            value: status as u32,
            action: SvcAction::Resume,
        }
    }

    fn reschedule(status: SvcStatus) -> Self {
        Self {
            value: status as u32,
            action: SvcAction::Reschedule,
        }
    }
}

/// Decode raw SVC arguments.
pub fn decode(number: u8, args: [u32; 3]) -> Result<SvcRequest, SvcStatus> {
    let handle = || TaskHandle::from_raw(args[0]).ok_or(SvcStatus::UnknownTask);
    let name = UserStr {
        address: args[0],
        len: args[1],
    };

    Ok(match SvcNumber::try_from(number)? {
        SvcNumber::Yield => SvcRequest::Yield,
        SvcNumber::Sleep => SvcRequest::Sleep(args[0]),
        SvcNumber::Lock => SvcRequest::Lock(args[0] as usize),
        SvcNumber::Unlock => SvcRequest::Unlock(args[0] as usize),
        SvcNumber::Wait => SvcRequest::Wait(args[0] as usize),
        SvcNumber::Post => SvcRequest::Post(args[0] as usize),
        SvcNumber::Stop => SvcRequest::Stop(handle()?),
        SvcNumber::Restart => SvcRequest::Restart(handle()?),
        SvcNumber::Reboot => SvcRequest::Reboot,
        SvcNumber::Ps => SvcRequest::Ps(args[0]),
        SvcNumber::Sched => SvcRequest::Sched(if args[0] != 0 {
            SchedulerMode::Priority
        } else {
            SchedulerMode::RoundRobin
        }),
        SvcNumber::Preempt => SvcRequest::Preempt(args[0] != 0),
        SvcNumber::Pidof => SvcRequest::Pidof(name),
        SvcNumber::Pkill => SvcRequest::Pkill(name),
        SvcNumber::Run => SvcRequest::Run(name),
        SvcNumber::Ipcs => SvcRequest::Ipcs(args[0]),
        SvcNumber::SetPriority => {
            let priority = u8::try_from(args[1]).map_err(|_| SvcStatus::InvalidObject)?;
            SvcRequest::SetPriority(handle()?, priority)
        }
        SvcNumber::Priority => SvcRequest::Inheritance(args[0] != 0),
    })
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

impl Kernel {
    /// Carry out `request` on behalf of the current task. `memory` reaches
    /// the caller's buffers once they have been checked.
    pub fn service<M: StackMemory>(&mut self, request: SvcRequest, memory: &mut M) -> SvcReply {
        log::trace!("svc {:?}", request);
        let lifecycle = |result: Result<(), KernelError>| {
            SvcReply::reschedule(result.map_or_else(SvcStatus::from, |()| SvcStatus::Ok))
        };

        match request {
            SvcRequest::Yield => SvcReply::reschedule(SvcStatus::Ok),
            SvcRequest::Sleep(ticks) => self.with_caller(|k, task| k.sleep(task, ticks)),
            SvcRequest::Lock(m) => self.with_caller(|k, task| k.lock(task, m)),
            SvcRequest::Unlock(m) => self.with_caller(|k, task| k.unlock(task, m)),
            SvcRequest::Wait(s) => self.with_caller(|k, task| k.wait(task, s)),
            SvcRequest::Post(s) => self.post(s),
            SvcRequest::Stop(handle) => lifecycle(self.stop_thread(handle)),
            SvcRequest::Restart(handle) => lifecycle(self.restart_thread(handle)),
            SvcRequest::Pkill(name) => self.with_caller(|k, task| {
                match k.user_name(task, name, memory) {
                    Ok(name) => lifecycle(k.stop_by_name(&name)),
                    Err(status) => SvcReply::resume(status),
                }
            }),
            SvcRequest::Run(name) => self.with_caller(|k, task| {
                match k.user_name(task, name, memory) {
                    Ok(name) => lifecycle(k.restart_by_name(&name)),
                    Err(status) => SvcReply::resume(status),
                }
            }),
            SvcRequest::SetPriority(handle, priority) => {
                lifecycle(self.set_priority(handle, priority))
            }
            SvcRequest::Reboot => {
                log::warn!("reboot requested");
                SvcReply {
                    value: SvcStatus::Ok as u32,
                    action: SvcAction::Reboot,
                }
            }
            SvcRequest::Ps(address) => self.with_caller(|k, task| {
                let Some(out) = k.user_object::<PsSnapshot, M>(task, address, memory) else {
                    return SvcReply::resume(SvcStatus::InvalidObject);
                };
                let snapshot = k.ps();
                let count = snapshot.len() as u32;
                // The buffer may hold anything; overwrite without dropping it.
                unsafe { out.write(snapshot) };
                SvcReply {
                    value: count,
                    action: SvcAction::Resume,
                }
            }),
            SvcRequest::Ipcs(address) => self.with_caller(|k, task| {
                let Some(out) = k.user_object::<IpcsSnapshot, M>(task, address, memory) else {
                    return SvcReply::resume(SvcStatus::InvalidObject);
                };
                unsafe { out.write(k.ipcs()) };
                SvcReply::resume(SvcStatus::Ok)
            }),
            // r0 carries a pid here, so a refused name reads as "not found".
            SvcRequest::Pidof(name) => self.with_caller(|k, task| SvcReply {
                value: k
                    .user_name(task, name, memory)
                    .ok()
                    .and_then(|name| k.find_by_name(&name))
                    .map_or(TaskHandle::NONE_RAW, TaskHandle::to_raw),
                action: SvcAction::Resume,
            }),
            SvcRequest::Sched(mode) => {
                self.set_scheduler_mode(mode);
                SvcReply::reschedule(SvcStatus::Ok)
            }
            SvcRequest::Preempt(on) => {
                self.set_preemption(on);
                SvcReply::reschedule(SvcStatus::Ok)
            }
            SvcRequest::Inheritance(on) => {
                self.set_priority_inheritance(on);
                SvcReply::reschedule(SvcStatus::Ok)
            }
        }
    }

    /// Run a call that acts on the calling task.
    fn with_caller(&mut self, f: impl FnOnce(&mut Self, usize) -> SvcReply) -> SvcReply {
        match self.current {
            Some(task) => f(self, task),
            None => SvcReply::resume(SvcStatus::UnknownTask),
        }
    }

    /// Whether `[address, address + len)` lies inside `task`'s own stack
    /// and `address` is a multiple of `align`.
    fn owns_range(&self, task: usize, address: u32, len: usize, align: usize) -> bool {
        let tcb = &self.tasks[task];
        let end = u32::try_from(len)
            .ok()
            .and_then(|len| address.checked_add(len));
        match end {
            Some(end) => {
                address >= tcb.stack_base
                    && end <= tcb.stack_top()
                    && address as usize % align == 0
            }
            None => false,
        }
    }

    /// Pointer to a `T` the caller asked the kernel to fill in.
    fn user_object<T, M: StackMemory>(
        &self,
        task: usize,
        address: u32,
        memory: &mut M,
    ) -> Option<*mut T> {
        if !self.owns_range(task, address, size_of::<T>(), align_of::<T>()) {
            log::warn!(
                "{} passed a bad buffer at {:#010x}",
                self.tasks[task].name,
                address
            );
            return None;
        }
        Some(memory.translate(address).cast())
    }

    /// Copy a name argument out of the caller's stack or flash.
    fn user_name<M: StackMemory>(
        &self,
        task: usize,
        name: UserStr,
        memory: &mut M,
    ) -> Result<TaskName, SvcStatus> {
        let len = name.len as usize;
        if len == 0 || len > TASK_NAME_LEN {
            return Err(SvcStatus::UnknownTask);
        }
        // Null is never a name, even though it is a flash address.
        let in_flash = name
            .address
            .checked_add(name.len)
            .is_some_and(|end| name.address > FLASH_BASE && end <= FLASH_BASE + FLASH_SIZE);
        if !in_flash && !self.owns_range(task, name.address, len, 1) {
            log::warn!(
                "{} passed a bad name at {:#010x}",
                self.tasks[task].name,
                name.address
            );
            return Err(SvcStatus::InvalidObject);
        }

        let bytes = unsafe { core::slice::from_raw_parts(memory.translate(name.address), len) };
        let text = core::str::from_utf8(bytes).map_err(|_| SvcStatus::UnknownTask)?;
        let mut out = TaskName::new();
        out.try_push_str(text).map_err(|_| SvcStatus::UnknownTask)?;
        Ok(out)
    }

    fn sleep(&mut self, task: usize, ticks: u32) -> SvcReply {
        if ticks > 0 {
            let tcb = &mut self.tasks[task];
            tcb.ticks = ticks;
            tcb.state = TaskState::Delayed;
        }
        SvcReply::reschedule(SvcStatus::Ok)
    }

    fn lock(&mut self, task: usize, m: usize) -> SvcReply {
        let inheritance = self.config.priority_inheritance;
        let Some(mutex) = self.mutexes.get_mut(m) else {
            return SvcReply::resume(SvcStatus::InvalidObject);
        };

        if !mutex.locked {
            mutex.locked = true;
            mutex.owner = Some(task);
            return SvcReply::reschedule(SvcStatus::Ok);
        }
        if mutex.owner == Some(task) {
            return SvcReply::resume(SvcStatus::AlreadyOwner);
        }
        if mutex.queue.push(task).is_err() {
            return SvcReply::resume(SvcStatus::Retry);
        }
        let owner = mutex.owner;

        let tcb = &mut self.tasks[task];
        tcb.state = TaskState::BlockedOnMutex;
        tcb.blocking_mutex = Some(m as u8);

        if let Some(owner) = owner.filter(|_| inheritance) {
            self.refresh_priority(owner);
            log::debug!(
                "{} inherits priority {}",
                self.tasks[owner].name,
                self.tasks[owner].effective_priority
            );
        }
        SvcReply::reschedule(SvcStatus::Ok)
    }

    fn unlock(&mut self, task: usize, m: usize) -> SvcReply {
        match self.mutexes.get(m) {
            None => SvcReply::resume(SvcStatus::InvalidObject),
            Some(mutex) if !mutex.is_owned_by(task) => SvcReply::resume(SvcStatus::NotOwner),
            Some(_) => {
                self.hand_off(m);
                SvcReply::reschedule(SvcStatus::Ok)
            }
        }
    }

    fn wait(&mut self, task: usize, s: usize) -> SvcReply {
        let Some(semaphore) = self.semaphores.get_mut(s) else {
            return SvcReply::resume(SvcStatus::InvalidObject);
        };

        if semaphore.count > 0 {
            semaphore.count -= 1;
            return SvcReply::reschedule(SvcStatus::Ok);
        }
        if semaphore.queue.contains(task) || semaphore.queue.push(task).is_err() {
            return SvcReply::resume(SvcStatus::Retry);
        }
        let tcb = &mut self.tasks[task];
        tcb.state = TaskState::BlockedOnSemaphore;
        tcb.blocking_semaphore = Some(s as u8);
        SvcReply::reschedule(SvcStatus::Ok)
    }

    /// The oldest waiter receives the unit directly; otherwise the count
    /// goes up.
    fn post(&mut self, s: usize) -> SvcReply {
        let Some(semaphore) = self.semaphores.get_mut(s) else {
            return SvcReply::resume(SvcStatus::InvalidObject);
        };

        match semaphore.queue.pop_front() {
            Some(waiter) => {
                let tcb = &mut self.tasks[waiter];
                tcb.blocking_semaphore = None;
                tcb.state = TaskState::Ready;
            }
            None => semaphore.count = semaphore.count.saturating_add(1),
        }
        SvcReply::reschedule(SvcStatus::Ok)
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
