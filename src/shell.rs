//! # Shell Commands
//!
//! The textual command set a serial console offers, parsed into
//! [`Command`]. Each command maps onto exactly one syscall. Line editing
//! and the UART itself belong to the board, which only has to provide a
//! [`core::fmt::Write`] sink.
//!
//! The caller is the board's console task: it reads a line from its UART,
//! hands it to [`Command::parse`], then runs the result with
//! `Command::execute` against the same UART writer. The line buffer must be
//! a local of that task, because names reach the kernel by address and the
//! kernel only reads them from flash or the caller's own stack. The demo
//! firmware has no serial console and so never spawns one.
//!
//! ```text
//! ps                          task table
//! ipcs                        mutexes and semaphores
//! kill <pid>                  stop a task
//! pkill <name>                stop tasks by name
//! run <name>                  restart tasks by name
//! pidof <name>                print a task's pid
//! sched prio|rr               scheduler mode
//! preempt on|off              tick-driven preemption
//! inheritance on|off          mutex priority inheritance
//! setpriority <pid> <prio>    change a task's priority
//! reboot
//! ```

use core::fmt::{self, Write};

use arrayvec::ArrayString;

use crate::kernel::IpcsSnapshot;
use crate::scheduler::SchedulerMode;
use crate::task::{TaskHandle, TaskInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Ps,
    Ipcs,
    Kill(TaskHandle),
    Pkill(&'a str),
    Run(&'a str),
    Pidof(&'a str),
    Sched(SchedulerMode),
    Preempt(bool),
    Inheritance(bool),
    SetPriority(TaskHandle, u8),
    Reboot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    UnknownCommand,
    MissingArgument,
    BadArgument,
    TrailingArgument,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ParseError::Empty => "empty command",
            ParseError::UnknownCommand => "unknown command",
            ParseError::MissingArgument => "missing argument",
            ParseError::BadArgument => "bad argument",
            ParseError::TrailingArgument => "too many arguments",
        })
    }
}

impl<'a> Command<'a> {
    /// Parse one line. Words are separated by any whitespace; command
    /// words are case-insensitive, names are not.
    pub fn parse(line: &'a str) -> Result<Self, ParseError> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or(ParseError::Empty)?;
        let mut arg = || words.next().ok_or(ParseError::MissingArgument);

        let command = match lowercase(verb).as_str() {
            "ps" => Command::Ps,
            "ipcs" => Command::Ipcs,
            "reboot" => Command::Reboot,
            "kill" => Command::Kill(pid(arg()?)?),
            "pkill" => Command::Pkill(arg()?),
            "run" => Command::Run(arg()?),
            "pidof" => Command::Pidof(arg()?),
            "sched" => Command::Sched(match arg()? {
                w if w.eq_ignore_ascii_case("prio") => SchedulerMode::Priority,
                w if w.eq_ignore_ascii_case("rr") => SchedulerMode::RoundRobin,
                _ => return Err(ParseError::BadArgument),
            }),
            "preempt" => Command::Preempt(on_off(arg()?)?),
            "inheritance" => Command::Inheritance(on_off(arg()?)?),
            "setpriority" => {
                let handle = pid(arg()?)?;
                let priority = arg()?.parse().map_err(|_| ParseError::BadArgument)?;
                Command::SetPriority(handle, priority)
            }
            _ => return Err(ParseError::UnknownCommand),
        };

        if words.next().is_some() {
            return Err(ParseError::TrailingArgument);
        }
        Ok(command)
    }
}

fn pid(word: &str) -> Result<TaskHandle, ParseError> {
    word.parse::<u32>()
        .ok()
        .and_then(TaskHandle::from_raw)
        .ok_or(ParseError::BadArgument)
}

fn on_off(word: &str) -> Result<bool, ParseError> {
    if word.eq_ignore_ascii_case("on") {
        Ok(true)
    } else if word.eq_ignore_ascii_case("off") {
        Ok(false)
    } else {
        Err(ParseError::BadArgument)
    }
}

/// Lowercase copy of a command word. Words too long to be a command come
/// back empty.
fn lowercase(word: &str) -> ArrayString<12> {
    let mut out = ArrayString::new();
    if word.len() <= out.capacity() {
        for c in word.chars() {
            out.push(c.to_ascii_lowercase());
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Task table, one task per line.
pub fn write_ps(out: &mut impl Write, tasks: &[TaskInfo]) -> fmt::Result {
    writeln!(out, "PID\tPRIO\tCPU\tSTATE\t\tNAME")?;
    for task in tasks {
        // An inherited boost shows as base>effective.
        let mut priority = ArrayString::<8>::new();
        if task.effective_priority == task.base_priority {
            write!(priority, "{}", task.base_priority)?;
        } else {
            write!(priority, "{}>{}", task.base_priority, task.effective_priority)?;
        }
        writeln!(
            out,
            "{}\t{}\t{}.{:02}%\t{:<9}\t{}",
            task.handle.to_raw(),
            priority.as_str(),
            task.cpu_hundredths / 100,
            task.cpu_hundredths % 100,
            task.state.label(),
            task.name
        )?;
    }
    Ok(())
}

/// Every mutex and semaphore with its queue.
pub fn write_ipcs(out: &mut impl Write, snapshot: &IpcsSnapshot) -> fmt::Result {
    for mutex in &snapshot.mutexes {
        write!(out, "mutex {}: ", mutex.index)?;
        match mutex.owner {
            Some(owner) if mutex.locked => write!(out, "locked by {}", owner.to_raw())?,
            _ => write!(out, "unlocked")?,
        }
        write_waiters(out, &mutex.waiters)?;
    }
    for semaphore in &snapshot.semaphores {
        write!(out, "semaphore {}: count {}", semaphore.index, semaphore.count)?;
        write_waiters(out, &semaphore.waiters)?;
    }
    Ok(())
}

fn write_waiters(out: &mut impl Write, waiters: &[TaskHandle]) -> fmt::Result {
    write!(out, ", queue [")?;
    for (i, waiter) in waiters.iter().enumerate() {
        if i > 0 {
            out.write_char(' ')?;
        }
        write!(out, "{}", waiter.to_raw())?;
    }
    writeln!(out, "]")
}

// ---------------------------------------------------------------------------
// Dispatch (target only)
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "arm", target_os = "none"))]
impl Command<'_> {
    /// Run the command through its syscall and report on `out`.
    pub fn execute(&self, out: &mut impl Write) -> fmt::Result {
        use crate::kernel::{self, PsSnapshot};
        use crate::svc::SvcStatus;

        let status = match *self {
            Command::Ps => {
                let mut tasks = PsSnapshot::new();
                kernel::ps(&mut tasks);
                return write_ps(out, &tasks);
            }
            Command::Ipcs => {
                let mut snapshot = IpcsSnapshot::default();
                kernel::ipcs(&mut snapshot);
                return write_ipcs(out, &snapshot);
            }
            Command::Pidof(name) => {
                return match kernel::pidof(name) {
                    Some(handle) => writeln!(out, "{}", handle.to_raw()),
                    None => writeln!(out, "{}: not found", name),
                };
            }
            Command::Kill(handle) => kernel::stop_thread(handle),
            Command::Pkill(name) => kernel::pkill(name),
            Command::Run(name) => kernel::run(name),
            Command::SetPriority(handle, priority) => kernel::set_priority(handle, priority),
            Command::Sched(mode) => {
                kernel::set_scheduler(mode);
                SvcStatus::Ok
            }
            Command::Preempt(on) => {
                kernel::set_preemption(on);
                SvcStatus::Ok
            }
            Command::Inheritance(on) => {
                kernel::set_priority_inheritance(on);
                SvcStatus::Ok
            }
            Command::Reboot => {
                writeln!(out, "rebooting")?;
                kernel::reboot()
            }
        };
        writeln!(out, "{}", status)
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
