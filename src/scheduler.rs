//! # Scheduler
//!
//! Selects the next task to dispatch. Two disciplines are supported and
//! can be switched at run time; the change takes effect at the next
//! decision.
//!
//! ## Priority mode
//!
//! Among `Ready`/`Unrun` tasks pick the lowest effective priority
//! (0 is the most important). Ties go to the task that has been
//! dispatched the fewest times, then to the lowest slot index, so equal
//! priorities share the CPU round-robin.
//!
//! ## Round-robin mode
//!
//! Walk the table circularly from the slot after the last pick and take
//! the first runnable task, ignoring priorities.
//!
//! Both modes bump the winner's `scheduled_count`.

use crate::task::TaskControlBlock;

/// Scheduling discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerMode {
    Priority,
    RoundRobin,
}

impl SchedulerMode {
    pub fn label(self) -> &'static str {
        match self {
            SchedulerMode::Priority => "priority",
            SchedulerMode::RoundRobin => "round-robin",
        }
    }
}

/// Scheduler state: the active discipline and the round-robin cursor.
#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    mode: SchedulerMode,
    /// Slot picked by the last round-robin decision.
    cursor: Option<usize>,
}

impl Scheduler {
    pub const fn new(mode: SchedulerMode) -> Self {
        Self { mode, cursor: None }
    }

    #[inline]
    pub fn mode(&self) -> SchedulerMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: SchedulerMode) {
        self.mode = mode;
    }

    /// Pick the next task and account for the dispatch.
    ///
    /// Returns `None` only when no slot is runnable, which the kernel
    /// treats as fatal: the idle task is expected to always be ready.
    pub fn select_next(&mut self, tasks: &mut [TaskControlBlock]) -> Option<usize> {
        let next = match self.mode {
            SchedulerMode::Priority => select_by_priority(tasks),
            SchedulerMode::RoundRobin => self.select_round_robin(tasks),
        }?;
        tasks[next].scheduled_count = tasks[next].scheduled_count.wrapping_add(1);
        Some(next)
    }

    fn select_round_robin(&mut self, tasks: &[TaskControlBlock]) -> Option<usize> {
        let n = tasks.len();
        let start = self.cursor.map_or(0, |c| c + 1);
        let next = (0..n)
            .map(|step| (start + step) % n)
            .find(|&i| tasks[i].is_runnable())?;
        self.cursor = Some(next);
        Some(next)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerMode::Priority)
    }
}

fn select_by_priority(tasks: &[TaskControlBlock]) -> Option<usize> {
    tasks
        .iter()
        .enumerate()
        .filter(|(_, tcb)| tcb.is_runnable())
        // `min_by_key` keeps the first of equal keys: lowest index wins.
        .min_by_key(|(_, tcb)| (tcb.effective_priority, tcb.scheduled_count))
        .map(|(i, _)| i)
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_TASKS;
    use crate::task::TaskState;
    use quickcheck_macros::quickcheck;

    fn table(priorities: &[u8]) -> [TaskControlBlock; MAX_TASKS] {
        let mut tasks = [TaskControlBlock::EMPTY; MAX_TASKS];
        for (tcb, &priority) in tasks.iter_mut().zip(priorities) {
            tcb.state = TaskState::Ready;
            tcb.base_priority = priority;
            tcb.effective_priority = priority;
        }
        tasks
    }

    #[test]
    fn test_priority_picks_lowest_value() {
        let mut tasks = table(&[7, 3, 5]);
        let mut scheduler = Scheduler::new(SchedulerMode::Priority);
        for _ in 0..5 {
            assert_eq!(scheduler.select_next(&mut tasks), Some(1));
        }
        assert_eq!(tasks[1].scheduled_count, 5);
    }

    #[test]
    fn test_priority_skips_unrunnable() {
        let mut tasks = table(&[7, 0, 5]);
        tasks[1].state = TaskState::BlockedOnMutex;
        let mut scheduler = Scheduler::default();
        assert_eq!(scheduler.select_next(&mut tasks), Some(2));

        tasks[2].state = TaskState::Unrun;
        tasks[2].scheduled_count = 0;
        assert_eq!(scheduler.select_next(&mut tasks), Some(2));
    }

    #[test]
    fn test_priority_ties_alternate() {
        let mut tasks = table(&[0, 5, 5]);
        tasks[0].state = TaskState::Delayed;
        let mut scheduler = Scheduler::default();
        let picks: std::vec::Vec<_> = (0..6)
            .map(|_| scheduler.select_next(&mut tasks))
            .collect();
        assert_eq!(
            picks,
            [Some(1), Some(2), Some(1), Some(2), Some(1), Some(2)]
        );
    }

    #[test]
    fn test_inherited_priority_is_used() {
        let mut tasks = table(&[4, 6]);
        tasks[1].effective_priority = 2;
        let mut scheduler = Scheduler::default();
        assert_eq!(scheduler.select_next(&mut tasks), Some(1));
    }

    #[test]
    fn test_round_robin_ignores_priority() {
        let mut tasks = table(&[0, 9, 4]);
        let mut scheduler = Scheduler::new(SchedulerMode::RoundRobin);
        let picks: std::vec::Vec<_> = (0..6)
            .map(|_| scheduler.select_next(&mut tasks))
            .collect();
        assert_eq!(
            picks,
            [Some(0), Some(1), Some(2), Some(0), Some(1), Some(2)]
        );
    }

    #[test]
    fn test_round_robin_skips_blocked() {
        let mut tasks = table(&[1, 1, 1, 1]);
        tasks[1].state = TaskState::BlockedOnSemaphore;
        tasks[2].state = TaskState::Stopped;
        let mut scheduler = Scheduler::new(SchedulerMode::RoundRobin);
        assert_eq!(scheduler.select_next(&mut tasks), Some(0));
        assert_eq!(scheduler.select_next(&mut tasks), Some(3));
        assert_eq!(scheduler.select_next(&mut tasks), Some(0));
    }

    #[test]
    fn test_nothing_runnable() {
        let mut tasks = [TaskControlBlock::EMPTY; MAX_TASKS];
        assert_eq!(Scheduler::default().select_next(&mut tasks), None);
        assert_eq!(
            Scheduler::new(SchedulerMode::RoundRobin).select_next(&mut tasks),
            None
        );
    }

    #[test]
    fn test_mode_switch_applies_next_decision() {
        let mut tasks = table(&[3, 1]);
        let mut scheduler = Scheduler::default();
        assert_eq!(scheduler.select_next(&mut tasks), Some(1));
        scheduler.set_mode(SchedulerMode::RoundRobin);
        assert_eq!(scheduler.select_next(&mut tasks), Some(0));
        assert_eq!(scheduler.mode().label(), "round-robin");
    }

    /// N consecutive round-robin picks over N runnable tasks visit each
    /// task exactly once.
    #[quickcheck]
    fn round_robin_visits_every_task_once(runnable: std::vec::Vec<bool>, warmup: u8) -> bool {
        let mut tasks = [TaskControlBlock::EMPTY; MAX_TASKS];
        for (tcb, &on) in tasks.iter_mut().zip(&runnable) {
            if on {
                tcb.state = TaskState::Ready;
            }
        }
        let n = tasks.iter().filter(|t| t.is_runnable()).count();
        let mut scheduler = Scheduler::new(SchedulerMode::RoundRobin);
        for _ in 0..warmup % 7 {
            scheduler.select_next(&mut tasks);
        }

        let mut seen = [false; MAX_TASKS];
        for _ in 0..n {
            match scheduler.select_next(&mut tasks) {
                Some(i) if !seen[i] => seen[i] = true,
                _ => return false,
            }
        }
        n == 0 || seen.iter().filter(|&&s| s).count() == n
    }

    /// The priority pick is never beaten by another runnable task.
    #[quickcheck]
    fn priority_pick_is_minimal(spec: std::vec::Vec<(u8, u8, bool)>) -> bool {
        let mut tasks = [TaskControlBlock::EMPTY; MAX_TASKS];
        for (tcb, &(priority, count, ready)) in tasks.iter_mut().zip(&spec) {
            tcb.state = if ready { TaskState::Ready } else { TaskState::Delayed };
            tcb.effective_priority = priority % 16;
            tcb.scheduled_count = u32::from(count);
        }
        let before = tasks;
        match Scheduler::default().select_next(&mut tasks) {
            None => !before.iter().any(|t| t.is_runnable()),
            Some(pick) => before.iter().filter(|t| t.is_runnable()).all(|t| {
                (before[pick].effective_priority, before[pick].scheduled_count)
                    <= (t.effective_priority, t.scheduled_count)
            }),
        }
    }
}
