//! # Synchronization Primitives
//!
//! Kernel mutex and counting-semaphore objects with their bounded FIFO
//! wait queues, plus the interrupt-safe critical section used by the
//! Cortex-M4 port.
//!
//! The objects here are plain data. Blocking, hand-off and priority
//! inheritance are decided by the syscall dispatcher, which owns the TCB
//! table these queues index into.

use arrayvec::ArrayVec;

use crate::config::MAX_TASKS;

// ---------------------------------------------------------------------------
// Wait queue
// ---------------------------------------------------------------------------

/// Bounded FIFO of task slot indices.
///
/// Storage is sized for every task; `depth` is the configured bound.
/// Removing from the middle shifts the tail down, so order is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitQueue {
    slots: ArrayVec<u8, MAX_TASKS>,
    depth: usize,
}

impl WaitQueue {
    pub fn new(depth: usize) -> Self {
        Self {
            slots: ArrayVec::new(),
            depth: depth.clamp(1, MAX_TASKS),
        }
    }

    /// Append `task`. Fails when the queue is at its bound.
    pub fn push(&mut self, task: usize) -> Result<(), QueueFull> {
        if self.is_full() {
            return Err(QueueFull);
        }
        self.slots.push(task as u8);
        Ok(())
    }

    /// Take the oldest waiter.
    pub fn pop_front(&mut self) -> Option<usize> {
        if self.slots.is_empty() {
            None
        } else {
            Some(usize::from(self.slots.remove(0)))
        }
    }

    /// Drop `task` wherever it sits. Returns whether it was queued.
    pub fn remove(&mut self, task: usize) -> bool {
        match self.slots.iter().position(|&t| usize::from(t) == task) {
            Some(at) => {
                self.slots.remove(at);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, task: usize) -> bool {
        self.slots.iter().any(|&t| usize::from(t) == task)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.depth
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Queued slot indices, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots.iter().map(|&t| usize::from(t))
    }
}

/// Error returned by [`WaitQueue::push`] on a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

// ---------------------------------------------------------------------------
// Mutex and semaphore
// ---------------------------------------------------------------------------

/// Kernel mutex. Only the owner may unlock it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutex {
    pub locked: bool,
    /// Slot index of the owner while locked.
    pub owner: Option<usize>,
    pub queue: WaitQueue,
}

impl Mutex {
    pub fn new(depth: usize) -> Self {
        Self {
            locked: false,
            owner: None,
            queue: WaitQueue::new(depth),
        }
    }

    #[inline]
    pub fn is_owned_by(&self, task: usize) -> bool {
        self.locked && self.owner == Some(task)
    }
}

/// Counting semaphore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Semaphore {
    pub count: u32,
    pub queue: WaitQueue,
}

impl Semaphore {
    pub fn new(count: u32, depth: usize) -> Self {
        Self {
            count,
            queue: WaitQueue::new(depth),
        }
    }
}

// ---------------------------------------------------------------------------
// Critical section
// ---------------------------------------------------------------------------

/// Execute a closure within a critical section (interrupts disabled).
///
/// Guards the global kernel instance against SysTick/SVCall/PendSV.
/// Interrupts are restored to their previous state on exit.
#[cfg(all(target_arch = "arm", target_os = "none"))]
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(&cortex_m::interrupt::CriticalSection) -> R,
{
    cortex_m::interrupt::free(f)
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut queue = WaitQueue::new(3);
        queue.push(4).unwrap();
        queue.push(1).unwrap();
        queue.push(7).unwrap();
        assert_eq!(queue.pop_front(), Some(4));
        assert_eq!(queue.pop_front(), Some(1));
        assert_eq!(queue.pop_front(), Some(7));
        assert_eq!(queue.pop_front(), None);
    }

    #[test]
    fn test_depth_bound() {
        let mut queue = WaitQueue::new(2);
        queue.push(0).unwrap();
        queue.push(1).unwrap();
        assert!(queue.is_full());
        assert_eq!(queue.push(2), Err(QueueFull));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_depth_is_clamped() {
        assert_eq!(WaitQueue::new(0).depth(), 1);
        assert_eq!(WaitQueue::new(100).depth(), MAX_TASKS);
    }

    #[test]
    fn test_remove_compacts() {
        let mut queue = WaitQueue::new(4);
        for task in [3, 5, 8, 9] {
            queue.push(task).unwrap();
        }
        assert!(queue.remove(5));
        assert!(!queue.remove(5));
        assert_eq!(queue.len(), 3);
        assert!(!queue.contains(5));
        assert_eq!(queue.iter().collect::<std::vec::Vec<_>>(), [3, 8, 9]);

        // Space freed by the removal is usable again.
        queue.push(2).unwrap();
        assert_eq!(queue.pop_front(), Some(3));
    }

    #[test]
    fn test_mutex_ownership() {
        let mut mutex = Mutex::new(2);
        assert!(!mutex.is_owned_by(0));
        mutex.locked = true;
        mutex.owner = Some(0);
        assert!(mutex.is_owned_by(0));
        assert!(!mutex.is_owned_by(1));
    }
}
