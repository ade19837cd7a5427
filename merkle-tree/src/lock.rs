// Copyright (c) MerkleDB Contributors
// SPDX-License-Identifier: Apache-2.0

//! A reentrant read-write lock with priority-ordered acquisition.
//!
//! Waiting requests are granted by descending priority; within one priority
//! the most recent arrival wins (LIFO). A queued write request blocks every
//! new non-reentrant read request regardless of priority, so writers cannot
//! be starved by a steady stream of readers. All blocking acquires take an
//! optional timeout, and a grant that took longer than the configured
//! unhealthy threshold is reported through `tracing`.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

pub const DEFAULT_UNHEALTHY_WAIT: Duration = Duration::from_secs(30);

/// Urgency of one acquisition request; higher values are served first.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Priority {
    Low = 1,
    Medium = 5,
    High = 10,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Mode {
    Shared,
    Exclusive,
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Mode::Shared => "shared",
            Mode::Exclusive => "exclusive",
        }
    }
}

/// Violations of the lock contract.
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum LockError {
    #[error("thread does not hold the {0} lock")]
    NotHeld(&'static str),

    #[error("shared to exclusive upgrade is not supported")]
    Upgrade,

    #[error("exclusive holder may not also acquire shared")]
    Downgrade,
}

#[derive(Debug)]
struct Waiter {
    seq: u64,
    mode: Mode,
    priority: Priority,
}

#[derive(Debug, Default)]
struct LockState {
    writer: Option<ThreadId>,
    writer_count: usize,
    readers: HashMap<ThreadId, usize>,
    queue: Vec<Waiter>,
    next_seq: u64,
}

impl LockState {
    /// The rank of the strongest queued write request.
    fn best_write_rank(&self) -> Option<(Priority, u64)> {
        self.queue
            .iter()
            .filter(|w| w.mode == Mode::Exclusive)
            .map(|w| (w.priority, w.seq))
            .max()
    }

    fn has_write_waiter(&self) -> bool {
        self.queue.iter().any(|w| w.mode == Mode::Exclusive)
    }

    fn remove_waiter(&mut self, seq: u64) {
        self.queue.retain(|w| w.seq != seq);
    }

    /// An exclusive request is grantable when nothing is held and it is the
    /// strongest queued write request. Read waiters never gate a writer;
    /// they are the ones being held back.
    fn can_grant_exclusive(&self, seq: u64) -> bool {
        self.writer.is_none()
            && self.readers.is_empty()
            && self
                .best_write_rank()
                .map_or(true, |(_, best_seq)| best_seq == seq)
    }

    /// A shared request is grantable when no writer holds the lock and no
    /// write request is queued.
    fn can_grant_shared(&self) -> bool {
        self.writer.is_none() && !self.has_write_waiter()
    }
}

/// Reentrant shared/exclusive lock with priority-ordered waiting.
#[derive(Debug)]
pub struct PriorityRwLock {
    state: Mutex<LockState>,
    cond: Condvar,
    unhealthy_wait: Duration,
}

impl Default for PriorityRwLock {
    fn default() -> Self {
        Self::new(DEFAULT_UNHEALTHY_WAIT)
    }
}

impl PriorityRwLock {
    pub fn new(unhealthy_wait: Duration) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            cond: Condvar::new(),
            unhealthy_wait,
        }
    }

    /// Blocks until the shared lock is granted or `timeout` expires.
    /// Returns `Ok(false)` on expiry; the request leaves no trace.
    pub fn acquire_read(
        &self,
        priority: Priority,
        timeout: Option<Duration>,
    ) -> Result<bool, LockError> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if let Some(count) = state.readers.get_mut(&me) {
            // Reentrant holders bypass the queue even under writer preference.
            *count += 1;
            return Ok(true);
        }
        if state.writer == Some(me) {
            return Err(LockError::Downgrade);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(Waiter {
            seq,
            mode: Mode::Shared,
            priority,
        });
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        loop {
            if state.can_grant_shared() {
                state.remove_waiter(seq);
                *state.readers.entry(me).or_insert(0) += 1;
                drop(state);
                self.note_granted(Mode::Shared, priority, started.elapsed());
                return Ok(true);
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out()
                        && !state.can_grant_shared()
                    {
                        state.remove_waiter(seq);
                        return Ok(false);
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
    }

    /// Blocks until the exclusive lock is granted or `timeout` expires.
    pub fn acquire_write(
        &self,
        priority: Priority,
        timeout: Option<Duration>,
    ) -> Result<bool, LockError> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.writer == Some(me) {
            state.writer_count += 1;
            return Ok(true);
        }
        if state.readers.contains_key(&me) {
            return Err(LockError::Upgrade);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(Waiter {
            seq,
            mode: Mode::Exclusive,
            priority,
        });
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        loop {
            if state.can_grant_exclusive(seq) {
                state.remove_waiter(seq);
                state.writer = Some(me);
                state.writer_count = 1;
                drop(state);
                self.note_granted(Mode::Exclusive, priority, started.elapsed());
                return Ok(true);
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out()
                        && !state.can_grant_exclusive(seq)
                    {
                        state.remove_waiter(seq);
                        // Wake the queue: our departure may unblock readers.
                        self.cond.notify_all();
                        return Ok(false);
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
    }

    /// Immediate exclusive attempt. Succeeds only when nothing is held and
    /// no strictly-higher-priority write request is waiting.
    pub fn try_acquire_write(&self, priority: Priority) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.writer == Some(me) {
            state.writer_count += 1;
            return true;
        }
        if state.readers.contains_key(&me) {
            return false;
        }
        let outranked = state
            .best_write_rank()
            .is_some_and(|(best, _)| best > priority);
        if state.writer.is_none() && state.readers.is_empty() && !outranked {
            state.writer = Some(me);
            state.writer_count = 1;
            true
        } else {
            false
        }
    }

    pub fn release_read(&self) -> Result<(), LockError> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        let count = state
            .readers
            .get_mut(&me)
            .ok_or(LockError::NotHeld("shared"))?;
        *count -= 1;
        if *count == 0 {
            state.readers.remove(&me);
            drop(state);
            self.cond.notify_all();
        }
        Ok(())
    }

    pub fn release_write(&self) -> Result<(), LockError> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.writer != Some(me) {
            return Err(LockError::NotHeld("exclusive"));
        }
        state.writer_count -= 1;
        if state.writer_count == 0 {
            state.writer = None;
            drop(state);
            self.cond.notify_all();
        }
        Ok(())
    }

    /// Shared lock with RAII release.
    pub fn read(&self, priority: Priority) -> Result<ReadGuard<'_>, LockError> {
        self.acquire_read(priority, None)?;
        Ok(ReadGuard { lock: self })
    }

    /// Shared lock bounded by `timeout`; `None` on expiry.
    pub fn read_for(
        &self,
        priority: Priority,
        timeout: Duration,
    ) -> Result<Option<ReadGuard<'_>>, LockError> {
        Ok(self
            .acquire_read(priority, Some(timeout))?
            .then_some(ReadGuard { lock: self }))
    }

    /// Exclusive lock with RAII release.
    pub fn write(&self, priority: Priority) -> Result<WriteGuard<'_>, LockError> {
        self.acquire_write(priority, None)?;
        Ok(WriteGuard { lock: self })
    }

    /// Exclusive lock bounded by `timeout`; `None` on expiry.
    pub fn write_for(
        &self,
        priority: Priority,
        timeout: Duration,
    ) -> Result<Option<WriteGuard<'_>>, LockError> {
        Ok(self
            .acquire_write(priority, Some(timeout))?
            .then_some(WriteGuard { lock: self }))
    }

    /// Non-blocking exclusive lock; `None` when it cannot be granted now.
    pub fn try_write(&self, priority: Priority) -> Option<WriteGuard<'_>> {
        self.try_acquire_write(priority)
            .then_some(WriteGuard { lock: self })
    }

    #[cfg(test)]
    pub(crate) fn queued_write_waiters(&self) -> usize {
        self.state
            .lock()
            .queue
            .iter()
            .filter(|w| w.mode == Mode::Exclusive)
            .count()
    }

    fn note_granted(&self, mode: Mode, priority: Priority, waited: Duration) {
        if waited > self.unhealthy_wait {
            tracing::warn!(
                mode = mode.as_str(),
                priority = priority as i32,
                waited_ms = waited.as_millis() as u64,
                "lock acquisition exceeded the unhealthy wait threshold"
            );
        }
    }
}

/// RAII holder of a shared grant; releases on drop.
#[must_use]
pub struct ReadGuard<'a> {
    lock: &'a PriorityRwLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let released = self.lock.release_read();
        debug_assert!(released.is_ok());
    }
}

/// RAII holder of an exclusive grant; releases on drop.
#[must_use]
pub struct WriteGuard<'a> {
    lock: &'a PriorityRwLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let released = self.lock.release_write();
        debug_assert!(released.is_ok());
    }
}
