use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

struct State {
    available: usize,
    next_ticket: u64,
    queue: VecDeque<u64>,
}

impl State {
    fn enqueue(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.queue.push_back(ticket);
        ticket
    }

    /// A permit may only be taken by the queue head; this is what keeps the
    /// grant order FIFO and keeps late arrivals from barging.
    fn claimable(&self, ticket: u64) -> bool {
        self.available > 0 && self.queue.front() == Some(&ticket)
    }

    fn claim(&mut self, ticket: u64) {
        self.available -= 1;
        self.queue.pop_front();
        debug_assert!(!self.queue.contains(&ticket));
    }
}

/// A fair counting semaphore.
///
/// Permits are granted to blocked waiters in FIFO order; `try_acquire` never
/// barges past a queued waiter. `release` may be called by a thread that
/// never acquired, which is how the leaky bucket refills its pool.
///
/// # Test
///
/// ```
/// use firewall::semaphore::Semaphore;
///
/// let pool = Semaphore::new(2);
///
/// assert!(pool.try_acquire());
/// assert!(pool.try_acquire());
/// assert!(!pool.try_acquire());
/// assert_eq!(pool.available(), 0);
///
/// pool.release();
/// assert_eq!(pool.available(), 1);
/// ```
pub struct Semaphore {
    state: Mutex<State>,
    condvar: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(State {
                available: permits,
                next_ticket: 0,
                queue: VecDeque::new(),
            }),
            condvar: Condvar::new(),
        }
    }

    pub fn available(&self) -> usize {
        self.state.lock().available
    }

    /// Block until a permit is granted.
    pub fn acquire(&self) {
        let mut state = self.state.lock();

        if state.available > 0 && state.queue.is_empty() {
            state.available -= 1;
            return;
        }

        let ticket = state.enqueue();
        loop {
            if state.claimable(ticket) {
                state.claim(ticket);
                // The freed head position may make the next waiter eligible.
                self.condvar.notify_all();
                return;
            }

            self.condvar.wait(&mut state);
        }
    }

    /// Take a permit without blocking.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();

        if state.available > 0 && state.queue.is_empty() {
            state.available -= 1;
            true
        } else {
            false
        }
    }

    /// Block at most `timeout` for a permit.
    ///
    /// On expiry the waiter leaves the queue and reports `false`.
    pub fn try_acquire_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        if state.available > 0 && state.queue.is_empty() {
            state.available -= 1;
            return true;
        }

        if timeout.is_zero() {
            return false;
        }

        let ticket = state.enqueue();
        loop {
            if state.claimable(ticket) {
                state.claim(ticket);
                self.condvar.notify_all();
                return true;
            }

            if self.condvar.wait_until(&mut state, deadline).timed_out() {
                // A release may have made this ticket eligible right at the
                // deadline; prefer the permit over the timeout.
                if state.claimable(ticket) {
                    state.claim(ticket);
                    self.condvar.notify_all();
                    return true;
                }

                state.queue.retain(|queued| *queued != ticket);
                self.condvar.notify_all();
                return false;
            }
        }
    }

    /// Return one permit and wake the longest-standing waiter, if any.
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.available += 1;
        self.condvar.notify_all();
    }
}
