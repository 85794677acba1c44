use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

/// A one-shot admission latch.
///
/// Requests wait while the latch is closed and stream through once it
/// opens. Opening is idempotent and a latch never closes again; closing a
/// gate means publishing a fresh closed latch instead.
pub struct Latch {
    open: Mutex<bool>,
    condvar: Condvar,
}

impl Latch {
    fn new(open: bool) -> Self {
        Self {
            open: Mutex::new(open),
            condvar: Condvar::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }

    /// Open the latch and wake every waiter.
    pub fn open(&self) {
        *self.open.lock() = true;
        self.condvar.notify_all();
    }

    /// Block until the latch opens, or until `deadline` when one is given.
    ///
    /// Returns whether the latch is open.
    fn wait_open(&self, deadline: Option<Instant>) -> bool {
        let mut open = self.open.lock();

        while !*open {
            match deadline {
                None => self.condvar.wait(&mut open),
                Some(deadline) => {
                    if self.condvar.wait_until(&mut open, deadline).timed_out() {
                        return *open;
                    }
                }
            }
        }

        true
    }
}

/// The admission gate of one maintenance identity.
///
/// The gate publishes the current latch. Closing swaps in a fresh closed
/// latch and hands it to the operator, whose responsibility it is to open
/// it again; a waiter that outlives a swap re-contends on whatever latch is
/// published when it wakes.
pub struct Gate {
    current: Mutex<Arc<Latch>>,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            current: Mutex::new(Arc::new(Latch::new(true))),
        }
    }
}

impl Gate {
    pub fn current(&self) -> Arc<Latch> {
        self.current.lock().clone()
    }

    pub fn is_open(&self) -> bool {
        self.current().is_open()
    }

    /// Swap in a new closed latch and return it.
    ///
    /// New admissions block on the returned latch until it is opened.
    pub fn close(&self) -> Arc<Latch> {
        let latch = Arc::new(Latch::new(false));
        *self.current.lock() = latch.clone();
        latch
    }

    /// Block until the published latch is open.
    ///
    /// Returns `false` when `deadline` passes first.
    pub fn wait_open(&self, deadline: Option<Instant>) -> bool {
        loop {
            let latch = self.current();

            if !latch.wait_open(deadline) {
                return false;
            }

            // Admitted only if the gate was not swapped while we waited.
            if Arc::ptr_eq(&latch, &self.current()) {
                return true;
            }
        }
    }
}

/// The in-flight counter of one maintenance identity.
///
/// Requests `enter` on admission and `leave` on every completion path; an
/// operator blocks in `await_drained` until the count reaches zero.
#[derive(Default)]
pub struct Drain {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl Drain {
    pub fn enter(&self) {
        *self.count.lock() += 1;
    }

    pub fn leave(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);

        if *count == 0 {
            self.condvar.notify_all();
        }
    }

    pub fn in_flight(&self) -> usize {
        *self.count.lock()
    }

    /// Block until no request is in flight.
    pub fn await_drained(&self) {
        let mut count = self.count.lock();

        while *count > 0 {
            self.condvar.wait(&mut count);
        }
    }
}

/// Per-identity maintenance state: the admission gate plus the drain
/// barrier. Distinct identities are fully independent.
#[derive(Default)]
pub struct Maintenance {
    gate: Gate,
    drain: Drain,
}

impl Maintenance {
    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    pub fn drain(&self) -> &Drain {
        &self.drain
    }

    /// Request-side admission: wait for the gate, then register with the
    /// drain.
    ///
    /// Registration happens before the gate is re-checked, so an operator
    /// that closed the gate in between either sees this request in the
    /// drain count or this request sees the closed gate and backs out;
    /// either way the operator body runs with an empty in-flight set.
    ///
    /// Returns `false` when `timeout` expires before admission.
    pub fn admit(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            if !self.gate.wait_open(deadline) {
                return false;
            }

            self.drain.enter();
            if self.gate.is_open() {
                return true;
            }

            self.drain.leave();
        }
    }

    /// Request-side completion.
    pub fn leave(&self) {
        self.drain.leave();
    }
}
