use std::{
    collections::BinaryHeap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, LazyLock,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::Instant,
};

use parking_lot::{Condvar, Mutex};

/// The stable identity of a logical scheduled action.
///
/// Cancellation is keyed by token, not by task handle: an owner keeps one
/// token per logical action (a refill step, an expiry step) and can cancel
/// "the expiry task" without having tracked what was scheduled.
///
/// # Test
///
/// ```
/// use firewall::timer::Token;
///
/// let token = Token::generate();
///
/// assert_eq!(token, token);
/// assert_ne!(token, Token::generate());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u64);

impl Token {
    pub fn generate() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);

        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

struct Task {
    deadline: Instant,
    sequence: u64,
    token: Token,
    run: Box<dyn FnOnce() + Send>,
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}

impl Eq for Task {}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    // Inverted so the max-heap surfaces the earliest deadline first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.sequence.cmp(&self.sequence))
    }
}

struct Shared {
    queue: Mutex<BinaryHeap<Task>>,
    condvar: Condvar,
    sequence: AtomicU64,
}

/// A single-threaded delay scheduler.
///
/// One worker thread pops tasks in deadline order, sleeping until the
/// earliest deadline is reached. Task panics are caught and reported; they
/// never terminate the worker. Among tasks with equal deadlines, execution
/// order follows scheduling order.
///
/// The process-wide instance behind [`DelayTimer::global`] is a daemon and
/// is never stopped; independent instances exist for tests and for callers
/// that want their own scheduling domain.
#[derive(Clone)]
pub struct DelayTimer {
    shared: Arc<Shared>,
}

impl Default for DelayTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayTimer {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(BinaryHeap::new()),
            condvar: Condvar::new(),
            sequence: AtomicU64::new(0),
        });

        let worker = shared.clone();
        thread::Builder::new()
            .name("firewall-timer".to_string())
            .spawn(move || Self::run_worker(worker))
            .expect("failed to spawn delay timer worker!");

        Self { shared }
    }

    /// The process-wide timer, started on first use.
    pub fn global() -> Self {
        static GLOBAL: LazyLock<DelayTimer> = LazyLock::new(DelayTimer::new);

        GLOBAL.clone()
    }

    /// Enqueue a task to run at or after `deadline`.
    ///
    /// Scheduling the same token again adds another task; it does not
    /// replace the first one.
    pub fn schedule(&self, deadline: Instant, token: Token, task: impl FnOnce() + Send + 'static) {
        let mut queue = self.shared.queue.lock();

        queue.push(Task {
            sequence: self.shared.sequence.fetch_add(1, Ordering::Relaxed),
            run: Box::new(task),
            deadline,
            token,
        });

        // The new head may be earlier than what the worker sleeps on.
        self.shared.condvar.notify_all();
    }

    /// Remove at most one pending task with this token.
    ///
    /// Returns whether a task was removed; absent tokens are a no-op.
    pub fn unschedule(&self, token: Token) -> bool {
        let mut queue = self.shared.queue.lock();

        let mut tasks = std::mem::take(&mut *queue).into_vec();
        let removed = match tasks.iter().position(|task| task.token == token) {
            Some(index) => {
                tasks.swap_remove(index);
                true
            }
            None => false,
        };

        *queue = BinaryHeap::from(tasks);
        if removed {
            self.shared.condvar.notify_all();
        }

        removed
    }

    fn run_worker(shared: Arc<Shared>) {
        loop {
            let task = {
                let mut queue = shared.queue.lock();

                loop {
                    match queue.peek().map(|head| head.deadline) {
                        None => {
                            shared.condvar.wait(&mut queue);
                        }
                        Some(deadline) if deadline <= Instant::now() => {
                            break queue.pop();
                        }
                        Some(deadline) => {
                            let _ = shared.condvar.wait_until(&mut queue, deadline);
                        }
                    }
                }
            };

            let Some(task) = task else {
                continue;
            };

            // A panicking task must not take the worker down with it.
            if let Err(payload) = catch_unwind(AssertUnwindSafe(task.run)) {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());

                log::error!("delay timer task panicked: {}", reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::mpsc::channel,
        time::{Duration, Instant},
    };

    use super::{DelayTimer, Token};

    #[test]
    fn test_deadline_order() {
        let timer = DelayTimer::new();
        let (sender, receiver) = channel();
        let now = Instant::now();

        for (label, delay) in [("b", 40), ("a", 20), ("c", 60)] {
            let sender = sender.clone();
            timer.schedule(now + Duration::from_millis(delay), Token::generate(), move || {
                sender.send(label).unwrap();
            });
        }

        let timeout = Duration::from_secs(2);
        assert_eq!(receiver.recv_timeout(timeout).unwrap(), "a");
        assert_eq!(receiver.recv_timeout(timeout).unwrap(), "b");
        assert_eq!(receiver.recv_timeout(timeout).unwrap(), "c");
    }

    #[test]
    fn test_unschedule_removes_one() {
        let timer = DelayTimer::new();
        let (sender, receiver) = channel();
        let token = Token::generate();
        let now = Instant::now();

        for _ in 0..2 {
            let sender = sender.clone();
            timer.schedule(now + Duration::from_millis(30), token, move || {
                sender.send(()).unwrap();
            });
        }

        assert!(timer.unschedule(token));

        let timeout = Duration::from_secs(2);
        assert!(receiver.recv_timeout(timeout).is_ok());
        assert!(receiver.recv_timeout(Duration::from_millis(200)).is_err());

        assert!(!timer.unschedule(token));
    }

    #[test]
    fn test_worker_survives_panic() {
        let timer = DelayTimer::new();
        let (sender, receiver) = channel();
        let now = Instant::now();

        timer.schedule(now, Token::generate(), || panic!("boom"));

        timer.schedule(now + Duration::from_millis(30), Token::generate(), move || {
            sender.send(()).unwrap();
        });

        assert!(receiver.recv_timeout(Duration::from_secs(2)).is_ok());
    }
}
