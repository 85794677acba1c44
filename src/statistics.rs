use std::sync::{
    LazyLock,
    atomic::{AtomicU64, Ordering},
};

/// The admission outcome reported by a filter.
#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    Admitted,
    DeniedAccess,
    DeniedLimit,
    DeniedMaintenance,
}

pub trait Number {
    fn add(&self, value: u64);
    fn get(&self) -> u64;
}

#[derive(Default)]
pub struct Count(AtomicU64);

impl Number for Count {
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Process-wide admission counters.
///
/// Filters report every decision here; there is no exporter, the counts are
/// simply readable by whoever embeds the library.
///
/// # Example
///
/// ```
/// use firewall::statistics::{Counts, Number, Outcome};
///
/// let counts = Counts::default();
///
/// counts.add(Outcome::Admitted);
/// counts.add(Outcome::DeniedLimit);
///
/// assert_eq!(counts.admitted.get(), 1);
/// assert_eq!(counts.denied_limit.get(), 1);
/// assert_eq!(counts.denied_access.get(), 0);
/// ```
#[derive(Default)]
pub struct Counts {
    pub admitted: Count,
    pub denied_access: Count,
    pub denied_limit: Count,
    pub denied_maintenance: Count,
}

impl Counts {
    pub fn add(&self, outcome: Outcome) {
        match outcome {
            Outcome::Admitted => self.admitted.add(1),
            Outcome::DeniedAccess => self.denied_access.add(1),
            Outcome::DeniedLimit => self.denied_limit.add(1),
            Outcome::DeniedMaintenance => self.denied_maintenance.add(1),
        }
    }
}

pub static COUNTS: LazyLock<Counts> = LazyLock::new(Counts::default);
