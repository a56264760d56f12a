//! BUGGIFY - Deterministic Fault Injection
//!
//! Simulated segment stores and simulated remote sinks consult `buggify!` at
//! every decision point where the real world can fail: a write that tears,
//! an fsync that errors, a backend that is briefly unreachable or rejects an
//! operation outright. Decisions are drawn from the caller's `Rng`, so a
//! seeded `SimulatedRng` replays the exact same fault sequence.
//!
//! ```ignore
//! // Probability from the thread's FaultConfig table
//! if buggify!(&mut rng, faults::process::CONSUMER_CRASH) { ... }
//!
//! // Explicit probability (still off under FaultConfig::disabled())
//! if buggify!(&mut rng, faults::remote::UNAVAILABLE, 0.10) {
//!     return SubmitOutcome::Retryable("simulated outage".into());
//! }
//! ```
//!
//! Configuration and counters are thread-local: a DST run and the consumer
//! tasks it drives share one current-thread runtime.

pub mod config;
pub mod faults;

pub use config::FaultConfig;
pub use faults::ALL_FAULTS;

use crate::io::Rng;
use std::cell::RefCell;
use std::collections::BTreeMap;

/// How often one fault site was reached and how often it fired
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultCounter {
    pub checks: u64,
    pub triggers: u64,
}

/// Counters per fault id, ordered by id
#[derive(Debug, Clone, Default)]
pub struct FaultStats {
    counters: BTreeMap<&'static str, FaultCounter>,
}

impl FaultStats {
    pub fn counter(&self, fault_id: &str) -> FaultCounter {
        self.counters.get(fault_id).copied().unwrap_or_default()
    }

    pub fn total_triggers(&self) -> u64 {
        self.counters.values().map(|c| c.triggers).sum()
    }

    pub fn summary(&self) -> String {
        let mut out = String::from("BUGGIFY Statistics:");
        for (fault_id, c) in &self.counters {
            let pct = if c.checks == 0 {
                0.0
            } else {
                c.triggers as f64 * 100.0 / c.checks as f64
            };
            out.push_str(&format!(
                "\n  {}: {}/{} ({:.2}%)",
                fault_id, c.triggers, c.checks, pct
            ));
        }
        out
    }

    fn record(&mut self, fault_id: &'static str, triggered: bool) {
        let counter = self.counters.entry(fault_id).or_default();
        counter.checks += 1;
        if triggered {
            counter.triggers += 1;
        }
    }
}

#[derive(Debug, Default)]
struct FaultContext {
    config: FaultConfig,
    stats: FaultStats,
}

thread_local! {
    static FAULTS: RefCell<FaultContext> = RefCell::new(FaultContext::default());
}

/// Replace the fault table for the current thread
pub fn set_config(config: FaultConfig) {
    FAULTS.with(|ctx| ctx.borrow_mut().config = config);
}

/// Snapshot of this thread's counters
pub fn stats() -> FaultStats {
    FAULTS.with(|ctx| ctx.borrow().stats.clone())
}

pub fn reset_stats() {
    FAULTS.with(|ctx| ctx.borrow_mut().stats = FaultStats::default());
}

/// Roll for `fault_id` at its configured probability
#[inline]
pub fn should_buggify<R: Rng>(rng: &mut R, fault_id: &'static str) -> bool {
    FAULTS.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        let probability = ctx.config.get(fault_id);
        let triggered = probability > 0.0 && roll(rng, probability);
        ctx.stats.record(fault_id, triggered);
        triggered
    })
}

/// Roll for `fault_id` at an explicit probability
#[inline]
pub fn should_buggify_with_prob<R: Rng>(
    rng: &mut R,
    fault_id: &'static str,
    probability: f64,
) -> bool {
    FAULTS.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        let triggered = ctx.config.enabled && probability > 0.0 && roll(rng, probability.min(1.0));
        ctx.stats.record(fault_id, triggered);
        triggered
    })
}

#[inline]
fn roll<R: Rng>(rng: &mut R, probability: f64) -> bool {
    (rng.gen_range(0, 1_000_000) as f64) < probability * 1_000_000.0
}

#[macro_export]
macro_rules! buggify {
    ($rng:expr, $fault_id:expr) => {
        $crate::buggify::should_buggify($rng, $fault_id)
    };
    ($rng:expr, $fault_id:expr, $prob:expr) => {
        $crate::buggify::should_buggify_with_prob($rng, $fault_id, $prob)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::SimulatedRng;

    #[test]
    fn test_buggify_disabled() {
        set_config(FaultConfig::disabled());
        let mut rng = SimulatedRng::new(7);

        for _ in 0..1000 {
            assert!(!buggify!(&mut rng, faults::remote::UNAVAILABLE));
            assert!(!buggify!(&mut rng, faults::disk::WRITE_FAIL, 1.0));
        }
        set_config(FaultConfig::default());
    }

    #[test]
    fn test_explicit_probability_bounds() {
        set_config(FaultConfig::new());
        let mut rng = SimulatedRng::new(7);

        assert!((0..100).all(|_| buggify!(&mut rng, faults::remote::REJECT, 1.0)));
        assert!(!(0..100).any(|_| buggify!(&mut rng, faults::remote::REJECT, 0.0)));
    }

    #[test]
    fn test_table_probability_and_counters() {
        reset_stats();
        set_config(FaultConfig::new().with(faults::process::CONSUMER_CRASH, 0.1));
        let mut rng = SimulatedRng::new(42);

        for _ in 0..1000 {
            let _ = buggify!(&mut rng, faults::process::CONSUMER_CRASH);
            // Not in the table: checked, never fires
            assert!(!buggify!(&mut rng, faults::disk::FSYNC_FAIL));
        }

        let stats = stats();
        let crash = stats.counter(faults::process::CONSUMER_CRASH);
        assert_eq!(crash.checks, 1000);
        assert!(crash.triggers > 50 && crash.triggers < 200, "triggers: {}", crash.triggers);
        assert_eq!(stats.counter(faults::disk::FSYNC_FAIL).triggers, 0);
        assert_eq!(stats.total_triggers(), crash.triggers);
        assert!(stats.summary().contains(faults::process::CONSUMER_CRASH));
        set_config(FaultConfig::default());
    }

    #[test]
    fn test_same_seed_same_faults() {
        set_config(FaultConfig::new());
        let draw = |seed| {
            let mut rng = SimulatedRng::new(seed);
            (0..64)
                .map(|_| buggify!(&mut rng, faults::remote::UNAVAILABLE, 0.3))
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(5), draw(5));
    }
}
