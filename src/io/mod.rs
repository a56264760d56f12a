//! I/O Abstractions
//!
//! Randomness goes through the `Rng` trait so that retry jitter and fault
//! injection are deterministic under simulation and real in production.
//!
//! - `ProductionRng`: thread-local OS-seeded generator
//! - `SimulatedRng`: seeded ChaCha8 for DST replay

pub mod simulation;

pub use simulation::SimulatedRng;

/// Source of randomness
pub trait Rng: Send {
    fn next_u64(&mut self) -> u64;

    /// Uniform value in `min..max`; returns `min` when the range is empty
    fn gen_range(&mut self, min: u64, max: u64) -> u64;
}

pub mod production {
    use super::Rng;

    /// Production RNG backed by `rand::thread_rng`
    #[derive(Debug, Default, Clone, Copy)]
    pub struct ProductionRng;

    impl ProductionRng {
        pub fn new() -> Self {
            ProductionRng
        }
    }

    impl Rng for ProductionRng {
        fn next_u64(&mut self) -> u64 {
            use rand::RngCore;
            rand::thread_rng().next_u64()
        }

        fn gen_range(&mut self, min: u64, max: u64) -> u64 {
            use rand::Rng as _;
            if min >= max {
                return min;
            }
            rand::thread_rng().gen_range(min..max)
        }
    }
}
